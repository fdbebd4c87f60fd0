//! Combining fragments into a target's aggregate state.
//!
//! [`PatchComputer`] is the contract the reconcile loop drives. It must be
//! deterministic and side-effect-free, and re-applying the same inputs to its
//! own output must yield that output unchanged.

use serde_json::{Map, Value};
use thiserror::Error;
use vsmerger_core::Payload;

/// Patch computation failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatchError {
    #[error("{what} must be a JSON object")]
    NotAnObject { what: &'static str },

    #[error("field '{field}' in {what} must be a list of routes")]
    NotAList { field: String, what: &'static str },
}

/// Produces a new target state from desired, previous and current state.
pub trait PatchComputer: Send + Sync {
    /// `desired` is `None` when the fragment is being retracted; `previous`
    /// is `None` when there is no stale fragment to remove.
    ///
    /// # Errors
    ///
    /// Returns a [`PatchError`] when any input has an unusable shape.
    fn compute(
        &self,
        desired: Option<&Payload>,
        previous: Option<&Payload>,
        current: &Payload,
    ) -> Result<Payload, PatchError>;
}

/// Default merge over named route lists.
///
/// For each configured field (`http`, `tcp`, `tls` by default):
/// routes of `previous` that `desired` no longer declares are removed,
/// routes of `desired` already in the target are replaced where they stand,
/// and the rest of `desired` is prepended in declaration order. Routes are
/// matched by `name` when both carry one, otherwise by equality.
#[derive(Debug, Clone)]
pub struct RouteListMerge {
    fields: Vec<String>,
}

impl Default for RouteListMerge {
    fn default() -> Self {
        Self::with_fields(["http", "tcp", "tls"])
    }
}

impl RouteListMerge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge only the given route-list fields.
    pub fn with_fields<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    fn merge_field(
        field: &str,
        desired: &[Value],
        previous: &[Value],
        current: &[Value],
    ) -> Vec<Value> {
        let mut placed = vec![false; desired.len()];
        let mut kept = Vec::with_capacity(current.len());

        for route in current {
            if let Some(index) = desired.iter().position(|d| same_route(d, route)) {
                if let (Some(slot), Some(replacement)) = (placed.get_mut(index), desired.get(index))
                {
                    if !*slot {
                        *slot = true;
                        kept.push(replacement.clone());
                    }
                }
            } else if !previous.iter().any(|p| same_route(p, route)) {
                kept.push(route.clone());
            }
        }

        let fresh = desired
            .iter()
            .zip(placed)
            .filter(|(_, placed)| !placed)
            .map(|(route, _)| route.clone());

        let merged: Vec<Value> = fresh.chain(kept).collect();
        tracing::trace!(field, routes = merged.len(), "Merged route list");
        merged
    }
}

impl PatchComputer for RouteListMerge {
    fn compute(
        &self,
        desired: Option<&Payload>,
        previous: Option<&Payload>,
        current: &Payload,
    ) -> Result<Payload, PatchError> {
        let desired = as_object(desired, "desired fragment")?;
        let previous = as_object(previous, "previous fragment")?;
        let mut next = match current {
            Value::Null => Map::new(),
            Value::Object(map) => map.clone(),
            _ => return Err(PatchError::NotAnObject { what: "target state" }),
        };

        for field in &self.fields {
            let desired_routes = routes(desired, field, "desired fragment")?;
            let previous_routes = routes(previous, field, "previous fragment")?;
            if desired_routes.is_empty() && previous_routes.is_empty() {
                continue;
            }
            let current_routes = routes(Some(&next), field, "target state")?;
            let merged =
                Self::merge_field(field, desired_routes, previous_routes, current_routes);

            if merged.is_empty() && !next.contains_key(field) {
                continue;
            }
            next.insert(field.clone(), Value::Array(merged));
        }

        Ok(Value::Object(next))
    }
}

fn as_object<'a>(
    payload: Option<&'a Payload>,
    what: &'static str,
) -> Result<Option<&'a Map<String, Value>>, PatchError> {
    match payload {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) => Ok(Some(map)),
        Some(_) => Err(PatchError::NotAnObject { what }),
    }
}

fn routes<'a>(
    object: Option<&'a Map<String, Value>>,
    field: &str,
    what: &'static str,
) -> Result<&'a [Value], PatchError> {
    match object.and_then(|o| o.get(field)) {
        None | Some(Value::Null) => Ok(&[]),
        Some(Value::Array(items)) => Ok(items.as_slice()),
        Some(_) => Err(PatchError::NotAList {
            field: field.to_string(),
            what,
        }),
    }
}

fn same_route(a: &Value, b: &Value) -> bool {
    match (route_name(a), route_name(b)) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn route_name(route: &Value) -> Option<&str> {
    route.get("name").and_then(Value::as_str)
}

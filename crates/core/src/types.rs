//! Identities and the merge data model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque payload carried by fragments and targets.
pub type Payload = serde_json::Value;

/// Namespaced identity of an object.
///
/// Used as the reconcile key for specifications and as the identity of
/// target resources.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    /// Create a key from namespace and name.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Reference from a specification to the target it contributes to.
///
/// An empty namespace means "the specification's own namespace".
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetRef {
    #[serde(default)]
    pub namespace: String,
    pub name: String,
}

impl TargetRef {
    /// Create a reference with an explicit namespace.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Create a reference that defaults to the owner's namespace.
    pub fn local(name: impl Into<String>) -> Self {
        Self::new("", name)
    }

    /// Resolve to a concrete target identity.
    pub fn resolve(&self, owner_namespace: &str) -> ObjectKey {
        let namespace = if self.namespace.is_empty() {
            owner_namespace
        } else {
            self.namespace.as_str()
        };
        ObjectKey::new(namespace, self.name.clone())
    }
}

/// Object metadata shared by specifications and targets.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    /// Version token used for optimistic concurrency and error markers.
    #[serde(default)]
    pub resource_version: String,
    #[serde(default)]
    pub generation: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Self::default()
        }
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.namespace.clone(), self.name.clone())
    }

    /// Whether the object has been marked for deletion.
    pub fn is_terminating(&self) -> bool {
        self.deletion_timestamp.is_some()
    }
}

/// Desired contribution of a specification.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergeSpec {
    pub target: TargetRef,
    /// Fragment to merge into the target.
    #[serde(default)]
    pub patch: Payload,
}

/// Status written back by the controller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeStatus {
    /// Empty on success, otherwise the resource version that failed.
    #[serde(default)]
    pub error: String,
}

/// A contributor's declared fragment plus the target it merges into.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Specification {
    pub metadata: ObjectMeta,
    pub spec: MergeSpec,
    #[serde(default)]
    pub status: MergeStatus,
}

impl Specification {
    /// Create a specification with the given target reference and fragment.
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        target: TargetRef,
        patch: Payload,
    ) -> Self {
        Self {
            metadata: ObjectMeta::new(namespace, name),
            spec: MergeSpec { target, patch },
            status: MergeStatus::default(),
        }
    }

    /// Set the resource version token.
    #[must_use]
    pub fn with_resource_version(mut self, version: impl Into<String>) -> Self {
        self.metadata.resource_version = version.into();
        self
    }

    /// Mark the specification for deletion.
    #[must_use]
    pub fn with_deletion_timestamp(mut self, at: DateTime<Utc>) -> Self {
        self.metadata.deletion_timestamp = Some(at);
        self
    }

    pub fn key(&self) -> ObjectKey {
        self.metadata.key()
    }

    /// The target this specification resolves to.
    pub fn target_key(&self) -> ObjectKey {
        self.spec.target.resolve(&self.metadata.namespace)
    }

    pub fn resource_version(&self) -> &str {
        &self.metadata.resource_version
    }

    pub fn is_terminating(&self) -> bool {
        self.metadata.is_terminating()
    }

    pub fn patch(&self) -> &Payload {
        &self.spec.patch
    }

    /// Whether two snapshots contribute the same content.
    ///
    /// Ignores status and version bookkeeping.
    pub fn same_contribution(&self, other: &Self) -> bool {
        self.spec == other.spec
            && self.metadata.deletion_timestamp == other.metadata.deletion_timestamp
    }
}

/// The shared, externally owned object fragments are merged into.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetResource {
    pub metadata: ObjectMeta,
    /// Aggregate state.
    #[serde(default)]
    pub spec: Payload,
}

impl TargetResource {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, spec: Payload) -> Self {
        Self {
            metadata: ObjectMeta::new(namespace, name),
            spec,
        }
    }

    pub fn key(&self) -> ObjectKey {
        self.metadata.key()
    }

    pub fn resource_version(&self) -> &str {
        &self.metadata.resource_version
    }

    pub fn is_terminating(&self) -> bool {
        self.metadata.is_terminating()
    }

    /// Copy of this target carrying a new aggregate state.
    #[must_use]
    pub fn with_state(&self, spec: Payload) -> Self {
        Self {
            metadata: self.metadata.clone(),
            spec,
        }
    }
}

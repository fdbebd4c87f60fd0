//! Event-filter capability for specification watch events.

use vsmerger_core::Specification;
use vsmerger_events::SpecEvent;

/// Decides which specification events enqueue a reconcile.
///
/// Implementors may record state as a side effect (the controller stores
/// pre-update snapshots in its change cache from `on_update`).
pub trait EventFilter {
    fn on_create(&self, spec: &Specification) -> bool;

    fn on_update(&self, old: &Specification, new: &Specification) -> bool;

    fn on_delete(&self, spec: &Specification) -> bool;

    /// Resyncs and other events without a before/after pair.
    fn on_generic(&self, spec: &Specification) -> bool;

    /// Dispatch an event to the matching hook.
    fn accepts(&self, event: &SpecEvent) -> bool {
        match event {
            SpecEvent::Created(spec) => self.on_create(spec),
            SpecEvent::Updated { old, new } => self.on_update(old, new),
            SpecEvent::Deleted(spec) => self.on_delete(spec),
            SpecEvent::Resynced(spec) => self.on_generic(spec),
        }
    }
}

//! Event arena
//!
//! Event records are shared by the inbound queue, the pending slot, the
//! key-repeat slot and any number of dispatch entries. Each holder owns one
//! reference; the record is freed when the last reference is released.

use slotmap::{new_key_type, SlotMap};
use tracing::trace;

use crate::event::{EventEntry, InjectionResult};

new_key_type! {
    /// Handle to a pooled event record.
    pub struct EventId;
}

#[derive(Debug)]
struct Slot {
    entry: EventEntry,
    refs: u32,
}

/// Reference-counted arena of event records.
#[derive(Debug, Default)]
pub struct EventPool {
    slots: SlotMap<EventId, Slot>,
    allocated: u64,
}

impl EventPool {
    /// Empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a record with one reference.
    pub fn insert(&mut self, entry: EventEntry) -> EventId {
        self.allocated += 1;
        self.slots.insert(Slot { entry, refs: 1 })
    }

    /// Add a reference.
    pub fn retain(&mut self, id: EventId) {
        if let Some(slot) = self.slots.get_mut(id) {
            slot.refs += 1;
        }
    }

    /// Drop a reference. Returns the record when this was the last one.
    ///
    /// An injected record that is freed while its ticket is still pending
    /// resolves the ticket as failed.
    pub fn release(&mut self, id: EventId) -> Option<EventEntry> {
        let slot = self.slots.get_mut(id)?;
        debug_assert!(slot.refs > 0);
        slot.refs = slot.refs.saturating_sub(1);
        if slot.refs > 0 {
            return None;
        }
        let slot = self.slots.remove(id)?;
        if let Some(injection) = &slot.entry.injection {
            if injection.resolve(InjectionResult::Failed) {
                trace!("Released injected event before it was resolved");
            }
        }
        Some(slot.entry)
    }

    /// Record lookup.
    pub fn get(&self, id: EventId) -> Option<&EventEntry> {
        self.slots.get(id).map(|slot| &slot.entry)
    }

    /// Mutable record lookup.
    pub fn get_mut(&mut self, id: EventId) -> Option<&mut EventEntry> {
        self.slots.get_mut(id).map(|slot| &mut slot.entry)
    }

    /// Current reference count (0 when freed).
    pub fn ref_count(&self, id: EventId) -> u32 {
        self.slots.get(id).map_or(0, |slot| slot.refs)
    }

    /// Live records.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True if no record is live.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Records allocated since creation.
    pub fn allocated_total(&self) -> u64 {
        self.allocated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventKind, InjectionState, PolicyFlags};
    use std::sync::Arc;

    fn config_changed() -> EventEntry {
        EventEntry::new(0, PolicyFlags::empty(), EventKind::ConfigurationChanged)
    }

    #[test]
    fn test_last_release_frees() {
        let mut pool = EventPool::new();
        let id = pool.insert(config_changed());
        pool.retain(id);
        assert_eq!(pool.ref_count(id), 2);
        assert!(pool.release(id).is_none());
        assert!(pool.release(id).is_some());
        assert!(pool.get(id).is_none());
        assert!(pool.is_empty());
        assert!(pool.release(id).is_none());
    }

    #[test]
    fn test_release_fails_pending_injection() {
        let mut pool = EventPool::new();
        let ticket = Arc::new(InjectionState::new(1, 1, false));
        let mut entry = config_changed();
        entry.injection = Some(ticket.clone());
        let id = pool.insert(entry);
        pool.release(id);
        assert_eq!(ticket.result(), InjectionResult::Failed);
    }

    #[test]
    fn test_release_keeps_resolved_injection() {
        let mut pool = EventPool::new();
        let ticket = Arc::new(InjectionState::new(1, 1, false));
        ticket.resolve(InjectionResult::Succeeded);
        let mut entry = config_changed();
        entry.injection = Some(ticket.clone());
        let id = pool.insert(entry);
        pool.release(id);
        assert_eq!(ticket.result(), InjectionResult::Succeeded);
    }
}

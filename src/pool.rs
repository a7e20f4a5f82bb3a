//! A pool groups the managers serving one broker key.

use std::sync::Arc;

use crate::broker::BrokerKey;
use crate::manager::Manager;
use crate::registration::ManagerId;

/// The managers currently open to one broker.
///
/// Managers are scanned in insertion order for the first with a free slot, so
/// occupancy packs toward the front of the list and teardown naturally
/// proceeds from the tail (placement constraint in the source design).
pub(crate) struct Pool<C> {
    #[allow(dead_code)]
    pub(crate) broker: BrokerKey,
    pub(crate) managers: Vec<Manager<C>>,
}

impl<C> Pool<C> {
    pub(crate) fn new(broker: BrokerKey) -> Self {
        Pool {
            broker,
            managers: Vec::new(),
        }
    }

    /// Finds the first manager, in insertion order, with a free producer slot.
    pub(crate) fn manager_with_free_producer_slot(&self) -> Option<(ManagerId, usize)> {
        self.managers.iter().find_map(|m| {
            m.free_producer_slot().map(|slot| (m.id, slot))
        })
    }

    /// Finds the first manager, in insertion order, with a free
    /// committing-consumer slot.
    pub(crate) fn manager_with_free_consumer_slot(&self) -> Option<(ManagerId, usize)> {
        self.managers.iter().find_map(|m| {
            m.free_consumer_slot().map(|slot| (m.id, slot))
        })
    }

    pub(crate) fn manager_mut(&mut self, id: ManagerId) -> Option<&mut Manager<C>> {
        self.managers.iter_mut().find(|m| m.id == id)
    }

    pub(crate) fn manager(&self, id: ManagerId) -> Option<&Manager<C>> {
        self.managers.iter().find(|m| m.id == id)
    }

    pub(crate) fn push(&mut self, manager: Manager<C>) {
        self.managers.push(manager);
    }

    /// Removes `id` from the pool if present and returns its connection for
    /// the caller to close, along with whether the pool is now empty.
    pub(crate) fn remove_manager(&mut self, id: ManagerId) -> Option<Arc<C>> {
        let idx = self.managers.iter().position(|m| m.id == id)?;
        Some(self.managers.remove(idx).connection)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.managers.is_empty()
    }

    pub(crate) fn client_count(&self) -> usize {
        self.managers.len()
    }
}

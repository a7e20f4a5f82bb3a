//! A JSON-serialisable diagnostic snapshot of the coordinator's pools.

use serde::Serialize;

use crate::broker::BrokerKey;

/// One manager's slot occupancy, as reported in a [`CoordinatorSnapshot`].
#[derive(Debug, Clone, Serialize)]
pub struct ClientSnapshot {
    /// Number of producer slots currently bound.
    pub producer_slots_used: usize,
    /// Number of committing-consumer slots currently bound.
    pub committing_consumer_slots_used: usize,
}

/// One broker's pool, as reported in a [`CoordinatorSnapshot`].
#[derive(Debug, Clone, Serialize)]
pub struct PoolSnapshot {
    /// The broker this pool serves.
    pub broker: BrokerKey,
    /// Each manager currently open to `broker`, in insertion order.
    pub clients: Vec<ClientSnapshot>,
}

/// A point-in-time diagnostic view of every pool the coordinator holds.
///
/// Intended for host applications to expose over their own metrics or health
/// endpoints; the coordinator itself never serves this over a socket.
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorSnapshot {
    /// Every pool currently resident, in no particular order.
    pub pools: Vec<PoolSnapshot>,
}

//! A manager owns exactly one physical connection and two bounded slot arrays:
//! one for producers (where the slot index doubles as the publishing id) and
//! one for committing consumers.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::broker::BrokerKey;
use crate::registration::{ManagerId, RegistrationId};

/// Event a manager's connection pushes back to the coordinator's event loop.
///
/// This is the Rust stand-in for the source system's pair of upward listener
/// callbacks threaded through client-factory parameters: rather than a lambda
/// captured at connect time, the transport (or, in tests, a fake) is honded an
/// [`EventSink`] and pushes typed events through it.
#[derive(Debug, Clone)]
pub enum ManagerEvent {
    /// The connection terminated for any reason other than an orderly close
    /// requested by the coordinator itself.
    Shutdown {
        /// Manager whose connection terminated.
        manager_id: ManagerId,
    },
    /// The broker announced that a stream's topology changed.
    MetadataChanged {
        /// Stream whose topology changed.
        stream: String,
    },
}

/// Handed to a [`ClientFactory`] at connect time so the resulting connection
/// (or, in tests, the fake standing in for it) can report shutdown and
/// metadata-change events back to the coordinator that created it.
#[derive(Clone)]
pub struct EventSink {
    pub(crate) manager_id: ManagerId,
    pub(crate) tx: mpsc::UnboundedSender<ManagerEvent>,
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSink")
            .field("manager_id", &self.manager_id)
            .finish()
    }
}

impl EventSink {
    /// Reports that this manager's connection has shut down.
    pub fn shutdown(&self) {
        let _ = self.tx.send(ManagerEvent::Shutdown {
            manager_id: self.manager_id,
        });
    }

    /// Reports that `stream`'s topology has changed (its leader may have
    /// moved, or the stream may have been deleted).
    pub fn metadata_changed(&self, stream: impl Into<String>) {
        let _ = self.tx.send(ManagerEvent::MetadataChanged {
            stream: stream.into(),
        });
    }
}

/// Produces connections and wires them up to report back to the coordinator.
///
/// Parameters standing in for "client parameters" in the source design are
/// just the broker to connect to and the [`EventSink`] to report on; transport
/// options (TLS, credentials, ...) are the host application's concern and are
/// expected to be captured by the `ClientFactory` implementation itself.
#[async_trait]
pub trait ClientFactory: Send + Sync + 'static {
    /// The connection type this factory produces.
    type Connection: Send + Sync + 'static;
    /// The error type this factory's connect attempts can fail with.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Establishes a new connection to `broker`, registering `events` so the
    /// connection can report shutdown and topology-change events.
    async fn connect(
        &self,
        broker: &BrokerKey,
        events: EventSink,
    ) -> Result<Self::Connection, Self::Error>;
}

#[async_trait]
impl<T: ClientFactory + ?Sized> ClientFactory for Arc<T> {
    type Connection = T::Connection;
    type Error = T::Error;

    async fn connect(
        &self,
        broker: &BrokerKey,
        events: EventSink,
    ) -> Result<Self::Connection, Self::Error> {
        (**self).connect(broker, events).await
    }
}

/// One physical connection plus its bounded producer and committing-consumer
/// slot arrays.
///
/// A slot is represented as `Option<RegistrationId>`: `None` is free, `Some`
/// identifies the bound registration. Release is O(1); allocation is an O(capacity)
/// linear scan for the lowest free index, matching the source design (capacities
/// are small, typically in the low hundreds).
pub(crate) struct Manager<C> {
    pub(crate) id: ManagerId,
    pub(crate) broker: BrokerKey,
    pub(crate) connection: Arc<C>,
    pub(crate) producer_slots: Vec<Option<RegistrationId>>,
    pub(crate) consumer_slots: Vec<Option<RegistrationId>>,
    /// Set once a shutdown event has been observed; dead managers are skipped
    /// by slot allocation even before their slots have all been vacated.
    pub(crate) dead: bool,
}

impl<C> Manager<C> {
    pub(crate) fn new(
        id: ManagerId,
        broker: BrokerKey,
        connection: Arc<C>,
        max_producers: usize,
        max_committing_consumers: usize,
    ) -> Self {
        Manager {
            id,
            broker,
            connection,
            producer_slots: vec![None; max_producers],
            consumer_slots: vec![None; max_committing_consumers],
            dead: false,
        }
    }

    /// The lowest free producer slot index, if any.
    pub(crate) fn free_producer_slot(&self) -> Option<usize> {
        if self.dead {
            return None;
        }
        self.producer_slots.iter().position(Option::is_none)
    }

    /// The lowest free committing-consumer slot index, if any.
    pub(crate) fn free_consumer_slot(&self) -> Option<usize> {
        if self.dead {
            return None;
        }
        self.consumer_slots.iter().position(Option::is_none)
    }

    pub(crate) fn occupancy(&self) -> usize {
        self.producer_slots.iter().filter(|s| s.is_some()).count()
            + self.consumer_slots.iter().filter(|s| s.is_some()).count()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.occupancy() == 0
    }

    pub(crate) fn bound_producers(&self) -> impl Iterator<Item = RegistrationId> + '_ {
        self.producer_slots.iter().filter_map(|s| *s)
    }

    pub(crate) fn bound_consumers(&self) -> impl Iterator<Item = RegistrationId> + '_ {
        self.consumer_slots.iter().filter_map(|s| *s)
    }

    pub(crate) fn producer_slots_used(&self) -> usize {
        self.producer_slots.iter().filter(|s| s.is_some()).count()
    }

    pub(crate) fn consumer_slots_used(&self) -> usize {
        self.consumer_slots.iter().filter(|s| s.is_some()).count()
    }
}

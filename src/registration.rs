//! Producer and committing-consumer registrations: the user-facing lifecycle
//! hooks, and the bookkeeping the coordinator keeps about each live registration.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::broker::BrokerKey;

/// Opaque identity for a registration, stable for its whole lifetime regardless
/// of how many times it is rebound to a different manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegistrationId(u64);

impl std::fmt::Display for RegistrationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque identity for a manager, stable for its whole lifetime within a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ManagerId(u64);

impl std::fmt::Display for ManagerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Default)]
pub(crate) struct IdAllocator(AtomicU64);

impl IdAllocator {
    pub(crate) fn next_registration(&self) -> RegistrationId {
        RegistrationId(self.0.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Default)]
pub(crate) struct ManagerIdAllocator(AtomicU64);

impl ManagerIdAllocator {
    pub(crate) fn next(&self) -> ManagerId {
        ManagerId(self.0.fetch_add(1, Ordering::Relaxed))
    }
}

/// Where a registration currently sits: which broker, which manager within
/// that broker's pool, and which slot index within the manager.
///
/// For a producer, `slot` doubles as its publishing id (invariant 3 in the
/// data model).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Binding {
    pub(crate) manager_id: ManagerId,
    pub(crate) slot: usize,
}

/// Lifecycle hooks a producer must implement so the coordinator can drive it.
///
/// Hook calls are synchronous and expected to be cheap (typically: stash a
/// reference, flip a flag) — they run while the coordinator processes a
/// registration or recovery pass and must not block on I/O.
pub trait ProducerHooks<C>: Send + Sync + 'static {
    /// Called once, when the producer is first bound, with the publishing id
    /// the broker will use to correlate publish confirms for this producer.
    fn set_publisher_id(&self, publishing_id: u8);

    /// Called whenever the producer is (re)bound to a connection, including
    /// the initial bind and every later rebind after recovery.
    fn set_client(&self, connection: Arc<C>);

    /// Called when the producer's connection has gone away and it is no
    /// longer usable until a later `set_client`.
    fn unavailable(&self);

    /// Called after a successful rebind, once `set_client` has been invoked
    /// with the new connection.
    fn running(&self);

    /// Called when recovery gives up for good: the stream was deleted, or the
    /// backoff policy's attempts were exhausted. No further hooks will be
    /// invoked for this producer.
    fn close_after_stream_deletion(&self);
}

/// Lifecycle hooks a committing consumer must implement.
///
/// Unlike a producer, a committing consumer has no publishing id and is never
/// told to close: it owns its own main connection elsewhere, and this slot is
/// only its auxiliary offset-commit channel.
pub trait CommittingConsumerHooks<C>: Send + Sync + 'static {
    /// Called whenever the consumer's commit channel is (re)bound.
    fn set_client(&self, connection: Arc<C>);

    /// Called when the commit channel's connection has gone away.
    fn unavailable(&self);

    /// Called after a successful rebind.
    fn running(&self);
}

pub(crate) struct ProducerEntry<C> {
    pub(crate) stream: String,
    pub(crate) hooks: Arc<dyn ProducerHooks<C>>,
    pub(crate) broker: Option<BrokerKey>,
    pub(crate) binding: Option<Binding>,
}

pub(crate) struct ConsumerEntry<C> {
    pub(crate) stream: String,
    pub(crate) hooks: Arc<dyn CommittingConsumerHooks<C>>,
    pub(crate) broker: Option<BrokerKey>,
    pub(crate) binding: Option<Binding>,
}

/// What kind of registration an id refers to; used by the cleanup handle and
/// by recovery bookkeeping, which track both classes in the same affected set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Kind {
    Producer,
    CommittingConsumer,
}

/// Narrow interface the coordinator presents to a [`CleanupHandle`], so the
/// handle doesn't need to know the coordinator's locator/client-factory
/// generic parameters.
#[async_trait]
pub(crate) trait Releaser<C>: Send + Sync {
    async fn release(self: Arc<Self>, id: RegistrationId, kind: Kind);
}

/// A handle returned from [`crate::Coordinator::register_producer`] or
/// [`crate::Coordinator::register_committing_consumer`].
///
/// Dropping this handle does *not* release the registration — call
/// [`CleanupHandle::release`] explicitly. Releasing is idempotent: a second
/// call (or a call racing a shutdown/recovery pass) is a safe no-op, per the
/// coordinator's cleanup contract.
#[must_use = "dropping a CleanupHandle does not release its registration; call `release`"]
pub struct CleanupHandle<C> {
    pub(crate) id: RegistrationId,
    pub(crate) kind: Kind,
    pub(crate) coordinator: Arc<dyn Releaser<C>>,
}

impl<C> CleanupHandle<C> {
    /// Releases this registration. Safe to call more than once, and safe to
    /// call while the registration is in a recovery pass's pending set.
    pub async fn release(self) {
        self.coordinator.release(self.id, self.kind).await;
    }
}

impl<C> std::fmt::Debug for CleanupHandle<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupHandle")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

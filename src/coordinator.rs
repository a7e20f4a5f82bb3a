//! The coordinator: entry point for registering producers and committing
//! consumers, and the owner of every pool, manager and recovery job.

use std::collections::HashMap;
use std::convert::TryFrom;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::broker::BrokerKey;
use crate::config::Config;
use crate::error::CoordinatorError;
use crate::manager::{ClientFactory, EventSink, Manager, ManagerEvent};
use crate::metadata::{Locator, ResponseCode};
use crate::pool::Pool;
use crate::recovery::{self, AffectedIds};
use crate::registration::{
    Binding, CleanupHandle, CommittingConsumerHooks, ConsumerEntry, IdAllocator, Kind, ManagerId,
    ManagerIdAllocator, ProducerEntry, ProducerHooks, RegistrationId, Releaser,
};
use crate::snapshot::{ClientSnapshot, CoordinatorSnapshot, PoolSnapshot};

/// Converts a producer slot index into the single-byte publishing id the
/// broker expects. `Config::builder`'s `max_producers_per_client` is capped
/// at 256, so this never fails in practice; it's a checked conversion rather
/// than `as u8` so a future relaxation of that cap fails loudly instead of
/// silently wrapping two slots onto the same publishing id.
fn publishing_id(slot: usize) -> u8 {
    u8::try_from(slot).expect("producer slot index exceeds u8 range; max_producers_per_client should have rejected this")
}

pub(crate) struct State<C> {
    pub(crate) pools: HashMap<BrokerKey, Pool<C>>,
    pub(crate) producers: HashMap<RegistrationId, ProducerEntry<C>>,
    pub(crate) consumers: HashMap<RegistrationId, ConsumerEntry<C>>,
    pub(crate) topology_jobs: HashMap<String, Arc<AsyncMutex<AffectedIds>>>,
    pub(crate) closed: bool,
}

impl<C> Default for State<C> {
    fn default() -> Self {
        State {
            pools: HashMap::new(),
            producers: HashMap::new(),
            consumers: HashMap::new(),
            topology_jobs: HashMap::new(),
            closed: false,
        }
    }
}

/// The shared, reference-counted guts of a [`Coordinator`]. Kept separate from
/// `Coordinator` itself so recovery jobs and the background event loop can
/// hold it without holding a `Coordinator` value (which is just a thin, user
/// facing `Clone`-able wrapper).
pub(crate) struct CoordinatorInner<L: Locator, F: ClientFactory> {
    pub(crate) config: Config,
    pub(crate) locator: L,
    pub(crate) client_factory: F,
    pub(crate) state: AsyncMutex<State<F::Connection>>,
    pub(crate) registration_ids: IdAllocator,
    pub(crate) manager_ids: ManagerIdAllocator,
    pub(crate) events_tx: mpsc::UnboundedSender<ManagerEvent>,
}

impl<L: Locator, F: ClientFactory> CoordinatorInner<L, F> {
    pub(crate) async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    /// Finds or creates a manager in `broker`'s pool with a free producer
    /// slot, marks the slot as belonging to `id`, and returns the manager's
    /// identity, the slot index and the connection to hand to the hooks.
    ///
    /// Does not hold the coordinator's state lock across the client-factory
    /// connect call: two concurrent callers racing against an empty pool may
    /// each end up creating their own manager rather than serializing onto
    /// one, which trades perfectly dense packing for never blocking the
    /// lock on network I/O (see the concurrency notes in the design doc).
    async fn acquire_producer_slot(
        self: &Arc<Self>,
        broker: &BrokerKey,
        id: RegistrationId,
    ) -> Result<(ManagerId, usize, Arc<F::Connection>), CoordinatorError<L::Error>> {
        {
            let mut state = self.state.lock().await;
            let pool = state
                .pools
                .entry(broker.clone())
                .or_insert_with(|| Pool::new(broker.clone()));
            if let Some((manager_id, slot)) = pool.manager_with_free_producer_slot() {
                let manager = pool.manager_mut(manager_id).expect("manager just matched");
                manager.producer_slots[slot] = Some(id);
                return Ok((manager_id, slot, manager.connection.clone()));
            }
        }

        let (manager_id, connection) = self.create_manager(broker).await?;

        let mut state = self.state.lock().await;
        let pool = state
            .pools
            .get_mut(broker)
            .expect("pool inserted just above");
        let manager = pool
            .manager_mut(manager_id)
            .expect("manager inserted just above");
        let slot = manager
            .free_producer_slot()
            .expect("freshly created manager has free slots");
        manager.producer_slots[slot] = Some(id);
        Ok((manager_id, slot, connection))
    }

    async fn acquire_consumer_slot(
        self: &Arc<Self>,
        broker: &BrokerKey,
        id: RegistrationId,
    ) -> Result<(ManagerId, usize, Arc<F::Connection>), CoordinatorError<L::Error>> {
        {
            let mut state = self.state.lock().await;
            let pool = state
                .pools
                .entry(broker.clone())
                .or_insert_with(|| Pool::new(broker.clone()));
            if let Some((manager_id, slot)) = pool.manager_with_free_consumer_slot() {
                let manager = pool.manager_mut(manager_id).expect("manager just matched");
                manager.consumer_slots[slot] = Some(id);
                return Ok((manager_id, slot, manager.connection.clone()));
            }
        }

        let (manager_id, connection) = self.create_manager(broker).await?;

        let mut state = self.state.lock().await;
        let pool = state
            .pools
            .get_mut(broker)
            .expect("pool inserted just above");
        let manager = pool
            .manager_mut(manager_id)
            .expect("manager inserted just above");
        let slot = manager
            .free_consumer_slot()
            .expect("freshly created manager has free slots");
        manager.consumer_slots[slot] = Some(id);
        Ok((manager_id, slot, connection))
    }

    async fn create_manager(
        self: &Arc<Self>,
        broker: &BrokerKey,
    ) -> Result<(ManagerId, Arc<F::Connection>), CoordinatorError<L::Error>> {
        let manager_id = self.manager_ids.next();
        let sink = EventSink {
            manager_id,
            tx: self.events_tx.clone(),
        };
        let connect = self.client_factory.connect(broker, sink);
        let connection = tokio::time::timeout(self.config.connect_timeout, connect)
            .await
            .map_err(|_| CoordinatorError::Connect {
                broker: broker.clone(),
                source: Box::new(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "connect timed out",
                )),
            })?
            .map_err(|e| CoordinatorError::Connect {
                broker: broker.clone(),
                source: Box::new(e),
            })?;
        let connection = Arc::new(connection);

        let mut state = self.state.lock().await;
        let pool = state
            .pools
            .entry(broker.clone())
            .or_insert_with(|| Pool::new(broker.clone()));
        pool.push(Manager::new(
            manager_id,
            broker.clone(),
            connection.clone(),
            self.config.max_producers_per_client,
            self.config.max_committing_consumers_per_client,
        ));
        tracing::info!(%broker, %manager_id, "opened manager connection");
        Ok((manager_id, connection))
    }

    pub(crate) async fn rebind_producer(
        self: &Arc<Self>,
        id: RegistrationId,
        broker: &BrokerKey,
    ) -> Result<(), CoordinatorError<L::Error>> {
        let (manager_id, slot, connection) = self.acquire_producer_slot(broker, id).await?;
        let hooks = {
            let mut state = self.state.lock().await;
            let entry = state
                .producers
                .get_mut(&id)
                .expect("producer entry present for an id being rebound");
            entry.broker = Some(broker.clone());
            entry.binding = Some(Binding { manager_id, slot });
            entry.hooks.clone()
        };
        hooks.set_publisher_id(publishing_id(slot));
        hooks.set_client(connection);
        hooks.running();
        Ok(())
    }

    pub(crate) async fn rebind_consumer(
        self: &Arc<Self>,
        id: RegistrationId,
        broker: &BrokerKey,
    ) -> Result<(), CoordinatorError<L::Error>> {
        let (manager_id, slot, connection) = self.acquire_consumer_slot(broker, id).await?;
        let hooks = {
            let mut state = self.state.lock().await;
            let entry = state
                .consumers
                .get_mut(&id)
                .expect("consumer entry present for an id being rebound");
            entry.broker = Some(broker.clone());
            entry.binding = Some(Binding { manager_id, slot });
            entry.hooks.clone()
        };
        hooks.set_client(connection);
        hooks.running();
        Ok(())
    }

    /// Clears a registration's slot, if any, tearing down its manager (and,
    /// transitively, its pool) if that was the manager's last occupant.
    fn unbind(state: &mut State<F::Connection>, broker: &BrokerKey, binding: Binding, kind: Kind) {
        let mut close_connection = false;
        if let Some(pool) = state.pools.get_mut(broker) {
            if let Some(manager) = pool.manager_mut(binding.manager_id) {
                match kind {
                    Kind::Producer => manager.producer_slots[binding.slot] = None,
                    Kind::CommittingConsumer => manager.consumer_slots[binding.slot] = None,
                }
                if manager.is_empty() {
                    pool.remove_manager(binding.manager_id);
                    close_connection = true;
                }
            }
            if pool.is_empty() {
                state.pools.remove(broker);
            }
        }
        if close_connection {
            let manager_id = binding.manager_id;
            tracing::info!(%broker, %manager_id, "manager emptied, connection closed");
        }
    }

    pub(crate) async fn handle_shutdown(self: &Arc<Self>, manager_id: ManagerId) {
        let (broker, producers, consumers) = {
            let mut state = self.state.lock().await;
            let broker = state
                .pools
                .iter()
                .find(|(_, pool)| pool.manager(manager_id).is_some())
                .map(|(broker, _)| broker.clone());
            let broker = match broker {
                Some(b) => b,
                None => return, // already torn down (e.g. raced with user cleanup)
            };

            let (producer_ids, consumer_ids) = {
                let pool = state.pools.get_mut(&broker).unwrap();
                let manager = pool.manager_mut(manager_id).unwrap();
                manager.dead = true;
                let producer_ids: Vec<_> = manager.bound_producers().collect();
                let consumer_ids: Vec<_> = manager.bound_consumers().collect();
                (producer_ids, consumer_ids)
            };

            state.pools.get_mut(&broker).unwrap().remove_manager(manager_id);
            if state.pools.get(&broker).map(Pool::is_empty).unwrap_or(false) {
                state.pools.remove(&broker);
            }

            for id in &producer_ids {
                if let Some(e) = state.producers.get_mut(id) {
                    e.binding = None;
                }
            }
            for id in &consumer_ids {
                if let Some(e) = state.consumers.get_mut(id) {
                    e.binding = None;
                }
            }

            (broker, producer_ids, consumer_ids)
        };

        tracing::warn!(%broker, %manager_id, producers = producers.len(), consumers = consumers.len(), "manager connection shut down, starting recovery");

        self.notify_unavailable(&producers, &consumers).await;

        let affected = Arc::new(AsyncMutex::new(AffectedIds {
            producers: producers.into_iter().collect(),
            consumers: consumers.into_iter().collect(),
        }));
        recovery::spawn(self.clone(), self.config.shutdown_backoff, affected, None);
    }

    pub(crate) async fn handle_metadata_changed(self: &Arc<Self>, stream: String) {
        let (producers, consumers, existing_job) = {
            let mut state = self.state.lock().await;

            let producer_ids: Vec<RegistrationId> = state
                .producers
                .iter()
                .filter(|(_, e)| e.stream == stream && e.binding.is_some())
                .map(|(id, _)| *id)
                .collect();
            let consumer_ids: Vec<RegistrationId> = state
                .consumers
                .iter()
                .filter(|(_, e)| e.stream == stream && e.binding.is_some())
                .map(|(id, _)| *id)
                .collect();

            for id in &producer_ids {
                let (broker, binding) = {
                    let e = state.producers.get(id).unwrap();
                    (e.broker.clone(), e.binding)
                };
                if let (Some(broker), Some(binding)) = (broker, binding) {
                    Self::unbind(&mut state, &broker, binding, Kind::Producer);
                }
                if let Some(e) = state.producers.get_mut(id) {
                    e.binding = None;
                }
            }
            for id in &consumer_ids {
                let (broker, binding) = {
                    let e = state.consumers.get(id).unwrap();
                    (e.broker.clone(), e.binding)
                };
                if let (Some(broker), Some(binding)) = (broker, binding) {
                    Self::unbind(&mut state, &broker, binding, Kind::CommittingConsumer);
                }
                if let Some(e) = state.consumers.get_mut(id) {
                    e.binding = None;
                }
            }

            let existing_job = state.topology_jobs.get(&stream).cloned();
            (producer_ids, consumer_ids, existing_job)
        };

        if producers.is_empty() && consumers.is_empty() {
            return;
        }

        tracing::warn!(%stream, producers = producers.len(), consumers = consumers.len(), "topology changed, starting recovery");

        self.notify_unavailable(&producers, &consumers).await;

        if let Some(job) = existing_job {
            let mut guard = job.lock().await;
            guard.producers.extend(producers);
            guard.consumers.extend(consumers);
            return;
        }

        let affected = Arc::new(AsyncMutex::new(AffectedIds {
            producers: producers.into_iter().collect(),
            consumers: consumers.into_iter().collect(),
        }));
        {
            let mut state = self.state.lock().await;
            state.topology_jobs.insert(stream.clone(), affected.clone());
        }
        recovery::spawn(
            self.clone(),
            self.config.topology_backoff,
            affected,
            Some(stream),
        );
    }

    async fn notify_unavailable(&self, producers: &[RegistrationId], consumers: &[RegistrationId]) {
        let state = self.state.lock().await;
        let producer_hooks: Vec<_> = producers
            .iter()
            .filter_map(|id| state.producers.get(id).map(|e| e.hooks.clone()))
            .collect();
        let consumer_hooks: Vec<_> = consumers
            .iter()
            .filter_map(|id| state.consumers.get(id).map(|e| e.hooks.clone()))
            .collect();
        drop(state);
        for hooks in producer_hooks {
            hooks.unavailable();
        }
        for hooks in consumer_hooks {
            hooks.unavailable();
        }
    }

    async fn handle_event(self: &Arc<Self>, event: ManagerEvent) {
        match event {
            ManagerEvent::Shutdown { manager_id } => self.handle_shutdown(manager_id).await,
            ManagerEvent::MetadataChanged { stream } => self.handle_metadata_changed(stream).await,
        }
    }
}

#[async_trait]
impl<L: Locator, F: ClientFactory> Releaser<F::Connection> for CoordinatorInner<L, F> {
    async fn release(self: Arc<Self>, id: RegistrationId, kind: Kind) {
        let mut state = self.state.lock().await;
        match kind {
            Kind::Producer => {
                if let Some(entry) = state.producers.remove(&id) {
                    if let (Some(broker), Some(binding)) = (entry.broker.clone(), entry.binding) {
                        Self::unbind(&mut state, &broker, binding, Kind::Producer);
                    }
                }
            }
            Kind::CommittingConsumer => {
                if let Some(entry) = state.consumers.remove(&id) {
                    if let (Some(broker), Some(binding)) = (entry.broker.clone(), entry.binding) {
                        Self::unbind(&mut state, &broker, binding, Kind::CommittingConsumer);
                    }
                }
            }
        }
        drop(state);
        // Also excise this id from any in-flight recovery job's pending set,
        // so a cleanup racing a recovery pass always wins (see concurrency
        // notes: the slot is released here if still present; if it had
        // already been moved into a pending set, this removes it from there).
        let jobs: Vec<_> = {
            let state = self.state.lock().await;
            state.topology_jobs.values().cloned().collect()
        };
        for job in jobs {
            let mut guard = job.lock().await;
            guard.producers.remove(&id);
            guard.consumers.remove(&id);
        }
    }
}

/// Looks up a stream's metadata and classifies it for a fresh registration
/// attempt (§4.2 of the design doc): returns the leader to bind to, or the
/// synchronous error to surface to the caller.
async fn resolve_leader<L: Locator>(
    locator: &L,
    stream: &str,
) -> Result<BrokerKey, CoordinatorError<L::Error>> {
    let metadata = locator
        .metadata(stream)
        .await
        .map_err(CoordinatorError::Locator)?;
    let metadata = metadata.ok_or_else(|| CoordinatorError::StreamDoesNotExist {
        stream: stream.to_string(),
    })?;
    match metadata.response_code() {
        ResponseCode::StreamDoesNotExist => Err(CoordinatorError::StreamDoesNotExist {
            stream: stream.to_string(),
        }),
        ResponseCode::Ok => metadata.leader().cloned().ok_or_else(|| {
            CoordinatorError::illegal_state(stream, "no leader available")
        }),
        _ => Err(CoordinatorError::illegal_state(
            stream,
            "non-OK metadata response code",
        )),
    }
}

/// Entry point for binding producers and committing consumers to stream
/// leader connections, repairing those bindings as connections die or
/// cluster topology changes.
///
/// Cheap to clone: internally it is an `Arc` around the coordinator's shared
/// state, the same shape as the connection pool this crate's design is
/// descended from.
pub struct Coordinator<L: Locator, F: ClientFactory> {
    inner: Arc<CoordinatorInner<L, F>>,
}

impl<L: Locator, F: ClientFactory> Clone for Coordinator<L, F> {
    fn clone(&self) -> Self {
        Coordinator {
            inner: self.inner.clone(),
        }
    }
}

impl<L: Locator, F: ClientFactory> std::fmt::Debug for Coordinator<L, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator").finish_non_exhaustive()
    }
}

impl<L: Locator, F: ClientFactory> Coordinator<L, F> {
    /// Builds a coordinator over `locator` and `client_factory`, using `config`
    /// for slot capacities, backoff policies and connect timeout.
    pub fn new(config: Config, locator: L, client_factory: F) -> Self {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(CoordinatorInner {
            config,
            locator,
            client_factory,
            state: AsyncMutex::new(State::default()),
            registration_ids: IdAllocator::default(),
            manager_ids: ManagerIdAllocator::default(),
            events_tx,
        });

        let weak = Arc::downgrade(&inner);
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                match weak.upgrade() {
                    Some(inner) => inner.handle_event(event).await,
                    None => break,
                }
            }
        });

        Coordinator { inner }
    }

    /// Registers a producer against `stream`, binding it to the stream's
    /// current leader. Fails synchronously with no side effects if the
    /// stream does not exist or has no usable leader.
    pub async fn register_producer(
        &self,
        hooks: Arc<dyn ProducerHooks<F::Connection>>,
        stream: impl Into<String>,
    ) -> Result<CleanupHandle<F::Connection>, CoordinatorError<L::Error>> {
        let stream = stream.into();
        if self.inner.is_closed().await {
            return Err(CoordinatorError::illegal_state(
                stream,
                "coordinator is closed",
            ));
        }

        let broker = resolve_leader(&self.inner.locator, &stream).await?;
        let id = self.inner.registration_ids.next_registration();

        {
            let mut state = self.inner.state.lock().await;
            state.producers.insert(
                id,
                ProducerEntry {
                    stream: stream.clone(),
                    hooks: hooks.clone(),
                    broker: None,
                    binding: None,
                },
            );
        }

        let (manager_id, slot, connection) =
            self.inner.acquire_producer_slot(&broker, id).await?;

        {
            let mut state = self.inner.state.lock().await;
            let entry = state.producers.get_mut(&id).expect("just inserted");
            entry.broker = Some(broker.clone());
            entry.binding = Some(Binding { manager_id, slot });
        }

        hooks.set_publisher_id(publishing_id(slot));
        hooks.set_client(connection);

        Ok(CleanupHandle {
            id,
            kind: Kind::Producer,
            coordinator: self.inner.clone(),
        })
    }

    /// Registers a committing consumer against `stream`, analogous to
    /// [`Coordinator::register_producer`] but without a publishing id.
    pub async fn register_committing_consumer(
        &self,
        hooks: Arc<dyn CommittingConsumerHooks<F::Connection>>,
        stream: impl Into<String>,
    ) -> Result<CleanupHandle<F::Connection>, CoordinatorError<L::Error>> {
        let stream = stream.into();
        if self.inner.is_closed().await {
            return Err(CoordinatorError::illegal_state(
                stream,
                "coordinator is closed",
            ));
        }

        let broker = resolve_leader(&self.inner.locator, &stream).await?;
        let id = self.inner.registration_ids.next_registration();

        {
            let mut state = self.inner.state.lock().await;
            state.consumers.insert(
                id,
                ConsumerEntry {
                    stream: stream.clone(),
                    hooks: hooks.clone(),
                    broker: None,
                    binding: None,
                },
            );
        }

        let (manager_id, slot, connection) =
            self.inner.acquire_consumer_slot(&broker, id).await?;

        {
            let mut state = self.inner.state.lock().await;
            let entry = state.consumers.get_mut(&id).expect("just inserted");
            entry.broker = Some(broker.clone());
            entry.binding = Some(Binding { manager_id, slot });
        }

        hooks.set_client(connection);

        Ok(CleanupHandle {
            id,
            kind: Kind::CommittingConsumer,
            coordinator: self.inner.clone(),
        })
    }

    /// Number of distinct broker pools currently resident.
    pub async fn pool_size(&self) -> usize {
        self.inner.state.lock().await.pools.len()
    }

    /// Total number of live manager connections, across all pools.
    pub async fn client_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .await
            .pools
            .values()
            .map(Pool::client_count)
            .sum()
    }

    /// A point-in-time diagnostic snapshot of every pool.
    pub async fn snapshot(&self) -> CoordinatorSnapshot {
        let state = self.inner.state.lock().await;
        let pools = state
            .pools
            .values()
            .map(|pool| PoolSnapshot {
                broker: pool.broker.clone(),
                clients: pool
                    .managers
                    .iter()
                    .map(|m| ClientSnapshot {
                        producer_slots_used: m.producer_slots_used(),
                        committing_consumer_slots_used: m.consumer_slots_used(),
                    })
                    .collect(),
            })
            .collect();
        CoordinatorSnapshot { pools }
    }

    /// Gracefully shuts the coordinator down: closes every manager connection,
    /// marks the coordinator closed so further registrations fail, and leaves
    /// any in-flight recovery jobs to observe the closed flag and exit on
    /// their next wakeup. Idempotent.
    pub async fn close(&self) {
        let mut state = self.inner.state.lock().await;
        state.closed = true;
        state.pools.clear();
        state.topology_jobs.clear();
    }
}

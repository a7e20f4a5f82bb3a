//! Fake collaborators for exercising a [`crate::Coordinator`] without a real
//! broker: a scriptable [`Locator`], an in-memory [`ClientFactory`], and hook
//! recorders that capture the order lifecycle hooks fire in.
//!
//! Gated behind the `testkit` feature (always available to this crate's own
//! `#[cfg(test)]` modules) so integration tests in `tests/` can depend on it
//! without dragging fakes into a normal build.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;

use crate::{BrokerKey, ClientFactory, CommittingConsumerHooks, EventSink, Locator, ProducerHooks, StreamMetadata};

/// A [`Locator`] error: the fakes never fail to connect, only to resolve
/// metadata, and only when a test explicitly queues an error.
#[derive(Debug, Clone, Error)]
#[error("fake locator error: {0}")]
pub struct FakeLocatorError(pub String);

/// A scriptable locator. Each call to [`Locator::metadata`] for a stream pops
/// the next queued response for that stream; once a stream's queue is
/// exhausted, its last response repeats forever (so a test only needs to
/// queue as many distinct responses as it cares to assert on).
#[derive(Default, Debug)]
pub struct FakeLocator {
    responses: Mutex<HashMap<String, VecDeque<Result<Option<StreamMetadata>, FakeLocatorError>>>>,
    last: Mutex<HashMap<String, Result<Option<StreamMetadata>, FakeLocatorError>>>,
}

impl FakeLocator {
    /// An empty locator; every stream resolves as absent until scripted.
    pub fn new() -> Self {
        FakeLocator::default()
    }

    /// Queues `response` as the next answer [`Locator::metadata`] gives for
    /// `stream`.
    pub fn queue(&self, stream: impl Into<String>, response: Result<Option<StreamMetadata>, FakeLocatorError>) {
        self.responses
            .lock()
            .unwrap()
            .entry(stream.into())
            .or_default()
            .push_back(response);
    }

    /// Queues an immediate, permanent answer for `stream`, replacing any
    /// previously queued responses.
    pub fn set(&self, stream: impl Into<String>, response: Result<Option<StreamMetadata>, FakeLocatorError>) {
        let stream = stream.into();
        self.responses.lock().unwrap().remove(&stream);
        self.last.lock().unwrap().insert(stream, response);
    }
}

#[async_trait]
impl Locator for FakeLocator {
    type Error = FakeLocatorError;

    async fn metadata(&self, stream: &str) -> Result<Option<StreamMetadata>, Self::Error> {
        let queued = self
            .responses
            .lock()
            .unwrap()
            .get_mut(stream)
            .and_then(VecDeque::pop_front);
        let response = match queued {
            Some(response) => response,
            None => self
                .last
                .lock()
                .unwrap()
                .get(stream)
                .cloned()
                .unwrap_or(Ok(None)),
        };
        self.last
            .lock()
            .unwrap()
            .insert(stream.to_string(), response.clone());
        response
    }
}

/// A fake connection: an id plus the [`EventSink`] a test can use to fire
/// shutdown or metadata-change events on its own schedule.
#[derive(Debug)]
pub struct FakeConnection {
    /// Monotonic id, assigned in connection order, handy for assertions.
    pub id: u64,
    /// Used by tests to simulate this connection dying or its broker
    /// reporting a topology change.
    pub events: EventSink,
}

/// An in-memory [`ClientFactory`] that never fails to connect and hands back
/// [`FakeConnection`]s carrying the [`EventSink`] the test can drive.
#[derive(Default, Debug)]
pub struct FakeClientFactory {
    next_id: Mutex<u64>,
    connections: Mutex<Vec<Arc<FakeConnection>>>,
}

impl FakeClientFactory {
    /// A fresh factory with no connections yet.
    pub fn new() -> Self {
        FakeClientFactory::default()
    }

    /// Every connection handed out so far, in connect order.
    pub fn connections(&self) -> Vec<Arc<FakeConnection>> {
        self.connections.lock().unwrap().clone()
    }
}

/// A [`ClientFactory`] error: unused today since [`FakeClientFactory`] never
/// fails to connect, kept so tests can construct one if a future scenario
/// needs a connect failure.
#[derive(Debug, Error)]
#[error("fake client factory error: {0}")]
pub struct FakeConnectError(pub String);

#[async_trait]
impl ClientFactory for FakeClientFactory {
    type Connection = FakeConnection;
    type Error = FakeConnectError;

    async fn connect(
        &self,
        _broker: &BrokerKey,
        events: EventSink,
    ) -> Result<Self::Connection, Self::Error> {
        let id = {
            let mut next_id = self.next_id.lock().unwrap();
            let id = *next_id;
            *next_id += 1;
            id
        };
        let connection = Arc::new(FakeConnection { id, events });
        self.connections.lock().unwrap().push(connection.clone());
        Ok(FakeConnection {
            id: connection.id,
            events: connection.events.clone(),
        })
    }
}

/// One hook invocation, in the order it was observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookEvent {
    /// [`ProducerHooks::set_publisher_id`].
    SetPublisherId(u8),
    /// [`ProducerHooks::set_client`] / [`CommittingConsumerHooks::set_client`], carrying the connection's id.
    SetClient(u64),
    /// [`ProducerHooks::unavailable`] / [`CommittingConsumerHooks::unavailable`].
    Unavailable,
    /// [`ProducerHooks::running`] / [`CommittingConsumerHooks::running`].
    Running,
    /// [`ProducerHooks::close_after_stream_deletion`].
    ClosedAfterStreamDeletion,
}

/// Records every hook invocation for later assertions, implementing both
/// [`ProducerHooks`] and [`CommittingConsumerHooks`] so the same recorder
/// type serves either registration kind.
#[derive(Default, Debug)]
pub struct RecordingHooks {
    events: Mutex<Vec<HookEvent>>,
}

impl RecordingHooks {
    /// A fresh, empty recorder.
    pub fn new() -> Arc<Self> {
        Arc::new(RecordingHooks::default())
    }

    /// A snapshot of every hook call observed so far, in order.
    pub fn events(&self) -> Vec<HookEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Number of times `set_client` was called.
    pub fn set_client_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, HookEvent::SetClient(_)))
            .count()
    }

    /// Number of times `unavailable` was called.
    pub fn unavailable_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, HookEvent::Unavailable))
            .count()
    }

    /// Whether `close_after_stream_deletion` was ever called.
    pub fn was_closed(&self) -> bool {
        self.events()
            .iter()
            .any(|e| matches!(e, HookEvent::ClosedAfterStreamDeletion))
    }
}

impl ProducerHooks<FakeConnection> for RecordingHooks {
    fn set_publisher_id(&self, publishing_id: u8) {
        self.events.lock().unwrap().push(HookEvent::SetPublisherId(publishing_id));
    }

    fn set_client(&self, connection: Arc<FakeConnection>) {
        self.events.lock().unwrap().push(HookEvent::SetClient(connection.id));
    }

    fn unavailable(&self) {
        self.events.lock().unwrap().push(HookEvent::Unavailable);
    }

    fn running(&self) {
        self.events.lock().unwrap().push(HookEvent::Running);
    }

    fn close_after_stream_deletion(&self) {
        self.events.lock().unwrap().push(HookEvent::ClosedAfterStreamDeletion);
    }
}

impl CommittingConsumerHooks<FakeConnection> for RecordingHooks {
    fn set_client(&self, connection: Arc<FakeConnection>) {
        self.events.lock().unwrap().push(HookEvent::SetClient(connection.id));
    }

    fn unavailable(&self) {
        self.events.lock().unwrap().push(HookEvent::Unavailable);
    }

    fn running(&self) {
        self.events.lock().unwrap().push(HookEvent::Running);
    }
}

/// Builds a [`StreamMetadata`] with response code `OK` and the given leader,
/// and an empty replica set beyond the leader — the common case test
/// scenarios need.
pub fn ok_with_leader(stream: &str, leader: BrokerKey) -> Option<StreamMetadata> {
    Some(StreamMetadata::new(
        stream,
        crate::ResponseCode::Ok,
        Some(leader.clone()),
        vec![leader],
    ))
}

/// Builds a [`StreamMetadata`] with response code `OK` but no leader yet
/// (mid-election).
pub fn ok_without_leader(stream: &str) -> Option<StreamMetadata> {
    Some(StreamMetadata::new(stream, crate::ResponseCode::Ok, None, vec![]))
}

/// Builds a [`StreamMetadata`] reporting the stream as deleted.
pub fn deleted(stream: &str) -> Option<StreamMetadata> {
    Some(StreamMetadata::new(
        stream,
        crate::ResponseCode::StreamDoesNotExist,
        None,
        vec![],
    ))
}

//! The metadata view: on-demand lookups of `{stream -> (responseCode, leader, replicas)}`.

use async_trait::async_trait;

use crate::broker::BrokerKey;

/// The response code a locator attaches to a single stream's metadata record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCode {
    /// The stream exists and the record is authoritative (though `leader` may
    /// still be absent while the cluster elects one).
    Ok,
    /// The stream has been deleted, or never existed.
    StreamDoesNotExist,
    /// The stream exists but is transiently unavailable (e.g. mid-election).
    StreamNotAvailable,
    /// The caller lacks permission to address this stream.
    AccessRefused,
    /// Any other broker-defined code not otherwise distinguished here.
    Other(u16),
}

impl ResponseCode {
    /// Whether this code indicates the stream is gone for good, as opposed to
    /// merely unreachable right now.
    pub fn is_deleted(self) -> bool {
        matches!(self, ResponseCode::StreamDoesNotExist)
    }

    /// Whether this code is the happy path (metadata usable, leader may still
    /// be briefly absent).
    pub fn is_ok(self) -> bool {
        matches!(self, ResponseCode::Ok)
    }
}

/// A single stream's metadata as reported by the cluster.
#[derive(Debug, Clone)]
pub struct StreamMetadata {
    name: String,
    response_code: ResponseCode,
    leader: Option<BrokerKey>,
    replicas: Vec<BrokerKey>,
}

impl StreamMetadata {
    /// Builds a metadata record.
    pub fn new(
        name: impl Into<String>,
        response_code: ResponseCode,
        leader: Option<BrokerKey>,
        replicas: Vec<BrokerKey>,
    ) -> Self {
        StreamMetadata {
            name: name.into(),
            response_code,
            leader,
            replicas,
        }
    }

    /// The stream name this record describes.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The response code attached to this record.
    pub fn response_code(&self) -> ResponseCode {
        self.response_code
    }

    /// The current leader, if one is known.
    pub fn leader(&self) -> Option<&BrokerKey> {
        self.leader.as_ref()
    }

    /// The stream's replica set, including the leader when known.
    pub fn replicas(&self) -> &[BrokerKey] {
        &self.replicas
    }
}

/// The metadata locator: a read-mostly connection to the cluster used to resolve
/// a stream name to its current leader.
///
/// Implementations may throw (return `Err`); the coordinator treats a locator
/// failure as fatal during synchronous registration and as transient during a
/// recovery attempt (see [`crate::recovery`]).
#[async_trait]
pub trait Locator: Send + Sync + 'static {
    /// The error type this locator's transport can produce.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Looks up metadata for a single stream. Returns `None` if the stream is
    /// entirely absent from the locator's response (as opposed to present with
    /// a `StreamDoesNotExist` code — both are treated the same way by callers,
    /// but the distinction is preserved for logging).
    async fn metadata(&self, stream: &str) -> Result<Option<StreamMetadata>, Self::Error>;
}

#[async_trait]
impl<T: Locator + ?Sized> Locator for std::sync::Arc<T> {
    type Error = T::Error;

    async fn metadata(&self, stream: &str) -> Result<Option<StreamMetadata>, Self::Error> {
        (**self).metadata(stream).await
    }
}

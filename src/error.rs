//! Error types surfaced by the coordinator.

/// Errors returned synchronously from [`crate::Coordinator::register_producer`] and
/// [`crate::Coordinator::register_committing_consumer`].
///
/// Recovery-time failures never reach this type directly: a locator error observed
/// during a recovery attempt is absorbed into the retry loop (see
/// [`crate::recovery`]) and only ever surfaces to the user as a `closeAfterStreamDeletion`
/// hook invocation once the backoff policy's attempts are exhausted.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError<L>
where
    L: std::error::Error + Send + Sync + 'static,
{
    /// The stream is absent from the locator's response, or its response code
    /// explicitly indicates the stream does not exist.
    #[error("stream {stream:?} does not exist")]
    StreamDoesNotExist {
        /// Name of the stream that was looked up.
        stream: String,
    },

    /// Metadata came back with a non-OK response code other than deletion, or OK
    /// with no leader, or the coordinator has already been closed.
    #[error("illegal state for stream {stream:?}: {reason}")]
    IllegalState {
        /// Name of the stream that was looked up, empty for coordinator-wide states.
        stream: String,
        /// Human-readable explanation, e.g. "no leader available".
        reason: &'static str,
    },

    /// The locator (or the underlying transport it uses) failed.
    #[error("locator lookup failed")]
    Locator(#[source] L),

    /// The client factory failed to establish the initial connection.
    #[error("failed to establish connection to {broker}")]
    Connect {
        /// Broker the client factory tried to connect to.
        broker: crate::broker::BrokerKey,
        /// Underlying transport error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl<L> CoordinatorError<L>
where
    L: std::error::Error + Send + Sync + 'static,
{
    pub(crate) fn illegal_state(stream: impl Into<String>, reason: &'static str) -> Self {
        CoordinatorError::IllegalState {
            stream: stream.into(),
            reason,
        }
    }
}

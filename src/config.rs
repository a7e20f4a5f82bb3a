//! Coordinator tunables: slot capacities and the two backoff policies.

use crate::backoff::BackoffPolicy;
use std::time::Duration;

/// Default number of producer slots per manager, matching the source system's
/// historical per-connection publisher limit.
pub const DEFAULT_MAX_PRODUCERS_PER_CLIENT: usize = 256;

/// Default number of committing-consumer slots per manager.
pub const DEFAULT_MAX_COMMITTING_CONSUMERS_PER_CLIENT: usize = 50;

/// Coordinator configuration, built through [`ConfigBuilder`].
#[derive(Debug, Clone)]
pub struct Config {
    pub(crate) max_producers_per_client: usize,
    pub(crate) max_committing_consumers_per_client: usize,
    pub(crate) shutdown_backoff: BackoffPolicy,
    pub(crate) topology_backoff: BackoffPolicy,
    pub(crate) connect_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_producers_per_client: DEFAULT_MAX_PRODUCERS_PER_CLIENT,
            max_committing_consumers_per_client: DEFAULT_MAX_COMMITTING_CONSUMERS_PER_CLIENT,
            shutdown_backoff: BackoffPolicy::fixed_with_initial_delay(
                Duration::from_millis(0),
                Duration::from_secs(5),
            ),
            topology_backoff: BackoffPolicy::fixed(Duration::from_secs(5)),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl Config {
    /// Returns a [`ConfigBuilder`] seeded with the default configuration.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder(Config::default())
    }
}

/// Builder for [`Config`], following the same consuming-builder shape the
/// pool's own connection options use.
#[derive(Debug, Clone)]
pub struct ConfigBuilder(Config);

impl ConfigBuilder {
    /// Sets the number of producer slots each manager carries.
    ///
    /// A slot index doubles as the publishing id handed to
    /// [`crate::ProducerHooks::set_publisher_id`], which is a single byte, so
    /// `n` cannot exceed 256.
    pub fn max_producers_per_client(mut self, n: usize) -> Self {
        assert!(n > 0, "max_producers_per_client must be greater than zero");
        assert!(
            n <= 256,
            "max_producers_per_client must be at most 256 (publishing id is a byte)"
        );
        self.0.max_producers_per_client = n;
        self
    }

    /// Sets the number of committing-consumer slots each manager carries.
    pub fn max_committing_consumers_per_client(mut self, n: usize) -> Self {
        assert!(
            n > 0,
            "max_committing_consumers_per_client must be greater than zero"
        );
        self.0.max_committing_consumers_per_client = n;
        self
    }

    /// Sets the backoff policy used by recovery jobs triggered by a manager's
    /// connection shutting down.
    pub fn shutdown_backoff(mut self, policy: BackoffPolicy) -> Self {
        self.0.shutdown_backoff = policy;
        self
    }

    /// Sets the backoff policy used by recovery jobs triggered by a
    /// topology-change (metadata) event.
    pub fn topology_backoff(mut self, policy: BackoffPolicy) -> Self {
        self.0.topology_backoff = policy;
        self
    }

    /// Sets how long the client factory is given to establish a connection
    /// before the attempt is treated as failed.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.0.connect_timeout = timeout;
        self
    }

    /// Consumes the builder, returning the finished configuration.
    pub fn build(self) -> Config {
        self.0
    }
}

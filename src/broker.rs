//! The primary index used for pools: a `(host, port)` pair identifying a broker node.

use std::fmt;

/// A node of the streaming cluster, identified by the address clients use to reach it.
///
/// `BrokerKey` is the map key under which [`crate::pool::Pool`]s are kept; two brokers
/// compare equal iff host and port match exactly, so DNS aliases for the same physical
/// node are treated as distinct pools (matching how the locator reports leaders).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
pub struct BrokerKey {
    host: String,
    port: u16,
}

impl BrokerKey {
    /// Builds a broker key from its advertised host and port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        BrokerKey {
            host: host.into(),
            port,
        }
    }

    /// The advertised hostname or IP address.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The advertised port.
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for BrokerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

//! Binds producers and committing consumers to the connections that own a
//! stream's current leader, recovering those bindings when a connection dies
//! or the cluster's topology changes.
//!
//! A [`Coordinator`] multiplexes many producers and committing consumers onto
//! a small number of physical connections ("managers"), one manager per
//! `(broker, slot-capacity)` and up to [`Config::builder`]'s configured limit
//! of each kind of registration per manager. Callers never see a manager
//! directly: they register a set of lifecycle hooks and a stream name, and
//! get back a connection (via [`ProducerHooks::set_client`] or
//! [`CommittingConsumerHooks::set_client`]) along with a [`CleanupHandle`] to
//! release when done.
//!
//! ```ignore
//! use stream_producers_coordinator::{Config, Coordinator};
//!
//! #[tokio::main]
//! async fn main() {
//!     let coordinator = Coordinator::new(Config::builder().build(), locator, client_factory);
//!     let handle = coordinator
//!         .register_producer(hooks, "my-stream")
//!         .await
//!         .unwrap();
//!     // ... publish using the connection handed to `hooks.set_client` ...
//!     handle.release().await;
//! }
//! ```
#![deny(missing_docs, missing_debug_implementations)]

mod backoff;
mod broker;
mod config;
mod coordinator;
mod error;
mod manager;
mod metadata;
mod pool;
mod recovery;
mod registration;
mod snapshot;

#[cfg(any(test, feature = "testkit"))]
pub mod testkit;

pub use backoff::{BackoffConfigError, BackoffPolicy};
pub use broker::BrokerKey;
pub use config::{Config, ConfigBuilder};
pub use coordinator::Coordinator;
pub use error::CoordinatorError;
pub use manager::{ClientFactory, EventSink, ManagerEvent};
pub use metadata::{Locator, ResponseCode, StreamMetadata};
pub use registration::{CleanupHandle, CommittingConsumerHooks, ProducerHooks};
pub use snapshot::{ClientSnapshot, CoordinatorSnapshot, PoolSnapshot};

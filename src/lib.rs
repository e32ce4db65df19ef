//! Application-facing messaging client.
//!
//! A [`Client`] loads `key=value` client properties, joins a consumer group,
//! brings up a producer and prepares a consumer over any [`BrokerClient`]
//! implementation. Consumed messages are committed only after the handler
//! accepted them, which gives at-least-once delivery.
//!
//! The crate does not install a `tracing` subscriber.

pub mod broker;
pub mod client;
pub mod config;
pub mod constants;
pub mod error;
pub mod properties;
pub mod session;

pub use broker::{BrokerClient, InboundMessage, MemoryBroker};
#[cfg(feature = "kafka")]
pub use broker::KafkaBroker;
pub use client::Client;
pub use config::ClientSettings;
pub use error::{
    ClientError, ConfigError, ConnectionError, ConsumerError, HandlerError, ProducerError,
};
pub use properties::Configuration;
pub use session::{ConsumerState, OutboundMessage, ProducerState};

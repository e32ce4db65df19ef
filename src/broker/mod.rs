/*
Broker client surface the sessions drive.

The wire protocol belongs to the broker client library; this module only fixes
the shape of what the sessions need from it: connections that accept requests
synchronously and report progress (ready, errors, deliveries) on an event stream.
*/
use crate::error::ConnectionError;
use crate::properties::Configuration;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio::sync::mpsc;

#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;

#[cfg(feature = "kafka")]
pub use kafka::KafkaBroker;
pub use memory::MemoryBroker;

#[derive(Debug, Clone)]
pub enum BrokerEvent {
    /// Connection established. Emitted at most once per connection.
    Ready,
    /// Connection establishment gave up before reaching ready.
    ConnectFailed(ConnectionError),
    /// Non-terminal error. Observed and logged, never fatal.
    Error(ConnectionError),
    /// A consumed message. Producers never emit this.
    Data(InboundMessage),
}

pub type EventSender = mpsc::UnboundedSender<BrokerEvent>;
pub type EventStream = mpsc::UnboundedReceiver<BrokerEvent>;

/// What a producer connection is asked to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProduceRecord {
    pub topic: String,
    pub key: Option<Bytes>,
    pub payload: Bytes,
    /// `None` lets the broker pick.
    pub partition: Option<u32>,
    /// Delivery delay hint. Zero or negative means send now.
    pub delay_ms: i64,
}

/// A delivered message, with the coordinates needed to commit it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    pub key: Option<Bytes>,
    pub payload: Bytes,
    pub timestamp: i64, // unix millis
}

impl InboundMessage {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

pub trait ProducerConnection: Send + Sync {
    /// Requests a connection. Completion is reported as `Ready` or `ConnectFailed`.
    fn connect(&self) -> Result<(), ConnectionError>;

    /// Hands a record to the client library. Does not wait for the broker ack.
    fn produce(&self, record: ProduceRecord) -> Result<(), ConnectionError>;

    fn disconnect(&self) -> Result<(), ConnectionError>;
}

pub trait ConsumerConnection: Send + Sync {
    fn connect(&self) -> Result<(), ConnectionError>;

    fn subscribe(&self, topics: &[String]) -> Result<(), ConnectionError>;

    /// Starts continuous consumption; messages arrive as `Data` events.
    fn consume(&self) -> Result<(), ConnectionError>;

    fn commit_message(&self, message: &InboundMessage) -> Result<(), ConnectionError>;

    fn disconnect(&self) -> Result<(), ConnectionError>;
}

/// Factory for connections. Construction must not touch the network.
pub trait BrokerClient: Send + Sync {
    fn producer(
        &self,
        config: &Configuration,
    ) -> Result<(Arc<dyn ProducerConnection>, EventStream), ConnectionError>;

    fn consumer(
        &self,
        config: &Configuration,
    ) -> Result<(Arc<dyn ConsumerConnection>, EventStream), ConnectionError>;
}

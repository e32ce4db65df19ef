use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("could not parse client settings {path:?}: {source}")]
    Settings {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Reported by a broker connection, either synchronously from a request or
/// asynchronously through its event stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("broker transport failure: {0}")]
    Transport(String),

    #[error("connection is not established")]
    NotConnected,

    #[error("connection was closed")]
    Disconnected,

    #[error("invalid connection config: {0}")]
    Config(String),

    #[error("commit rejected: {0}")]
    Commit(String),
}

/// Raised by the application's message handler. Carries the coordinates of the
/// message that failed so the error-first callback can report it.
#[derive(Debug, Error)]
#[error("handler failed for {topic}[{partition}]@{offset}: {source}")]
pub struct HandlerError {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    #[source]
    pub source: anyhow::Error,
}

#[derive(Debug, Error)]
pub enum ProducerError {
    #[error("producer has not been started")]
    NotStarted,

    #[error("producer was already started")]
    AlreadyStarted,

    #[error("producer is closed")]
    Closed,

    #[error("message could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("producer failed to connect: {0}")]
    Connect(#[source] ConnectionError),

    #[error("producer was not ready after {0:?}")]
    ConnectTimeout(Duration),

    #[error("producer connection error: {0}")]
    Connection(#[from] ConnectionError),
}

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("consumer has not been started")]
    NotStarted,

    #[error("consumer was already started")]
    AlreadyStarted,

    #[error("consumer is already active on topic {topic}")]
    AlreadyActive { topic: String },

    #[error("consumer is closed")]
    Closed,

    #[error("consumer connection error: {0}")]
    Connection(#[from] ConnectionError),
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("producer error: {0}")]
    Producer(#[from] ProducerError),

    #[error("consumer error: {0}")]
    Consumer(#[from] ConsumerError),
}

use crate::broker::{BrokerClient, BrokerEvent, ConsumerConnection, EventStream, InboundMessage};
use crate::constants::{AUTO_OFFSET_RESET_KEY, OFFSET_RESET_EARLIEST};
use crate::error::{ConnectionError, ConsumerError, HandlerError};
use crate::properties::Configuration;
use crate::session::lock;
use anyhow::anyhow;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Unconnected,
    Connecting,
    Subscribed,
    Closed,
}

struct Pipeline {
    topic: String,
    connection: Arc<dyn ConsumerConnection>,
    state: watch::Receiver<ConsumerState>,
    task: JoinHandle<()>,
}

enum Slot {
    Unconnected,
    // built by `start`, not connected until activation
    Idle {
        connection: Arc<dyn ConsumerConnection>,
        events: EventStream,
    },
    Active(Pipeline),
    Closed,
}

/// Owns the consumer connection and its single delivery pipeline.
///
/// A message is committed only after the handler accepted it. When the handler
/// fails, it is called once more with the error and the offset stays
/// uncommitted, so the broker redelivers the message after a restart or rebalance.
pub struct ConsumerSession {
    broker: Arc<dyn BrokerClient>,
    slot: Mutex<Slot>,
}

impl ConsumerSession {
    pub fn new(broker: Arc<dyn BrokerClient>) -> Self {
        ConsumerSession {
            broker,
            slot: Mutex::new(Slot::Unconnected),
        }
    }

    pub fn state(&self) -> ConsumerState {
        match &*lock(&self.slot) {
            Slot::Unconnected | Slot::Idle { .. } => ConsumerState::Unconnected,
            Slot::Active(pipeline) => *pipeline.state.borrow(),
            Slot::Closed => ConsumerState::Closed,
        }
    }

    /// Topic of the active pipeline, if any.
    pub fn topic(&self) -> Option<String> {
        match &*lock(&self.slot) {
            Slot::Active(pipeline) => Some(pipeline.topic.clone()),
            _ => None,
        }
    }

    /// Builds the connection without connecting. Reading starts from the
    /// earliest retained message when the group has no committed offset.
    pub fn start(&self, config: &Configuration) -> Result<(), ConsumerError> {
        info!("setting up consumer");
        let mut slot = lock(&self.slot);
        match *slot {
            Slot::Unconnected => {}
            Slot::Closed => return Err(ConsumerError::Closed),
            Slot::Idle { .. } | Slot::Active(_) => return Err(ConsumerError::AlreadyStarted),
        }
        let config = config
            .clone()
            .with(AUTO_OFFSET_RESET_KEY, OFFSET_RESET_EARLIEST);
        let (connection, events) = self.broker.consumer(&config)?;
        *slot = Slot::Idle { connection, events };
        info!("consumer is ready");
        Ok(())
    }

    /// Connects, subscribes to `topic` and feeds every delivered message to
    /// `handler`. Returns immediately; delivery happens on a background task.
    ///
    /// A session runs one pipeline: activating again is rejected with
    /// [`ConsumerError::AlreadyActive`].
    pub fn activate<F>(&self, topic: &str, handler: F) -> Result<(), ConsumerError>
    where
        F: FnMut(Result<&InboundMessage, HandlerError>) -> anyhow::Result<()> + Send + 'static,
    {
        let mut slot = lock(&self.slot);
        match std::mem::replace(&mut *slot, Slot::Closed) {
            Slot::Idle { connection, events } => {
                let (state_tx, state_rx) = watch::channel(ConsumerState::Connecting);
                let task = tokio::spawn(run_pipeline(
                    Arc::clone(&connection),
                    events,
                    topic.to_string(),
                    handler,
                    state_tx,
                ));
                *slot = Slot::Active(Pipeline {
                    topic: topic.to_string(),
                    connection,
                    state: state_rx,
                    task,
                });
                info!(%topic, "consumer activated");
                Ok(())
            }
            Slot::Active(pipeline) => {
                let active = pipeline.topic.clone();
                *slot = Slot::Active(pipeline);
                warn!(requested = %topic, %active, "consumer already active");
                Err(ConsumerError::AlreadyActive { topic: active })
            }
            Slot::Unconnected => {
                *slot = Slot::Unconnected;
                Err(ConsumerError::NotStarted)
            }
            Slot::Closed => Err(ConsumerError::Closed),
        }
    }

    /// Stops delivery and disconnects. Never fails; problems are logged.
    pub fn close(&self) {
        let previous = std::mem::replace(&mut *lock(&self.slot), Slot::Closed);
        let connection = match previous {
            Slot::Idle { connection, .. } => connection,
            Slot::Active(pipeline) => {
                pipeline.task.abort();
                pipeline.connection
            }
            Slot::Unconnected | Slot::Closed => {
                debug!("consumer close: nothing to disconnect");
                return;
            }
        };
        match connection.disconnect() {
            Ok(()) => info!("consumer disconnected"),
            Err(e) => error!(error = %e, "error closing consumer connection"),
        }
    }
}

async fn run_pipeline<F>(
    connection: Arc<dyn ConsumerConnection>,
    mut events: EventStream,
    topic: String,
    mut handler: F,
    state: watch::Sender<ConsumerState>,
) where
    F: FnMut(Result<&InboundMessage, HandlerError>) -> anyhow::Result<()>,
{
    if let Err(e) = connection.connect() {
        error!(%topic, error = %e, "consumer failed to connect");
        state.send_replace(ConsumerState::Closed);
        return;
    }

    while let Some(event) = events.recv().await {
        match event {
            BrokerEvent::Ready => match subscribe(connection.as_ref(), &topic) {
                Ok(()) => {
                    state.send_replace(ConsumerState::Subscribed);
                    info!(%topic, "consumer subscribed");
                }
                Err(e) => error!(%topic, error = %e, "consumer failed to subscribe"),
            },
            BrokerEvent::ConnectFailed(e) => {
                error!(%topic, error = %e, "consumer failed to connect");
                state.send_replace(ConsumerState::Closed);
                return;
            }
            BrokerEvent::Error(e) => error!(%topic, error = %e, "error from consumer connection"),
            BrokerEvent::Data(message) => {
                deliver(connection.as_ref(), &mut handler, message);
            }
        }
    }
    debug!(%topic, "consumer event stream ended");
}

fn subscribe(connection: &dyn ConsumerConnection, topic: &str) -> Result<(), ConnectionError> {
    connection.subscribe(&[topic.to_string()])?;
    connection.consume()
}

/// Hands one message to the handler and commits it if the handler accepted it.
/// Contains no await point, so the pair cannot be split by task cancellation.
fn deliver<F>(connection: &dyn ConsumerConnection, handler: &mut F, message: InboundMessage)
where
    F: FnMut(Result<&InboundMessage, HandlerError>) -> anyhow::Result<()>,
{
    match call_handler(handler, Ok(&message)) {
        Ok(()) => match connection.commit_message(&message) {
            Ok(()) => debug!(
                topic = %message.topic,
                partition = message.partition,
                offset = message.offset,
                "message committed"
            ),
            Err(e) => warn!(
                topic = %message.topic,
                partition = message.partition,
                offset = message.offset,
                error = %e,
                "commit failed"
            ),
        },
        Err(source) => {
            let failure = HandlerError {
                topic: message.topic,
                partition: message.partition,
                offset: message.offset,
                source,
            };
            error!(error = %failure, "message handler failed; offset left uncommitted");
            if let Err(e) = call_handler(handler, Err(failure)) {
                debug!(error = %e, "handler failed on its error callback too");
            }
        }
    }
}

/// Runs the handler, turning a panic into an ordinary handler error so one bad
/// message cannot stop the pipeline.
fn call_handler<F>(handler: &mut F, delivery: Result<&InboundMessage, HandlerError>) -> anyhow::Result<()>
where
    F: FnMut(Result<&InboundMessage, HandlerError>) -> anyhow::Result<()>,
{
    match panic::catch_unwind(AssertUnwindSafe(|| handler(delivery))) {
        Ok(result) => result,
        Err(payload) => Err(anyhow!("handler panicked: {}", panic_message(&*payload))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}

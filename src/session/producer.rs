use crate::broker::{BrokerClient, BrokerEvent, EventStream, ProduceRecord, ProducerConnection};
use crate::error::{ConnectionError, ProducerError};
use crate::properties::Configuration;
use crate::session::lock;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerState {
    Unconnected,
    Connecting,
    Ready,
    Closed,
}

/// One-shot readiness of a producer connection. Leaves `Pending` exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Readiness {
    Pending,
    Ready,
    Failed(ConnectionError),
    Closed,
}

/// A message to publish, before encoding.
#[derive(Debug, Clone)]
pub struct OutboundMessage<T> {
    pub topic: String,
    pub key: Option<Bytes>,
    pub payload: T,
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl<T: Serialize> OutboundMessage<T> {
    pub fn new(topic: impl Into<String>, payload: T) -> Self {
        OutboundMessage {
            topic: topic.into(),
            key: None,
            payload,
            scheduled_at: None,
        }
    }

    pub fn key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    fn into_record(self, now: DateTime<Utc>) -> Result<ProduceRecord, ProducerError> {
        let payload = serde_json::to_vec(&self.payload)?;
        Ok(ProduceRecord {
            topic: self.topic,
            key: self.key,
            payload: Bytes::from(payload),
            partition: None,
            delay_ms: delay_ms(self.scheduled_at, now),
        })
    }
}

/// Milliseconds until `scheduled_at`; zero when unscheduled, negative when already past.
pub(crate) fn delay_ms(scheduled_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> i64 {
    scheduled_at
        .map(|at| (at - now).num_milliseconds())
        .unwrap_or(0)
}

struct ProducerLink {
    connection: Arc<dyn ProducerConnection>,
    queue: mpsc::UnboundedSender<ProduceRecord>,
    readiness: Arc<watch::Sender<Readiness>>,
    dispatcher: JoinHandle<()>,
    observer: JoinHandle<()>,
}

enum Slot {
    Unconnected,
    Connecting(ProducerLink),
    Ready(ProducerLink),
    Closed,
}

/// Owns the producer connection. Records published before the connection is
/// ready wait in a queue that a single dispatcher drains, in submission order,
/// once the first ready event arrives.
pub struct ProducerSession {
    broker: Arc<dyn BrokerClient>,
    connect_timeout: Option<Duration>,
    slot: Mutex<Slot>,
}

impl ProducerSession {
    pub fn new(broker: Arc<dyn BrokerClient>) -> Self {
        ProducerSession {
            broker,
            connect_timeout: None,
            slot: Mutex::new(Slot::Unconnected),
        }
    }

    /// Gives up on `start` if the connection is not ready in time.
    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn state(&self) -> ProducerState {
        match *lock(&self.slot) {
            Slot::Unconnected => ProducerState::Unconnected,
            Slot::Connecting(_) => ProducerState::Connecting,
            Slot::Ready(_) => ProducerState::Ready,
            Slot::Closed => ProducerState::Closed,
        }
    }

    /// Builds the connection, asks it to connect, and waits until it is ready.
    pub async fn start(&self, config: &Configuration) -> Result<(), ProducerError> {
        info!("setting up producer");
        let (connection, mut readiness_rx) = {
            let mut slot = lock(&self.slot);
            match *slot {
                Slot::Unconnected => {}
                Slot::Closed => return Err(ProducerError::Closed),
                Slot::Connecting(_) | Slot::Ready(_) => return Err(ProducerError::AlreadyStarted),
            }
            let (connection, events) = self.broker.producer(config)?;
            let link = spawn_link(Arc::clone(&connection), events);
            let readiness_rx = link.readiness.subscribe();
            *slot = Slot::Connecting(link);
            (connection, readiness_rx)
        };

        if let Err(e) = connection.connect() {
            self.abandon().await;
            return Err(ProducerError::Connect(e));
        }

        // the watch guard is not Send; copy the value out before the next await
        let settled = async {
            readiness_rx
                .wait_for(|r| *r != Readiness::Pending)
                .await
                .map(|r| (*r).clone())
        };
        let outcome = match self.connect_timeout {
            Some(limit) => match tokio::time::timeout(limit, settled).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(timeout = ?limit, "producer did not become ready in time");
                    self.abandon().await;
                    return Err(ProducerError::ConnectTimeout(limit));
                }
            },
            None => settled.await,
        };

        match outcome {
            Ok(Readiness::Ready) => {}
            Ok(Readiness::Failed(e)) => {
                self.abandon().await;
                return Err(ProducerError::Connect(e));
            }
            Ok(Readiness::Closed) | Ok(Readiness::Pending) | Err(_) => {
                return Err(ProducerError::Closed);
            }
        }

        let mut slot = lock(&self.slot);
        match std::mem::replace(&mut *slot, Slot::Closed) {
            Slot::Connecting(link) => {
                *slot = Slot::Ready(link);
                info!("producer is ready");
                Ok(())
            }
            // closed while we were waiting
            other => {
                *slot = other;
                Err(ProducerError::Closed)
            }
        }
    }

    /// Encodes `message` as JSON and queues it for `topic`. Returns without
    /// waiting for the broker to acknowledge the send.
    pub fn publish<T: Serialize + ?Sized>(
        &self,
        topic: &str,
        message: &T,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> Result<(), ProducerError> {
        let now = Utc::now();
        let record = ProduceRecord {
            topic: topic.to_string(),
            key: None,
            payload: Bytes::from(serde_json::to_vec(message)?),
            partition: None,
            delay_ms: delay_ms(scheduled_at, now),
        };
        debug!(%topic, ?scheduled_at, delay_ms = record.delay_ms, "queueing message");
        self.enqueue(record)
    }

    pub fn publish_message<T: Serialize>(
        &self,
        message: OutboundMessage<T>,
    ) -> Result<(), ProducerError> {
        let record = message.into_record(Utc::now())?;
        debug!(topic = %record.topic, delay_ms = record.delay_ms, "queueing message");
        self.enqueue(record)
    }

    fn enqueue(&self, record: ProduceRecord) -> Result<(), ProducerError> {
        match &*lock(&self.slot) {
            Slot::Connecting(link) | Slot::Ready(link) => link
                .queue
                .send(record)
                .map_err(|_| ProducerError::Connection(ConnectionError::Disconnected)),
            Slot::Unconnected => Err(ProducerError::NotStarted),
            Slot::Closed => Err(ProducerError::Closed),
        }
    }

    /// Flushes queued records if the connection is ready, then disconnects.
    /// Never fails; problems are logged.
    pub async fn close(&self) {
        let previous = std::mem::replace(&mut *lock(&self.slot), Slot::Closed);
        match previous {
            Slot::Connecting(link) | Slot::Ready(link) => shutdown(link).await,
            Slot::Unconnected | Slot::Closed => debug!("producer close: nothing to disconnect"),
        }
    }

    /// Tears down a link that never became ready.
    async fn abandon(&self) {
        let previous = std::mem::replace(&mut *lock(&self.slot), Slot::Closed);
        if let Slot::Connecting(link) | Slot::Ready(link) = previous {
            shutdown(link).await;
        }
    }
}

fn spawn_link(connection: Arc<dyn ProducerConnection>, events: EventStream) -> ProducerLink {
    let (queue, queued) = mpsc::unbounded_channel();
    let (readiness, _) = watch::channel(Readiness::Pending);
    let readiness = Arc::new(readiness);
    let observer = tokio::spawn(observe(events, Arc::clone(&readiness)));
    let dispatcher = tokio::spawn(dispatch(
        Arc::clone(&connection),
        queued,
        readiness.subscribe(),
    ));
    ProducerLink {
        connection,
        queue,
        readiness,
        dispatcher,
        observer,
    }
}

/// Routes connection events: the first ready or connect failure settles the
/// readiness signal, errors are logged.
async fn observe(mut events: EventStream, readiness: Arc<watch::Sender<Readiness>>) {
    while let Some(event) = events.recv().await {
        match event {
            BrokerEvent::Ready => {
                readiness.send_if_modified(|r| settle(r, Readiness::Ready));
            }
            BrokerEvent::ConnectFailed(e) => {
                error!(error = %e, "producer failed to connect");
                readiness.send_if_modified(|r| settle(r, Readiness::Failed(e)));
            }
            BrokerEvent::Error(e) => error!(error = %e, "error from producer connection"),
            BrokerEvent::Data(message) => {
                warn!(topic = %message.topic, "producer connection delivered a message; ignored")
            }
        }
    }
}

fn settle(current: &mut Readiness, next: Readiness) -> bool {
    if *current != Readiness::Pending {
        return false;
    }
    *current = next;
    true
}

/// Waits for the first ready transition, then sends queued records in order.
async fn dispatch(
    connection: Arc<dyn ProducerConnection>,
    mut queued: mpsc::UnboundedReceiver<ProduceRecord>,
    mut readiness: watch::Receiver<Readiness>,
) {
    let ready = match readiness.wait_for(|r| *r != Readiness::Pending).await {
        Ok(r) => *r == Readiness::Ready,
        Err(_) => false,
    };
    if !ready {
        queued.close();
        let mut dropped = 0usize;
        while queued.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            warn!(dropped, "producer never became ready; dropping queued messages");
        }
        return;
    }

    while let Some(record) = queued.recv().await {
        debug!(topic = %record.topic, delay_ms = record.delay_ms, "sending message");
        let topic = record.topic.clone();
        if let Err(e) = connection.produce(record) {
            error!(%topic, error = %e, "producer failed to send message");
        }
    }
}

async fn shutdown(link: ProducerLink) {
    let ProducerLink {
        connection,
        queue,
        readiness,
        dispatcher,
        observer,
    } = link;

    readiness.send_if_modified(|r| settle(r, Readiness::Closed));
    drop(queue);
    if let Err(e) = dispatcher.await {
        warn!(error = %e, "producer dispatcher ended abnormally");
    }

    match connection.disconnect() {
        Ok(()) => info!("producer disconnected"),
        Err(e) => error!(error = %e, "error closing producer connection"),
    }
    observer.abort();
}

//! In-process broker with Kafka-shaped semantics: topics split into partitions,
//! per-partition offsets, and committed offsets per consumer group.
//!
//! Useful for local development and for tests. The fault switches on
//! [`MemoryBroker`] make every connection it hands out misbehave in a
//! controlled way (hold back readiness, fail to connect, fail to disconnect,
//! reject commits, or emit asynchronous errors).

mod log_engine;
mod offset_tracker;
mod topic;

pub use offset_tracker::CommitRecord;

use crate::broker::{
    BrokerClient, BrokerEvent, ConsumerConnection, EventSender, EventStream, InboundMessage,
    ProduceRecord, ProducerConnection,
};
use crate::constants::{
    AUTO_OFFSET_RESET_KEY, DEFAULT_PARTITION_CNT, GROUP_ID_KEY, OFFSET_RESET_LATEST,
};
use crate::error::ConnectionError;
use crate::properties::Configuration;
use bytes::Bytes;
use log_engine::LogEngine;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct Faults {
    hold_ready: bool,
    connect_failure: Option<ConnectionError>,
    fail_disconnect: bool,
    reject_commits: bool,
}

struct Shared {
    engine: Mutex<LogEngine>,
    appended: Notify,
    produced: Mutex<Vec<ProduceRecord>>,
    faults: Mutex<Faults>,
    held: Mutex<Vec<EventSender>>,
    live: Mutex<Vec<EventSender>>,
}

impl Shared {
    fn append(&self, record: ProduceRecord) -> Result<(u32, u64), ConnectionError> {
        let placed = lock(&self.engine).produce(
            &record.topic,
            record.partition,
            record.key,
            record.payload,
            chrono::Utc::now().timestamp_millis(),
        )?;
        self.appended.notify_waiters();
        Ok(placed)
    }

    /// Completes a connect request according to the current fault switches.
    fn settle_connect(&self, events: EventSender) -> Result<(), ConnectionError> {
        let faults = lock(&self.faults);
        if let Some(err) = faults.connect_failure.clone() {
            let _ = events.send(BrokerEvent::ConnectFailed(err));
            return Ok(());
        }
        lock(&self.live).push(events.clone());
        if faults.hold_ready {
            lock(&self.held).push(events);
        } else {
            let _ = events.send(BrokerEvent::Ready);
        }
        Ok(())
    }

    /// Drops the broker's handles on a connection's event stream.
    fn forget(&self, events: &EventSender) {
        lock(&self.live).retain(|live| !live.same_channel(events));
        lock(&self.held).retain(|held| !held.same_channel(events));
    }

    fn disconnect_allowed(&self) -> Result<(), ConnectionError> {
        if lock(&self.faults).fail_disconnect {
            return Err(ConnectionError::Transport("broker refused disconnect".into()));
        }
        Ok(())
    }
}

/// Cheap to clone; clones share the same topics and offsets.
#[derive(Clone)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        MemoryBroker::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::with_partitions(DEFAULT_PARTITION_CNT)
    }

    /// Auto-created topics get `partition_count` partitions.
    pub fn with_partitions(partition_count: u32) -> Self {
        MemoryBroker {
            shared: Arc::new(Shared {
                engine: Mutex::new(LogEngine::new(partition_count)),
                appended: Notify::new(),
                produced: Mutex::new(Vec::new()),
                faults: Mutex::new(Faults::default()),
                held: Mutex::new(Vec::new()),
                live: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Connections requested from now on stay connecting until [`release_ready`](Self::release_ready).
    pub fn hold_ready(&self) {
        lock(&self.shared.faults).hold_ready = true;
    }

    pub fn release_ready(&self) {
        lock(&self.shared.faults).hold_ready = false;
        for events in lock(&self.shared.held).drain(..) {
            let _ = events.send(BrokerEvent::Ready);
        }
    }

    pub fn fail_connect(&self, err: ConnectionError) {
        lock(&self.shared.faults).connect_failure = Some(err);
    }

    pub fn fail_disconnect(&self) {
        lock(&self.shared.faults).fail_disconnect = true;
    }

    pub fn reject_commits(&self) {
        lock(&self.shared.faults).reject_commits = true;
    }

    /// Pushes a non-fatal error to every connected client.
    pub fn emit_error(&self, err: ConnectionError) {
        let mut live = lock(&self.shared.live);
        live.retain(|events| events.send(BrokerEvent::Error(err.clone())).is_ok());
    }

    /// Appends a record as if another producer had sent it.
    pub fn inject(&self, topic: &str, payload: impl Into<Bytes>) -> Result<(u32, u64), ConnectionError> {
        self.shared.append(ProduceRecord {
            topic: topic.to_string(),
            key: None,
            payload: payload.into(),
            partition: None,
            delay_ms: 0,
        })
    }

    pub fn create_topic(&self, name: &str, partition_count: u32) {
        lock(&self.shared.engine).create_topic(name, Some(partition_count));
    }

    /// Every record handed to a producer connection, in the order received.
    pub fn produced(&self) -> Vec<ProduceRecord> {
        lock(&self.shared.produced).clone()
    }

    pub fn high_watermark(&self, topic: &str, partition: u32) -> u64 {
        lock(&self.shared.engine).high_watermark(topic, partition)
    }

    pub fn committed_offset(&self, group: &str, topic: &str, partition: u32) -> Option<u64> {
        lock(&self.shared.engine).committed_offset(group, topic, partition)
    }

    pub fn commits(&self) -> Vec<CommitRecord> {
        lock(&self.shared.engine).commit_history()
    }
}

impl BrokerClient for MemoryBroker {
    fn producer(
        &self,
        _config: &Configuration,
    ) -> Result<(Arc<dyn ProducerConnection>, EventStream), ConnectionError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let producer = MemoryProducer {
            shared: Arc::clone(&self.shared),
            events: Mutex::new(Some(tx)),
            connected: AtomicBool::new(false),
        };
        Ok((Arc::new(producer), rx))
    }

    fn consumer(
        &self,
        config: &Configuration,
    ) -> Result<(Arc<dyn ConsumerConnection>, EventStream), ConnectionError> {
        let group = config
            .get(GROUP_ID_KEY)
            .ok_or_else(|| ConnectionError::Config(format!("{} is required", GROUP_ID_KEY)))?
            .to_string();
        let reset = OffsetReset::from_config(config.get(AUTO_OFFSET_RESET_KEY));
        let (tx, rx) = mpsc::unbounded_channel();
        let consumer = MemoryConsumer {
            shared: Arc::clone(&self.shared),
            group,
            reset,
            events: Mutex::new(Some(tx)),
            connected: AtomicBool::new(false),
            topics: Mutex::new(Vec::new()),
            pump: Mutex::new(None),
        };
        Ok((Arc::new(consumer), rx))
    }
}

struct MemoryProducer {
    shared: Arc<Shared>,
    events: Mutex<Option<EventSender>>,
    connected: AtomicBool,
}

impl ProducerConnection for MemoryProducer {
    fn connect(&self) -> Result<(), ConnectionError> {
        let events = lock(&self.events)
            .clone()
            .ok_or(ConnectionError::Disconnected)?;
        self.connected.store(true, Ordering::SeqCst);
        self.shared.settle_connect(events)
    }

    fn produce(&self, record: ProduceRecord) -> Result<(), ConnectionError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ConnectionError::NotConnected);
        }
        lock(&self.shared.produced).push(record.clone());

        if record.delay_ms <= 0 {
            self.shared.append(record)?;
            return Ok(());
        }

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| ConnectionError::Transport(format!("delayed send needs a runtime: {}", e)))?;
        let shared = Arc::clone(&self.shared);
        let events = lock(&self.events).clone();
        let delay = Duration::from_millis(record.delay_ms as u64);
        runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = shared.append(record) {
                if let Some(events) = events {
                    let _ = events.send(BrokerEvent::Error(e));
                }
            }
        });
        Ok(())
    }

    fn disconnect(&self) -> Result<(), ConnectionError> {
        self.shared.disconnect_allowed()?;
        self.connected.store(false, Ordering::SeqCst);
        if let Some(events) = lock(&self.events).take() {
            self.shared.forget(&events);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OffsetReset {
    Earliest,
    Latest,
}

impl OffsetReset {
    fn from_config(value: Option<&str>) -> Self {
        match value {
            Some(OFFSET_RESET_LATEST) | Some("largest") | Some("end") => OffsetReset::Latest,
            _ => OffsetReset::Earliest,
        }
    }
}

struct MemoryConsumer {
    shared: Arc<Shared>,
    group: String,
    reset: OffsetReset,
    events: Mutex<Option<EventSender>>,
    connected: AtomicBool,
    topics: Mutex<Vec<String>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryConsumer {
    fn ensure_connected(&self) -> Result<(), ConnectionError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ConnectionError::NotConnected)
        }
    }
}

impl ConsumerConnection for MemoryConsumer {
    fn connect(&self) -> Result<(), ConnectionError> {
        let events = lock(&self.events)
            .clone()
            .ok_or(ConnectionError::Disconnected)?;
        self.connected.store(true, Ordering::SeqCst);
        self.shared.settle_connect(events)
    }

    fn subscribe(&self, topics: &[String]) -> Result<(), ConnectionError> {
        self.ensure_connected()?;
        *lock(&self.topics) = topics.to_vec();
        debug!(group = %self.group, ?topics, "subscribed");
        Ok(())
    }

    fn consume(&self) -> Result<(), ConnectionError> {
        self.ensure_connected()?;
        let mut pump = lock(&self.pump);
        if pump.is_some() {
            return Ok(());
        }
        let events = lock(&self.events)
            .clone()
            .ok_or(ConnectionError::Disconnected)?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| ConnectionError::Transport(format!("consume needs a runtime: {}", e)))?;
        let fetcher = Fetcher {
            shared: Arc::clone(&self.shared),
            group: self.group.clone(),
            reset: self.reset,
            topics: lock(&self.topics).clone(),
            positions: HashMap::new(),
        };
        *pump = Some(runtime.spawn(fetcher.run(events)));
        Ok(())
    }

    fn commit_message(&self, message: &InboundMessage) -> Result<(), ConnectionError> {
        self.ensure_connected()?;
        if lock(&self.shared.faults).reject_commits {
            return Err(ConnectionError::Commit(format!(
                "broker rejected commit for {}[{}]@{}",
                message.topic, message.partition, message.offset
            )));
        }
        lock(&self.shared.engine).commit_offset(
            &message.topic,
            message.partition,
            &self.group,
            message.offset + 1,
        );
        Ok(())
    }

    fn disconnect(&self) -> Result<(), ConnectionError> {
        self.shared.disconnect_allowed()?;
        self.connected.store(false, Ordering::SeqCst);
        if let Some(pump) = lock(&self.pump).take() {
            pump.abort();
        }
        if let Some(events) = lock(&self.events).take() {
            self.shared.forget(&events);
        }
        Ok(())
    }
}

/// Pulls records for one consumer and turns them into `Data` events.
struct Fetcher {
    shared: Arc<Shared>,
    group: String,
    reset: OffsetReset,
    topics: Vec<String>,
    positions: HashMap<(String, u32), u64>,
}

impl Fetcher {
    async fn run(mut self, events: EventSender) {
        let shared = Arc::clone(&self.shared);
        loop {
            let notified = shared.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.poll();
            if batch.is_empty() {
                notified.await;
                continue;
            }
            for message in batch {
                if events.send(BrokerEvent::Data(message)).is_err() {
                    warn!(group = %self.group, "consumer event stream closed; stopping fetch");
                    return;
                }
            }
        }
    }

    fn poll(&mut self) -> Vec<InboundMessage> {
        let engine = lock(&self.shared.engine);
        let mut batch = Vec::new();
        for topic in &self.topics {
            for partition in 0..engine.partition_count(topic) {
                let position = self
                    .positions
                    .entry((topic.clone(), partition))
                    .or_insert_with(|| {
                        engine
                            .committed_offset(&self.group, topic, partition)
                            .unwrap_or(match self.reset {
                                OffsetReset::Earliest => 0,
                                OffsetReset::Latest => engine.high_watermark(topic, partition),
                            })
                    });
                for record in engine.read_from(topic, partition, *position) {
                    *position = record.offset + 1;
                    batch.push(InboundMessage {
                        topic: topic.clone(),
                        partition,
                        offset: record.offset,
                        key: record.key,
                        payload: record.payload,
                        timestamp: record.timestamp,
                    });
                }
            }
        }
        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    fn group_config(group: &str) -> Configuration {
        Configuration::new().with(GROUP_ID_KEY, group)
    }

    async fn next_event(events: &mut EventStream) -> BrokerEvent {
        timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("timed out waiting for broker event")
            .expect("event stream closed")
    }

    #[tokio::test]
    async fn producer_emits_ready_after_connect() {
        let broker = MemoryBroker::new();
        let (producer, mut events) = broker.producer(&Configuration::new()).unwrap();

        assert_eq!(
            producer.produce(ProduceRecord {
                topic: "t".into(),
                key: None,
                payload: Bytes::from_static(b"x"),
                partition: None,
                delay_ms: 0,
            }),
            Err(ConnectionError::NotConnected)
        );

        producer.connect().unwrap();
        assert!(matches!(next_event(&mut events).await, BrokerEvent::Ready));
    }

    #[tokio::test]
    async fn held_connections_become_ready_on_release() {
        let broker = MemoryBroker::new();
        broker.hold_ready();
        let (producer, mut events) = broker.producer(&Configuration::new()).unwrap();
        producer.connect().unwrap();

        assert!(events.try_recv().is_err());
        broker.release_ready();
        assert!(matches!(next_event(&mut events).await, BrokerEvent::Ready));
    }

    #[tokio::test]
    async fn consumer_requires_group() {
        let broker = MemoryBroker::new();
        let err = broker.consumer(&Configuration::new()).err().unwrap();
        assert!(matches!(err, ConnectionError::Config(_)));
    }

    #[tokio::test]
    async fn consumer_resumes_from_committed_offset() {
        let broker = MemoryBroker::new();
        for i in 0..3 {
            broker.inject("events", format!("event-{}", i)).unwrap();
        }

        let (first, mut events) = broker.consumer(&group_config("analytics")).unwrap();
        first.connect().unwrap();
        assert!(matches!(next_event(&mut events).await, BrokerEvent::Ready));
        first.subscribe(&["events".to_string()]).unwrap();
        first.consume().unwrap();
        match next_event(&mut events).await {
            BrokerEvent::Data(message) => {
                assert_eq!(message.offset, 0);
                first.commit_message(&message).unwrap();
            }
            other => panic!("expected data, got {:?}", other),
        }
        first.disconnect().unwrap();

        let (second, mut events) = broker.consumer(&group_config("analytics")).unwrap();
        second.connect().unwrap();
        assert!(matches!(next_event(&mut events).await, BrokerEvent::Ready));
        second.subscribe(&["events".to_string()]).unwrap();
        second.consume().unwrap();
        match next_event(&mut events).await {
            BrokerEvent::Data(message) => assert_eq!(message.offset, 1),
            other => panic!("expected data, got {:?}", other),
        }
        assert_eq!(broker.committed_offset("analytics", "events", 0), Some(1));
    }

    #[tokio::test]
    async fn latest_reset_skips_existing_records() {
        let broker = MemoryBroker::new();
        broker.inject("events", "old").unwrap();

        let config = group_config("tail").with(AUTO_OFFSET_RESET_KEY, "latest");
        let (consumer, mut events) = broker.consumer(&config).unwrap();
        consumer.connect().unwrap();
        assert!(matches!(next_event(&mut events).await, BrokerEvent::Ready));
        consumer.subscribe(&["events".to_string()]).unwrap();
        consumer.consume().unwrap();
        // let the fetcher pin its starting position
        tokio::time::sleep(Duration::from_millis(50)).await;

        broker.inject("events", "new").unwrap();
        match next_event(&mut events).await {
            BrokerEvent::Data(message) => assert_eq!(message.payload, Bytes::from("new")),
            other => panic!("expected data, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn delayed_records_land_after_the_delay() {
        let broker = MemoryBroker::new();
        let (producer, mut events) = broker.producer(&Configuration::new()).unwrap();
        producer.connect().unwrap();
        assert!(matches!(next_event(&mut events).await, BrokerEvent::Ready));

        producer
            .produce(ProduceRecord {
                topic: "later".into(),
                key: None,
                payload: Bytes::from_static(b"x"),
                partition: None,
                delay_ms: 50,
            })
            .unwrap();
        assert_eq!(broker.high_watermark("later", 0), 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(broker.high_watermark("later", 0), 1);
    }

    #[tokio::test]
    async fn fault_switches_apply() {
        let broker = MemoryBroker::new();
        broker.fail_disconnect();
        broker.reject_commits();
        let (consumer, mut events) = broker.consumer(&group_config("g")).unwrap();
        consumer.connect().unwrap();
        assert!(matches!(next_event(&mut events).await, BrokerEvent::Ready));

        broker.emit_error(ConnectionError::Transport("flaky".into()));
        assert!(matches!(next_event(&mut events).await, BrokerEvent::Error(_)));

        let message = InboundMessage {
            topic: "t".into(),
            partition: 0,
            offset: 0,
            key: None,
            payload: Bytes::new(),
            timestamp: 0,
        };
        assert!(matches!(
            consumer.commit_message(&message),
            Err(ConnectionError::Commit(_))
        ));
        assert!(consumer.disconnect().is_err());
    }

    #[tokio::test]
    async fn disconnect_releases_event_stream() {
        let broker = MemoryBroker::new();
        broker.hold_ready();
        let (held, mut held_events) = broker.producer(&Configuration::new()).unwrap();
        held.connect().unwrap();
        broker.release_ready();
        assert!(matches!(next_event(&mut held_events).await, BrokerEvent::Ready));

        broker.hold_ready();
        let (pending, mut pending_events) = broker.producer(&Configuration::new()).unwrap();
        pending.connect().unwrap();

        held.disconnect().unwrap();
        pending.disconnect().unwrap();

        assert!(held_events.recv().await.is_none());
        assert!(pending_events.recv().await.is_none());
        assert!(lock(&broker.shared.live).is_empty());
        assert!(lock(&broker.shared.held).is_empty());
    }
}

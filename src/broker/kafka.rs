//! `rdkafka` backed broker client. Enabled with the `kafka` feature.
//!
//! librdkafka connects lazily, so `connect` probes the cluster with a metadata
//! request on the blocking pool and reports the outcome as `Ready` or
//! `ConnectFailed`.

use crate::broker::{
    BrokerClient, BrokerEvent, ConsumerConnection, EventSender, EventStream, InboundMessage,
    ProduceRecord, ProducerConnection,
};
use crate::error::ConnectionError;
use crate::properties::Configuration;
use bytes::Bytes;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::Message;
use rdkafka::producer::{DeliveryFuture, FutureProducer, FutureRecord, Producer};
use rdkafka::{Offset, TopicPartitionList};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const METADATA_TIMEOUT: Duration = Duration::from_secs(10);
const FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn transport(err: KafkaError) -> ConnectionError {
    ConnectionError::Transport(err.to_string())
}

fn client_config(config: &Configuration) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    for (key, value) in config.iter() {
        client_config.set(key, value);
    }
    client_config
}

fn runtime() -> Result<Handle, ConnectionError> {
    Handle::try_current()
        .map_err(|e| ConnectionError::Transport(format!("kafka client needs a tokio runtime: {}", e)))
}

/// Reports the outcome of a metadata probe on `events`.
fn probe<F>(events: Option<EventSender>, fetch: F) -> Result<(), ConnectionError>
where
    F: FnOnce() -> Result<(), KafkaError> + Send + 'static,
{
    let events = events.ok_or(ConnectionError::Disconnected)?;
    let runtime = runtime()?;
    runtime.spawn_blocking(move || {
        let event = match fetch() {
            Ok(()) => BrokerEvent::Ready,
            Err(e) => BrokerEvent::ConnectFailed(transport(e)),
        };
        let _ = events.send(event);
    });
    Ok(())
}

#[derive(Debug, Default, Clone, Copy)]
pub struct KafkaBroker;

impl KafkaBroker {
    pub fn new() -> Self {
        KafkaBroker
    }
}

impl BrokerClient for KafkaBroker {
    fn producer(
        &self,
        config: &Configuration,
    ) -> Result<(Arc<dyn ProducerConnection>, EventStream), ConnectionError> {
        let producer: FutureProducer = client_config(config)
            .create()
            .map_err(|e| ConnectionError::Config(e.to_string()))?;
        let (tx, rx) = mpsc::unbounded_channel();
        Ok((
            Arc::new(KafkaProducer {
                producer,
                events: Mutex::new(Some(tx)),
            }),
            rx,
        ))
    }

    fn consumer(
        &self,
        config: &Configuration,
    ) -> Result<(Arc<dyn ConsumerConnection>, EventStream), ConnectionError> {
        let mut client_config = client_config(config);
        // commits are driven by the handler outcome
        if !config.contains_key("enable.auto.commit") {
            client_config.set("enable.auto.commit", "false");
        }
        let consumer: StreamConsumer = client_config
            .create()
            .map_err(|e| ConnectionError::Config(e.to_string()))?;
        let (tx, rx) = mpsc::unbounded_channel();
        Ok((
            Arc::new(KafkaConsumer {
                consumer: Arc::new(consumer),
                events: Mutex::new(Some(tx)),
                pump: Mutex::new(None),
            }),
            rx,
        ))
    }
}

struct KafkaProducer {
    producer: FutureProducer,
    events: Mutex<Option<EventSender>>,
}

impl ProducerConnection for KafkaProducer {
    fn connect(&self) -> Result<(), ConnectionError> {
        let producer = self.producer.clone();
        probe(lock(&self.events).clone(), move || {
            producer
                .client()
                .fetch_metadata(None, METADATA_TIMEOUT)
                .map(|_| ())
        })
    }

    /// Immediate records enter librdkafka's queue before this returns, so
    /// successive calls keep their order. Delayed records are queued once
    /// their delay has passed.
    fn produce(&self, record: ProduceRecord) -> Result<(), ConnectionError> {
        let events = lock(&self.events).clone().ok_or(ConnectionError::Disconnected)?;
        let runtime = runtime()?;

        if record.delay_ms <= 0 {
            let delivery = enqueue(&self.producer, &record).map_err(transport)?;
            runtime.spawn(confirm(delivery, record.topic, events));
            return Ok(());
        }

        let producer = self.producer.clone();
        runtime.spawn(async move {
            tokio::time::sleep(Duration::from_millis(record.delay_ms as u64)).await;
            match enqueue(&producer, &record) {
                Ok(delivery) => confirm(delivery, record.topic, events).await,
                Err(e) => {
                    let _ = events.send(BrokerEvent::Error(transport(e)));
                }
            }
        });
        Ok(())
    }

    fn disconnect(&self) -> Result<(), ConnectionError> {
        lock(&self.events).take();
        self.producer.flush(FLUSH_TIMEOUT).map_err(transport)
    }
}

fn enqueue(producer: &FutureProducer, record: &ProduceRecord) -> Result<DeliveryFuture, KafkaError> {
    let mut future_record =
        FutureRecord::<[u8], [u8]>::to(&record.topic).payload(&record.payload[..]);
    if let Some(key) = &record.key {
        future_record = future_record.key(&key[..]);
    }
    if let Some(partition) = record.partition {
        future_record = future_record.partition(partition as i32);
    }
    producer.send_result(future_record).map_err(|(e, _)| e)
}

async fn confirm(delivery: DeliveryFuture, topic: String, events: EventSender) {
    let failure = match delivery.await {
        Ok(Ok((partition, offset))) => {
            debug!(%topic, partition, offset, "kafka delivery confirmed");
            return;
        }
        Ok(Err((e, _))) => transport(e),
        Err(_) => ConnectionError::Transport(format!("delivery to {} was canceled", topic)),
    };
    let _ = events.send(BrokerEvent::Error(failure));
}

struct KafkaConsumer {
    consumer: Arc<StreamConsumer>,
    events: Mutex<Option<EventSender>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl ConsumerConnection for KafkaConsumer {
    fn connect(&self) -> Result<(), ConnectionError> {
        let consumer = Arc::clone(&self.consumer);
        probe(lock(&self.events).clone(), move || {
            consumer.fetch_metadata(None, METADATA_TIMEOUT).map(|_| ())
        })
    }

    fn subscribe(&self, topics: &[String]) -> Result<(), ConnectionError> {
        let topics: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer.subscribe(&topics).map_err(transport)
    }

    fn consume(&self) -> Result<(), ConnectionError> {
        let mut pump = lock(&self.pump);
        if pump.is_some() {
            return Ok(());
        }
        let events = lock(&self.events).clone().ok_or(ConnectionError::Disconnected)?;
        let consumer = Arc::clone(&self.consumer);
        *pump = Some(runtime()?.spawn(async move {
            loop {
                let event = match consumer.recv().await {
                    Ok(message) => BrokerEvent::Data(InboundMessage {
                        topic: message.topic().to_string(),
                        partition: message.partition() as u32,
                        offset: message.offset() as u64,
                        key: message.key().map(Bytes::copy_from_slice),
                        payload: message
                            .payload()
                            .map(Bytes::copy_from_slice)
                            .unwrap_or_default(),
                        timestamp: message.timestamp().to_millis().unwrap_or(0),
                    }),
                    Err(e) => BrokerEvent::Error(transport(e)),
                };
                if events.send(event).is_err() {
                    warn!("kafka consumer event stream closed; stopping");
                    return;
                }
            }
        }));
        Ok(())
    }

    fn commit_message(&self, message: &InboundMessage) -> Result<(), ConnectionError> {
        let mut offsets = TopicPartitionList::new();
        offsets
            .add_partition_offset(
                &message.topic,
                message.partition as i32,
                Offset::Offset(message.offset as i64 + 1),
            )
            .map_err(|e| ConnectionError::Commit(e.to_string()))?;
        self.consumer
            .commit(&offsets, CommitMode::Async)
            .map_err(|e| ConnectionError::Commit(e.to_string()))
    }

    fn disconnect(&self) -> Result<(), ConnectionError> {
        if let Some(pump) = lock(&self.pump).take() {
            pump.abort();
        }
        lock(&self.events).take();
        self.consumer.unsubscribe();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::GROUP_ID_KEY;

    #[test]
    fn properties_pass_through_to_client_config() {
        let config = Configuration::new()
            .with("bootstrap.servers", "localhost:9092")
            .with(GROUP_ID_KEY, "billing");

        let client_config = client_config(&config);

        assert_eq!(client_config.get("bootstrap.servers"), Some("localhost:9092"));
        assert_eq!(client_config.get(GROUP_ID_KEY), Some("billing"));
    }

    #[tokio::test]
    async fn immediate_records_are_queued_before_produce_returns() {
        let config = Configuration::new()
            .with("bootstrap.servers", "127.0.0.1:1")
            .with("message.timeout.ms", "100");
        let producer: FutureProducer = client_config(&config).create().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let connection = KafkaProducer {
            producer: producer.clone(),
            events: Mutex::new(Some(tx)),
        };

        for n in 0..3 {
            connection
                .produce(ProduceRecord {
                    topic: "orders".into(),
                    key: None,
                    payload: Bytes::from(n.to_string()),
                    partition: None,
                    delay_ms: 0,
                })
                .unwrap();
        }
        assert_eq!(producer.in_flight_count(), 3);

        connection
            .produce(ProduceRecord {
                topic: "orders".into(),
                key: None,
                payload: Bytes::from_static(b"later"),
                partition: None,
                delay_ms: 60_000,
            })
            .unwrap();
        assert_eq!(producer.in_flight_count(), 3);
    }
}

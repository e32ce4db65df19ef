use crate::broker::memory::offset_tracker::{CommitRecord, OffsetTracker};
use crate::broker::memory::topic::{StoredRecord, Topic};
use crate::constants::{DEFAULT_AUTO_CREATE_TOPICS_ENABLE, DEFAULT_PARTITION_CNT};
use crate::error::ConnectionError;
use bytes::Bytes;
use std::collections::HashMap;

pub struct LogEngine {
    pub topics: HashMap<String, Topic>,
    // optional config knobs:
    partition_count: u32,
    auto_create_topic: bool,
    pub offset_tracker: OffsetTracker,
}

impl Default for LogEngine {
    fn default() -> Self {
        LogEngine::new(DEFAULT_PARTITION_CNT)
    }
}

impl LogEngine {
    pub fn new(partition_count: u32) -> LogEngine {
        LogEngine {
            topics: HashMap::new(),
            partition_count,
            auto_create_topic: DEFAULT_AUTO_CREATE_TOPICS_ENABLE,
            offset_tracker: OffsetTracker::new(),
        }
    }

    pub fn create_topic(&mut self, name: impl Into<String>, partition_count: Option<u32>) -> &Topic {
        let name = name.into();
        let count = partition_count.unwrap_or(self.partition_count);
        self.topics
            .entry(name.clone())
            .or_insert_with(|| Topic::new(name, count))
    }

    fn ensure_topic(&mut self, name: &str) -> Result<&mut Topic, ConnectionError> {
        if !self.topics.contains_key(name) {
            if !self.auto_create_topic {
                return Err(ConnectionError::Transport(format!("unknown topic {}", name)));
            }
            self.create_topic(name, None);
            tracing::debug!(topic = %name, "auto-created topic");
        }
        self.topics
            .get_mut(name)
            .ok_or_else(|| ConnectionError::Transport(format!("unknown topic {}", name)))
    }

    // returns (partition_id, offset)
    pub fn produce(
        &mut self,
        topic_name: &str,
        partition: Option<u32>,
        key: Option<Bytes>,
        payload: Bytes,
        timestamp: i64,
    ) -> Result<(u32, u64), ConnectionError> {
        let topic = self.ensure_topic(topic_name)?;
        let placed = topic.append(partition, key, payload, timestamp).ok_or_else(|| {
            ConnectionError::Transport(format!(
                "partition {:?} does not exist in topic {}",
                partition, topic.name
            ))
        })?;
        tracing::debug!(topic = %topic_name, partition = placed.0, offset = placed.1, "appended record");
        Ok(placed)
    }

    pub fn read_from(&self, topic: &str, partition: u32, offset: u64) -> Vec<StoredRecord> {
        self.topics
            .get(topic)
            .map(|t| t.read_from(partition, offset).to_vec())
            .unwrap_or_default()
    }

    pub fn partition_count(&self, topic: &str) -> u32 {
        self.topics
            .get(topic)
            .map(Topic::partition_count)
            .unwrap_or(0)
    }

    pub fn high_watermark(&self, topic: &str, partition: u32) -> u64 {
        self.topics
            .get(topic)
            .map(|t| t.high_watermark(partition))
            .unwrap_or(0)
    }

    pub fn commit_offset(&mut self, topic: &str, partition: u32, group: &str, offset: u64) {
        self.offset_tracker.commit(group, topic, partition, offset);
    }

    pub fn committed_offset(&self, group: &str, topic: &str, partition: u32) -> Option<u64> {
        self.offset_tracker.fetch(group, topic, partition)
    }

    pub fn commit_history(&self) -> Vec<CommitRecord> {
        self.offset_tracker.history().to_vec()
    }
}

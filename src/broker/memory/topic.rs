use bytes::Bytes;
use xxhash_rust::xxh3::xxh3_64;

#[derive(Debug, Clone)]
pub struct StoredRecord {
    pub offset: u64,
    pub key: Option<Bytes>,
    pub payload: Bytes,
    pub timestamp: i64,
}

pub struct Topic {
    pub(crate) name: String,
    partitions: Vec<Vec<StoredRecord>>,
    next_partition: u32, // used for partition tracking in round robin allocation
}

impl Topic {
    pub fn new(name: impl Into<String>, partition_count: u32) -> Topic {
        let partition_count = partition_count.max(1);
        Topic {
            name: name.into(),
            partitions: (0..partition_count).map(|_| Vec::new()).collect(),
            next_partition: 0,
        }
    }

    pub fn partition_count(&self) -> u32 {
        self.partitions.len() as u32
    }

    /// Appends to an explicit partition, the key's partition, or the next one
    /// in round robin order. Returns `None` for an unknown explicit partition.
    pub fn append(
        &mut self,
        partition: Option<u32>,
        key: Option<Bytes>,
        payload: Bytes,
        timestamp: i64,
    ) -> Option<(u32, u64)> {
        let partition_id = match (partition, &key) {
            (Some(p), _) => p,
            (None, Some(key)) => self.hash_key_to_partition(key),
            (None, None) => {
                let partition_id = self.next_partition;
                self.next_partition = (self.next_partition + 1) % self.partition_count();
                partition_id
            }
        };

        let log = self.partitions.get_mut(partition_id as usize)?;
        let offset = log.len() as u64;
        log.push(StoredRecord {
            offset,
            key,
            payload,
            timestamp,
        });
        Some((partition_id, offset))
    }

    pub fn read_from(&self, partition: u32, offset: u64) -> &[StoredRecord] {
        match self.partitions.get(partition as usize) {
            Some(log) => log.get(offset as usize..).unwrap_or(&[]),
            None => &[],
        }
    }

    /// Offset the next appended record will get.
    pub fn high_watermark(&self, partition: u32) -> u64 {
        self.partitions
            .get(partition as usize)
            .map(|log| log.len() as u64)
            .unwrap_or(0)
    }

    pub fn hash_key_to_partition(&self, key: &[u8]) -> u32 {
        let hash = xxh3_64(key);
        (hash as u32) % self.partition_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unkeyed_records_rotate_across_partitions() {
        let mut topic = Topic::new("clicks", 3);

        let placed: Vec<(u32, u64)> = (0..4)
            .map(|i| {
                topic
                    .append(None, None, Bytes::from(format!("v{}", i)), i)
                    .unwrap()
            })
            .collect();

        assert_eq!(placed, vec![(0, 0), (1, 0), (2, 0), (0, 1)]);
    }

    #[test]
    fn keyed_records_stick_to_one_partition() {
        let mut topic = Topic::new("orders", 4);
        let key = Bytes::from_static(b"customer-42");

        let (first, _) = topic
            .append(None, Some(key.clone()), Bytes::from_static(b"a"), 1)
            .unwrap();
        let (second, offset) = topic
            .append(None, Some(key.clone()), Bytes::from_static(b"b"), 2)
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(first, topic.hash_key_to_partition(&key));
        assert_eq!(offset, 1);
    }

    #[test]
    fn read_from_past_the_end_is_empty() {
        let mut topic = Topic::new("logs", 1);
        topic.append(None, None, Bytes::from_static(b"x"), 0);

        assert_eq!(topic.read_from(0, 0).len(), 1);
        assert!(topic.read_from(0, 1).is_empty());
        assert!(topic.read_from(0, 10).is_empty());
        assert!(topic.read_from(7, 0).is_empty());
        assert_eq!(topic.high_watermark(0), 1);
    }

    #[test]
    fn unknown_explicit_partition_is_rejected() {
        let mut topic = Topic::new("logs", 2);
        assert!(topic
            .append(Some(5), None, Bytes::from_static(b"x"), 0)
            .is_none());
    }
}

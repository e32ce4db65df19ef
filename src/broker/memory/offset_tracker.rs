use std::collections::HashMap;

type TopicPartition = (String, u32);

/// Committed positions, keyed by consumer group. A committed offset is the
/// next offset the group should read.
#[derive(Debug, Default)]
pub struct OffsetTracker {
    store: HashMap<String, HashMap<TopicPartition, u64>>, // group -> (topic, partition) -> offset
    commits: Vec<CommitRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRecord {
    pub group: String,
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commit(&mut self, group: &str, topic: &str, partition: u32, offset: u64) {
        self.store
            .entry(group.to_string())
            .or_default()
            .insert((topic.to_string(), partition), offset);
        self.commits.push(CommitRecord {
            group: group.to_string(),
            topic: topic.to_string(),
            partition,
            offset,
        });
    }

    pub fn fetch(&self, group: &str, topic: &str, partition: u32) -> Option<u64> {
        self.store
            .get(group)
            .and_then(|m| m.get(&(topic.to_string(), partition)))
            .copied()
    }

    /// Every commit in the order it was made.
    pub fn history(&self) -> &[CommitRecord] {
        &self.commits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn groups_track_offsets_independently() {
        let mut tracker = OffsetTracker::new();

        tracker.commit("group-a", "events", 0, 2);
        tracker.commit("group-b", "events", 0, 1);

        assert_eq!(tracker.fetch("group-a", "events", 0), Some(2));
        assert_eq!(tracker.fetch("group-b", "events", 0), Some(1));
        assert_eq!(tracker.fetch("group-c", "events", 0), None);
    }

    #[test]
    fn latest_commit_wins_and_history_is_kept() {
        let mut tracker = OffsetTracker::new();

        tracker.commit("billing", "orders", 0, 1);
        tracker.commit("billing", "orders", 0, 3);

        assert_eq!(tracker.fetch("billing", "orders", 0), Some(3));
        let offsets: Vec<u64> = tracker.history().iter().map(|c| c.offset).collect();
        assert_eq!(offsets, vec![1, 3]);
    }

    #[test]
    fn partitions_and_topics_do_not_collide() {
        let mut tracker = OffsetTracker::new();

        tracker.commit("g", "orders", 0, 5);
        tracker.commit("g", "orders", 1, 7);
        tracker.commit("g", "refunds", 0, 9);

        assert_eq!(tracker.fetch("g", "orders", 0), Some(5));
        assert_eq!(tracker.fetch("g", "orders", 1), Some(7));
        assert_eq!(tracker.fetch("g", "refunds", 0), Some(9));
    }
}

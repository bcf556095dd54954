//! FIFO merge queue with idempotent, task-keyed enqueue.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A finished change waiting to be integrated into trunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct MergeQueueEntry {
    pub change_request_ref: Option<String>,
    pub task_id: String,
    pub worker_id: String,
    pub branch_name: String,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct MergeQueue {
    entries: VecDeque<MergeQueueEntry>,
}

impl MergeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `entry` unless its task is already queued. Returns whether it was added.
    pub fn enqueue(&mut self, entry: MergeQueueEntry) -> bool {
        if self.contains_task(&entry.task_id) {
            return false;
        }
        self.entries.push_back(entry);
        true
    }

    pub fn contains_task(&self, task_id: &str) -> bool {
        self.entries.iter().any(|e| e.task_id == task_id)
    }

    /// The entry the next drain will work on.
    pub fn head(&self) -> Option<&MergeQueueEntry> {
        self.entries.front()
    }

    /// Remove the head; only called once its merge is settled.
    pub fn pop_head(&mut self) -> Option<MergeQueueEntry> {
        self.entries.pop_front()
    }

    /// Drop a queued entry for `task_id` (its worker was retired).
    pub fn remove_task(&mut self, task_id: &str) -> Option<MergeQueueEntry> {
        let pos = self.entries.iter().position(|e| e.task_id == task_id)?;
        self.entries.remove(pos)
    }

    pub fn position(&self, task_id: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.task_id == task_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MergeQueueEntry> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(task: &str) -> MergeQueueEntry {
        MergeQueueEntry {
            change_request_ref: Some(format!("cr-{task}")),
            task_id: task.to_string(),
            worker_id: format!("w-{task}"),
            branch_name: format!("task/{task}"),
            enqueued_at: Utc::now(),
        }
    }

    #[test]
    fn enqueue_is_idempotent_per_task() {
        let mut queue = MergeQueue::new();
        assert!(queue.enqueue(entry("a")));
        assert!(!queue.enqueue(entry("a")));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn drains_in_enqueue_order() {
        let mut queue = MergeQueue::new();
        for t in ["b", "a", "c"] {
            queue.enqueue(entry(t));
        }
        let order: Vec<String> = std::iter::from_fn(|| queue.pop_head().map(|e| e.task_id)).collect();
        assert_eq!(order, vec!["b", "a", "c"]);
    }

    #[test]
    fn remove_task_keeps_relative_order() {
        let mut queue = MergeQueue::new();
        for t in ["a", "b", "c"] {
            queue.enqueue(entry(t));
        }
        assert!(queue.remove_task("b").is_some());
        assert_eq!(queue.position("c"), Some(1));
        assert!(queue.remove_task("b").is_none());
    }

    #[test]
    fn serializes_as_plain_list() {
        let mut queue = MergeQueue::new();
        queue.enqueue(entry("a"));
        let json = serde_json::to_value(&queue).unwrap();
        assert!(json.is_array());
        let back: MergeQueue = serde_json::from_value(json).unwrap();
        assert_eq!(back, queue);
    }
}

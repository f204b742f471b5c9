// src/concurrency/queue.rs

use crossbeam::queue::SegQueue;

use super::item::WorkItem;

/// Unbounded multi-producer, multi-consumer queue of pending work.
///
/// Every item is handed to at most one consumer. Across consumers the order
/// of execution is not guaranteed.
#[derive(Debug, Default)]
pub struct WorkQueue {
    items: SegQueue<WorkItem>,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, item: WorkItem) {
        self.items.push(item);
    }

    /// Removes the next item, or `None` when the queue is empty. Never blocks.
    pub fn try_dequeue(&self) -> Option<WorkItem> {
        self.items.pop()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Drops every pending item without running it and returns how many there were
    pub fn discard_all(&self) -> usize {
        let mut discarded = 0;
        while self.items.pop().is_some() {
            discarded += 1;
        }
        discarded
    }
}

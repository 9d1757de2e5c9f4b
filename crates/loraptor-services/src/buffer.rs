//! Bounded FIFO of message records. A full buffer evicts its oldest record.

use std::collections::VecDeque;

use loraptor_core::MessageRecord;

#[derive(Debug)]
pub struct MessageBuffer {
    records: VecDeque<MessageRecord>,
    capacity: usize,
}

impl MessageBuffer {
    /// A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a record, returning the evicted oldest record if the buffer
    /// was full.
    pub fn push(&mut self, record: MessageRecord) -> Option<MessageRecord> {
        let evicted = if self.records.len() >= self.capacity {
            self.records.pop_front()
        } else {
            None
        };
        self.records.push_back(record);
        evicted
    }

    pub fn drain(&mut self) -> Vec<MessageRecord> {
        self.records.drain(..).collect()
    }

    pub fn retain_mut(&mut self, f: impl FnMut(&mut MessageRecord) -> bool) {
        self.records.retain_mut(f);
    }

    pub fn iter(&self) -> impl Iterator<Item = &MessageRecord> {
        self.records.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut MessageRecord> {
        self.records.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

use std::collections::VecDeque;

use tracing::warn;

/// Log every Nth drop after the first.
const DROP_LOG_EVERY: u64 = 25;

/// Bounded FIFO of serialized frames waiting for an open socket.
///
/// Pushing past capacity evicts the oldest entry and counts it as dropped.
/// Entries are delivered in order and removed only after a successful send.
#[derive(Debug, Clone)]
pub struct OutboundQueue {
    entries: VecDeque<String>,
    capacity: usize,
    dropped: u64,
    label: String,
}

impl OutboundQueue {
    /// Creates an empty queue. A capacity of `0` is raised to `1`.
    pub fn new(capacity: usize, label: impl Into<String>) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity.min(64)),
            capacity,
            dropped: 0,
            label: label.into(),
        }
    }

    /// Appends a frame, evicting from the head when over capacity.
    pub fn push(&mut self, frame: String) {
        self.entries.push_back(frame);
        self.evict_overflow();
    }

    /// Sends queued frames in order until the queue is empty or `send` fails.
    ///
    /// A frame is removed only once `send` accepts it, so a failure leaves it
    /// (and everything behind it) at the front in the original order.
    pub fn drain<F, E>(&mut self, mut send: F) -> Result<usize, E>
    where
        F: FnMut(&str) -> Result<(), E>,
    {
        let mut sent = 0;
        while let Some(front) = self.entries.front() {
            send(front)?;
            self.entries.pop_front();
            sent += 1;
        }
        Ok(sent)
    }

    /// Changes the capacity, evicting the oldest entries if it shrank.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        self.evict_overflow();
    }

    fn evict_overflow(&mut self) {
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
            self.dropped += 1;
            if self.dropped == 1 || self.dropped % DROP_LOG_EVERY == 0 {
                warn!(
                    account = %self.label,
                    dropped = self.dropped,
                    max_queue_size = self.capacity,
                    "offline queue full, dropping oldest frame"
                );
            }
        }
    }

    /// Iterate from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total frames evicted since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

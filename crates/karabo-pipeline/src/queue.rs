//! Bounded per-input chunk queue.
//!
//! Holds the chunks an output has produced for one input but the input has
//! not yet read. End-of-stream markers bypass the bound so they are never
//! lost.

use std::collections::VecDeque;

use crate::config::OnSlowness;
use crate::frame::EncodedFrame;

/// Result of offering a chunk to a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// The new chunk was discarded.
    Dropped,
    /// The oldest chunk was discarded to make room.
    DroppedOldest,
    /// Nothing changed; the caller must wait or fail.
    Full,
}

#[derive(Debug)]
pub struct ChunkQueue {
    items: VecDeque<EncodedFrame>,
    capacity: usize,
    dropped: u64,
}

impl ChunkQueue {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            dropped: 0,
        }
    }

    /// Data chunks currently queued (end-of-stream markers excluded).
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.iter().filter(|f| !f.is_end_of_stream()).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Chunks discarded so far.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Offer a data chunk under `policy`.
    pub fn push(&mut self, frame: EncodedFrame, policy: OnSlowness) -> PushOutcome {
        if !self.is_full() {
            self.items.push_back(frame);
            return PushOutcome::Queued;
        }
        match policy {
            OnSlowness::Drop => {
                self.dropped += 1;
                PushOutcome::Dropped
            }
            OnSlowness::QueueDrop => {
                if let Some(pos) = self.items.iter().position(|f| !f.is_end_of_stream()) {
                    self.items.remove(pos);
                }
                self.dropped += 1;
                self.items.push_back(frame);
                PushOutcome::DroppedOldest
            }
            OnSlowness::Wait | OnSlowness::Throw => PushOutcome::Full,
        }
    }

    /// Append an end-of-stream marker regardless of the bound.
    pub fn push_end_of_stream(&mut self, frame: EncodedFrame) {
        self.items.push_back(frame);
    }

    pub fn pop(&mut self) -> Option<EncodedFrame> {
        self.items.pop_front()
    }

    /// Forget everything queued; returns how many data chunks went.
    pub fn clear(&mut self) -> usize {
        let n = self.len();
        self.items.clear();
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{ChunkMeta, Frame, Payload};
    use karabo_data::{Hash, Timestamp};

    fn chunk(n: i32) -> EncodedFrame {
        Frame {
            items: vec![(
                Payload::Hash(Hash::new().with("n", n)),
                ChunkMeta::new("src", Timestamp::default()),
            )],
            end_of_stream: false,
        }
        .encode()
        .unwrap()
    }

    #[test]
    fn test_drop_keeps_the_first_chunks() {
        let mut q = ChunkQueue::new(2);
        let outcomes: Vec<_> = (0..10).map(|n| q.push(chunk(n), OnSlowness::Drop)).collect();
        assert_eq!(outcomes.iter().filter(|o| **o == PushOutcome::Queued).count(), 2);
        assert_eq!(q.len(), 2);
        assert_eq!(q.dropped(), 8);
    }

    #[test]
    fn test_queue_drop_keeps_the_latest_chunks() {
        let mut q = ChunkQueue::new(2);
        let frames: Vec<_> = (0..5).map(chunk).collect();
        for f in &frames {
            q.push(f.clone(), OnSlowness::QueueDrop);
        }
        assert_eq!(q.len(), 2);
        assert_eq!(q.dropped(), 3);
        assert_eq!(q.pop().unwrap().wire(), frames[3].wire());
    }

    #[test]
    fn test_wait_and_throw_leave_queue_untouched() {
        let mut q = ChunkQueue::new(1);
        assert_eq!(q.push(chunk(0), OnSlowness::Wait), PushOutcome::Queued);
        assert_eq!(q.push(chunk(1), OnSlowness::Wait), PushOutcome::Full);
        assert_eq!(q.push(chunk(1), OnSlowness::Throw), PushOutcome::Full);
        assert_eq!(q.dropped(), 0);
    }

    #[test]
    fn test_end_of_stream_is_never_dropped() {
        let mut q = ChunkQueue::new(1);
        q.push(chunk(0), OnSlowness::Drop);
        q.push_end_of_stream(Frame::end_of_stream().encode().unwrap());
        q.push(chunk(1), OnSlowness::QueueDrop);
        assert_eq!(q.len(), 1);
        assert!(q.pop().unwrap().is_end_of_stream());
    }
}

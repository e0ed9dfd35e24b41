//! Bounded FIFO of held frames

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::utils::CachePadded;
use ringbuf::traits::{Consumer, Observer, RingBuffer};
use ringbuf::HeapRb;

use crate::frame::Frame;

/// Fixed-capacity hold list; inserting into a full ring evicts the oldest frame
pub struct HoldRing {
    ring: HeapRb<Arc<Frame>>,
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Stats {
    held: AtomicUsize,
    selected: AtomicUsize,
    evicted: AtomicUsize,
}

impl HoldRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: HeapRb::new(capacity.max(1)),
            stats: CachePadded::new(Stats::default()),
        }
    }

    /// Insert a frame; returns the frame pushed out to make room
    pub fn push(&mut self, frame: Arc<Frame>) -> Option<Arc<Frame>> {
        let evicted = self.ring.push_overwrite(frame);
        self.stats.held.fetch_add(1, Ordering::Relaxed);
        if evicted.is_some() {
            self.stats.evicted.fetch_add(1, Ordering::Relaxed);
        }
        evicted
    }

    /// Oldest held frame
    pub fn pop(&mut self) -> Option<Arc<Frame>> {
        let frame = self.ring.try_pop()?;
        self.stats.selected.fetch_add(1, Ordering::Relaxed);
        Some(frame)
    }

    pub fn drain(&mut self) -> Vec<Arc<Frame>> {
        let mut frames = Vec::with_capacity(self.len());
        while let Some(frame) = self.ring.try_pop() {
            frames.push(frame);
        }
        frames
    }

    pub fn len(&self) -> usize {
        self.ring.occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity().get()
    }

    /// Newest frame count held, if any
    pub fn newest(&self) -> Option<u32> {
        self.ring.iter().last().map(|f| f.frame_count())
    }

    /// (held, popped, evicted)
    pub fn stats(&self) -> (usize, usize, usize) {
        (
            self.stats.held.load(Ordering::Relaxed),
            self.stats.selected.load(Ordering::Relaxed),
            self.stats.evicted.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::tests::preview_frame;

    #[test]
    fn full_ring_evicts_oldest_insertion() {
        let mut ring = HoldRing::new(2);
        assert!(ring.push(Arc::new(preview_frame(1))).is_none());
        assert!(ring.push(Arc::new(preview_frame(2))).is_none());
        let evicted = ring.push(Arc::new(preview_frame(3))).unwrap();
        assert_eq!(evicted.frame_count(), 1);
        assert_eq!(ring.newest(), Some(3));
        assert_eq!(ring.pop().map(|f| f.frame_count()), Some(2));
        assert_eq!(ring.stats(), (3, 1, 1));
    }
}

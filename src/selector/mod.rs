//! Frame selector: keeps recent preview outputs for zero-shutter-lag capture

mod ring;

pub use ring::HoldRing;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use metrics::counter;
use tracing::{debug, info, warn};

use crate::buffer::{BufferPosition, PoolRegistry};
use crate::error::{Error, Result};
use crate::frame::{Frame, FrameManager};
use crate::pipeline::PipeId;
use crate::utils::lock;

pub struct FrameSelector {
    ring: Mutex<HoldRing>,
    arrived: Condvar,
    frames: Arc<FrameManager>,
    pools: Arc<PoolRegistry>,
    wait_interval: Duration,
    cancelled: AtomicBool,
}

impl FrameSelector {
    pub fn new(
        hold_count: usize,
        wait_interval: Duration,
        frames: Arc<FrameManager>,
        pools: Arc<PoolRegistry>,
    ) -> Self {
        Self {
            ring: Mutex::new(HoldRing::new(hold_count)),
            arrived: Condvar::new(),
            frames,
            pools,
            wait_interval,
            cancelled: AtomicBool::new(false),
        }
    }

    /// Keep `frame`'s output of `pipe` for later selection. The selector takes its
    /// own frame reference; a full list gives back its oldest frame first.
    ///
    /// `pipe` must be the frame's hold pipe, set by the preview factory from
    /// `hold_node(reprocessing_mode)`; the held buffer is always that pipe's dst.
    pub fn manage_frame_hold_list(&self, frame: &Arc<Frame>, pipe: PipeId) -> bool {
        if frame.hold_pipe() != Some(pipe) || !frame.mark_held() {
            return false;
        }
        frame.inc_ref();

        let mut ring = lock(&self.ring);
        if let Some(oldest) = ring.push(Arc::clone(frame)) {
            debug!("hold list full, evicting frame {}", oldest.frame_count());
            self.evict(&oldest);
        }
        drop(ring);
        self.arrived.notify_all();
        true
    }

    /// Pop held frames in FIFO order until `count` frames at or after `target`
    /// are found; older frames met on the way are released. Waits up to
    /// `max_retries` intervals for frames still in flight.
    ///
    /// The caller owns one reference to each returned frame and its held buffer.
    /// No stage is passed in: every held frame carries its hold pipe, and the
    /// buffer taken from it is that pipe's dst.
    pub fn select_capture_frames(
        &self,
        count: usize,
        target: u32,
        max_retries: u32,
    ) -> Result<Vec<Arc<Frame>>> {
        let mut selected: Vec<Arc<Frame>> = Vec::with_capacity(count);
        let mut ring = lock(&self.ring);
        let mut retries = 0;

        loop {
            if self.cancelled.load(Ordering::Acquire) {
                selected.iter().for_each(|f| self.evict(f));
                return Err(Error::Flushing);
            }

            while selected.len() < count {
                let Some(frame) = ring.pop() else { break };
                if frame.frame_count() < target {
                    self.evict(&frame);
                } else {
                    selected.push(frame);
                }
            }
            if selected.len() == count {
                debug!(
                    "selected frame(s) {:?} for {}",
                    selected.iter().map(|f| f.frame_count()).collect::<Vec<_>>(),
                    target
                );
                return Ok(selected);
            }

            if retries >= max_retries {
                warn!("no held frame for {} after {} retries", target, retries);
                counter!("camera_selection_timeouts_total").increment(1);
                selected.iter().for_each(|f| self.evict(f));
                return Err(Error::SelectionTimeout(target));
            }
            retries += 1;
            ring = self
                .arrived
                .wait_timeout(ring, self.wait_interval)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Give a frame back: return its held buffer and drop the selector's reference
    fn evict(&self, frame: &Arc<Frame>) {
        if let Some(buffer) = frame.take_held_buffer() {
            if let Err(e) = self.pools.put(&buffer, BufferPosition::None) {
                warn!("frame {}: {}", frame.frame_count(), e);
            }
        }
        self.frames.release(frame);
    }

    /// Return every held buffer
    pub fn release(&self) -> usize {
        let frames = lock(&self.ring).drain();
        for frame in &frames {
            self.evict(frame);
        }
        if !frames.is_empty() {
            info!("released {} held frames", frames.len());
        }
        frames.len()
    }

    /// Fail current and future selections until `resume`
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        let _ring = lock(&self.ring);
        self.arrived.notify_all();
    }

    pub fn resume(&self) {
        self.cancelled.store(false, Ordering::Release);
    }

    pub fn len(&self) -> usize {
        lock(&self.ring).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.ring).is_empty()
    }

    pub fn dump(&self) {
        let ring = lock(&self.ring);
        let (held, selected, evicted) = ring.stats();
        info!(
            "selector: {}/{} held, newest {:?}; {} held total, {} popped, {} evicted",
            ring.len(),
            ring.capacity(),
            ring.newest(),
            held,
            selected,
            evicted
        );
    }
}

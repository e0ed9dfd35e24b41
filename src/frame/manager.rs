use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use metrics::{counter, gauge};
use tracing::{debug, info, warn};

use super::{Entity, Frame, FrameType};
use crate::error::{Error, Result};
use crate::metadata::ShotSettings;
use crate::pipeline::FactoryMode;
use crate::utils::lock;

/// Arena owning every live frame.
///
/// A frame leaves the arena once its reference count is zero and it is complete.
/// Frames released before turning terminal stay behind as zombies until `reap`.
pub struct FrameManager {
    frames: Mutex<HashMap<u64, Arc<Frame>>>,
    next_key: AtomicU64,
    capacity: usize,
}

impl FrameManager {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: Mutex::new(HashMap::new()),
            next_key: AtomicU64::new(1),
            capacity,
        }
    }

    /// Insert a frame holding one reference for its creator
    pub fn create(
        &self,
        frame_count: u32,
        frame_type: FrameType,
        mode: FactoryMode,
        request_key: Option<u32>,
        shot: ShotSettings,
        entities: Vec<Entity>,
    ) -> Result<Arc<Frame>> {
        let mut frames = lock(&self.frames);
        if frames.len() >= self.capacity {
            warn!(
                "frame arena full ({} live), cannot create frame {}",
                frames.len(),
                frame_count
            );
            return Err(Error::OutOfMemory(frames.len()));
        }

        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        let frame = Arc::new(Frame::new(
            key,
            frame_count,
            frame_type,
            mode,
            request_key,
            shot,
            entities,
        ));
        frames.insert(key, Arc::clone(&frame));

        let kind = match frame_type {
            FrameType::Request => "request",
            FrameType::Internal => "internal",
        };
        counter!("camera_frames_created_total", "type" => kind).increment(1);
        gauge!("camera_frames_live").set(frames.len() as f64);
        Ok(frame)
    }

    /// Drop one reference; destroys the frame when that was the last and it is complete
    pub fn release(&self, frame: &Arc<Frame>) -> bool {
        if frame.dec_ref() > 0 {
            return false;
        }
        if !frame.is_complete() {
            debug!("frame {} released before completing", frame.frame_count());
            return false;
        }
        let mut frames = lock(&self.frames);
        let removed = frames.remove(&frame.key()).is_some();
        gauge!("camera_frames_live").set(frames.len() as f64);
        removed
    }

    /// Destroy unreferenced frames that have since turned terminal
    pub fn reap(&self) -> usize {
        let mut frames = lock(&self.frames);
        let before = frames.len();
        frames.retain(|_, f| f.ref_count() > 0 || !f.is_complete());
        let reaped = before - frames.len();
        if reaped > 0 {
            debug!("reaped {} frames", reaped);
        }
        gauge!("camera_frames_live").set(frames.len() as f64);
        reaped
    }

    pub fn live(&self) -> usize {
        lock(&self.frames).len()
    }

    /// Drop every frame regardless of state
    pub fn clear(&self) {
        let mut frames = lock(&self.frames);
        if !frames.is_empty() {
            warn!("dropping {} frames", frames.len());
        }
        frames.clear();
        gauge!("camera_frames_live").set(0.0);
    }

    pub fn dump(&self) {
        let frames = lock(&self.frames);
        info!("frame arena: {} live", frames.len());
        let mut sorted: Vec<_> = frames.values().collect();
        sorted.sort_by_key(|f| f.key());
        for frame in sorted {
            debug!(
                "  {:?} complete={} held={}",
                frame,
                frame.is_complete(),
                frame.is_held()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::PoolId;
    use crate::pipeline::PipeId;
    use crate::SensorConfig;

    fn create(manager: &FrameManager, count: u32) -> Result<Arc<Frame>> {
        manager.create(
            count,
            FrameType::Internal,
            FactoryMode::PreviewOtf,
            None,
            ShotSettings::for_sensor(&SensorConfig::default()),
            vec![Entity::stage(PipeId::Flite, Some(PoolId::Bayer))],
        )
    }

    #[test]
    fn full_arena_reports_out_of_memory() {
        let manager = FrameManager::new(2);
        let _a = create(&manager, 1).unwrap();
        let _b = create(&manager, 2).unwrap();
        assert!(matches!(create(&manager, 3), Err(Error::OutOfMemory(2))));
    }

    #[test]
    fn destroyed_only_when_unreferenced_and_complete() {
        let manager = FrameManager::new(4);
        let frame = create(&manager, 1).unwrap();
        frame.inc_ref();

        frame.begin_stage(PipeId::Flite).unwrap();
        frame.finish_stage(PipeId::Flite, true).unwrap();
        assert!(!manager.release(&frame));
        assert_eq!(manager.live(), 1);
        assert!(manager.release(&frame));
        assert_eq!(manager.live(), 0);
    }

    #[test]
    fn zombies_are_reaped_once_terminal() {
        let manager = FrameManager::new(4);
        let frame = create(&manager, 1).unwrap();

        assert!(!manager.release(&frame));
        assert_eq!(manager.reap(), 0);
        assert_eq!(manager.live(), 1);

        frame.fail_pending();
        assert_eq!(manager.reap(), 1);
        assert_eq!(manager.live(), 0);
    }

    #[test]
    fn keys_are_unique_for_equal_frame_counts() {
        let manager = FrameManager::new(4);
        let a = create(&manager, 7).unwrap();
        let b = create(&manager, 7).unwrap();
        assert_ne!(a.key(), b.key());
        assert_eq!(manager.live(), 2);
    }
}

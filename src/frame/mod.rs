//! Frames: one traversal of a stage graph

pub mod entity;
pub mod manager;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use tracing::warn;

pub use entity::{Entity, EntityState};
pub use manager::FrameManager;

use crate::buffer::{Buffer, PoolId};
use crate::error::{Error, Result};
use crate::metadata::{CameraMetadata, ShotSettings};
use crate::pipeline::{FactoryMode, PipeId};
use crate::utils::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    /// Carries outputs of a producer request
    Request,
    /// Keeps the sensor chain running; never reported
    Internal,
}

struct FrameState {
    entities: Vec<Entity>,
    capture: bool,
    zsl: bool,
    service_bayer: bool,
    /// Entity whose dst the selector may keep
    hold_pipe: Option<PipeId>,
    held: bool,
    timestamp_ns: Option<u64>,
    dynamic: CameraMetadata,
}

/// A unit of pipeline work.
///
/// Stage workers only touch per-entity state through these methods; structural
/// ownership (process lists, arena) stays with the orchestrator.
pub struct Frame {
    key: u64,
    frame_count: u32,
    frame_type: FrameType,
    mode: FactoryMode,
    request_key: Option<u32>,
    shot: ShotSettings,
    created_at: Instant,
    refs: AtomicUsize,
    state: Mutex<FrameState>,
}

impl Frame {
    pub(crate) fn new(
        key: u64,
        frame_count: u32,
        frame_type: FrameType,
        mode: FactoryMode,
        request_key: Option<u32>,
        shot: ShotSettings,
        entities: Vec<Entity>,
    ) -> Self {
        Self {
            key,
            frame_count,
            frame_type,
            mode,
            request_key,
            shot,
            created_at: Instant::now(),
            refs: AtomicUsize::new(1),
            state: Mutex::new(FrameState {
                entities,
                capture: false,
                zsl: false,
                service_bayer: false,
                hold_pipe: None,
                held: false,
                timestamp_ns: None,
                dynamic: CameraMetadata::new(),
            }),
        }
    }

    /// Arena key, unique across preview and reprocessing frames
    pub fn key(&self) -> u64 {
        self.key
    }

    pub fn frame_count(&self) -> u32 {
        self.frame_count
    }

    pub fn frame_type(&self) -> FrameType {
        self.frame_type
    }

    pub fn mode(&self) -> FactoryMode {
        self.mode
    }

    pub fn request_key(&self) -> Option<u32> {
        self.request_key
    }

    pub fn shot(&self) -> &ShotSettings {
        &self.shot
    }

    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    pub fn set_entity_state(&self, pipe: PipeId, next: EntityState) -> Result<()> {
        let mut state = lock(&self.state);
        let entity = find_mut(&mut state.entities, pipe)?;
        if !entity.state.can_move_to(next) {
            return Err(Error::InvalidTransition {
                pipe,
                from: entity.state,
                to: next,
            });
        }
        entity.state = next;
        Ok(())
    }

    pub fn entity_state(&self, pipe: PipeId) -> Result<EntityState> {
        let state = lock(&self.state);
        Ok(find(&state.entities, pipe)?.state)
    }

    pub fn has_entity(&self, pipe: PipeId) -> bool {
        lock(&self.state).entities.iter().any(|e| e.pipe == pipe)
    }

    /// Bind a buffer to a stage input; returns the buffer it replaced
    pub fn set_src_buffer(&self, pipe: PipeId, buffer: Buffer) -> Result<Option<Buffer>> {
        let mut state = lock(&self.state);
        Ok(find_mut(&mut state.entities, pipe)?.src.replace(buffer))
    }

    /// Bind a buffer to a stage output; returns the buffer it replaced
    pub fn set_dst_buffer(&self, pipe: PipeId, buffer: Buffer) -> Result<Option<Buffer>> {
        let mut state = lock(&self.state);
        Ok(find_mut(&mut state.entities, pipe)?.dst.replace(buffer))
    }

    pub fn src_buffer(&self, pipe: PipeId) -> Result<Buffer> {
        let state = lock(&self.state);
        find(&state.entities, pipe)?
            .src
            .clone()
            .ok_or(Error::NoBufferBound { pipe, slot: "src" })
    }

    pub fn dst_buffer(&self, pipe: PipeId) -> Result<Buffer> {
        let state = lock(&self.state);
        find(&state.entities, pipe)?
            .dst
            .clone()
            .ok_or(Error::NoBufferBound { pipe, slot: "dst" })
    }

    pub fn dst_pool(&self, pipe: PipeId) -> Result<Option<PoolId>> {
        let state = lock(&self.state);
        Ok(find(&state.entities, pipe)?.dst_pool)
    }

    pub fn src_pool(&self, pipe: PipeId) -> Result<Option<PoolId>> {
        let state = lock(&self.state);
        Ok(find(&state.entities, pipe)?.src_pool)
    }

    /// True iff every entity that was ever requested is COMPLETE or ERROR
    pub fn is_complete(&self) -> bool {
        lock(&self.state)
            .entities
            .iter()
            .all(|e| e.state == EntityState::NoReq || e.state.is_terminal())
    }

    /// Snapshot of every entity
    pub fn entities(&self) -> Vec<Entity> {
        lock(&self.state).entities.clone()
    }

    /// Taps of `stage` that were requested for this frame
    pub fn requested_taps(&self, stage: PipeId) -> Vec<PipeId> {
        lock(&self.state)
            .entities
            .iter()
            .filter(|e| e.parent == Some(stage) && e.state != EntityState::NoReq)
            .map(|e| e.pipe)
            .collect()
    }

    /// First stage after `after` (in graph order) still waiting to run
    pub fn next_stage(&self, after: Option<PipeId>) -> Option<PipeId> {
        let state = lock(&self.state);
        let stages = state.entities.iter().filter(|e| e.parent.is_none());
        let mut rest: Vec<&Entity> = match after {
            Some(pipe) => stages.skip_while(|e| e.pipe != pipe).skip(1).collect(),
            None => stages.collect(),
        };
        rest.retain(|e| e.state == EntityState::Requested);
        rest.first().map(|e| e.pipe)
    }

    /// Move a stage and its requested taps to PROCESSING
    pub fn begin_stage(&self, stage: PipeId) -> Result<()> {
        let mut state = lock(&self.state);
        let entity = find_mut(&mut state.entities, stage)?;
        if !entity.state.can_move_to(EntityState::Processing) {
            return Err(Error::InvalidTransition {
                pipe: stage,
                from: entity.state,
                to: EntityState::Processing,
            });
        }
        entity.state = EntityState::Processing;
        for tap in state
            .entities
            .iter_mut()
            .filter(|e| e.parent == Some(stage) && e.state == EntityState::Requested)
        {
            tap.state = EntityState::Processing;
        }
        Ok(())
    }

    /// Settle a stage and its in-flight taps as COMPLETE or ERROR
    pub fn finish_stage(&self, stage: PipeId, ok: bool) -> Result<()> {
        let next = if ok {
            EntityState::Complete
        } else {
            EntityState::Error
        };
        let mut state = lock(&self.state);
        for entity in state
            .entities
            .iter_mut()
            .filter(|e| e.pipe == stage || e.parent == Some(stage))
        {
            if entity.state.can_move_to(next) {
                entity.state = next;
            }
        }
        let settled = find(&state.entities, stage)?.state;
        if settled != next {
            return Err(Error::InvalidTransition {
                pipe: stage,
                from: settled,
                to: next,
            });
        }
        Ok(())
    }

    /// Mark every entity still waiting or running as ERROR; returns the stages touched
    pub fn fail_pending(&self) -> Vec<PipeId> {
        let mut state = lock(&self.state);
        let mut failed = Vec::new();
        for entity in state.entities.iter_mut() {
            if matches!(
                entity.state,
                EntityState::Requested | EntityState::Processing
            ) {
                entity.state = EntityState::Error;
                failed.push(entity.pipe);
            }
        }
        failed
    }

    /// Unbind one pool slot from every entity; returns it once
    pub fn detach_buffer(&self, pool: PoolId, index: usize) -> Option<Buffer> {
        let mut state = lock(&self.state);
        detach(&mut state.entities, pool, index)
    }

    /// Unbind the dst of `pipe` (and any other slot sharing it)
    pub fn take_dst_buffer(&self, pipe: PipeId) -> Option<Buffer> {
        let mut state = lock(&self.state);
        let buffer = find(&state.entities, pipe).ok()?.dst.clone()?;
        detach(&mut state.entities, buffer.pool, buffer.index)
    }

    /// Unbind the src of `pipe` (and any other slot sharing it)
    pub fn take_src_buffer(&self, pipe: PipeId) -> Option<Buffer> {
        let mut state = lock(&self.state);
        let buffer = find(&state.entities, pipe).ok()?.src.clone()?;
        detach(&mut state.entities, buffer.pool, buffer.index)
    }

    /// Unbind every distinct buffer, except the held one while the selector has it
    pub fn drain_buffers(&self) -> Vec<Buffer> {
        let mut state = lock(&self.state);
        let keep = if state.held {
            state
                .hold_pipe
                .and_then(|pipe| find(&state.entities, pipe).ok())
                .and_then(|e| e.dst.as_ref())
                .map(|b| (b.pool, b.index))
        } else {
            None
        };

        let mut drained = Vec::new();
        loop {
            let next = state.entities.iter().find_map(|e| {
                [&e.src, &e.dst]
                    .into_iter()
                    .flatten()
                    .find(|b| Some((b.pool, b.index)) != keep)
                    .map(|b| (b.pool, b.index))
            });
            match next {
                Some((pool, index)) => {
                    if let Some(buffer) = detach(&mut state.entities, pool, index) {
                        drained.push(buffer);
                    }
                }
                None => break,
            }
        }
        drained
    }

    /// Designate the entity whose dst is kept for reprocessing
    pub fn set_hold_pipe(&self, pipe: PipeId) {
        lock(&self.state).hold_pipe = Some(pipe);
    }

    pub fn hold_pipe(&self) -> Option<PipeId> {
        lock(&self.state).hold_pipe
    }

    /// True when `buffer` is this frame's hold buffer
    pub fn is_hold_buffer(&self, buffer: &Buffer) -> bool {
        let state = lock(&self.state);
        state
            .hold_pipe
            .and_then(|pipe| find(&state.entities, pipe).ok())
            .and_then(|e| e.dst.as_ref())
            .map(|b| b.same_slot(buffer))
            .unwrap_or(false)
    }

    /// Claim the hold buffer for the selector; fails if it is gone or not COMPLETE
    pub fn mark_held(&self) -> bool {
        let mut state = lock(&self.state);
        let ready = state
            .hold_pipe
            .and_then(|pipe| find(&state.entities, pipe).ok())
            .map(|e| e.state == EntityState::Complete && e.dst.is_some())
            .unwrap_or(false);
        if ready {
            state.held = true;
        }
        ready
    }

    pub fn is_held(&self) -> bool {
        lock(&self.state).held
    }

    /// Give up the hold and unbind the hold buffer
    pub fn take_held_buffer(&self) -> Option<Buffer> {
        let mut state = lock(&self.state);
        if !state.held {
            return None;
        }
        state.held = false;
        let buffer = state
            .hold_pipe
            .and_then(|pipe| find(&state.entities, pipe).ok())
            .and_then(|e| e.dst.clone())?;
        detach(&mut state.entities, buffer.pool, buffer.index)
    }

    pub fn set_capture(&self, capture: bool) {
        lock(&self.state).capture = capture;
    }

    pub fn is_capture(&self) -> bool {
        lock(&self.state).capture
    }

    pub fn set_zsl(&self, zsl: bool) {
        lock(&self.state).zsl = zsl;
    }

    pub fn is_zsl(&self) -> bool {
        lock(&self.state).zsl
    }

    pub fn set_service_bayer(&self, service_bayer: bool) {
        lock(&self.state).service_bayer = service_bayer;
    }

    pub fn is_service_bayer(&self) -> bool {
        lock(&self.state).service_bayer
    }

    pub fn set_timestamp(&self, timestamp_ns: u64) {
        lock(&self.state).timestamp_ns = Some(timestamp_ns);
    }

    pub fn timestamp(&self) -> Option<u64> {
        lock(&self.state).timestamp_ns
    }

    /// Fold stage results into the frame's dynamic metadata
    pub fn merge_dynamic(&self, meta: &CameraMetadata) {
        lock(&self.state).dynamic.merge(meta);
    }

    pub fn dynamic(&self) -> CameraMetadata {
        lock(&self.state).dynamic.clone()
    }

    pub fn inc_ref(&self) -> usize {
        self.refs.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn dec_ref(&self) -> usize {
        let previous = self
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        match previous {
            Ok(n) => n - 1,
            Err(_) => {
                warn!("frame {}: reference count underflow", self.frame_count);
                0
            }
        }
    }

    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("key", &self.key)
            .field("frame_count", &self.frame_count)
            .field("type", &self.frame_type)
            .field("mode", &self.mode)
            .field("request_key", &self.request_key)
            .field("refs", &self.ref_count())
            .finish()
    }
}

fn find(entities: &[Entity], pipe: PipeId) -> Result<&Entity> {
    entities
        .iter()
        .find(|e| e.pipe == pipe)
        .ok_or(Error::NoSuchStage(pipe))
}

fn find_mut(entities: &mut [Entity], pipe: PipeId) -> Result<&mut Entity> {
    entities
        .iter_mut()
        .find(|e| e.pipe == pipe)
        .ok_or(Error::NoSuchStage(pipe))
}

fn detach(entities: &mut [Entity], pool: PoolId, index: usize) -> Option<Buffer> {
    let mut found = None;
    for entity in entities.iter_mut().filter(|e| e.holds(pool, index)) {
        for slot in [&mut entity.src, &mut entity.dst] {
            if slot
                .as_ref()
                .map(|b| b.pool == pool && b.index == index)
                .unwrap_or(false)
            {
                found = slot.take().or(found);
            }
        }
    }
    found
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::buffer::{Allocator, BufferInfo, BufferManager, BufferPosition, MmapAllocator};
    use crate::SensorConfig;
    use std::sync::Arc;

    pub(crate) fn preview_frame(frame_count: u32) -> Frame {
        let entities = vec![
            Entity::stage(PipeId::Flite, Some(PoolId::Bayer)),
            Entity::tap(PipeId::FliteRaw, PipeId::Flite, Some(PoolId::Service(1)), false),
            Entity::stage(PipeId::Aa3Isp, None).with_src_pool(Some(PoolId::Bayer)),
            Entity::stage(PipeId::Mcsc, None),
            Entity::tap(PipeId::McscPreview, PipeId::Mcsc, Some(PoolId::Scp), true),
        ];
        Frame::new(
            u64::from(frame_count),
            frame_count,
            FrameType::Request,
            FactoryMode::PreviewOtf,
            Some(frame_count),
            ShotSettings::for_sensor(&SensorConfig::default()),
            entities,
        )
    }

    fn bayer_pool() -> Arc<BufferManager> {
        let allocator: Arc<dyn Allocator> = Arc::new(MmapAllocator::new(1 << 20));
        let pool = Arc::new(BufferManager::new("bayer", PoolId::Bayer, allocator));
        pool.set_info(BufferInfo::new(vec![256], vec![16], 2)).unwrap();
        pool.alloc().unwrap();
        pool
    }

    #[test]
    fn completing_an_unrequested_stage_is_rejected() {
        let frame = preview_frame(1);
        assert!(matches!(
            frame.set_entity_state(PipeId::FliteRaw, EntityState::Complete),
            Err(Error::InvalidTransition { .. })
        ));
        assert!(matches!(
            frame.entity_state(PipeId::Jpeg),
            Err(Error::NoSuchStage(PipeId::Jpeg))
        ));
    }

    #[test]
    fn complete_only_when_every_requested_entity_is_terminal() {
        let frame = preview_frame(1);
        assert!(!frame.is_complete());

        frame.begin_stage(PipeId::Flite).unwrap();
        frame.finish_stage(PipeId::Flite, true).unwrap();
        frame.begin_stage(PipeId::Aa3Isp).unwrap();
        frame.finish_stage(PipeId::Aa3Isp, true).unwrap();
        frame.begin_stage(PipeId::Mcsc).unwrap();
        assert_eq!(
            frame.entity_state(PipeId::McscPreview).unwrap(),
            EntityState::Processing
        );
        assert!(!frame.is_complete());

        frame.finish_stage(PipeId::Mcsc, false).unwrap();
        assert_eq!(
            frame.entity_state(PipeId::McscPreview).unwrap(),
            EntityState::Error
        );
        // FliteRaw stayed NOREQ and does not block completion
        assert!(frame.is_complete());
    }

    #[test]
    fn next_stage_follows_graph_order() {
        let frame = preview_frame(1);
        assert_eq!(frame.next_stage(None), Some(PipeId::Flite));
        assert_eq!(frame.next_stage(Some(PipeId::Flite)), Some(PipeId::Aa3Isp));
        assert_eq!(frame.next_stage(Some(PipeId::Mcsc)), None);

        let failed = frame.fail_pending();
        assert_eq!(failed.len(), 4);
        assert_eq!(frame.next_stage(None), None);
        assert!(frame.is_complete());
    }

    #[test]
    fn unbound_slot_reports_no_buffer() {
        let frame = preview_frame(1);
        assert!(matches!(
            frame.dst_buffer(PipeId::Flite),
            Err(Error::NoBufferBound { slot: "dst", .. })
        ));
    }

    #[test]
    fn shared_slot_is_detached_once() {
        let pool = bayer_pool();
        let frame = preview_frame(1);
        let bayer = pool.get_buffer(BufferPosition::InHal).unwrap();
        frame.set_dst_buffer(PipeId::Flite, bayer.clone()).unwrap();
        frame.set_src_buffer(PipeId::Aa3Isp, bayer.clone()).unwrap();

        let drained = frame.drain_buffers();
        assert_eq!(drained.len(), 1);
        assert!(frame.src_buffer(PipeId::Aa3Isp).is_err());
        assert!(frame.drain_buffers().is_empty());
    }

    #[test]
    fn held_buffer_survives_drain() {
        let pool = bayer_pool();
        let frame = preview_frame(1);
        frame.set_hold_pipe(PipeId::Flite);
        let bayer = pool.get_buffer(BufferPosition::InHal).unwrap();
        frame.set_dst_buffer(PipeId::Flite, bayer.clone()).unwrap();
        frame.set_src_buffer(PipeId::Aa3Isp, bayer).unwrap();

        assert!(!frame.mark_held(), "hold needs a complete stage");
        frame.begin_stage(PipeId::Flite).unwrap();
        frame.finish_stage(PipeId::Flite, true).unwrap();
        assert!(frame.mark_held());

        assert!(frame.drain_buffers().is_empty());
        let held = frame.take_held_buffer().unwrap();
        assert_eq!(held.pool, PoolId::Bayer);
        assert!(!frame.is_held());
        assert!(frame.src_buffer(PipeId::Aa3Isp).is_err());
    }

    #[test]
    fn reference_count_saturates_at_zero() {
        let frame = preview_frame(1);
        assert_eq!(frame.inc_ref(), 2);
        assert_eq!(frame.dec_ref(), 1);
        assert_eq!(frame.dec_ref(), 0);
        assert_eq!(frame.dec_ref(), 0);
    }
}

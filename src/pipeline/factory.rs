//! Builds frames for one stage graph and owns that graph's pipes

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use flume::Sender;
use once_cell::sync::OnceCell;
use tracing::{debug, info, instrument, warn};

use super::{FactoryMode, Pipe, PipeId, SrcSpec, StageGraph};
use crate::buffer::PoolId;
use crate::driver::DriverSet;
use crate::error::{Error, Result};
use crate::frame::{Entity, Frame, FrameManager, FrameType};
use crate::metadata::ShotSettings;
use crate::utils::{core_for, lock};

pub struct FrameFactory {
    mode: FactoryMode,
    graph: &'static StageGraph,
    frames: Arc<FrameManager>,
    pipes: OnceCell<Vec<Pipe>>,
    /// DMA-out taps enabled for the next frames
    requests: Mutex<HashMap<PipeId, bool>>,
    /// Pool overrides, e.g. a tap mapped onto a producer stream
    outputs: Mutex<HashMap<PipeId, PoolId>>,
    hold: Mutex<Option<PipeId>>,
    running: AtomicBool,
}

impl FrameFactory {
    pub fn new(mode: FactoryMode, frames: Arc<FrameManager>) -> Self {
        Self {
            mode,
            graph: mode.graph(),
            frames,
            pipes: OnceCell::new(),
            requests: Mutex::new(HashMap::new()),
            outputs: Mutex::new(HashMap::new()),
            hold: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    pub fn mode(&self) -> FactoryMode {
        self.mode
    }

    pub fn graph(&self) -> &'static StageGraph {
        self.graph
    }

    /// Create one pipe per stage, pinned round-robin over `cores`
    #[instrument(skip(self, drivers, cores), fields(mode = ?self.mode))]
    pub fn init_pipes(&self, drivers: &DriverSet, cores: &[usize]) -> Result<()> {
        if self.pipes.get().is_some() {
            return Ok(());
        }
        let pipes = self
            .graph
            .stages
            .iter()
            .enumerate()
            .map(|(n, node)| Ok(Pipe::new(node.pipe, drivers.get(node.pipe)?, core_for(cores, n))))
            .collect::<Result<Vec<_>>>()?;
        // a concurrent init won the race; its pipes are equivalent
        let _ = self.pipes.set(pipes);
        info!("{:?}: {} pipes ready", self.mode, self.graph.stages.len());
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.pipes.get().is_some()
    }

    /// Enable or disable a DMA-out tap for frames created from now on
    pub fn set_request(&self, pipe: PipeId, enabled: bool) {
        lock(&self.requests).insert(pipe, enabled);
    }

    pub fn is_requested(&self, pipe: PipeId) -> bool {
        lock(&self.requests).get(&pipe).copied().unwrap_or(false)
    }

    /// Route a stage or tap output into `pool` instead of its internal pool
    pub fn set_output_pool(&self, pipe: PipeId, pool: PoolId) {
        lock(&self.outputs).insert(pipe, pool);
    }

    /// Entity whose output the selector keeps for still capture
    pub fn set_hold(&self, pipe: Option<PipeId>) {
        *lock(&self.hold) = pipe;
    }

    pub fn hold(&self) -> Option<PipeId> {
        *lock(&self.hold)
    }

    /// Resolved dst pool of a stage or tap
    pub fn output_pool(&self, pipe: PipeId) -> Option<PoolId> {
        let outputs = lock(&self.outputs);
        self.resolve(&outputs, pipe)
    }

    fn resolve(&self, outputs: &HashMap<PipeId, PoolId>, pipe: PipeId) -> Option<PoolId> {
        if let Some(pool) = outputs.get(&pipe) {
            return Some(*pool);
        }
        match self.graph.stage(pipe) {
            Some(node) => node.dst,
            None => self.graph.tap(pipe).and_then(|(_, tap)| tap.pool),
        }
    }

    /// Instantiate a frame for the current graph and tap selection; acquires no buffers
    pub fn create_new_frame(
        &self,
        frame_count: u32,
        frame_type: FrameType,
        request_key: Option<u32>,
        shot: ShotSettings,
    ) -> Result<Arc<Frame>> {
        if !self.is_ready() {
            return Err(Error::FactoryNotReady(format!("{:?}", self.mode)));
        }

        let hold = self.hold();
        let entities = {
            let requests = lock(&self.requests);
            let outputs = lock(&self.outputs);
            let mut entities = Vec::new();
            for node in &self.graph.stages {
                let src_pool = match node.src {
                    SrcSpec::From(pipe) => self.resolve(&outputs, pipe),
                    _ => None,
                };
                entities.push(
                    Entity::stage(node.pipe, self.resolve(&outputs, node.pipe))
                        .with_src_pool(src_pool),
                );
                for tap in &node.taps {
                    let pool = self.resolve(&outputs, tap.pipe);
                    let wanted = requests.get(&tap.pipe).copied().unwrap_or(false)
                        || hold == Some(tap.pipe)
                        || self.feeds_stage(tap.pipe);
                    entities.push(Entity::tap(tap.pipe, node.pipe, pool, wanted && pool.is_some()));
                }
            }
            entities
        };

        let frame = self.frames.create(
            frame_count,
            frame_type,
            self.mode,
            request_key,
            shot,
            entities,
        )?;
        if let Some(pipe) = hold {
            frame.set_hold_pipe(pipe);
        }
        debug!("{:?}: frame {} created", self.mode, frame_count);
        Ok(frame)
    }

    /// A tap read by a later stage is always on
    fn feeds_stage(&self, tap: PipeId) -> bool {
        self.graph.consumer_of(tap).is_some()
    }

    pub fn push_frame_to_pipe(&self, frame: Arc<Frame>, pipe: PipeId) -> Result<()> {
        self.pipe(pipe)?.push(frame)
    }

    pub fn set_output_frame_q_to_pipe(&self, tx: Sender<Arc<Frame>>, pipe: PipeId) -> Result<()> {
        self.pipe(pipe)?.set_output(tx);
        Ok(())
    }

    fn pipes(&self) -> Result<&[Pipe]> {
        self.pipes
            .get()
            .map(Vec::as_slice)
            .ok_or_else(|| Error::FactoryNotReady(format!("{:?}", self.mode)))
    }

    fn pipe(&self, pipe: PipeId) -> Result<&Pipe> {
        self.pipes()?
            .iter()
            .find(|p| p.id() == pipe)
            .ok_or(Error::NoSuchStage(pipe))
    }

    pub fn prepare_pipes(&self, count: usize) -> Result<()> {
        for pipe in self.pipes()? {
            pipe.prepare(count)?;
        }
        Ok(())
    }

    pub fn start_pipes(&self) -> Result<()> {
        for pipe in self.pipes()? {
            pipe.start()?;
        }
        self.running.store(true, Ordering::Release);
        info!("{:?}: pipes started", self.mode);
        Ok(())
    }

    /// Stop every pipe in graph order. Frames still queued are handed on as ERROR,
    /// so each reaches its output queue and gets cleaned up there. A second call is a no-op.
    pub fn stop_pipes(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::AcqRel) {
            debug!("{:?}: pipes already stopped", self.mode);
            return Ok(());
        }
        let mut stopped = 0;
        for pipe in self.pipes()? {
            if pipe.stop() {
                stopped += 1;
            }
        }
        if stopped == 0 {
            warn!("{:?}: no pipe was running", self.mode);
        }
        info!("{:?}: pipes stopped", self.mode);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn stages(&self) -> impl Iterator<Item = PipeId> + '_ {
        self.graph.stage_ids()
    }

    /// Frames queued across every pipe
    pub fn queued_frames(&self) -> usize {
        self.pipes()
            .map(|pipes| pipes.iter().map(Pipe::queued).sum())
            .unwrap_or(0)
    }
}

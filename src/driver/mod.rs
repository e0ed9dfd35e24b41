//! Hardware stage drivers: one blocking `submit` per frame per stage

pub mod jpeg;
pub mod simulated;
#[cfg(feature = "v4l2-sensor")]
pub mod v4l2;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub use jpeg::JpegEncoderDriver;
pub use simulated::{FaultPlan, SimulatedDriver};

use crate::buffer::Buffer;
use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::metadata::{CameraMetadata, ShotSettings};
use crate::pipeline::PipeId;
use crate::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Return once the hardware is done
    Blocking,
    /// Return after queueing; completion is signalled by fence
    Fenced,
}

/// One unit of work for a stage
#[derive(Debug, Clone)]
pub struct StageCommand {
    pub pipe: PipeId,
    pub frame_count: u32,
    pub src: Option<Buffer>,
    pub dst: Option<Buffer>,
    /// Requested DMA-out taps with their bound buffers
    pub taps: Vec<(PipeId, Option<Buffer>)>,
    pub shot: ShotSettings,
    pub sync: SyncMode,
}

impl StageCommand {
    /// Snapshot the buffers a frame has bound for `pipe`
    pub fn for_frame(pipe: PipeId, frame: &Frame) -> Self {
        let taps = frame
            .requested_taps(pipe)
            .into_iter()
            .map(|tap| (tap, frame.dst_buffer(tap).ok()))
            .collect();

        Self {
            pipe,
            frame_count: frame.frame_count(),
            src: frame.src_buffer(pipe).ok(),
            dst: frame.dst_buffer(pipe).ok(),
            taps,
            shot: *frame.shot(),
            sync: SyncMode::Blocking,
        }
    }

    /// Every output buffer of the command
    pub fn outputs(&self) -> impl Iterator<Item = &Buffer> {
        self.dst
            .iter()
            .chain(self.taps.iter().filter_map(|(_, b)| b.as_ref()))
    }
}

#[derive(Debug, Clone, Default)]
pub struct StageOutput {
    /// Start-of-exposure time, reported by the sensor stage
    pub timestamp_ns: Option<u64>,
    pub metadata: CameraMetadata,
}

pub trait StageDriver: Send + Sync {
    fn name(&self) -> &str;

    /// Pre-queue `count` buffers ahead of streaming
    fn prepare(&self, _count: usize) -> Result<()> {
        Ok(())
    }

    fn submit(&self, cmd: &StageCommand) -> Result<StageOutput>;
}

/// Driver per stage
#[derive(Clone, Default)]
pub struct DriverSet {
    drivers: HashMap<PipeId, Arc<dyn StageDriver>>,
}

impl DriverSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Software stand-ins for every stage
    pub fn simulated(config: &Config) -> Self {
        let latency = Duration::from_micros(config.pipeline.stage_latency_us);
        let mut set = Self::new();

        set.insert(PipeId::Flite, Arc::new(SimulatedDriver::sensor("flite", latency)));
        for (pipe, name) in [(PipeId::Aa3, "3aa"), (PipeId::Aa3Isp, "3aa-isp")] {
            set.insert(pipe, Arc::new(SimulatedDriver::three_a(name, latency)));
        }
        for (pipe, name) in [
            (PipeId::Isp, "isp"),
            (PipeId::Mcsc, "mcsc"),
            (PipeId::Aa3IspReprocessing, "3aa-isp-reprocessing"),
            (PipeId::IspReprocessing, "isp-reprocessing"),
            (PipeId::McscReprocessing, "mcsc-reprocessing"),
        ] {
            set.insert(pipe, Arc::new(SimulatedDriver::new(name, latency)));
        }
        set.insert(PipeId::Jpeg, Arc::new(JpegEncoderDriver::new("jpeg")));
        set
    }

    /// Simulated stages with the FLITE stage on a real capture node
    #[cfg(feature = "v4l2-sensor")]
    pub fn with_sensor(config: &Config, device: &str) -> Result<Self> {
        let mut set = Self::simulated(config);
        let sensor = v4l2::V4l2SensorDriver::new(device, &config.sensor)?;
        set.insert(PipeId::Flite, Arc::new(sensor));
        Ok(set)
    }

    pub fn insert(&mut self, pipe: PipeId, driver: Arc<dyn StageDriver>) {
        self.drivers.insert(pipe, driver);
    }

    pub fn get(&self, pipe: PipeId) -> Result<Arc<dyn StageDriver>> {
        self.drivers
            .get(&pipe)
            .cloned()
            .ok_or(Error::NoSuchStage(pipe))
    }
}

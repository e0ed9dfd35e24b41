pub mod buffer;
pub mod camera;
pub mod driver;
pub mod error;
pub mod frame;
pub mod metadata;
pub mod pipeline;
pub mod request;
pub mod selector;
pub mod stream;
pub mod utils;

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use camera::CameraDevice;
pub use error::{Error, ErrorKind, Result};

/// Prefix for environment overrides, e.g. `EXYNOS_CAMERA3__SENSOR__FPS=60`
pub const ENV_PREFIX: &str = "EXYNOS_CAMERA3";

/// Camera configuration, one per opened device
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sensor: SensorConfig,
    pub pipeline: PipelineConfig,
    pub buffers: BufferConfig,
    pub selector: SelectorConfig,
    pub monitor: MonitorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    /// V4L2 node backing the FLITE stage; simulated when unset
    pub device: Option<String>,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Frames between a sensor setting being queued and it taking effect
    pub control_delay: u32,
}

/// How preview frames traverse 3AA and ISP
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PreviewMode {
    /// 3AA and ISP chained on-the-fly, one stage
    Otf,
    /// 3AA and ISP as separate memory-to-memory stages
    M2m,
}

/// Which preview output is held for still capture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReprocessingMode {
    PureBayer,
    DirtyBayer,
    Yuv,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub preview_mode: PreviewMode,
    pub reprocessing_mode: ReprocessingMode,
    /// Outstanding requests at which intake starts blocking
    pub max_block_request_count: usize,
    /// Generate internal frames when no request is pending
    pub keep_warm: bool,
    /// Buffers pre-queued to each stage before streaming
    pub prepare_count: usize,
    /// Per-stage processing time of the simulated drivers
    pub stage_latency_us: u64,
    /// Live frame cap of the frame arena
    pub max_frames: usize,
    /// Cores to pin stage workers to, round-robin; empty disables pinning
    pub worker_cores: Vec<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    pub bayer_count: usize,
    pub aa3_count: usize,
    pub isp_count: usize,
    pub scp_count: usize,
    pub yuv_capture_count: usize,
    pub reprocessing_count: usize,
    /// Upper bound on memory handed out by the pool allocator
    pub memory_budget_mb: usize,
    /// Wait budget of a stage acquiring an internal buffer
    pub get_buffer_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    pub hold_count: usize,
    pub max_retries: u32,
    pub wait_interval_ms: u64,
}

/// What the watchdog does once it declares the device dead
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FatalPolicy {
    Abort,
    Report,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub interval_ms: u64,
    pub stall_timeout_ms: u64,
    pub fatal_policy: FatalPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sensor: SensorConfig::default(),
            pipeline: PipelineConfig::default(),
            buffers: BufferConfig::default(),
            selector: SelectorConfig::default(),
            monitor: MonitorConfig::default(),
        }
    }
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            device: None,
            width: 1920,
            height: 1080,
            fps: 30,
            control_delay: 2,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            preview_mode: PreviewMode::Otf,
            reprocessing_mode: ReprocessingMode::PureBayer,
            max_block_request_count: 4,
            keep_warm: true,
            prepare_count: 2,
            stage_latency_us: 4_000,
            max_frames: 64,
            worker_cores: Vec::new(),
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            bayer_count: 8,
            aa3_count: 6,
            isp_count: 6,
            scp_count: 6,
            yuv_capture_count: 4,
            reprocessing_count: 2,
            memory_budget_mb: 512,
            get_buffer_timeout_ms: 200,
        }
    }
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            hold_count: 2,
            max_retries: 10,
            wait_interval_ms: 33,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_ms: 100,
            stall_timeout_ms: 3_000,
            fatal_policy: FatalPolicy::Abort,
        }
    }
}

impl Config {
    /// Layer defaults, an optional TOML file and `EXYNOS_CAMERA3__*` environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }

        let config: Config = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sensor.width == 0 || self.sensor.height == 0 {
            return Err(Error::Config(format!(
                "sensor size {}x{}",
                self.sensor.width, self.sensor.height
            )));
        }
        if self.sensor.fps == 0 {
            return Err(Error::Config("sensor fps must be non-zero".into()));
        }
        if self.pipeline.max_block_request_count == 0 {
            return Err(Error::Config("max_block_request_count must be non-zero".into()));
        }
        if self.selector.hold_count == 0 {
            return Err(Error::Config("selector hold_count must be non-zero".into()));
        }
        if self.buffers.bayer_count < self.selector.hold_count + 1 {
            return Err(Error::Config(format!(
                "bayer pool ({}) cannot cover the hold list ({}) plus a live frame",
                self.buffers.bayer_count, self.selector.hold_count
            )));
        }
        Ok(())
    }

    pub fn frame_duration(&self) -> Duration {
        Duration::from_nanos(1_000_000_000 / u64::from(self.sensor.fps))
    }
}

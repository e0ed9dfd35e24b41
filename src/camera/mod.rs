//! Pipeline orchestrator: the camera device seen by the producer

mod capture;
mod flush;
mod handlers;
mod intake;
mod monitor;
mod setup;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use arc_swap::ArcSwapOption;
use flume::Sender;
use tracing::{error, info};

use crate::buffer::{Allocator, MmapAllocator, PoolId, PoolRegistry};
use crate::driver::DriverSet;
use crate::error::{Error, Result};
use crate::frame::{Frame, FrameManager};
use crate::metadata::{self, CameraMetadata, Parameters, RequestTemplate, ShotSettings};
use crate::pipeline::{FactoryMode, FrameFactory, PipeId};
use crate::request::{CallbackOps, CaptureRequest, RequestManager};
use crate::selector::FrameSelector;
use crate::stream::{StreamConfig, StreamSet};
use crate::utils::{lock, monotonic_ns};
use crate::Config;

use capture::CaptureJob;
use setup::Setup;

/// Everything built by `configure_streams`
pub(crate) struct Session {
    streams: StreamSet,
    pools: Arc<PoolRegistry>,
    preview: Arc<FrameFactory>,
    reprocessing: Option<Arc<FrameFactory>>,
    selector: Option<Arc<FrameSelector>>,
}

impl Session {
    fn factories(&self) -> impl Iterator<Item = &Arc<FrameFactory>> {
        std::iter::once(&self.preview).chain(self.reprocessing.iter())
    }
}

/// Threads and queues alive while streaming
struct Streaming {
    intake_tx: Sender<()>,
    stop: Arc<AtomicBool>,
    handler_stop: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
    handlers: Vec<JoinHandle<()>>,
    monitor: Option<JoinHandle<()>>,
}

pub(crate) struct Shared {
    config: Config,
    drivers: DriverSet,
    allocator: Arc<dyn Allocator>,
    parameters: Parameters,
    frames: Arc<FrameManager>,
    requests: RequestManager,
    session: ArcSwapOption<Session>,
    setup: Mutex<Option<Setup>>,
    streaming: Mutex<Option<Streaming>>,
    /// Serialises flush against stream start
    flush_lock: Mutex<()>,
    /// Preview frames in flight, by frame count
    process_list: Mutex<BTreeMap<u32, Arc<Frame>>>,
    /// Reprocessing frames in flight, by frame count
    capture_process_list: Mutex<BTreeMap<u32, Arc<Frame>>>,
    next_frame_count: AtomicU32,
    flushing: AtomicBool,
    closed: AtomicBool,
    last_progress: AtomicU64,
    last_shutter_ns: AtomicU64,
}

impl Shared {
    fn session(&self) -> Result<Arc<Session>> {
        self.session
            .load_full()
            .ok_or_else(|| Error::Config("streams are not configured".into()))
    }

    /// Fresh frame count; counts are never handed out twice
    fn next_frame_count(&self) -> u32 {
        self.next_frame_count.fetch_add(1, Ordering::Relaxed)
    }

    fn touch_progress(&self) {
        self.last_progress.store(monotonic_ns(), Ordering::Relaxed);
    }

    fn list(&self, mode: FactoryMode) -> &Mutex<BTreeMap<u32, Arc<Frame>>> {
        if mode.is_reprocessing() {
            &self.capture_process_list
        } else {
            &self.process_list
        }
    }

    fn in_flight(&self) -> usize {
        lock(&self.process_list).len() + lock(&self.capture_process_list).len()
    }

    fn check_usable(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Config("device is closed".into()));
        }
        if let Some(reason) = self.requests.fatal() {
            return Err(Error::DeviceFatal(reason));
        }
        Ok(())
    }
}

/// One opened camera.
///
/// `configure_streams` then any number of `process_capture_request` calls; results
/// come back through the [`CallbackOps`] given at open. Dropping the device closes it.
pub struct CameraDevice {
    shared: Arc<Shared>,
}

impl CameraDevice {
    /// Open with simulated stages, or a V4L2 sensor when one is configured
    pub fn open(config: Config, callbacks: Arc<dyn CallbackOps>) -> Result<Self> {
        let drivers = Self::default_drivers(&config)?;
        Self::open_with_drivers(config, drivers, callbacks)
    }

    #[cfg(feature = "v4l2-sensor")]
    fn default_drivers(config: &Config) -> Result<DriverSet> {
        let device = match &config.sensor.device {
            Some(device) => Some(device.clone()),
            None => crate::utils::auto_detect_sensor().ok().map(|found| found.path),
        };
        match device {
            Some(device) => DriverSet::with_sensor(config, &device),
            None => Ok(DriverSet::simulated(config)),
        }
    }

    #[cfg(not(feature = "v4l2-sensor"))]
    fn default_drivers(config: &Config) -> Result<DriverSet> {
        if let Some(device) = &config.sensor.device {
            tracing::warn!("{}: built without v4l2-sensor, simulating the sensor", device);
        }
        Ok(DriverSet::simulated(config))
    }

    pub fn open_with_drivers(
        config: Config,
        drivers: DriverSet,
        callbacks: Arc<dyn CallbackOps>,
    ) -> Result<Self> {
        config.validate()?;
        let shot = ShotSettings::for_sensor(&config.sensor);
        let allocator: Arc<dyn Allocator> =
            Arc::new(MmapAllocator::with_budget_mb(config.buffers.memory_budget_mb));

        info!(
            "opening camera: {}x{}@{} {:?}/{:?}",
            config.sensor.width,
            config.sensor.height,
            config.sensor.fps,
            config.pipeline.preview_mode,
            config.pipeline.reprocessing_mode
        );

        let shared = Shared {
            frames: Arc::new(FrameManager::new(config.pipeline.max_frames)),
            requests: RequestManager::new(callbacks, shot),
            parameters: Parameters::new(shot),
            drivers,
            allocator,
            session: ArcSwapOption::empty(),
            setup: Mutex::new(None),
            streaming: Mutex::new(None),
            flush_lock: Mutex::new(()),
            process_list: Mutex::new(BTreeMap::new()),
            capture_process_list: Mutex::new(BTreeMap::new()),
            next_frame_count: AtomicU32::new(1),
            flushing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            last_progress: AtomicU64::new(monotonic_ns()),
            last_shutter_ns: AtomicU64::new(0),
            config,
        };
        Ok(Self {
            shared: Arc::new(shared),
        })
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Validate and map `streams`; buffers and pipes are built in the background
    /// and joined by the first capture request
    pub fn configure_streams(&self, streams: &[StreamConfig]) -> Result<()> {
        self.shared.check_usable()?;
        self.shared.configure_streams(streams)
    }

    /// Queue one request; blocks while too many requests are outstanding
    pub fn process_capture_request(&self, request: &CaptureRequest) -> Result<()> {
        self.shared.check_usable()?;
        self.shared.process_capture_request(request)
    }

    /// Abort everything in flight; every outstanding request is answered before this returns
    pub fn flush(&self) -> Result<()> {
        self.shared.check_usable()?;
        self.shared.flush()
    }

    pub fn construct_default_request_settings(&self, template: RequestTemplate) -> CameraMetadata {
        metadata::construct_default_request_settings(template, &self.shared.config.sensor)
    }

    /// Flush, stop every thread and free every pool
    pub fn close(&self) -> Result<()> {
        self.shared.close()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Frames currently travelling through either graph
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight()
    }

    /// Requests registered but not yet fully answered
    pub fn outstanding_requests(&self) -> usize {
        self.shared.requests.outstanding()
    }

    /// (pool, available, allocated) of every pool of the current session
    pub fn pool_stats(&self) -> Vec<(PoolId, usize, usize)> {
        let Ok(session) = self.shared.session() else {
            return Vec::new();
        };
        let mut stats: Vec<_> = session
            .pools
            .iter()
            .map(|p| (p.pool(), p.num_available(), p.allocated_count()))
            .collect();
        stats.sort_by_key(|(pool, _, _)| *pool);
        stats
    }

    /// Frames the selector holds for still capture
    pub fn held_frames(&self) -> usize {
        self.shared
            .session()
            .ok()
            .and_then(|s| s.selector.as_ref().map(|sel| sel.len()))
            .unwrap_or(0)
    }

    pub fn dump(&self) {
        self.shared.dump();
    }
}

impl Drop for CameraDevice {
    fn drop(&mut self) {
        if let Err(e) = self.shared.close() {
            error!("close on drop: {}", e);
        }
    }
}

impl Shared {
    fn dump(&self) {
        info!(
            "camera: {} preview / {} capture frames in flight, next frame count {}",
            lock(&self.process_list).len(),
            lock(&self.capture_process_list).len(),
            self.next_frame_count.load(Ordering::Relaxed)
        );
        if let Ok(session) = self.session() {
            for pool in session.pools.iter() {
                pool.dump();
            }
            for factory in session.factories() {
                info!(
                    "{:?}: running={} queued={}",
                    factory.mode(),
                    factory.is_running(),
                    factory.queued_frames()
                );
            }
            if let Some(selector) = &session.selector {
                selector.dump();
            }
        }
        self.frames.dump();
        self.requests.dump();
    }
}

/// Stages a handler thread is spawned for
fn handler_stages(session: &Session) -> Vec<(Arc<FrameFactory>, PipeId)> {
    session
        .factories()
        .flat_map(|f| f.stages().map(move |s| (Arc::clone(f), s)))
        .collect()
}

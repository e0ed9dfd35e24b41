//! Stream configuration and streaming start-up

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use super::{handler_stages, Session, Shared, Streaming};
use crate::buffer::{AllocationMode, Allocator, BufferInfo, BufferManager, PoolId, PoolRegistry};
use crate::driver::DriverSet;
use crate::error::{Error, Result};
use crate::frame::FrameManager;
use crate::pipeline::{hold_node, FactoryMode, FrameFactory, PipeId};
use crate::request::CaptureRequest;
use crate::selector::FrameSelector;
use crate::stream::{PixelFormat, StreamConfig, StreamSet, StreamType};
use crate::utils::{lock, spawn_worker};
use crate::{Config, PreviewMode, ReprocessingMode};

type Factories = (FrameFactory, Option<FrameFactory>);

/// Background work started by `configure_streams`
pub(crate) struct Setup {
    streams: StreamSet,
    alloc: JoinHandle<Result<PoolRegistry>>,
    factories: JoinHandle<Result<Factories>>,
}

impl Setup {
    pub(super) fn join(self, config: &Config, frames: &Arc<FrameManager>) -> Result<Session> {
        let pools = join(self.alloc, "buffer allocation")?;
        let (preview, reprocessing) = join(self.factories, "factory construction")?;
        let pools = Arc::new(pools);

        let selector = reprocessing.as_ref().map(|_| {
            Arc::new(FrameSelector::new(
                config.selector.hold_count,
                Duration::from_millis(config.selector.wait_interval_ms),
                Arc::clone(frames),
                Arc::clone(&pools),
            ))
        });
        Ok(Session {
            streams: self.streams,
            pools,
            preview: Arc::new(preview),
            reprocessing: reprocessing.map(Arc::new),
            selector,
        })
    }
}

fn join<T>(handle: JoinHandle<Result<T>>, what: &str) -> Result<T> {
    handle
        .join()
        .map_err(|_| Error::Config(format!("{} thread panicked", what)))?
}

impl Shared {
    #[instrument(skip(self, list), fields(streams = list.len()))]
    pub(super) fn configure_streams(self: &Arc<Self>, list: &[StreamConfig]) -> Result<()> {
        let streams = StreamSet::new(list, self.config.sensor.width, self.config.sensor.height)?;

        // Tear down whatever the previous configuration left running
        self.flush()?;
        let _flush = lock(&self.flush_lock);
        if let Some(old) = lock(&self.setup).take() {
            if let Ok(session) = old.join(&self.config, &self.frames) {
                session.pools.release_all();
            }
        }
        if let Some(old) = self.session.swap(None) {
            for factory in old.factories() {
                factory.stop_pipes()?;
            }
            old.pools.release_all();
        }

        let alloc = spawn_worker("buffer-alloc".into(), None, {
            let config = self.config.clone();
            let streams = streams.clone();
            let allocator = Arc::clone(&self.allocator);
            move || build_pools(&config, &streams, allocator)
        })?;
        let factories = spawn_worker("factory-create".into(), None, {
            let config = self.config.clone();
            let streams = streams.clone();
            let drivers = self.drivers.clone();
            let frames = Arc::clone(&self.frames);
            move || build_factories(&config, &streams, &drivers, frames)
        })?;

        *lock(&self.setup) = Some(Setup {
            streams,
            alloc,
            factories,
        });
        info!("streams configured");
        Ok(())
    }

    pub(super) fn process_capture_request(self: &Arc<Self>, raw: &CaptureRequest) -> Result<()> {
        if self.session.load().is_none() && lock(&self.setup).is_none() {
            return Err(Error::Config("streams are not configured".into()));
        }
        self.validate_request(raw)?;

        let max = self.config.pipeline.max_block_request_count;
        let step = self.config.frame_duration() * (max as u32 + 2);
        let request = self.requests.admit(raw, max, step)?;

        match self.ensure_streaming() {
            Ok(()) => {
                if let Some(streaming) = lock(&self.streaming).as_ref() {
                    let _ = streaming.intake_tx.send(());
                }
                Ok(())
            }
            Err(e) => {
                warn!("request {}: cannot start streaming: {}", request.key(), e);
                // answer what was admitted so the producer is not left waiting
                self.requests.flush();
                Err(e)
            }
        }
    }

    fn validate_request(&self, raw: &CaptureRequest) -> Result<()> {
        let streams = match self.session.load_full() {
            Some(session) => session.streams.clone(),
            None => match lock(&self.setup).as_ref() {
                Some(setup) => setup.streams.clone(),
                None => return Err(Error::Config("streams are not configured".into())),
            },
        };
        for buffer in &raw.output_buffers {
            match streams.get(buffer.stream) {
                Some(s) if s.stream_type != StreamType::ZslInput => {}
                _ => {
                    return Err(Error::Config(format!(
                        "request {}: {} is not an output stream",
                        raw.frame_number, buffer.stream
                    )))
                }
            }
        }
        if let Some(input) = &raw.input_buffer {
            let is_input = streams
                .get(input.stream)
                .map(|s| s.stream_type == StreamType::ZslInput)
                .unwrap_or(false);
            let wants_jpeg = raw.output_buffers.iter().any(|b| {
                streams
                    .get(b.stream)
                    .map(|s| s.stream_type == StreamType::Jpeg)
                    .unwrap_or(false)
            });
            if !is_input || !wants_jpeg {
                return Err(Error::Config(format!(
                    "request {}: cannot reprocess from stream {}",
                    raw.frame_number, input.stream
                )));
            }
        }
        Ok(())
    }

    /// Join background setup on first use and start every pipe and thread
    pub(super) fn ensure_streaming(self: &Arc<Self>) -> Result<()> {
        let _flush = lock(&self.flush_lock);
        let mut streaming = lock(&self.streaming);
        if streaming.is_some() {
            return Ok(());
        }

        if let Some(setup) = lock(&self.setup).take() {
            let session = setup.join(&self.config, &self.frames)?;
            self.session.store(Some(Arc::new(session)));
        }
        let session = self.session()?;

        let stop = Arc::new(AtomicBool::new(false));
        let handler_stop = Arc::new(AtomicBool::new(false));
        let cores = &self.config.pipeline.worker_cores;

        let mut handlers = Vec::new();
        for (factory, stage) in handler_stages(&session) {
            let (tx, rx) = flume::unbounded();
            factory.set_output_frame_q_to_pipe(tx, stage)?;
            let shared = Arc::clone(self);
            let stop = Arc::clone(&handler_stop);
            handlers.push(spawn_worker(
                format!("done-{:?}", stage),
                None,
                move || shared.handler_loop(factory, stage, rx, stop),
            )?);
        }

        for factory in session.factories() {
            factory.prepare_pipes(self.config.pipeline.prepare_count)?;
            factory.start_pipes()?;
        }
        if let Some(selector) = &session.selector {
            selector.resume();
        }

        let (intake_tx, intake_rx) = flume::unbounded();
        let (capture_tx, capture_rx) = flume::unbounded();
        let intake = spawn_worker("intake".into(), cores.first().copied(), {
            let shared = Arc::clone(self);
            let stop = Arc::clone(&stop);
            move || shared.intake_loop(intake_rx, capture_tx, stop)
        })?;
        let capture = spawn_worker("select-bayer".into(), None, {
            let shared = Arc::clone(self);
            let stop = Arc::clone(&stop);
            move || shared.capture_loop(capture_rx, stop)
        })?;
        let monitor = spawn_worker("monitor".into(), None, {
            let shared = Arc::clone(self);
            let stop = Arc::clone(&stop);
            move || shared.monitor_loop(stop)
        })?;

        self.touch_progress();
        *streaming = Some(Streaming {
            intake_tx,
            stop,
            handler_stop,
            workers: vec![intake, capture],
            handlers,
            monitor: Some(monitor),
        });
        info!("streaming started");
        Ok(())
    }
}

fn pool(
    name: &str,
    pool: PoolId,
    info: BufferInfo,
    allocator: &Arc<dyn Allocator>,
) -> Result<Arc<BufferManager>> {
    let manager = Arc::new(BufferManager::new(name, pool, Arc::clone(allocator)));
    manager.set_info(info)?;
    manager.alloc()?;
    Ok(manager)
}

fn image(format: PixelFormat, width: u32, height: u32, count: usize) -> BufferInfo {
    BufferInfo::new(format.plane_sizes(width, height), format.strides(width), count)
}

/// Allocate every internal pool the configured streams need, plus one service pool per stream
#[instrument(skip_all)]
fn build_pools(
    config: &Config,
    streams: &StreamSet,
    allocator: Arc<dyn Allocator>,
) -> Result<PoolRegistry> {
    let (w, h) = (config.sensor.width, config.sensor.height);
    let counts = &config.buffers;
    let jpeg = streams.by_type(StreamType::Jpeg);
    let mut pools = PoolRegistry::new();

    pools.insert(pool(
        "bayer",
        PoolId::Bayer,
        image(PixelFormat::Raw16, w, h, counts.bayer_count).with_meta_plane(),
        &allocator,
    )?);
    if config.pipeline.preview_mode == PreviewMode::M2m {
        pools.insert(pool(
            "3aa",
            PoolId::Aa3,
            image(PixelFormat::Raw16, w, h, counts.aa3_count).with_meta_plane(),
            &allocator,
        )?);
        pools.insert(pool(
            "isp",
            PoolId::Isp,
            image(PixelFormat::Nv21, w, h, counts.isp_count).unmapped(),
            &allocator,
        )?);
    }
    if !streams.has(StreamType::Preview) {
        let scp_min = counts.scp_count.min(2).max(1);
        pools.insert(pool(
            "scp",
            PoolId::Scp,
            image(PixelFormat::Nv21, w, h, counts.scp_count)
                .growable(scp_min, AllocationMode::OnDemand)
                .unmapped(),
            &allocator,
        )?);
    }

    if let Some(jpeg) = jpeg {
        match config.pipeline.reprocessing_mode {
            ReprocessingMode::PureBayer => {}
            ReprocessingMode::DirtyBayer => {
                pools.insert(pool(
                    "dirty-bayer",
                    PoolId::DirtyBayer,
                    image(PixelFormat::Raw16, w, h, counts.bayer_count),
                    &allocator,
                )?);
                pools.insert(pool(
                    "isp-reprocessing",
                    PoolId::IspReprocessing,
                    image(PixelFormat::Nv21, jpeg.width, jpeg.height, counts.reprocessing_count)
                        .unmapped(),
                    &allocator,
                )?);
            }
            ReprocessingMode::Yuv => {
                pools.insert(pool(
                    "yuv-capture",
                    PoolId::YuvCapture,
                    image(PixelFormat::Nv21, jpeg.width, jpeg.height, counts.yuv_capture_count)
                        .growable(
                            (config.selector.hold_count + 1).min(counts.yuv_capture_count),
                            AllocationMode::Silent,
                        ),
                    &allocator,
                )?);
            }
        }
        pools.insert(pool(
            "yuv-reprocessing",
            PoolId::YuvReprocessing,
            image(PixelFormat::Nv21, jpeg.width, jpeg.height, counts.reprocessing_count),
            &allocator,
        )?);
    }

    for stream in streams.iter() {
        let manager = BufferManager::new_service(
            format!("stream-{}", stream.id),
            PoolId::Service(stream.id),
        );
        manager.set_info(image(stream.format, stream.width, stream.height, stream.max_buffers))?;
        let manager = Arc::new(manager);
        manager.alloc()?;
        pools.insert(manager);
    }

    debug!("{} pools allocated", pools.iter().count());
    Ok(pools)
}

/// Build the preview factory and, when a JPEG stream exists, the reprocessing one
#[instrument(skip_all)]
fn build_factories(
    config: &Config,
    streams: &StreamSet,
    drivers: &DriverSet,
    frames: Arc<FrameManager>,
) -> Result<Factories> {
    let cores = &config.pipeline.worker_cores;
    let preview = FrameFactory::new(
        FactoryMode::preview(config.pipeline.preview_mode),
        Arc::clone(&frames),
    );
    preview.init_pipes(drivers, cores)?;

    for stream in streams.iter() {
        if let Some(node) = stream.output_node() {
            if preview.graph().contains(node) {
                preview.set_output_pool(node, PoolId::Service(stream.id));
            }
        }
    }
    if !streams.has(StreamType::Preview) {
        // keep the scaler busy on an internal buffer
        preview.set_request(PipeId::McscPreview, true);
    }

    let reprocessing = match streams.by_type(StreamType::Jpeg) {
        Some(jpeg) => {
            let mode = config.pipeline.reprocessing_mode;
            preview.set_hold(Some(hold_node(mode)));
            let factory = FrameFactory::new(FactoryMode::reprocessing(mode), frames);
            factory.init_pipes(drivers, cores)?;
            factory.set_output_pool(PipeId::Jpeg, PoolId::Service(jpeg.id));
            Some(factory)
        }
        None => None,
    };
    Ok((preview, reprocessing))
}

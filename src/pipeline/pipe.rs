//! One hardware stage: an input queue drained by a worker thread that submits to the driver

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

use flume::{Receiver, Sender};
use metrics::{counter, histogram};
use tracing::{debug, error, info, trace, warn};

use super::PipeId;
use crate::driver::{StageCommand, StageDriver};
use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::utils::{lock, spawn_worker};

pub struct Pipe {
    id: PipeId,
    driver: Arc<dyn StageDriver>,
    core: Option<usize>,
    input: Mutex<Option<Sender<Arc<Frame>>>>,
    output: Mutex<Option<Sender<Arc<Frame>>>>,
    stopping: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Pipe {
    pub fn new(id: PipeId, driver: Arc<dyn StageDriver>, core: Option<usize>) -> Self {
        Self {
            id,
            driver,
            core,
            input: Mutex::new(None),
            output: Mutex::new(None),
            stopping: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        }
    }

    pub fn id(&self) -> PipeId {
        self.id
    }

    pub fn driver_name(&self) -> &str {
        self.driver.name()
    }

    /// Queue receiving every frame once this stage is done with it
    pub fn set_output(&self, tx: Sender<Arc<Frame>>) {
        *lock(&self.output) = Some(tx);
    }

    pub fn prepare(&self, count: usize) -> Result<()> {
        self.driver.prepare(count)
    }

    pub fn start(&self) -> Result<()> {
        let mut worker = lock(&self.worker);
        if worker.is_some() {
            return Ok(());
        }
        let output = lock(&self.output)
            .clone()
            .ok_or_else(|| Error::Config(format!("{:?} has no output queue", self.id)))?;

        let (tx, rx) = flume::unbounded();
        self.stopping.store(false, Ordering::Release);
        let handle = spawn_worker(format!("pipe-{:?}", self.id), self.core, {
            let id = self.id;
            let driver = Arc::clone(&self.driver);
            let stopping = Arc::clone(&self.stopping);
            move || run(id, driver, rx, output, stopping)
        })?;

        *lock(&self.input) = Some(tx);
        *worker = Some(handle);
        debug!("{:?}: started on {}", self.id, self.driver.name());
        Ok(())
    }

    pub fn push(&self, frame: Arc<Frame>) -> Result<()> {
        let input = lock(&self.input);
        match input.as_ref() {
            Some(tx) => tx.send(frame).map_err(|_| Error::PipeStopped(self.id)),
            None => Err(Error::PipeStopped(self.id)),
        }
    }

    /// Close the input queue and join the worker. Frames still queued are passed
    /// on as ERROR so their owners can clean them up. Returns false if already stopped.
    pub fn stop(&self) -> bool {
        let handle = lock(&self.worker).take();
        let Some(handle) = handle else {
            return false;
        };
        self.stopping.store(true, Ordering::Release);
        lock(&self.input).take();
        if handle.join().is_err() {
            error!("{:?}: worker panicked", self.id);
        }
        self.stopping.store(false, Ordering::Release);
        info!("{:?}: stopped", self.id);
        true
    }

    pub fn is_running(&self) -> bool {
        lock(&self.worker).is_some()
    }

    /// Frames waiting for this stage
    pub fn queued(&self) -> usize {
        lock(&self.input).as_ref().map(|tx| tx.len()).unwrap_or(0)
    }
}

impl Drop for Pipe {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(
    id: PipeId,
    driver: Arc<dyn StageDriver>,
    rx: Receiver<Arc<Frame>>,
    output: Sender<Arc<Frame>>,
    stopping: Arc<AtomicBool>,
) {
    let stage = format!("{:?}", id);
    while let Ok(frame) = rx.recv() {
        if stopping.load(Ordering::Acquire) {
            trace!("{:?}: frame {} dropped by stop", id, frame.frame_count());
            if let Err(e) = frame.finish_stage(id, false) {
                debug!("{:?}: {}", id, e);
            }
        } else {
            process(id, &stage, driver.as_ref(), &frame);
        }

        if output.send(frame).is_err() {
            warn!("{:?}: output queue closed", id);
        }
    }
    trace!("{:?}: worker exits", id);
}

fn process(id: PipeId, stage: &str, driver: &dyn StageDriver, frame: &Frame) {
    if let Err(e) = frame.begin_stage(id) {
        warn!("frame {}: {}", frame.frame_count(), e);
        return;
    }

    let started = Instant::now();
    let cmd = StageCommand::for_frame(id, frame);
    let ok = match driver.submit(&cmd) {
        Ok(output) => {
            if let Some(ts) = output.timestamp_ns {
                frame.set_timestamp(ts);
            }
            frame.merge_dynamic(&output.metadata);
            true
        }
        Err(e) => {
            warn!("frame {}: {}", frame.frame_count(), e);
            counter!("camera_stage_errors_total", "stage" => stage.to_owned()).increment(1);
            false
        }
    };
    histogram!("camera_stage_latency_seconds", "stage" => stage.to_owned())
        .record(started.elapsed().as_secs_f64());

    if let Err(e) = frame.finish_stage(id, ok) {
        warn!("frame {}: {}", frame.frame_count(), e);
    }
}

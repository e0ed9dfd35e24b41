//! Flush and close

use std::sync::atomic::Ordering;

use tracing::{error, info, instrument, warn};

use super::Shared;
use crate::error::Result;
use crate::utils::lock;

impl Shared {
    /// Stop every thread and pipe, answer everything in flight, then leave the
    /// device configured and idle. Streaming restarts with the next request.
    #[instrument(skip(self))]
    pub(super) fn flush(&self) -> Result<()> {
        let _flush = lock(&self.flush_lock);
        self.flushing.store(true, Ordering::Release);
        self.requests.set_flushing(true);

        let session = self.session.load_full();
        if let Some(selector) = session.as_ref().and_then(|s| s.selector.as_ref()) {
            selector.cancel();
        }

        let streaming = lock(&self.streaming).take();
        if let Some(mut streaming) = streaming {
            streaming.stop.store(true, Ordering::Release);
            for worker in streaming.workers.drain(..) {
                if worker.join().is_err() {
                    error!("worker panicked during flush");
                }
            }

            if let Some(session) = &session {
                for factory in session.factories() {
                    if let Err(e) = factory.stop_pipes() {
                        warn!("{:?}: {}", factory.mode(), e);
                    }
                }
            }

            // handlers leave once their queues stay empty
            streaming.handler_stop.store(true, Ordering::Release);
            for handler in streaming.handlers.drain(..) {
                if handler.join().is_err() {
                    error!("handler panicked during flush");
                }
            }
            if let Some(monitor) = streaming.monitor.take() {
                if monitor.join().is_err() {
                    error!("monitor panicked during flush");
                }
            }
        }

        let mut swept = 0;
        if let Some(session) = &session {
            let frames: Vec<_> = {
                let mut preview = lock(&self.process_list);
                let mut capture = lock(&self.capture_process_list);
                let mut frames: Vec<_> = std::mem::take(&mut *preview).into_values().collect();
                frames.extend(std::mem::take(&mut *capture).into_values());
                frames
            };
            swept = frames.len();
            for frame in &frames {
                self.finalize(session, frame);
            }
            if let Some(selector) = &session.selector {
                selector.release();
            }
        }

        self.requests.flush();
        self.frames.reap();

        self.requests.set_flushing(false);
        self.flushing.store(false, Ordering::Release);
        if let Some(selector) = session.as_ref().and_then(|s| s.selector.as_ref()) {
            selector.resume();
        }
        info!("flush done, {} frames swept", swept);
        Ok(())
    }

    /// Idempotent; the device answers nothing afterwards
    pub(super) fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let flushed = self.flush();

        if let Some(setup) = lock(&self.setup).take() {
            if let Ok(session) = setup.join(&self.config, &self.frames) {
                session.pools.release_all();
            }
        }
        if let Some(session) = self.session.swap(None) {
            for factory in session.factories() {
                if let Err(e) = factory.stop_pipes() {
                    warn!("{:?}: {}", factory.mode(), e);
                }
            }
            session.pools.release_all();
        }
        self.frames.clear();
        info!("camera closed");
        flushed
    }
}

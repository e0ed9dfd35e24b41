//! Still capture: pairs JPEG requests with held preview output and runs reprocessing

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use flume::{Receiver, RecvTimeoutError};
use tracing::{debug, info, instrument, trace, warn};

use super::{Session, Shared};
use crate::buffer::{Buffer, BufferPosition, PoolId};
use crate::error::{Error, Result};
use crate::frame::FrameType;
use crate::pipeline::{FrameFactory, PipeId};
use crate::request::{Request, ResultKind};
use crate::stream::{BufferStatus, StreamBuffer, StreamType};
use crate::utils::lock;

const CAPTURE_POLL: Duration = Duration::from_millis(100);

/// Work for the capture thread
#[derive(Debug, Clone, Copy)]
pub(crate) enum CaptureJob {
    /// Encode the held frame at or after `target` for request `key`
    Zsl { key: u32, target: u32 },
    /// Encode the producer's input buffer of request `key`
    Reprocess { key: u32 },
}

impl Shared {
    pub(super) fn capture_loop(&self, jobs: Receiver<CaptureJob>, stop: Arc<AtomicBool>) {
        loop {
            if stop.load(Ordering::Acquire) {
                break;
            }
            match jobs.recv_timeout(CAPTURE_POLL) {
                Ok(job) => self.run_capture(job),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        trace!("capture thread exits");
    }

    #[instrument(skip(self))]
    fn run_capture(&self, job: CaptureJob) {
        let session = match self.session() {
            Ok(session) => session,
            Err(e) => {
                warn!("{:?}: {}", job, e);
                return;
            }
        };
        let result = match job {
            CaptureJob::Zsl { key, target } => self.zsl_capture(&session, key, target),
            CaptureJob::Reprocess { key } => self.reprocess_capture(&session, key),
        };
        if let Err(e) = result {
            warn!("{:?} failed: {}", job, e);
        }
    }

    fn zsl_capture(&self, session: &Session, key: u32, target: u32) -> Result<()> {
        let request = self.requests.get_request(key)?;
        let (factory, selector) = match (&session.reprocessing, &session.selector) {
            (Some(factory), Some(selector)) => (factory, selector),
            _ => return Err(Error::Config("no reprocessing path configured".into())),
        };
        let jpeg = jpeg_output(session, &request)?;

        let mut selected = match selector.select_capture_frames(
            1,
            target,
            self.config.selector.max_retries,
        ) {
            Ok(selected) => selected,
            Err(e) => {
                self.fail_capture(&request, &jpeg);
                return Err(e);
            }
        };
        let held = selected.remove(0);
        let buffer = held.take_held_buffer();
        self.frames.release(&held);
        let Some(buffer) = buffer else {
            self.fail_capture(&request, &jpeg);
            return Err(Error::NoBufferAvailable(format!(
                "frame {} lost its held buffer",
                held.frame_count()
            )));
        };

        debug!("request {}: reprocessing frame {}", key, held.frame_count());
        self.start_reprocessing(session, factory, &request, held.frame_count(), buffer, &jpeg)
    }

    fn reprocess_capture(&self, session: &Session, key: u32) -> Result<()> {
        let request = self.requests.get_request(key)?;
        let factory = session
            .reprocessing
            .as_ref()
            .ok_or_else(|| Error::Config("no reprocessing path configured".into()))?;
        let jpeg = jpeg_output(session, &request)?;
        let input = request
            .input()
            .ok_or_else(|| Error::Config(format!("request {} has no input buffer", key)))?;

        let registered = session
            .pools
            .get(PoolId::Service(input.stream))
            .and_then(|pool| {
                pool.register_buffer(
                    key,
                    input.handle.clone(),
                    (input.acquire_fence, input.release_fence),
                    BufferPosition::InHal,
                )
            });
        let src = match registered {
            Ok(src) => src,
            Err(e) => {
                self.fail_capture(&request, &jpeg);
                return Err(e);
            }
        };
        let frame_count = self
            .requests
            .frame_count_of(key)
            .unwrap_or_else(|| self.next_frame_count());
        self.start_reprocessing(session, factory, &request, frame_count, src, &jpeg)
    }

    /// Build a reprocessing frame around `src`, bind the JPEG buffer and queue it.
    /// On failure every buffer goes back and the JPEG is reported as an error.
    fn start_reprocessing(
        &self,
        session: &Session,
        factory: &FrameFactory,
        request: &Request,
        frame_count: u32,
        src: Buffer,
        jpeg: &StreamBuffer,
    ) -> Result<()> {
        let frame = match factory.create_new_frame(
            frame_count,
            FrameType::Request,
            Some(request.key()),
            *request.shot(),
        ) {
            Ok(frame) => frame,
            Err(e) => {
                if let Err(put) = session.pools.put(&src, position_for(&src)) {
                    warn!("{:?}[{}]: {}", src.pool, src.index, put);
                }
                self.fail_capture(request, jpeg);
                return Err(e);
            }
        };
        frame.set_capture(true);
        frame.set_zsl(request.input().is_none());
        lock(&self.capture_process_list).insert(frame_count, Arc::clone(&frame));

        let first = factory.graph().first_stage();
        let started = frame
            .set_src_buffer(first, src)
            .and_then(|_| {
                let buffer = session.pools.get(PoolId::Service(jpeg.stream))?.register_buffer(
                    request.key(),
                    jpeg.handle.clone(),
                    (jpeg.acquire_fence, jpeg.release_fence),
                    BufferPosition::InHal,
                )?;
                frame.set_dst_buffer(PipeId::Jpeg, buffer)
            })
            .and_then(|_| self.start_frame(session, factory, &frame));
        if let Err(e) = started {
            self.discard_frame(session, &frame);
            self.fail_capture(request, jpeg);
            return Err(e);
        }
        info!("request {}: capture frame {} queued", request.key(), frame_count);
        Ok(())
    }

    /// Report the JPEG of `request` as failed; a producer-driven reprocess also
    /// needs its final result since its shutter is already out
    fn fail_capture(&self, request: &Request, jpeg: &StreamBuffer) {
        let key = request.key();
        if let Ok(result) = self.requests.result_for(key, ResultKind::BufferOnly) {
            self.dispatch(result.with_buffer(jpeg.clone().with_status(BufferStatus::Error)));
        }
        if request.is_reprocess() {
            if let Ok(result) = self.requests.result_for(key, ResultKind::AllResult) {
                self.dispatch(result.with_metadata(request.settings().clone()));
            }
        }
    }
}

fn jpeg_output(session: &Session, request: &Request) -> Result<StreamBuffer> {
    request
        .outputs()
        .iter()
        .find(|b| {
            session
                .streams
                .get(b.stream)
                .map(|s| s.stream_type == StreamType::Jpeg)
                .unwrap_or(false)
        })
        .cloned()
        .ok_or_else(|| Error::Config(format!("request {} has no JPEG output", request.key())))
}

fn position_for(buffer: &Buffer) -> BufferPosition {
    if buffer.pool.is_service() {
        BufferPosition::InService
    } else {
        BufferPosition::None
    }
}

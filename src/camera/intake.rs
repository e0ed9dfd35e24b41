//! Intake: turns queued requests into preview frames

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use flume::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, instrument, trace, warn};

use super::{CaptureJob, Session, Shared};
use crate::buffer::{BufferPosition, PoolId};
use crate::error::{Error, Result};
use crate::frame::{Frame, FrameType};
use crate::pipeline::{FrameFactory, PipeId};
use crate::request::{NotifyMsg, Request, ResultKind};
use crate::stream::{StreamBuffer, StreamType};
use crate::utils::{lock, monotonic_ns};

impl Shared {
    pub(super) fn intake_loop(
        &self,
        wake: Receiver<()>,
        capture_tx: Sender<CaptureJob>,
        stop: Arc<AtomicBool>,
    ) {
        let interval = self.config.frame_duration();
        while !stop.load(Ordering::Acquire) {
            let idle = match wake.recv_timeout(interval) {
                Ok(()) => false,
                Err(RecvTimeoutError::Timeout) => true,
                Err(RecvTimeoutError::Disconnected) => break,
            };

            while !stop.load(Ordering::Acquire) {
                let Some(request) = self.requests.create_service_request() else {
                    break;
                };
                self.take_request(&request, &capture_tx);
            }

            if idle && self.keep_warm() {
                if let Err(e) = self.create_internal_frame() {
                    debug!("keep-warm frame: {}", e);
                }
            }
        }
        trace!("intake exits");
    }

    fn keep_warm(&self) -> bool {
        self.config.pipeline.keep_warm
            && !self.flushing.load(Ordering::Acquire)
            && lock(&self.process_list).len() < self.config.pipeline.prepare_count.max(1)
    }

    #[instrument(skip_all, fields(request = request.key()))]
    fn take_request(&self, request: &Arc<Request>, capture_tx: &Sender<CaptureJob>) {
        if request.is_reprocess() {
            if let Err(e) = self.take_reprocess_request(request, capture_tx) {
                warn!("reprocess request {}: {}", request.key(), e);
                self.fail_request(request);
            }
            return;
        }

        if request.need_internal_frame() {
            debug!(
                "request {}: {} settle frames for the new exposure",
                request.key(),
                self.config.sensor.control_delay
            );
            for _ in 0..self.config.sensor.control_delay {
                if let Err(e) = self.create_internal_frame() {
                    warn!("settle frame: {}", e);
                    break;
                }
            }
        }
        self.parameters.apply(*request.shot());

        if let Err(e) = self.create_request_frame(request, capture_tx) {
            warn!("request {}: {}", request.key(), e);
            self.fail_request(request);
        }
    }

    /// The producer supplied the reprocessing input: the shutter goes out now and
    /// the capture thread runs the rest
    fn take_reprocess_request(&self, request: &Request, capture_tx: &Sender<CaptureJob>) -> Result<()> {
        let key = request.key();
        self.requests.bind_frame_count(key, self.next_frame_count())?;
        capture_tx
            .send(CaptureJob::Reprocess { key })
            .map_err(|_| Error::Flushing)?;
        let shutter = self.requests.result_for(key, ResultKind::NotifyOnly)?;
        self.dispatch(shutter.with_notify(NotifyMsg::Shutter {
            frame_number: key,
            timestamp_ns: monotonic_ns(),
        }));
        Ok(())
    }

    /// Frame with no producer buffers, only internal outputs
    pub(super) fn create_internal_frame(&self) -> Result<()> {
        let session = self.session()?;
        let factory = &session.preview;
        select_stream_taps(&session, factory, &[]);

        let frame_count = self.next_frame_count();
        let frame = factory.create_new_frame(
            frame_count,
            FrameType::Internal,
            None,
            *self.parameters.shot(),
        )?;
        lock(&self.process_list).insert(frame_count, Arc::clone(&frame));
        if let Err(e) = self.start_frame(&session, factory, &frame) {
            self.discard_frame(&session, &frame);
            return Err(e);
        }
        trace!("internal frame {} started", frame_count);
        Ok(())
    }

    fn create_request_frame(&self, request: &Request, capture_tx: &Sender<CaptureJob>) -> Result<()> {
        let session = self.session()?;
        let factory = &session.preview;
        let key = request.key();
        select_stream_taps(&session, factory, request.outputs());

        let wants_jpeg = request
            .outputs()
            .iter()
            .any(|b| stream_type(&session, b) == Some(StreamType::Jpeg));
        if wants_jpeg && session.selector.is_none() {
            return Err(Error::Config("no reprocessing path for the JPEG stream".into()));
        }

        let frame_count = self.next_frame_count();
        self.requests.bind_frame_count(key, frame_count)?;
        let frame = factory.create_new_frame(
            frame_count,
            FrameType::Request,
            Some(key),
            *request.shot(),
        )?;
        frame.set_capture(wants_jpeg);
        frame.set_service_bayer(
            request
                .outputs()
                .iter()
                .any(|b| stream_type(&session, b) == Some(StreamType::Raw)),
        );
        lock(&self.process_list).insert(frame_count, Arc::clone(&frame));

        let started = self
            .bind_request_buffers(&session, request, &frame)
            .and_then(|()| self.start_frame(&session, factory, &frame));
        if let Err(e) = started {
            self.discard_frame(&session, &frame);
            return Err(e);
        }

        if wants_jpeg {
            // the frame is already in the pipes; from here on a failure costs only the JPEG
            if capture_tx
                .send(CaptureJob::Zsl {
                    key,
                    target: frame_count,
                })
                .is_err()
            {
                warn!("request {}: capture thread is gone", key);
            }
        }
        debug!("request {} -> frame {}", key, frame_count);
        Ok(())
    }

    /// Register each non-JPEG output with its stream pool and bind it to the tap feeding it
    fn bind_request_buffers(
        &self,
        session: &Session,
        request: &Request,
        frame: &Frame,
    ) -> Result<()> {
        for out in request.outputs() {
            let stream = session
                .streams
                .get(out.stream)
                .ok_or_else(|| Error::Config(format!("unknown stream {}", out.stream)))?;
            if stream.stream_type == StreamType::Jpeg {
                continue;
            }
            let node = stream
                .output_node()
                .filter(|node| factory_has(&session.preview, *node))
                .ok_or_else(|| {
                    Error::Config(format!("stream {} has no preview output", out.stream))
                })?;
            let buffer = session.pools.get(PoolId::Service(out.stream))?.register_buffer(
                request.key(),
                out.handle.clone(),
                (out.acquire_fence, out.release_fence),
                BufferPosition::InHal,
            )?;
            frame.set_dst_buffer(node, buffer)?;
        }
        Ok(())
    }
}

fn stream_type(session: &Session, buffer: &StreamBuffer) -> Option<StreamType> {
    session.streams.get(buffer.stream).map(|s| s.stream_type)
}

fn factory_has(factory: &FrameFactory, pipe: PipeId) -> bool {
    factory.graph().contains(pipe)
}

/// Turn on exactly the stream taps `outputs` asks for
fn select_stream_taps(session: &Session, factory: &FrameFactory, outputs: &[StreamBuffer]) {
    for stream in session.streams.iter() {
        if stream.stream_type == StreamType::Jpeg {
            continue;
        }
        if let Some(node) = stream.output_node().filter(|n| factory_has(factory, *n)) {
            let wanted = outputs.iter().any(|b| b.stream == stream.id);
            factory.set_request(node, wanted);
        }
    }
}

//! Stage-done handlers: move frames along their graph and report what they produced

use std::iter;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use flume::{Receiver, RecvTimeoutError};
use tracing::{debug, trace, warn};

use super::{Session, Shared};
use crate::buffer::{Buffer, BufferPosition};
use crate::error::{Error, Result};
use crate::frame::{EntityState, Frame, FrameType};
use crate::pipeline::{FrameFactory, PipeId, SrcSpec};
use crate::request::{ErrorCode, NotifyMsg, Request, ResultKind, ResultRequest};
use crate::stream::BufferStatus;
use crate::utils::{lock, monotonic_ns};

const HANDLER_POLL: Duration = Duration::from_millis(100);

impl Shared {
    /// Drain the done queue of one stage until stopped and idle
    pub(super) fn handler_loop(
        &self,
        factory: Arc<FrameFactory>,
        stage: PipeId,
        rx: Receiver<Arc<Frame>>,
        stop: Arc<AtomicBool>,
    ) {
        loop {
            match rx.recv_timeout(HANDLER_POLL) {
                Ok(frame) => self.handle_done(&factory, stage, &frame),
                Err(RecvTimeoutError::Timeout) => {
                    if stop.load(Ordering::Acquire) {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        trace!("{:?}: handler exits", stage);
    }

    fn handle_done(&self, factory: &FrameFactory, stage: PipeId, frame: &Arc<Frame>) {
        self.touch_progress();
        let session = match self.session() {
            Ok(session) => session,
            Err(e) => {
                warn!("frame {} done on {:?}: {}", frame.frame_count(), stage, e);
                frame.fail_pending();
                lock(self.list(frame.mode())).remove(&frame.frame_count());
                self.frames.release(frame);
                return;
            }
        };

        let ok = frame.entity_state(stage).ok() == Some(EntityState::Complete);
        let preview_request =
            frame.frame_type() == FrameType::Request && !frame.mode().is_reprocessing();

        if preview_request && stage == factory.graph().first_stage() {
            self.send_shutter(frame, true);
        }
        if ok && preview_request && stage.reports_3a() {
            self.send_partial(frame);
        }

        let graph = factory.graph();
        let outputs: Vec<PipeId> = iter::once(stage)
            .chain(frame.requested_taps(stage))
            .collect();
        for &pipe in &outputs {
            let Ok(Some(pool)) = frame.dst_pool(pipe) else {
                continue;
            };
            if pool.is_service() {
                if let Some(buffer) = frame.take_dst_buffer(pipe) {
                    let done = frame.entity_state(pipe).ok() == Some(EntityState::Complete);
                    self.deliver_buffer(&session, frame, &buffer, done);
                }
            } else if graph.consumer_of(pipe).is_none() {
                // nothing downstream reads it; give it back unless the selector wants it
                if let Ok(buffer) = frame.dst_buffer(pipe) {
                    if !frame.is_hold_buffer(&buffer) {
                        if let Some(buffer) = frame.take_dst_buffer(pipe) {
                            self.put_back(&session, &buffer);
                        }
                    }
                }
            }
        }

        if let Ok(src) = frame.src_buffer(stage) {
            if !frame.is_hold_buffer(&src) {
                if let Some(buffer) = frame.take_src_buffer(stage) {
                    self.put_back(&session, &buffer);
                }
            }
        }

        if !ok {
            debug!("frame {}: {:?} failed", frame.frame_count(), stage);
            self.finalize(&session, frame);
            return;
        }

        match frame.next_stage(Some(stage)) {
            Some(next) => {
                let pushed = self
                    .prepare_stage(&session, frame, next)
                    .and_then(|()| factory.push_frame_to_pipe(Arc::clone(frame), next));
                if let Err(e) = pushed {
                    warn!("frame {}: cannot run {:?}: {}", frame.frame_count(), next, e);
                    self.finalize(&session, frame);
                }
            }
            None => self.finalize(&session, frame),
        }
    }

    /// Bind the input of `stage` and lease internal buffers for its outputs
    pub(super) fn prepare_stage(&self, session: &Session, frame: &Frame, stage: PipeId) -> Result<()> {
        let node = frame
            .mode()
            .graph()
            .stage(stage)
            .ok_or(Error::NoSuchStage(stage))?;
        if let SrcSpec::From(producer) = node.src {
            let src = frame.dst_buffer(producer)?;
            frame.set_src_buffer(stage, src)?;
        }

        let budget = Duration::from_millis(self.config.buffers.get_buffer_timeout_ms);
        for pipe in iter::once(stage).chain(frame.requested_taps(stage)) {
            let Some(pool) = frame.dst_pool(pipe)? else {
                continue;
            };
            if pool.is_service() || frame.dst_buffer(pipe).is_ok() {
                continue;
            }
            let buffer = session
                .pools
                .get(pool)?
                .get_buffer_timeout(BufferPosition::InDriver, budget)?;
            frame.set_dst_buffer(pipe, buffer)?;
        }
        Ok(())
    }

    /// Prepare the first stage of a frame already on its process list and queue it
    pub(super) fn start_frame(
        &self,
        session: &Session,
        factory: &FrameFactory,
        frame: &Arc<Frame>,
    ) -> Result<()> {
        let first = factory.graph().first_stage();
        self.prepare_stage(session, frame, first)?;
        factory.push_frame_to_pipe(Arc::clone(frame), first)
    }

    /// Close out a frame: offer it to the selector, return or report every buffer
    /// still bound, send what the request still lacks and drop the frame.
    pub(super) fn finalize(&self, session: &Session, frame: &Arc<Frame>) {
        frame.fail_pending();

        if let (Some(selector), Some(hold)) = (&session.selector, frame.hold_pipe()) {
            if frame.entity_state(hold).ok() == Some(EntityState::Complete) {
                selector.manage_frame_hold_list(frame, hold);
            }
        }

        for buffer in frame.drain_buffers() {
            if buffer.pool.is_service() {
                self.deliver_buffer(session, frame, &buffer, false);
            } else {
                self.put_back(session, &buffer);
            }
        }

        let request = frame
            .request_key()
            .and_then(|key| self.requests.get_request(key).ok());
        if let Some(request) = request {
            if frame.frame_type() == FrameType::Request && !frame.mode().is_reprocessing() {
                self.send_shutter(frame, false);
                self.send_final(frame, &request);
            } else if request.is_reprocess() {
                self.send_final(frame, &request);
            }
        }

        lock(self.list(frame.mode())).remove(&frame.frame_count());
        self.frames.release(frame);
        trace!("frame {} finalized", frame.frame_count());
    }

    /// Abandon a frame that never reached a pipe; no buffer of it is reported
    pub(super) fn discard_frame(&self, session: &Session, frame: &Arc<Frame>) {
        frame.fail_pending();
        for buffer in frame.drain_buffers() {
            self.put_back(session, &buffer);
        }
        lock(self.list(frame.mode())).remove(&frame.frame_count());
        self.frames.release(frame);
    }

    /// Answer a request that could not be started at all
    pub(super) fn fail_request(&self, request: &Request) {
        let key = request.key();
        let result = match self.requests.result_for(key, ResultKind::BufferOnly) {
            Ok(result) => result.with_notify(NotifyMsg::Error {
                frame_number: key,
                stream: None,
                code: ErrorCode::Request,
            }),
            Err(e) => {
                warn!("request {}: {}", key, e);
                return;
            }
        };
        let result = request.outputs().iter().fold(result, |result, buffer| {
            result.with_buffer(buffer.clone().with_status(BufferStatus::Error))
        });
        self.dispatch(result);
    }

    /// Report a stream buffer to its request (if it asked for that stream) and
    /// give the slot back to the producer
    fn deliver_buffer(&self, session: &Session, frame: &Frame, buffer: &Buffer, ok: bool) {
        let wanted = frame.request_key().zip(buffer.pool.stream()).and_then(|(key, stream)| {
            let request = self.requests.get_request(key).ok()?;
            request.output(stream).cloned().map(|out| (key, out))
        });
        if let Some((key, out)) = wanted {
            let status = if ok {
                BufferStatus::Ok
            } else {
                BufferStatus::Error
            };
            match self.requests.result_for(key, ResultKind::BufferOnly) {
                Ok(result) => self.dispatch(result.with_buffer(out.with_status(status))),
                Err(e) => debug!("request {}: {}", key, e),
            }
        }
        if let Err(e) = session.pools.put(buffer, BufferPosition::InService) {
            warn!("frame {}: {}", frame.frame_count(), e);
        }
    }

    fn put_back(&self, session: &Session, buffer: &Buffer) {
        let position = if buffer.pool.is_service() {
            BufferPosition::InService
        } else {
            BufferPosition::None
        };
        if let Err(e) = session.pools.put(buffer, position) {
            warn!("{:?}[{}]: {}", buffer.pool, buffer.index, e);
        }
    }

    /// Shutter of a preview request frame. Timestamps are expected to grow;
    /// `check_order` logs when one does not.
    fn send_shutter(&self, frame: &Frame, check_order: bool) {
        let Some(key) = frame.request_key() else {
            return;
        };
        let timestamp_ns = frame.timestamp().unwrap_or_else(monotonic_ns);
        if check_order {
            let last = self.last_shutter_ns.fetch_max(timestamp_ns, Ordering::AcqRel);
            if timestamp_ns < last {
                warn!(
                    "frame {}: shutter {} is older than {}",
                    frame.frame_count(),
                    timestamp_ns,
                    last
                );
            }
        }
        if let Ok(result) = self.requests.result_for(key, ResultKind::NotifyOnly) {
            self.dispatch(result.with_notify(NotifyMsg::Shutter {
                frame_number: key,
                timestamp_ns,
            }));
        }
    }

    fn send_partial(&self, frame: &Frame) {
        let Some(key) = frame.request_key() else {
            return;
        };
        if let Ok(result) = self.requests.result_for(key, ResultKind::Partial3a) {
            self.dispatch(result.with_metadata(frame.dynamic()));
        }
    }

    fn send_final(&self, frame: &Frame, request: &Request) {
        let mut metadata = request.settings().clone();
        metadata.merge(&frame.dynamic());
        if let Ok(result) = self.requests.result_for(request.key(), ResultKind::AllResult) {
            self.dispatch(result.with_metadata(metadata));
        }
    }

    pub(super) fn dispatch(&self, result: ResultRequest) {
        let key = result.key();
        if let Err(e) = self.requests.callback_request(result) {
            debug!("request {}: {}", key, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::DriverSet;
    use crate::metadata::ShotSettings;
    use crate::pipeline::FactoryMode;
    use crate::request::{CallbackOps, CaptureResult};
    use crate::{CameraDevice, Config};

    struct Discard;

    impl CallbackOps for Discard {
        fn notify(&self, _msg: NotifyMsg) {}
        fn process_capture_result(&self, _result: CaptureResult) {}
    }

    #[test]
    fn frame_done_without_a_session_leaves_the_process_list() {
        let config = Config::default();
        let drivers = DriverSet::simulated(&config);
        let device =
            CameraDevice::open_with_drivers(config, drivers.clone(), Arc::new(Discard)).unwrap();
        let shared = &device.shared;

        let factory = FrameFactory::new(FactoryMode::PreviewOtf, Arc::clone(&shared.frames));
        factory.init_pipes(&drivers, &[]).unwrap();
        let shot = ShotSettings::for_sensor(&shared.config.sensor);
        let frame = factory
            .create_new_frame(7, FrameType::Internal, None, shot)
            .unwrap();
        lock(&shared.process_list).insert(7, Arc::clone(&frame));
        assert_eq!(shared.in_flight(), 1);

        shared.handle_done(&factory, PipeId::Flite, &frame);
        assert_eq!(shared.in_flight(), 0);
    }
}

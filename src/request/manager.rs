//! Outstanding requests and the ordered result sequencer

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use metrics::{counter, gauge};
use tracing::{debug, info, instrument, trace, warn};

use super::{
    CallbackOps, CaptureRequest, CaptureResult, ErrorCode, NotifyMsg, Request, ResultKind,
    ResultRequest, PARTIAL_RESULT_3A, PARTIAL_RESULT_FINAL,
};
use crate::error::{Error, Result};
use crate::metadata::{CameraMetadata, ShotSettings};
use crate::stream::{BufferStatus, StreamBuffer, StreamId};
use crate::utils::{lock, monotonic_ns};

/// Per-request delivery bookkeeping
struct Pending {
    request: Arc<Request>,
    frame_count: Option<u32>,
    shutter: Option<NotifyMsg>,
    shutter_sent: bool,
    /// Failed as a whole; no metadata will be sent
    request_error: bool,
    errors: VecDeque<NotifyMsg>,
    partials: VecDeque<CameraMetadata>,
    buffers: VecDeque<Vec<StreamBuffer>>,
    /// Streams whose buffer has been handed in
    returned: HashSet<StreamId>,
    final_meta: Option<CameraMetadata>,
    final_sent: bool,
}

impl Pending {
    fn new(request: Arc<Request>) -> Self {
        Self {
            request,
            frame_count: None,
            shutter: None,
            shutter_sent: false,
            request_error: false,
            errors: VecDeque::new(),
            partials: VecDeque::new(),
            buffers: VecDeque::new(),
            returned: HashSet::new(),
            final_meta: None,
            final_sent: false,
        }
    }

    fn buffers_done(&self) -> bool {
        self.buffers.is_empty() && self.returned.len() >= self.request.outputs.len()
    }

    fn is_done(&self) -> bool {
        self.final_sent && self.buffers_done()
    }
}

enum Delivery {
    Notify(NotifyMsg),
    Result(CaptureResult),
}

struct State {
    pending: BTreeMap<u32, Pending>,
    /// Registered, not yet picked up by intake
    queue: VecDeque<Arc<Request>>,
    /// frame count -> request key
    bindings: HashMap<u32, u32>,
    last_key: Option<u32>,
    last_settings: CameraMetadata,
    last_shot: ShotSettings,
    flushing: bool,
    fatal: Option<String>,
}

pub struct RequestManager {
    callbacks: Arc<dyn CallbackOps>,
    sequencer: Mutex<()>,
    state: Mutex<State>,
    slot_freed: Condvar,
}

/// Holder of the callback sequencer. Results dispatched through it reach the
/// producer in order, with no other thread delivering in between.
pub struct Sequencer<'a> {
    manager: &'a RequestManager,
    _guard: MutexGuard<'a, ()>,
}

impl Sequencer<'_> {
    pub fn callback(&self, result: ResultRequest) -> Result<()> {
        self.manager.enqueue(result)?;
        self.manager.drain();
        Ok(())
    }
}

impl RequestManager {
    pub fn new(callbacks: Arc<dyn CallbackOps>, initial: ShotSettings) -> Self {
        Self {
            callbacks,
            sequencer: Mutex::new(()),
            state: Mutex::new(State {
                pending: BTreeMap::new(),
                queue: VecDeque::new(),
                bindings: HashMap::new(),
                last_key: None,
                last_settings: CameraMetadata::new(),
                last_shot: initial,
                flushing: false,
                fatal: None,
            }),
            slot_freed: Condvar::new(),
        }
    }

    /// Copy a producer request into an owned one and queue it for intake
    pub fn register_service_request(&self, request: &CaptureRequest) -> Result<Arc<Request>> {
        let mut state = lock(&self.state);
        Self::register(&mut state, request)
    }

    /// Wait until fewer than `max` requests are outstanding, then register.
    /// `step` bounds each wait; a step that expires is logged and the wait goes on.
    #[instrument(skip(self, request), fields(frame = request.frame_number))]
    pub fn admit(
        &self,
        request: &CaptureRequest,
        max: usize,
        step: Duration,
    ) -> Result<Arc<Request>> {
        let mut state = lock(&self.state);
        loop {
            if let Some(reason) = &state.fatal {
                return Err(Error::DeviceFatal(reason.clone()));
            }
            if !state.flushing && state.pending.len() < max {
                break;
            }
            let (guard, wait) = self
                .slot_freed
                .wait_timeout(state, step)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
            if wait.timed_out() && !state.flushing {
                warn!(
                    "request {} blocked, {} outstanding",
                    request.frame_number,
                    state.pending.len()
                );
            }
        }
        Self::register(&mut state, request)
    }

    fn register(state: &mut State, raw: &CaptureRequest) -> Result<Arc<Request>> {
        let key = raw.frame_number;
        if let Some(last) = state.last_key {
            if key <= last {
                return Err(Error::Config(format!(
                    "frame number {} does not follow {}",
                    key, last
                )));
            }
        }
        if raw.output_buffers.is_empty() {
            return Err(Error::Config(format!("request {} has no output buffers", key)));
        }
        let settings = match (&raw.settings, state.last_key) {
            (Some(settings), _) => settings.clone(),
            (None, Some(_)) => state.last_settings.clone(),
            (None, None) => {
                return Err(Error::Config("first request carries no settings".into()));
            }
        };

        let shot = ShotSettings::from_metadata(&settings, &state.last_shot);
        let request = Arc::new(Request {
            key,
            need_internal_frame: shot.needs_sensor_settle(&state.last_shot),
            settings: settings.clone(),
            shot,
            input: raw.input_buffer.clone(),
            outputs: raw.output_buffers.clone(),
        });

        state.last_key = Some(key);
        state.last_settings = settings;
        state.last_shot = shot;
        state
            .pending
            .insert(key, Pending::new(Arc::clone(&request)));
        state.queue.push_back(Arc::clone(&request));
        gauge!("camera_requests_outstanding").set(state.pending.len() as f64);
        debug!(
            "request {} registered ({} outputs, reprocess={})",
            key,
            request.outputs.len(),
            request.is_reprocess()
        );
        Ok(request)
    }

    /// Next registered request in submission order
    pub fn create_service_request(&self) -> Option<Arc<Request>> {
        lock(&self.state).queue.pop_front()
    }

    /// Registered requests intake has not picked up yet
    pub fn queued(&self) -> usize {
        lock(&self.state).queue.len()
    }

    pub fn bind_frame_count(&self, key: u32, frame_count: u32) -> Result<()> {
        let mut state = lock(&self.state);
        let pending = state
            .pending
            .get_mut(&key)
            .ok_or(Error::RequestNotFound(key))?;
        pending.frame_count = Some(frame_count);
        state.bindings.insert(frame_count, key);
        Ok(())
    }

    pub fn frame_count_of(&self, key: u32) -> Option<u32> {
        lock(&self.state).pending.get(&key).and_then(|p| p.frame_count)
    }

    pub fn get_service_request(&self, frame_count: u32) -> Result<Arc<Request>> {
        let state = lock(&self.state);
        state
            .bindings
            .get(&frame_count)
            .and_then(|key| state.pending.get(key))
            .map(|p| Arc::clone(&p.request))
            .ok_or(Error::RequestNotFound(frame_count))
    }

    pub fn get_request(&self, key: u32) -> Result<Arc<Request>> {
        lock(&self.state)
            .pending
            .get(&key)
            .map(|p| Arc::clone(&p.request))
            .ok_or(Error::RequestNotFound(key))
    }

    pub fn create_result_request(&self, frame_count: u32, kind: ResultKind) -> Result<ResultRequest> {
        let state = lock(&self.state);
        let key = state
            .bindings
            .get(&frame_count)
            .copied()
            .filter(|key| state.pending.contains_key(key))
            .ok_or(Error::RequestNotFound(frame_count))?;
        Ok(ResultRequest::new(key, kind))
    }

    /// Result unit addressed by request key rather than frame count
    pub fn result_for(&self, key: u32, kind: ResultKind) -> Result<ResultRequest> {
        if !lock(&self.state).pending.contains_key(&key) {
            return Err(Error::RequestNotFound(key));
        }
        Ok(ResultRequest::new(key, kind))
    }

    pub fn callback_sequencer_lock(&self) -> Sequencer<'_> {
        Sequencer {
            manager: self,
            _guard: lock(&self.sequencer),
        }
    }

    pub fn callback_request(&self, result: ResultRequest) -> Result<()> {
        self.callback_sequencer_lock().callback(result)
    }

    fn enqueue(&self, result: ResultRequest) -> Result<()> {
        let mut state = lock(&self.state);
        let pending = state
            .pending
            .get_mut(&result.key)
            .ok_or(Error::RequestNotFound(result.key))?;

        match result.notify {
            Some(msg @ NotifyMsg::Shutter { .. }) => {
                if pending.shutter.is_none() && !pending.shutter_sent {
                    pending.shutter = Some(msg);
                } else {
                    trace!("request {}: shutter already queued", result.key);
                }
            }
            Some(
                msg @ NotifyMsg::Error {
                    code: ErrorCode::Request,
                    ..
                },
            ) => {
                if pending.shutter.is_none() && !pending.shutter_sent {
                    pending.request_error = true;
                    pending.shutter = Some(msg);
                } else {
                    warn!("request {}: already started, cannot fail it whole", result.key);
                }
            }
            Some(msg) => pending.errors.push_back(msg),
            None => {}
        }

        let mut accepted = Vec::new();
        for buffer in result.buffers {
            if pending.request.output(buffer.stream).is_none() {
                warn!("request {}: stream {} was not requested", result.key, buffer.stream);
            } else if !pending.returned.insert(buffer.stream) {
                warn!("request {}: stream {} returned twice", result.key, buffer.stream);
            } else {
                accepted.push(buffer);
            }
        }
        if !accepted.is_empty() {
            pending.buffers.push_back(accepted);
        }

        if let Some(meta) = result.metadata {
            match result.kind {
                ResultKind::Partial3a => pending.partials.push_back(meta),
                ResultKind::AllResult if !pending.final_sent && pending.final_meta.is_none() => {
                    pending.final_meta = Some(meta);
                }
                _ => trace!("request {}: metadata dropped for {:?}", result.key, result.kind),
            }
        }
        Ok(())
    }

    /// Deliver everything the ordering rules allow. Caller holds the sequencer.
    fn drain(&self) {
        loop {
            let batch = self.collect();
            if batch.is_empty() {
                break;
            }
            for delivery in batch {
                match delivery {
                    Delivery::Notify(msg) => self.callbacks.notify(msg),
                    Delivery::Result(result) => self.callbacks.process_capture_result(result),
                }
            }
        }
    }

    fn collect(&self) -> Vec<Delivery> {
        let mut state = lock(&self.state);
        let mut out = Vec::new();
        let mut shutters_in_order = true;
        let mut finals_in_order = true;

        for (&key, p) in state.pending.iter_mut() {
            if !p.shutter_sent && shutters_in_order {
                if let Some(msg) = p.shutter.take() {
                    out.push(Delivery::Notify(msg));
                    p.shutter_sent = true;
                }
            }
            shutters_in_order &= p.shutter_sent;
            if !p.shutter_sent {
                continue;
            }

            out.extend(p.errors.drain(..).map(Delivery::Notify));
            if !p.request_error {
                for meta in p.partials.drain(..) {
                    out.push(Delivery::Result(CaptureResult {
                        frame_number: key,
                        result: Some(meta),
                        output_buffers: Vec::new(),
                        input_buffer: None,
                        partial_result: PARTIAL_RESULT_3A,
                    }));
                }
            }
            while let Some(buffers) = p.buffers.pop_front() {
                if !p.request_error {
                    for failed in buffers.iter().filter(|b| b.status == BufferStatus::Error) {
                        out.push(Delivery::Notify(NotifyMsg::Error {
                            frame_number: key,
                            stream: Some(failed.stream),
                            code: ErrorCode::Buffer,
                        }));
                    }
                }
                out.push(Delivery::Result(CaptureResult {
                    frame_number: key,
                    result: None,
                    output_buffers: buffers,
                    input_buffer: None,
                    partial_result: 0,
                }));
            }

            if !p.final_sent && finals_in_order && p.buffers_done() {
                if p.request_error {
                    if let Some(input) = p.request.input.clone() {
                        out.push(Delivery::Result(CaptureResult {
                            frame_number: key,
                            result: None,
                            output_buffers: Vec::new(),
                            input_buffer: Some(input),
                            partial_result: 0,
                        }));
                    }
                    p.final_sent = true;
                } else if let Some(meta) = p.final_meta.take() {
                    out.push(Delivery::Result(CaptureResult {
                        frame_number: key,
                        result: Some(meta),
                        output_buffers: Vec::new(),
                        input_buffer: p.request.input.clone(),
                        partial_result: PARTIAL_RESULT_FINAL,
                    }));
                    p.final_sent = true;
                }
            }
            finals_in_order &= p.final_sent;
        }

        let done: Vec<u32> = state
            .pending
            .iter()
            .filter(|(_, p)| p.is_done())
            .map(|(k, _)| *k)
            .collect();
        if !done.is_empty() {
            for key in &done {
                state.pending.remove(key);
                trace!("request {} complete", key);
            }
            state.bindings.retain(|_, key| !done.contains(key));
            counter!("camera_requests_completed_total").increment(done.len() as u64);
            gauge!("camera_requests_outstanding").set(state.pending.len() as f64);
            self.slot_freed.notify_all();
        }
        out
    }

    /// Fabricate whatever each outstanding request still lacks and deliver it:
    /// a shutter for started requests, a request error for unstarted ones,
    /// error buffers for every missing output and final metadata.
    #[instrument(skip(self))]
    pub fn flush(&self) {
        let sequencer = self.callback_sequencer_lock();
        let count = {
            let mut state = lock(&self.state);
            state.queue.clear();
            let now = monotonic_ns();
            for (&key, p) in state.pending.iter_mut() {
                if !p.shutter_sent && p.shutter.is_none() {
                    if p.frame_count.is_some() {
                        p.shutter = Some(NotifyMsg::Shutter {
                            frame_number: key,
                            timestamp_ns: now,
                        });
                    } else {
                        p.request_error = true;
                        p.shutter = Some(NotifyMsg::Error {
                            frame_number: key,
                            stream: None,
                            code: ErrorCode::Request,
                        });
                    }
                }

                let missing: Vec<StreamBuffer> = p
                    .request
                    .outputs
                    .iter()
                    .filter(|b| !p.returned.contains(&b.stream))
                    .map(|b| b.clone().with_status(BufferStatus::Error))
                    .collect();
                p.returned.extend(missing.iter().map(|b| b.stream));
                if !missing.is_empty() {
                    p.buffers.push_back(missing);
                }

                if !p.request_error && !p.final_sent && p.final_meta.is_none() {
                    p.final_meta = Some(p.request.settings.clone());
                }
            }
            state.pending.len()
        };
        sequencer.manager.drain();
        info!("flushed {} outstanding requests", count);
    }

    /// Tell the producer the device is gone
    pub fn notify_device_error(&self) {
        let _sequencer = self.callback_sequencer_lock();
        self.callbacks.notify(NotifyMsg::Error {
            frame_number: 0,
            stream: None,
            code: ErrorCode::Device,
        });
    }

    /// While set, admission blocks
    pub fn set_flushing(&self, flushing: bool) {
        lock(&self.state).flushing = flushing;
        self.slot_freed.notify_all();
    }

    pub fn set_fatal(&self, reason: impl Into<String>) {
        lock(&self.state).fatal = Some(reason.into());
        self.slot_freed.notify_all();
    }

    pub fn fatal(&self) -> Option<String> {
        lock(&self.state).fatal.clone()
    }

    /// Registered and not yet fully delivered
    pub fn outstanding(&self) -> usize {
        lock(&self.state).pending.len()
    }

    pub fn dump(&self) {
        let state = lock(&self.state);
        info!(
            "requests: {} outstanding, {} queued",
            state.pending.len(),
            state.queue.len()
        );
        for (key, p) in &state.pending {
            debug!(
                "  request {} fc={:?} shutter={} buffers={}/{} final={}",
                key,
                p.frame_count,
                p.shutter_sent,
                p.returned.len(),
                p.request.outputs.len(),
                p.final_sent
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{construct_default_request_settings, MetaTag, MetaValue, RequestTemplate};
    use crate::stream::BufferHandle;
    use crate::SensorConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[derive(Debug, Clone)]
    enum Event {
        Notify(NotifyMsg),
        Result(CaptureResult),
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<Event>>,
    }

    impl Recorder {
        fn events(&self) -> Vec<Event> {
            self.events.lock().unwrap().clone()
        }
    }

    impl CallbackOps for Recorder {
        fn notify(&self, msg: NotifyMsg) {
            self.events.lock().unwrap().push(Event::Notify(msg));
        }

        fn process_capture_result(&self, result: CaptureResult) {
            self.events.lock().unwrap().push(Event::Result(result));
        }
    }

    fn manager() -> (Arc<Recorder>, Arc<RequestManager>) {
        let recorder = Arc::new(Recorder::default());
        let shot = ShotSettings::for_sensor(&SensorConfig::default());
        let manager = Arc::new(RequestManager::new(recorder.clone(), shot));
        (recorder, manager)
    }

    fn request(key: u32, streams: &[StreamId]) -> CaptureRequest {
        let settings = construct_default_request_settings(
            RequestTemplate::Preview,
            &SensorConfig::default(),
        );
        streams.iter().fold(
            CaptureRequest::new(key).with_settings(settings),
            |req, &s| req.with_output(StreamBuffer::new(s, BufferHandle::opaque(u64::from(key)))),
        )
    }

    fn shutter(manager: &RequestManager, key: u32) {
        let result = manager
            .result_for(key, ResultKind::NotifyOnly)
            .unwrap()
            .with_notify(NotifyMsg::Shutter {
                frame_number: key,
                timestamp_ns: u64::from(key) * 1000,
            });
        manager.callback_request(result).unwrap();
    }

    fn buffer(manager: &RequestManager, key: u32, stream: StreamId, status: BufferStatus) {
        let result = manager
            .result_for(key, ResultKind::BufferOnly)
            .unwrap()
            .with_buffer(StreamBuffer::new(stream, BufferHandle::opaque(0)).with_status(status));
        manager.callback_request(result).unwrap();
    }

    fn finish(manager: &RequestManager, key: u32) {
        let result = manager
            .result_for(key, ResultKind::AllResult)
            .unwrap()
            .with_metadata(CameraMetadata::new());
        manager.callback_request(result).unwrap();
    }

    fn complete(manager: &RequestManager, key: u32, streams: &[StreamId]) {
        shutter(manager, key);
        for &s in streams {
            buffer(manager, key, s, BufferStatus::Ok);
        }
        finish(manager, key);
    }

    #[test]
    fn shutter_precedes_buffers_racing_on_two_threads() {
        let (recorder, manager) = manager();
        manager.register_service_request(&request(1, &[1, 2])).unwrap();
        manager.bind_frame_count(1, 10).unwrap();

        let workers: Vec<_> = [1, 2]
            .into_iter()
            .map(|stream| {
                let manager = Arc::clone(&manager);
                thread::spawn(move || buffer(&manager, 1, stream, BufferStatus::Ok))
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert!(recorder.events().is_empty(), "buffers must wait for the shutter");

        shutter(&manager, 1);
        finish(&manager, 1);

        let events = recorder.events();
        assert_eq!(events.len(), 4);
        assert!(matches!(events[0], Event::Notify(NotifyMsg::Shutter { frame_number: 1, .. })));
        assert!(events[1..3]
            .iter()
            .all(|e| matches!(e, Event::Result(r) if r.output_buffers.len() == 1)));
        assert!(matches!(
            &events[3],
            Event::Result(r) if r.partial_result == PARTIAL_RESULT_FINAL
        ));
        assert_eq!(manager.outstanding(), 0);
        assert!(matches!(
            manager.get_service_request(10),
            Err(Error::RequestNotFound(10))
        ));
    }

    #[test]
    fn finals_follow_submission_order() {
        let (recorder, manager) = manager();
        manager.register_service_request(&request(1, &[1])).unwrap();
        manager.register_service_request(&request(2, &[1])).unwrap();

        shutter(&manager, 2);
        assert!(recorder.events().is_empty(), "shutter 2 waits for shutter 1");
        shutter(&manager, 1);
        buffer(&manager, 2, 1, BufferStatus::Ok);
        finish(&manager, 2);
        buffer(&manager, 1, 1, BufferStatus::Ok);
        finish(&manager, 1);

        let finals: Vec<u32> = recorder
            .events()
            .iter()
            .filter_map(|e| match e {
                Event::Result(r) if r.partial_result == PARTIAL_RESULT_FINAL => {
                    Some(r.frame_number)
                }
                _ => None,
            })
            .collect();
        assert_eq!(finals, vec![1, 2]);
    }

    #[test]
    fn errored_buffer_is_announced_first() {
        let (recorder, manager) = manager();
        manager.register_service_request(&request(1, &[3])).unwrap();
        shutter(&manager, 1);
        buffer(&manager, 1, 3, BufferStatus::Error);
        finish(&manager, 1);

        let events = recorder.events();
        assert!(matches!(
            events[1],
            Event::Notify(NotifyMsg::Error {
                code: ErrorCode::Buffer,
                stream: Some(3),
                ..
            })
        ));
        assert!(matches!(
            &events[2],
            Event::Result(r) if r.output_buffers[0].status == BufferStatus::Error
        ));
        assert_eq!(manager.outstanding(), 0);
    }

    #[test]
    fn admission_lets_one_request_in_per_completion() {
        let (_recorder, manager) = manager();
        let max = 2;
        for key in 1..=max as u32 {
            manager
                .admit(&request(key, &[1]), max, Duration::from_millis(50))
                .unwrap();
        }

        let admitted = Arc::new(AtomicUsize::new(0));
        let submitter = {
            let manager = Arc::clone(&manager);
            let admitted = Arc::clone(&admitted);
            thread::spawn(move || {
                for key in 3..3 + 5 {
                    manager
                        .admit(&request(key, &[1]), max, Duration::from_millis(50))
                        .unwrap();
                    admitted.fetch_add(1, Ordering::SeqCst);
                }
            })
        };

        thread::sleep(Duration::from_millis(100));
        assert_eq!(admitted.load(Ordering::SeqCst), 0);

        complete(&manager, 1, &[1]);
        thread::sleep(Duration::from_millis(100));
        assert_eq!(admitted.load(Ordering::SeqCst), 1);
        assert_eq!(manager.outstanding(), max);

        for key in 2..3 + 5 {
            complete(&manager, key, &[1]);
            // wait for the next admission before completing it
            let deadline = std::time::Instant::now() + Duration::from_secs(2);
            while manager.get_request(key + 2).is_err()
                && key + 2 < 3 + 5
                && std::time::Instant::now() < deadline
            {
                thread::sleep(Duration::from_millis(5));
            }
        }
        submitter.join().unwrap();
        assert_eq!(admitted.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn fatal_device_fails_admission() {
        let (_recorder, manager) = manager();
        manager.set_fatal("stalled");
        assert!(matches!(
            manager.admit(&request(1, &[1]), 4, Duration::from_millis(10)),
            Err(Error::DeviceFatal(_))
        ));
    }

    #[test]
    fn flush_completes_every_request() {
        let (recorder, manager) = manager();
        for key in 1..=3 {
            manager.register_service_request(&request(key, &[1, 2])).unwrap();
        }
        manager.bind_frame_count(1, 100).unwrap();
        manager.bind_frame_count(2, 101).unwrap();
        shutter(&manager, 1);
        buffer(&manager, 1, 1, BufferStatus::Ok);

        manager.flush();

        let events = recorder.events();
        let shutters = events
            .iter()
            .filter(|e| matches!(e, Event::Notify(NotifyMsg::Shutter { .. })))
            .count();
        assert_eq!(shutters, 2);
        assert!(events.iter().any(|e| matches!(
            e,
            Event::Notify(NotifyMsg::Error {
                frame_number: 3,
                code: ErrorCode::Request,
                ..
            })
        )));
        let finals: Vec<u32> = events
            .iter()
            .filter_map(|e| match e {
                Event::Result(r) if r.partial_result == PARTIAL_RESULT_FINAL => {
                    Some(r.frame_number)
                }
                _ => None,
            })
            .collect();
        assert_eq!(finals, vec![1, 2]);
        let buffers: usize = events
            .iter()
            .map(|e| match e {
                Event::Result(r) => r.output_buffers.len(),
                _ => 0,
            })
            .sum();
        assert_eq!(buffers, 6);
        assert_eq!(manager.outstanding(), 0);
        assert!(manager.create_service_request().is_none());
    }

    #[test]
    fn manual_exposure_change_needs_settle_frames() {
        let (_recorder, manager) = manager();
        let first = manager.register_service_request(&request(1, &[1])).unwrap();
        assert!(!first.need_internal_frame());

        let mut manual = construct_default_request_settings(
            RequestTemplate::Manual,
            &SensorConfig::default(),
        );
        manual.set(MetaTag::SensorExposureTime, MetaValue::I64(1_000_000));
        let raw = CaptureRequest::new(2)
            .with_settings(manual)
            .with_output(StreamBuffer::new(1, BufferHandle::opaque(2)));
        assert!(manager.register_service_request(&raw).unwrap().need_internal_frame());

        // repeated settings do not
        let repeat = CaptureRequest::new(3).with_output(StreamBuffer::new(1, BufferHandle::opaque(3)));
        assert!(!manager.register_service_request(&repeat).unwrap().need_internal_frame());
    }

    #[test]
    fn requests_are_popped_in_submission_order() {
        let (_recorder, manager) = manager();
        for key in [4, 9, 12] {
            manager.register_service_request(&request(key, &[1])).unwrap();
        }
        assert!(matches!(
            manager.register_service_request(&request(11, &[1])),
            Err(Error::Config(_))
        ));
        let keys: Vec<u32> = std::iter::from_fn(|| manager.create_service_request())
            .map(|r| r.key())
            .collect();
        assert_eq!(keys, vec![4, 9, 12]);
    }
}

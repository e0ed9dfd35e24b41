//! End-to-end runs of the camera device on simulated stages

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use exynos_camera3::buffer::PoolId;
use exynos_camera3::driver::{DriverSet, FaultPlan, SimulatedDriver};
use exynos_camera3::metadata::RequestTemplate;
use exynos_camera3::pipeline::PipeId;
use exynos_camera3::request::{
    CallbackOps, CaptureRequest, CaptureResult, ErrorCode, NotifyMsg, PARTIAL_RESULT_FINAL,
};
use exynos_camera3::stream::{
    BufferHandle, BufferStatus, StreamBuffer, StreamConfig, StreamId, StreamType,
};
use exynos_camera3::{CameraDevice, Config, Error, FatalPolicy, PreviewMode, ReprocessingMode};

const PREVIEW: StreamId = 0;
const JPEG: StreamId = 1;
const RAW: StreamId = 2;
const ZSL_IN: StreamId = 4;
const WIDTH: u32 = 64;
const HEIGHT: u32 = 48;

#[derive(Debug, Clone)]
enum Event {
    Notify(NotifyMsg),
    Result(CaptureResult),
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<Event>>,
    changed: Condvar,
}

impl Recorder {
    fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    fn push(&self, event: Event) {
        self.events.lock().unwrap().push(event);
        self.changed.notify_all();
    }

    /// Wait until `done` holds for the recorded events
    fn wait_for(&self, timeout: Duration, done: impl Fn(&[Event]) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        let mut events = self.events.lock().unwrap();
        while !done(&events) {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            events = self.changed.wait_timeout(events, deadline - now).unwrap().0;
        }
        true
    }

    fn shutters(&self, frame_number: u32) -> usize {
        self.events()
            .iter()
            .filter(|e| {
                matches!(e, Event::Notify(NotifyMsg::Shutter { frame_number: n, .. }) if *n == frame_number)
            })
            .count()
    }

    /// Everything delivered for `frame_number`, in delivery order
    fn events_of(&self, frame_number: u32) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| match e {
                Event::Notify(msg) => msg.frame_number() == frame_number,
                Event::Result(r) => r.frame_number == frame_number,
            })
            .collect()
    }

    /// Output buffers returned for `frame_number`, in delivery order
    fn buffers(&self, frame_number: u32) -> Vec<StreamBuffer> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Result(r) if r.frame_number == frame_number => Some(r.output_buffers),
                _ => None,
            })
            .flatten()
            .collect()
    }
}

impl CallbackOps for Recorder {
    fn notify(&self, msg: NotifyMsg) {
        self.push(Event::Notify(msg));
    }

    fn process_capture_result(&self, result: CaptureResult) {
        self.push(Event::Result(result));
    }
}

fn has_final(events: &[Event], frame_number: u32) -> bool {
    events.iter().any(|e| {
        matches!(e, Event::Result(r) if r.frame_number == frame_number && r.partial_result == PARTIAL_RESULT_FINAL)
    })
}

fn config() -> Config {
    let mut config = Config::default();
    config.sensor.width = WIDTH;
    config.sensor.height = HEIGHT;
    config.pipeline.keep_warm = false;
    config.pipeline.stage_latency_us = 2_000;
    config.monitor.fatal_policy = FatalPolicy::Report;
    config.monitor.interval_ms = 20;
    config.monitor.stall_timeout_ms = 5_000;
    config
}

fn stream(id: StreamId, stream_type: StreamType) -> StreamConfig {
    StreamConfig::new(id, stream_type, WIDTH, HEIGHT)
}

fn output(config: &StreamConfig, frame_number: u32) -> StreamBuffer {
    let size = config
        .format
        .plane_sizes(config.width, config.height)
        .iter()
        .sum();
    StreamBuffer::new(
        config.id,
        BufferHandle::with_memory(u64::from(frame_number) << 8 | u64::from(config.id), size),
    )
}

struct Harness {
    recorder: Arc<Recorder>,
    camera: CameraDevice,
    streams: Vec<StreamConfig>,
}

impl Harness {
    fn new(config: Config, streams: Vec<StreamConfig>) -> Self {
        let drivers = DriverSet::simulated(&config);
        Self::with_drivers(config, drivers, streams)
    }

    fn with_drivers(config: Config, drivers: DriverSet, streams: Vec<StreamConfig>) -> Self {
        let recorder = Arc::new(Recorder::default());
        let camera = CameraDevice::open_with_drivers(config, drivers, recorder.clone()).unwrap();
        camera.configure_streams(&streams).unwrap();
        Self {
            recorder,
            camera,
            streams,
        }
    }

    fn stream(&self, id: StreamId) -> &StreamConfig {
        self.streams.iter().find(|s| s.id == id).unwrap()
    }

    fn request(&self, frame_number: u32, outputs: &[StreamId]) -> CaptureRequest {
        let mut request = CaptureRequest::new(frame_number);
        if frame_number == 1 {
            request = request.with_settings(
                self.camera
                    .construct_default_request_settings(RequestTemplate::Preview),
            );
        }
        outputs.iter().fold(request, |request, &id| {
            request.with_output(output(self.stream(id), frame_number))
        })
    }

    fn submit(&self, frame_number: u32, outputs: &[StreamId]) {
        self.camera
            .process_capture_request(&self.request(frame_number, outputs))
            .unwrap();
    }

    fn wait_idle(&self) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if self.camera.outstanding_requests() == 0 {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    /// Every internal pool holds all of its buffers, apart from what the selector keeps
    fn assert_pools_settled(&self, held: usize) {
        let mut in_use = 0;
        for (pool, available, allocated) in self.camera.pool_stats() {
            if !pool.is_service() {
                in_use += allocated - available;
            }
        }
        assert_eq!(in_use, held, "{:?}", self.camera.pool_stats());
    }
}

#[test]
fn preview_request_gets_one_shutter_then_its_buffer() {
    let h = Harness::new(config(), vec![stream(PREVIEW, StreamType::Preview)]);
    h.submit(1, &[PREVIEW]);
    assert!(h.recorder.wait_for(Duration::from_secs(5), |e| has_final(e, 1)));
    assert!(h.wait_idle());

    assert_eq!(h.recorder.shutters(1), 1);
    let buffers = h.recorder.buffers(1);
    assert_eq!(buffers.len(), 1);
    assert_eq!(buffers[0].status, BufferStatus::Ok);

    // the shutter comes before anything else of the request
    let events = h.recorder.events();
    assert!(matches!(events[0], Event::Notify(NotifyMsg::Shutter { frame_number: 1, .. })));
}

#[test]
fn raw_and_jpeg_of_one_request_arrive_in_order() {
    let h = Harness::new(
        config(),
        vec![
            stream(PREVIEW, StreamType::Preview),
            stream(JPEG, StreamType::Jpeg),
            stream(RAW, StreamType::Raw),
        ],
    );
    h.submit(1, &[PREVIEW]);
    h.submit(2, &[PREVIEW, RAW, JPEG]);
    assert!(h.recorder.wait_for(Duration::from_secs(5), |e| has_final(e, 2)));
    assert!(h.wait_idle());

    let buffers = h.recorder.buffers(2);
    let raw = buffers.iter().position(|b| b.stream == RAW).unwrap();
    let jpeg = buffers.iter().position(|b| b.stream == JPEG).unwrap();
    assert!(raw < jpeg);
    assert!(buffers.iter().all(|b| b.status == BufferStatus::Ok));

    let encoded = buffers[jpeg].handle.contents().unwrap();
    assert_eq!(&encoded[..2], &[0xFF, 0xD8]);
    assert_eq!(h.recorder.shutters(2), 1);
}

#[test]
fn flush_answers_everything_in_flight() {
    let mut config = config();
    config.pipeline.stage_latency_us = 20_000;
    let h = Harness::new(config, vec![stream(PREVIEW, StreamType::Preview)]);

    for n in 1..=4 {
        h.submit(n, &[PREVIEW]);
    }
    h.camera.flush().unwrap();
    assert_eq!(h.camera.outstanding_requests(), 0);
    assert_eq!(h.camera.in_flight(), 0);

    let events = h.recorder.events();
    for n in 1..=4 {
        let started = h.recorder.shutters(n);
        let failed = events.iter().any(|e| {
            matches!(e, Event::Notify(NotifyMsg::Error { frame_number, code: ErrorCode::Request, .. }) if *frame_number == n)
        });
        assert_eq!(started + usize::from(failed), 1, "request {}", n);
        assert_eq!(h.recorder.buffers(n).len(), 1, "request {}", n);
    }
    h.assert_pools_settled(0);

    // the device streams again after a flush
    h.submit(5, &[PREVIEW]);
    assert!(h.recorder.wait_for(Duration::from_secs(5), |e| has_final(e, 5)));
}

#[test]
fn stage_error_fails_the_buffer_but_completes_the_request() {
    let config = config();
    let mut drivers = DriverSet::simulated(&config);
    let latency = Duration::from_micros(config.pipeline.stage_latency_us);
    drivers.insert(
        PipeId::Mcsc,
        Arc::new(SimulatedDriver::new("mcsc", latency).with_faults(FaultPlan::fail_on([2]))),
    );
    let h = Harness::with_drivers(config, drivers, vec![stream(PREVIEW, StreamType::Preview)]);

    for n in 1..=3 {
        h.submit(n, &[PREVIEW]);
    }
    assert!(h.recorder.wait_for(Duration::from_secs(5), |e| has_final(e, 3)));
    assert!(h.wait_idle());

    assert_eq!(h.recorder.buffers(1)[0].status, BufferStatus::Ok);
    assert_eq!(h.recorder.buffers(2)[0].status, BufferStatus::Error);
    assert_eq!(h.recorder.buffers(3)[0].status, BufferStatus::Ok);
    assert!(h.recorder.events().iter().any(|e| matches!(
        e,
        Event::Notify(NotifyMsg::Error {
            frame_number: 2,
            stream: Some(PREVIEW),
            code: ErrorCode::Buffer
        })
    )));
    assert!(has_final(&h.recorder.events(), 2));
}

#[test]
fn missing_held_frame_fails_only_the_jpeg() {
    let mut config = config();
    config.selector.max_retries = 3;
    config.selector.wait_interval_ms = 10;
    let mut drivers = DriverSet::simulated(&config);
    let latency = Duration::from_micros(config.pipeline.stage_latency_us);
    drivers.insert(
        PipeId::Flite,
        Arc::new(SimulatedDriver::sensor("flite", latency).with_faults(FaultPlan::fail_on([1]))),
    );
    let h = Harness::with_drivers(
        config,
        drivers,
        vec![stream(PREVIEW, StreamType::Preview), stream(JPEG, StreamType::Jpeg)],
    );

    h.submit(1, &[PREVIEW, JPEG]);
    assert!(h.recorder.wait_for(Duration::from_secs(5), |e| has_final(e, 1)));
    assert!(h.wait_idle());

    let buffers = h.recorder.buffers(1);
    assert_eq!(buffers.len(), 2);
    assert!(buffers.iter().all(|b| b.status == BufferStatus::Error));
    assert_eq!(h.recorder.shutters(1), 1);
    assert_eq!(h.camera.held_frames(), 0);
}

#[test]
fn reconfigure_replaces_the_stream_set() {
    let h = Harness::new(config(), vec![stream(PREVIEW, StreamType::Preview)]);
    h.submit(1, &[PREVIEW]);
    assert!(h.recorder.wait_for(Duration::from_secs(5), |e| has_final(e, 1)));

    let callback = stream(3, StreamType::Callback);
    h.camera
        .configure_streams(&[stream(PREVIEW, StreamType::Preview), callback.clone()])
        .unwrap();
    let request = CaptureRequest::new(2)
        .with_output(output(h.stream(PREVIEW), 2))
        .with_output(output(&callback, 2));
    h.camera.process_capture_request(&request).unwrap();
    assert!(h.recorder.wait_for(Duration::from_secs(5), |e| has_final(e, 2)));
    assert!(h.wait_idle());

    let buffers = h.recorder.buffers(2);
    assert_eq!(buffers.len(), 2);
    assert!(buffers.iter().all(|b| b.status == BufferStatus::Ok));
    assert!(h
        .camera
        .pool_stats()
        .iter()
        .any(|(pool, _, _)| *pool == PoolId::Service(3)));
}

#[test]
fn unknown_output_stream_is_rejected() {
    let h = Harness::new(config(), vec![stream(PREVIEW, StreamType::Preview)]);
    let request = CaptureRequest::new(1)
        .with_settings(h.camera.construct_default_request_settings(RequestTemplate::Preview))
        .with_output(output(&stream(9, StreamType::Preview), 1));
    assert!(matches!(
        h.camera.process_capture_request(&request),
        Err(Error::Config(_))
    ));
    assert_eq!(h.camera.outstanding_requests(), 0);
}

#[test]
fn stalled_stage_is_reported_as_device_error() {
    let mut config = config();
    config.monitor.stall_timeout_ms = 200;
    let mut drivers = DriverSet::simulated(&config);
    let latency = Duration::from_micros(config.pipeline.stage_latency_us);
    drivers.insert(
        PipeId::Mcsc,
        Arc::new(
            SimulatedDriver::new("mcsc", latency)
                .with_faults(FaultPlan::stall_on(1, Duration::from_millis(800))),
        ),
    );
    let h = Harness::with_drivers(config, drivers, vec![stream(PREVIEW, StreamType::Preview)]);

    h.submit(1, &[PREVIEW]);
    assert!(h.recorder.wait_for(Duration::from_secs(5), |events| {
        events.iter().any(|e| {
            matches!(e, Event::Notify(NotifyMsg::Error { code: ErrorCode::Device, .. }))
        })
    }));
    assert!(matches!(
        h.camera.process_capture_request(&h.request(2, &[PREVIEW])),
        Err(Error::DeviceFatal(_))
    ));
    h.camera.close().unwrap();
    assert!(h.camera.is_closed());
}

fn is_shutter(event: &Event) -> bool {
    matches!(event, Event::Notify(NotifyMsg::Shutter { .. }))
}

fn is_final(event: &Event) -> bool {
    matches!(event, Event::Result(r) if r.partial_result == PARTIAL_RESULT_FINAL)
}

fn jpeg_status(event: &Event) -> Option<BufferStatus> {
    match event {
        Event::Result(r) => r
            .output_buffers
            .iter()
            .find(|b| b.stream == JPEG)
            .map(|b| b.status),
        _ => None,
    }
}

fn reprocess_streams() -> Vec<StreamConfig> {
    vec![
        stream(PREVIEW, StreamType::Preview),
        stream(JPEG, StreamType::Jpeg),
        stream(ZSL_IN, StreamType::ZslInput),
    ]
}

impl Harness {
    fn reprocess_request(&self, frame_number: u32) -> CaptureRequest {
        self.request(frame_number, &[JPEG])
            .with_input(output(self.stream(ZSL_IN), frame_number))
    }
}

#[test]
fn reprocess_request_returns_its_input_with_the_final() {
    let h = Harness::new(config(), reprocess_streams());
    h.camera
        .process_capture_request(&h.reprocess_request(1))
        .unwrap();
    assert!(h.recorder.wait_for(Duration::from_secs(5), |e| has_final(e, 1)));
    assert!(h.wait_idle());

    let events = h.recorder.events_of(1);
    assert_eq!(h.recorder.shutters(1), 1);
    let shutter = events.iter().position(is_shutter).unwrap();
    let jpeg = events.iter().position(|e| jpeg_status(e).is_some()).unwrap();
    let last = events.iter().position(is_final).unwrap();
    assert!(shutter < jpeg && jpeg < last, "{:?}", events);
    assert_eq!(jpeg_status(&events[jpeg]), Some(BufferStatus::Ok));

    let Event::Result(final_result) = &events[last] else {
        unreachable!()
    };
    let input = final_result.input_buffer.as_ref().unwrap();
    assert_eq!(input.stream, ZSL_IN);
    h.assert_pools_settled(0);
}

#[test]
fn failed_reprocess_stage_fails_the_jpeg_but_sends_the_final() {
    let config = config();
    let mut drivers = DriverSet::simulated(&config);
    let latency = Duration::from_micros(config.pipeline.stage_latency_us);
    drivers.insert(
        PipeId::Aa3IspReprocessing,
        Arc::new(
            SimulatedDriver::new("3aa-isp-reprocessing", latency)
                .with_faults(FaultPlan::fail_on(1..=8)),
        ),
    );
    let h = Harness::with_drivers(config, drivers, reprocess_streams());
    h.camera
        .process_capture_request(&h.reprocess_request(1))
        .unwrap();
    assert!(h.recorder.wait_for(Duration::from_secs(5), |e| has_final(e, 1)));
    assert!(h.wait_idle());

    let events = h.recorder.events_of(1);
    assert_eq!(h.recorder.shutters(1), 1);
    let buffers = h.recorder.buffers(1);
    assert_eq!(buffers.len(), 1);
    assert_eq!(buffers[0].stream, JPEG);
    assert_eq!(buffers[0].status, BufferStatus::Error);
    assert!(events.iter().any(|e| matches!(
        e,
        Event::Notify(NotifyMsg::Error {
            stream: Some(JPEG),
            code: ErrorCode::Buffer,
            ..
        })
    )));
    let last = events.iter().rposition(is_final).unwrap();
    let Event::Result(final_result) = &events[last] else {
        unreachable!()
    };
    assert!(final_result.input_buffer.is_some());
    h.assert_pools_settled(0);
}

#[test]
fn reprocess_from_an_unknown_input_stream_is_rejected() {
    let h = Harness::new(config(), reprocess_streams());
    let request = h
        .request(1, &[JPEG])
        .with_input(output(&stream(9, StreamType::ZslInput), 1));
    assert!(matches!(
        h.camera.process_capture_request(&request),
        Err(Error::Config(_))
    ));
    assert_eq!(h.camera.outstanding_requests(), 0);
    assert!(h.recorder.events().is_empty());
}

/// A preview request, then RAW and JPEG from the next one, in the given graph
fn raw_and_jpeg_in(preview: PreviewMode, reprocessing: ReprocessingMode) {
    let mut config = config();
    config.pipeline.preview_mode = preview;
    config.pipeline.reprocessing_mode = reprocessing;
    let h = Harness::new(
        config,
        vec![
            stream(PREVIEW, StreamType::Preview),
            stream(JPEG, StreamType::Jpeg),
            stream(RAW, StreamType::Raw),
        ],
    );
    h.submit(1, &[PREVIEW]);
    h.submit(2, &[PREVIEW, RAW, JPEG]);
    assert!(h.recorder.wait_for(Duration::from_secs(5), |e| has_final(e, 2)));
    assert!(h.wait_idle());

    for n in 1..=2 {
        let events = h.recorder.events_of(n);
        assert!(is_shutter(&events[0]), "{:?}", events);
        assert!(is_final(events.last().unwrap()), "{:?}", events);
        assert_eq!(h.recorder.shutters(n), 1);
    }
    let buffers = h.recorder.buffers(2);
    assert_eq!(buffers.len(), 3);
    let raw = buffers.iter().position(|b| b.stream == RAW).unwrap();
    let jpeg = buffers.iter().position(|b| b.stream == JPEG).unwrap();
    assert!(raw < jpeg);
    assert!(buffers.iter().all(|b| b.status == BufferStatus::Ok), "{:?}", buffers);
    let encoded = buffers[jpeg].handle.contents().unwrap();
    assert_eq!(&encoded[..2], &[0xFF, 0xD8]);
    h.assert_pools_settled(h.camera.held_frames());
}

#[test]
fn yuv_capture_on_otf_preview() {
    raw_and_jpeg_in(PreviewMode::Otf, ReprocessingMode::Yuv);
}

#[test]
fn dirty_bayer_capture_on_m2m_preview() {
    raw_and_jpeg_in(PreviewMode::M2m, ReprocessingMode::DirtyBayer);
}

#[test]
fn dirty_bayer_capture_on_otf_preview() {
    raw_and_jpeg_in(PreviewMode::Otf, ReprocessingMode::DirtyBayer);
}

#[test]
fn pure_bayer_capture_on_m2m_preview() {
    raw_and_jpeg_in(PreviewMode::M2m, ReprocessingMode::PureBayer);
}

#[test]
fn flush_with_pending_captures_returns_every_buffer() {
    let mut config = config();
    config.pipeline.stage_latency_us = 20_000;
    let h = Harness::new(
        config,
        vec![stream(PREVIEW, StreamType::Preview), stream(JPEG, StreamType::Jpeg)],
    );

    let outputs: [&[StreamId]; 4] = [&[PREVIEW], &[PREVIEW, JPEG], &[PREVIEW], &[PREVIEW, JPEG]];
    for (n, out) in (1..).zip(outputs) {
        h.submit(n, out);
    }
    h.camera.flush().unwrap();

    assert_eq!(h.camera.held_frames(), 0);
    assert_eq!(h.camera.in_flight(), 0);
    assert_eq!(h.camera.outstanding_requests(), 0);
    for (pool, available, allocated) in h.camera.pool_stats() {
        if !pool.is_service() {
            assert_eq!(available, allocated, "{:?}", pool);
        }
    }
    for (n, out) in (1..).zip(outputs) {
        assert_eq!(h.recorder.buffers(n).len(), out.len(), "request {}", n);
    }

    h.submit(5, &[PREVIEW, JPEG]);
    assert!(h.recorder.wait_for(Duration::from_secs(5), |e| has_final(e, 5)));
    assert!(h.wait_idle());
    assert!(h.recorder.buffers(5).iter().all(|b| b.status == BufferStatus::Ok));
}

#[test]
fn stalled_sensor_blocks_admission_at_the_limit() {
    let mut config = config();
    config.pipeline.max_block_request_count = 2;
    let mut drivers = DriverSet::simulated(&config);
    let latency = Duration::from_micros(config.pipeline.stage_latency_us);
    drivers.insert(
        PipeId::Flite,
        Arc::new(
            SimulatedDriver::sensor("flite", latency)
                .with_faults(FaultPlan::stall_on(1, Duration::from_millis(600))),
        ),
    );
    let h = Harness::with_drivers(config, drivers, vec![stream(PREVIEW, StreamType::Preview)]);
    let admitted = AtomicUsize::new(0);

    thread::scope(|s| {
        s.spawn(|| {
            for n in 1..=5 {
                h.submit(n, &[PREVIEW]);
                admitted.fetch_add(1, Ordering::SeqCst);
            }
        });

        thread::sleep(Duration::from_millis(300));
        assert!(h.camera.outstanding_requests() <= 2);
        let so_far = admitted.load(Ordering::SeqCst);
        assert!((1..=2).contains(&so_far), "{} admitted", so_far);
    });

    assert!(h.recorder.wait_for(Duration::from_secs(5), |e| has_final(e, 5)));
    assert!(h.wait_idle());
    for n in 1..=5 {
        assert_eq!(h.recorder.buffers(n)[0].status, BufferStatus::Ok, "request {}", n);
    }
}

//! Producer requests, result units and the callback surface

pub mod manager;

pub use manager::{RequestManager, Sequencer};

use crate::metadata::{CameraMetadata, ShotSettings};
use crate::stream::{StreamBuffer, StreamId};

/// Request as handed in by the producer. Only borrowed for the duration of the call.
#[derive(Debug, Clone, Default)]
pub struct CaptureRequest {
    pub frame_number: u32,
    /// `None` repeats the settings of the previous request
    pub settings: Option<CameraMetadata>,
    /// Reprocess requests carry the source image
    pub input_buffer: Option<StreamBuffer>,
    pub output_buffers: Vec<StreamBuffer>,
}

impl CaptureRequest {
    pub fn new(frame_number: u32) -> Self {
        Self {
            frame_number,
            ..Default::default()
        }
    }

    pub fn with_settings(mut self, settings: CameraMetadata) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn with_output(mut self, buffer: StreamBuffer) -> Self {
        self.output_buffers.push(buffer);
        self
    }

    pub fn with_input(mut self, buffer: StreamBuffer) -> Self {
        self.input_buffer = Some(buffer);
        self
    }
}

/// Internally owned copy of a registered request
#[derive(Debug, Clone)]
pub struct Request {
    key: u32,
    settings: CameraMetadata,
    shot: ShotSettings,
    input: Option<StreamBuffer>,
    outputs: Vec<StreamBuffer>,
    need_internal_frame: bool,
}

impl Request {
    /// The producer's frame number
    pub fn key(&self) -> u32 {
        self.key
    }

    pub fn settings(&self) -> &CameraMetadata {
        &self.settings
    }

    pub fn shot(&self) -> &ShotSettings {
        &self.shot
    }

    pub fn input(&self) -> Option<&StreamBuffer> {
        self.input.as_ref()
    }

    pub fn outputs(&self) -> &[StreamBuffer] {
        &self.outputs
    }

    pub fn output(&self, stream: StreamId) -> Option<&StreamBuffer> {
        self.outputs.iter().find(|b| b.stream == stream)
    }

    pub fn is_reprocess(&self) -> bool {
        self.input.is_some()
    }

    /// Sensor controls changed in a way that needs settle frames ahead of this one
    pub fn need_internal_frame(&self) -> bool {
        self.need_internal_frame
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// The device is gone; no further results will arrive
    Device,
    /// The whole request failed; no shutter and no metadata follow
    Request,
    /// The final metadata of the request is missing
    Result,
    /// One output buffer failed
    Buffer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyMsg {
    Shutter {
        frame_number: u32,
        timestamp_ns: u64,
    },
    Error {
        frame_number: u32,
        stream: Option<StreamId>,
        code: ErrorCode,
    },
}

impl NotifyMsg {
    pub fn frame_number(&self) -> u32 {
        match self {
            NotifyMsg::Shutter { frame_number, .. } | NotifyMsg::Error { frame_number, .. } => {
                *frame_number
            }
        }
    }
}

/// Partial-result index of 3A metadata
pub const PARTIAL_RESULT_3A: u32 = 1;
/// Partial-result index of the final metadata; also the advertised partial count
pub const PARTIAL_RESULT_FINAL: u32 = 2;

#[derive(Debug, Clone)]
pub struct CaptureResult {
    pub frame_number: u32,
    pub result: Option<CameraMetadata>,
    pub output_buffers: Vec<StreamBuffer>,
    pub input_buffer: Option<StreamBuffer>,
    /// 0 for buffer-only results
    pub partial_result: u32,
}

/// Producer callback surface. Invoked from pipeline threads, one call at a time.
pub trait CallbackOps: Send + Sync {
    fn notify(&self, msg: NotifyMsg);
    fn process_capture_result(&self, result: CaptureResult);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultKind {
    NotifyOnly,
    BufferOnly,
    Partial3a,
    AllResult,
}

/// One unit of result data waiting for the sequencer
#[derive(Debug, Clone)]
pub struct ResultRequest {
    key: u32,
    kind: ResultKind,
    notify: Option<NotifyMsg>,
    buffers: Vec<StreamBuffer>,
    metadata: Option<CameraMetadata>,
}

impl ResultRequest {
    pub(crate) fn new(key: u32, kind: ResultKind) -> Self {
        Self {
            key,
            kind,
            notify: None,
            buffers: Vec::new(),
            metadata: None,
        }
    }

    pub fn key(&self) -> u32 {
        self.key
    }

    pub fn kind(&self) -> ResultKind {
        self.kind
    }

    pub fn with_notify(mut self, msg: NotifyMsg) -> Self {
        self.notify = Some(msg);
        self
    }

    pub fn with_buffer(mut self, buffer: StreamBuffer) -> Self {
        self.buffers.push(buffer);
        self
    }

    pub fn with_metadata(mut self, metadata: CameraMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

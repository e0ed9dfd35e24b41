//! Producer streams, their buffers, and where the pipeline fills them

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::pipeline::PipeId;

pub type StreamId = u32;

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    /// 16-bit packed bayer
    Raw16,
    Nv21,
    Nv12,
    Yuyv,
    /// Opaque byte stream (JPEG)
    Blob,
}

impl PixelFormat {
    /// Plane sizes of a `width`x`height` image
    pub fn plane_sizes(self, width: u32, height: u32) -> Vec<usize> {
        let pixels = width as usize * height as usize;
        match self {
            PixelFormat::Raw16 => vec![pixels * 2],
            PixelFormat::Nv21 | PixelFormat::Nv12 => vec![pixels, pixels / 2],
            PixelFormat::Yuyv => vec![pixels * 2],
            // Worst-case JPEG plus trailer
            PixelFormat::Blob => vec![pixels * 3 / 2 + 4096],
        }
    }

    pub fn strides(self, width: u32) -> Vec<u32> {
        match self {
            PixelFormat::Raw16 | PixelFormat::Yuyv => vec![width * 2],
            PixelFormat::Nv21 | PixelFormat::Nv12 => vec![width, width],
            PixelFormat::Blob => vec![0],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamType {
    Preview,
    /// CPU-readable YUV callback
    Callback,
    Video,
    Raw,
    Jpeg,
    /// Producer-supplied input for reprocess requests
    ZslInput,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub id: StreamId,
    pub stream_type: StreamType,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub max_buffers: usize,
}

impl StreamConfig {
    pub fn new(id: StreamId, stream_type: StreamType, width: u32, height: u32) -> Self {
        let format = match stream_type {
            StreamType::Raw | StreamType::ZslInput => PixelFormat::Raw16,
            StreamType::Jpeg => PixelFormat::Blob,
            _ => PixelFormat::Nv21,
        };
        Self {
            id,
            stream_type,
            width,
            height,
            format,
            max_buffers: 4,
        }
    }

    pub fn with_max_buffers(mut self, max_buffers: usize) -> Self {
        self.max_buffers = max_buffers;
        self
    }

    /// Pipe whose output fills this stream; input streams have none
    pub fn output_node(&self) -> Option<PipeId> {
        match self.stream_type {
            StreamType::Preview => Some(PipeId::McscPreview),
            StreamType::Callback => Some(PipeId::McscCallback),
            StreamType::Video => Some(PipeId::McscVideo),
            StreamType::Raw => Some(PipeId::FliteRaw),
            StreamType::Jpeg => Some(PipeId::Jpeg),
            StreamType::ZslInput => None,
        }
    }
}

/// Configured streams, keyed by id
#[derive(Debug, Clone, Default)]
pub struct StreamSet {
    streams: BTreeMap<StreamId, StreamConfig>,
}

impl StreamSet {
    /// Validate a stream list the way `configure_streams` must: reject, never coerce
    pub fn new(list: &[StreamConfig], sensor_width: u32, sensor_height: u32) -> Result<Self> {
        if list.is_empty() {
            return Err(Error::Config("empty stream list".into()));
        }

        let mut streams = BTreeMap::new();
        let mut nodes = BTreeMap::new();
        let mut inputs = 0;

        for stream in list {
            if stream.width == 0 || stream.height == 0 {
                return Err(Error::Config(format!(
                    "stream {} has size {}x{}",
                    stream.id, stream.width, stream.height
                )));
            }
            if stream.width > sensor_width || stream.height > sensor_height {
                return Err(Error::Config(format!(
                    "stream {} ({}x{}) exceeds sensor {}x{}",
                    stream.id, stream.width, stream.height, sensor_width, sensor_height
                )));
            }
            if stream.max_buffers == 0 {
                return Err(Error::Config(format!("stream {} has no buffers", stream.id)));
            }
            if stream.width % 2 != 0 || stream.height % 2 != 0 {
                return Err(Error::Config(format!(
                    "stream {} size {}x{} is not 2-aligned",
                    stream.id, stream.width, stream.height
                )));
            }
            match stream.output_node() {
                Some(node) => {
                    if let Some(other) = nodes.insert(node, stream.id) {
                        return Err(Error::Config(format!(
                            "streams {} and {} both map to {:?}",
                            other, stream.id, node
                        )));
                    }
                }
                None => inputs += 1,
            }
            if streams.insert(stream.id, stream.clone()).is_some() {
                return Err(Error::Config(format!("duplicate stream id {}", stream.id)));
            }
        }

        if inputs > 1 {
            return Err(Error::Config("at most one input stream".into()));
        }
        if nodes.is_empty() {
            return Err(Error::Config("no output stream".into()));
        }

        Ok(Self { streams })
    }

    pub fn get(&self, id: StreamId) -> Option<&StreamConfig> {
        self.streams.get(&id)
    }

    pub fn by_type(&self, stream_type: StreamType) -> Option<&StreamConfig> {
        self.streams.values().find(|s| s.stream_type == stream_type)
    }

    pub fn by_node(&self, node: PipeId) -> Option<&StreamConfig> {
        self.streams.values().find(|s| s.output_node() == Some(node))
    }

    pub fn iter(&self) -> impl Iterator<Item = &StreamConfig> {
        self.streams.values()
    }

    pub fn has(&self, stream_type: StreamType) -> bool {
        self.by_type(stream_type).is_some()
    }
}

/// Producer-owned memory behind a stream buffer
#[derive(Debug, Clone)]
pub struct BufferHandle {
    pub id: u64,
    data: Option<Arc<Mutex<Vec<u8>>>>,
}

impl BufferHandle {
    /// A handle the HAL cannot map; stages only track it
    pub fn opaque(id: u64) -> Self {
        Self { id, data: None }
    }

    /// A handle backed by CPU-visible memory the producer can read back
    pub fn with_memory(id: u64, size: usize) -> Self {
        Self {
            id,
            data: Some(Arc::new(Mutex::new(vec![0; size]))),
        }
    }

    pub fn memory(&self) -> Option<&Arc<Mutex<Vec<u8>>>> {
        self.data.as_ref()
    }

    /// Snapshot of the handle contents
    pub fn contents(&self) -> Option<Vec<u8>> {
        let data = self.data.as_ref()?;
        let guard = data.lock().ok()?;
        Some(guard.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferStatus {
    Ok,
    Error,
}

/// One buffer of one stream, as exchanged with the producer
#[derive(Debug, Clone)]
pub struct StreamBuffer {
    pub stream: StreamId,
    pub handle: BufferHandle,
    pub acquire_fence: Option<i32>,
    pub release_fence: Option<i32>,
    pub status: BufferStatus,
}

impl StreamBuffer {
    pub fn new(stream: StreamId, handle: BufferHandle) -> Self {
        Self {
            stream,
            handle,
            acquire_fence: None,
            release_fence: None,
            status: BufferStatus::Ok,
        }
    }

    pub fn with_status(mut self, status: BufferStatus) -> Self {
        self.status = status;
        self
    }
}

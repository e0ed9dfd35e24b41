//! FLITE stage backed by a V4L2 capture node

use std::sync::Mutex;
use std::time::Duration;

use tracing::{info, instrument, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use super::{StageCommand, StageDriver, StageOutput};
use crate::error::{Error, Result};
use crate::metadata::{MetaTag, MetaValue};
use crate::pipeline::PipeId;
use crate::utils::{lock, monotonic_ns};
use crate::SensorConfig;

const STREAM_BUFFERS: u32 = 4;

/// Dequeues one sensor frame per submit into the bayer destination
pub struct V4l2SensorDriver {
    name: String,
    // Keeps the node open for the lifetime of the stream
    _device: Device,
    stream: Mutex<MmapStream<'static>>,
}

fn fail(reason: impl Into<String>) -> Error {
    Error::Stage {
        pipe: PipeId::Flite,
        reason: reason.into(),
    }
}

impl V4l2SensorDriver {
    pub fn new(path: &str, sensor: &SensorConfig) -> Result<Self> {
        info!("Opening sensor node {}", path);
        let device = Device::with_path(path)?;

        let caps = device.query_caps()?;
        info!("Sensor: {} ({})", caps.card, caps.driver);
        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(Error::Config(format!("{} cannot capture video", path)));
        }

        let mut fmt = device.format()?;
        fmt.width = sensor.width;
        fmt.height = sensor.height;
        fmt.fourcc = FourCC::new(b"YUYV");
        let fmt = device.set_format(&fmt)?;
        if fmt.width != sensor.width || fmt.height != sensor.height {
            warn!(
                "{}: asked for {}x{}, node runs at {}x{}",
                path, sensor.width, sensor.height, fmt.width, fmt.height
            );
        }

        let stream = MmapStream::with_buffers(&device, Type::VideoCapture, STREAM_BUFFERS)?;
        Ok(Self {
            name: format!("flite({})", path),
            _device: device,
            stream: Mutex::new(stream),
        })
    }
}

impl StageDriver for V4l2SensorDriver {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self, cmd), fields(frame = cmd.frame_count))]
    fn submit(&self, cmd: &StageCommand) -> Result<StageOutput> {
        let mut stream = lock(&self.stream);
        let (data, meta) = stream.next().map_err(|e| fail(e.to_string()))?;

        if let Some(dst) = &cmd.dst {
            if let Some(plane) = dst.image_planes().first() {
                let len = data.len().min(plane.size());
                plane.write(&data[..len])?;
            }
        }

        let device_ts = Duration::from_secs(meta.timestamp.sec as u64)
            + Duration::from_micros(meta.timestamp.usec as u64);
        let timestamp = match device_ts.as_nanos() as u64 {
            0 => monotonic_ns(),
            ns => ns,
        };

        let mut output = StageOutput {
            timestamp_ns: Some(timestamp),
            ..Default::default()
        };
        output
            .metadata
            .set(MetaTag::SensorTimestamp, MetaValue::I64(timestamp as i64))
            .set(MetaTag::SensorExposureTime, MetaValue::I64(cmd.shot.exposure_ns))
            .set(
                MetaTag::SensorFrameDuration,
                MetaValue::I64(cmd.shot.frame_duration_ns),
            );
        Ok(output)
    }
}

//! Camera metadata, request templates and per-frame shot settings

use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

use crate::SensorConfig;

/// Metadata keys understood by the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MetaTag {
    ControlCaptureIntent,
    ControlMode,
    ControlAeMode,
    ControlAeState,
    ControlAfMode,
    ControlAfState,
    ControlAwbMode,
    SensorExposureTime,
    SensorFrameDuration,
    SensorSensitivity,
    SensorTimestamp,
    JpegQuality,
    JpegOrientation,
    JpegSize,
    RequestPipelineDepth,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum MetaValue {
    U8(u8),
    I32(i32),
    I64(i64),
    F32(f32),
}

/// Owned tag/value map; requests copy into one of these on registration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CameraMetadata {
    entries: BTreeMap<MetaTag, MetaValue>,
}

impl CameraMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, tag: MetaTag, value: MetaValue) -> &mut Self {
        self.entries.insert(tag, value);
        self
    }

    pub fn get(&self, tag: MetaTag) -> Option<MetaValue> {
        self.entries.get(&tag).copied()
    }

    pub fn get_i64(&self, tag: MetaTag) -> Option<i64> {
        match self.get(tag)? {
            MetaValue::I64(v) => Some(v),
            MetaValue::I32(v) => Some(i64::from(v)),
            MetaValue::U8(v) => Some(i64::from(v)),
            MetaValue::F32(_) => None,
        }
    }

    pub fn get_i32(&self, tag: MetaTag) -> Option<i32> {
        self.get_i64(tag).and_then(|v| i32::try_from(v).ok())
    }

    pub fn get_u8(&self, tag: MetaTag) -> Option<u8> {
        self.get_i64(tag).and_then(|v| u8::try_from(v).ok())
    }

    /// Overlay `other` on top of `self`
    pub fn merge(&mut self, other: &CameraMetadata) {
        for (tag, value) in &other.entries {
            self.entries.insert(*tag, *value);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&MetaTag, &MetaValue)> {
        self.entries.iter()
    }
}

/// `android.control.captureIntent`-style templates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestTemplate {
    Preview,
    StillCapture,
    VideoRecord,
    VideoSnapshot,
    ZeroShutterLag,
    Manual,
}

impl RequestTemplate {
    fn intent(self) -> u8 {
        match self {
            RequestTemplate::Preview => 1,
            RequestTemplate::StillCapture => 2,
            RequestTemplate::VideoRecord => 3,
            RequestTemplate::VideoSnapshot => 4,
            RequestTemplate::ZeroShutterLag => 5,
            RequestTemplate::Manual => 6,
        }
    }

    fn from_intent(intent: u8) -> Self {
        match intent {
            2 => RequestTemplate::StillCapture,
            3 => RequestTemplate::VideoRecord,
            4 => RequestTemplate::VideoSnapshot,
            5 => RequestTemplate::ZeroShutterLag,
            6 => RequestTemplate::Manual,
            _ => RequestTemplate::Preview,
        }
    }
}

pub const AE_MODE_OFF: u8 = 0;
pub const AE_MODE_ON: u8 = 1;
pub const AE_STATE_SEARCHING: u8 = 1;
pub const AE_STATE_CONVERGED: u8 = 2;
pub const DEFAULT_JPEG_QUALITY: u8 = 95;

/// Default settings a producer starts a request of the given kind from
pub fn construct_default_request_settings(
    template: RequestTemplate,
    sensor: &SensorConfig,
) -> CameraMetadata {
    let frame_duration = 1_000_000_000 / i64::from(sensor.fps.max(1));
    let mut meta = CameraMetadata::new();

    meta.set(MetaTag::ControlCaptureIntent, MetaValue::U8(template.intent()))
        .set(MetaTag::ControlMode, MetaValue::U8(1))
        .set(MetaTag::ControlAwbMode, MetaValue::U8(1))
        .set(MetaTag::SensorFrameDuration, MetaValue::I64(frame_duration))
        .set(MetaTag::SensorSensitivity, MetaValue::I32(100))
        .set(MetaTag::JpegQuality, MetaValue::U8(DEFAULT_JPEG_QUALITY))
        .set(MetaTag::JpegOrientation, MetaValue::I32(0));

    match template {
        RequestTemplate::Manual => {
            meta.set(MetaTag::ControlMode, MetaValue::U8(0))
                .set(MetaTag::ControlAeMode, MetaValue::U8(AE_MODE_OFF))
                .set(MetaTag::SensorExposureTime, MetaValue::I64(frame_duration / 2))
                .set(MetaTag::ControlAfMode, MetaValue::U8(0));
        }
        RequestTemplate::StillCapture | RequestTemplate::ZeroShutterLag => {
            meta.set(MetaTag::ControlAeMode, MetaValue::U8(AE_MODE_ON))
                .set(MetaTag::ControlAfMode, MetaValue::U8(4));
        }
        RequestTemplate::VideoRecord | RequestTemplate::VideoSnapshot => {
            meta.set(MetaTag::ControlAeMode, MetaValue::U8(AE_MODE_ON))
                .set(MetaTag::ControlAfMode, MetaValue::U8(3));
        }
        RequestTemplate::Preview => {
            meta.set(MetaTag::ControlAeMode, MetaValue::U8(AE_MODE_ON))
                .set(MetaTag::ControlAfMode, MetaValue::U8(4));
        }
    }

    meta
}

/// Sensor and encoder controls a frame is processed with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShotSettings {
    pub intent: RequestTemplate,
    pub manual_exposure: bool,
    pub exposure_ns: i64,
    pub frame_duration_ns: i64,
    pub sensitivity: i32,
    pub jpeg_quality: u8,
}

impl ShotSettings {
    pub fn for_sensor(sensor: &SensorConfig) -> Self {
        let frame_duration_ns = 1_000_000_000 / i64::from(sensor.fps.max(1));
        Self {
            intent: RequestTemplate::Preview,
            manual_exposure: false,
            exposure_ns: frame_duration_ns / 2,
            frame_duration_ns,
            sensitivity: 100,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }

    /// Resolve the controls of `meta`, keeping `previous` for anything it leaves out
    pub fn from_metadata(meta: &CameraMetadata, previous: &ShotSettings) -> Self {
        let manual_exposure = meta
            .get_u8(MetaTag::ControlAeMode)
            .map(|mode| mode == AE_MODE_OFF)
            .unwrap_or(previous.manual_exposure);

        Self {
            intent: meta
                .get_u8(MetaTag::ControlCaptureIntent)
                .map(RequestTemplate::from_intent)
                .unwrap_or(previous.intent),
            manual_exposure,
            exposure_ns: meta
                .get_i64(MetaTag::SensorExposureTime)
                .unwrap_or(previous.exposure_ns),
            frame_duration_ns: meta
                .get_i64(MetaTag::SensorFrameDuration)
                .filter(|d| *d > 0)
                .unwrap_or(previous.frame_duration_ns),
            sensitivity: meta
                .get_i32(MetaTag::SensorSensitivity)
                .unwrap_or(previous.sensitivity),
            jpeg_quality: meta
                .get_u8(MetaTag::JpegQuality)
                .filter(|q| (1..=100).contains(q))
                .unwrap_or(previous.jpeg_quality),
        }
    }

    /// A manual exposure or frame-duration change needs the sensor to settle first
    pub fn needs_sensor_settle(&self, previous: &ShotSettings) -> bool {
        self.manual_exposure
            && (self.exposure_ns != previous.exposure_ns
                || self.frame_duration_ns != previous.frame_duration_ns)
    }
}

/// Shot settings currently applied to the sensor, read lock-free by stage workers
pub struct Parameters {
    current: ArcSwap<ShotSettings>,
}

impl Parameters {
    pub fn new(shot: ShotSettings) -> Self {
        Self {
            current: ArcSwap::from_pointee(shot),
        }
    }

    pub fn shot(&self) -> Arc<ShotSettings> {
        self.current.load_full()
    }

    pub fn apply(&self, shot: ShotSettings) {
        self.current.store(Arc::new(shot));
    }
}

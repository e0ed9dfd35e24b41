//! Software JPEG stage

use bytes::{BufMut, BytesMut};
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use tracing::{debug, instrument};

use super::{StageCommand, StageDriver, StageOutput};
use crate::error::{Error, Result};
use crate::metadata::{MetaTag, MetaValue};

/// Encodes the luma plane of its source into the destination blob
pub struct JpegEncoderDriver {
    name: String,
}

impl JpegEncoderDriver {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    fn fail(&self, cmd: &StageCommand, reason: impl Into<String>) -> Error {
        Error::Stage {
            pipe: cmd.pipe,
            reason: format!("{}: {}", self.name, reason.into()),
        }
    }
}

impl StageDriver for JpegEncoderDriver {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self, cmd), fields(frame = cmd.frame_count))]
    fn submit(&self, cmd: &StageCommand) -> Result<StageOutput> {
        let src = cmd.src.as_ref().ok_or_else(|| self.fail(cmd, "no source"))?;
        let luma = src
            .image_planes()
            .first()
            .ok_or_else(|| self.fail(cmd, "source has no planes"))?;

        let width = luma.stride();
        if width == 0 {
            return Err(self.fail(cmd, "source stride is zero"));
        }
        let height = (luma.size() / width as usize) as u32;
        let pixels = luma
            .read()
            .ok_or_else(|| self.fail(cmd, "source is not CPU-visible"))?;

        let mut writer = BytesMut::with_capacity(pixels.len() / 4).writer();
        JpegEncoder::new_with_quality(&mut writer, cmd.shot.jpeg_quality)
            .encode(
                &pixels[..(width * height) as usize],
                width,
                height,
                ExtendedColorType::L8,
            )
            .map_err(|e| self.fail(cmd, e.to_string()))?;
        let encoded = writer.into_inner().freeze();

        let dst = cmd.dst.as_ref().ok_or_else(|| self.fail(cmd, "no destination"))?;
        if let Some(plane) = dst.image_planes().first() {
            if !plane.write(&encoded)? {
                debug!("{}: destination not mapped, dropping encoded data", self.name);
            }
        }

        debug!(
            "{}: frame {} {}x{} q{} -> {} bytes",
            self.name,
            cmd.frame_count,
            width,
            height,
            cmd.shot.jpeg_quality,
            encoded.len()
        );

        let mut output = StageOutput::default();
        output
            .metadata
            .set(MetaTag::JpegSize, MetaValue::I64(encoded.len() as i64))
            .set(MetaTag::JpegQuality, MetaValue::U8(cmd.shot.jpeg_quality));
        Ok(output)
    }
}

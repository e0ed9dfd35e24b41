//! Exynos camera HAL3 pipeline demo: a preview stream with a periodic still capture

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use color_eyre::Result;
use tracing::{info, warn};

use exynos_camera3::metadata::RequestTemplate;
use exynos_camera3::request::{CallbackOps, CaptureRequest, CaptureResult, NotifyMsg};
use exynos_camera3::stream::{BufferHandle, StreamBuffer, StreamConfig, StreamId, StreamType};
use exynos_camera3::{CameraDevice, Config};

const PREVIEW: StreamId = 0;
const JPEG: StreamId = 1;
const STILL_EVERY: u32 = 30;

/// Logs what the pipeline hands back
struct LogCallbacks;

impl CallbackOps for LogCallbacks {
    fn notify(&self, msg: NotifyMsg) {
        match msg {
            NotifyMsg::Shutter {
                frame_number,
                timestamp_ns,
            } => info!("shutter {} @ {}", frame_number, timestamp_ns),
            NotifyMsg::Error { .. } => warn!("{:?}", msg),
        }
    }

    fn process_capture_result(&self, result: CaptureResult) {
        for buffer in &result.output_buffers {
            let bytes = buffer.handle.contents().map(|c| c.len()).unwrap_or(0);
            info!(
                "result {}: stream {} {:?} ({} bytes)",
                result.frame_number, buffer.stream, buffer.status, bytes
            );
        }
        if result.result.is_some() {
            info!(
                "result {}: metadata (partial {})",
                result.frame_number, result.partial_result
            );
        }
    }
}

fn buffer(stream: &StreamConfig, id: u64) -> StreamBuffer {
    let size = stream
        .format
        .plane_sizes(stream.width, stream.height)
        .iter()
        .sum();
    StreamBuffer::new(stream.id, BufferHandle::with_memory(id, size))
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    #[cfg(feature = "profiling")]
    {
        use tracing_subscriber::layer::SubscriberExt;
        tracing::subscriber::set_global_default(
            tracing_subscriber::registry().with(tracing_tracy::TracyLayer::default()),
        )?;
    }
    #[cfg(not(feature = "profiling"))]
    tracing_subscriber::fmt()
        .with_env_filter("exynos_camera3=debug")
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    let path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load(path.as_deref())?;
    let (width, height) = (config.sensor.width, config.sensor.height);
    let frame_duration = config.frame_duration();

    let camera = Arc::new(CameraDevice::open(config, Arc::new(LogCallbacks))?);
    let streams = [
        StreamConfig::new(PREVIEW, StreamType::Preview, width, height),
        StreamConfig::new(JPEG, StreamType::Jpeg, width, height),
    ];
    camera.configure_streams(&streams)?;
    info!("camera ready, ctrl-c to stop");

    let preview_settings = camera.construct_default_request_settings(RequestTemplate::Preview);
    let mut ticker = tokio::time::interval(frame_duration);
    let mut frame_number: u32 = 0;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                frame_number += 1;
                let mut request = CaptureRequest::new(frame_number)
                    .with_output(buffer(&streams[0], u64::from(frame_number)));
                if frame_number == 1 {
                    request = request.with_settings(preview_settings.clone());
                }
                if frame_number % STILL_EVERY == 0 {
                    request = request.with_output(buffer(&streams[1], u64::from(frame_number)));
                }

                // admission blocks while the pipeline is full
                let device = Arc::clone(&camera);
                let submitted =
                    tokio::task::spawn_blocking(move || device.process_capture_request(&request))
                        .await?;
                if let Err(e) = submitted {
                    warn!("request {}: {}", frame_number, e);
                    if e.is_retryable() {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    } else {
                        break;
                    }
                }
            }
        }
    }

    info!("shutting down after {} requests", frame_number);
    camera.flush()?;
    camera.dump();
    camera.close()?;
    Ok(())
}

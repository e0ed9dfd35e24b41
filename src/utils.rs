use std::io;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use nix::time::{clock_gettime, ClockId};
use tracing::{debug, warn};

/// CLOCK_MONOTONIC, the time base of sensor timestamps
pub fn monotonic_clock() -> crate::Result<Duration> {
    let now = clock_gettime(ClockId::CLOCK_MONOTONIC).map_err(io::Error::from)?;
    Ok(Duration::new(now.tv_sec() as u64, now.tv_nsec() as u32))
}

/// [`monotonic_clock`] in nanoseconds; 0 if the clock cannot be read
pub fn monotonic_ns() -> u64 {
    match monotonic_clock() {
        Ok(now) => now.as_nanos() as u64,
        Err(e) => {
            warn!("monotonic clock: {}", e);
            0
        }
    }
}

/// Lock `mutex`, carrying on with the inner state if a holder panicked
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Spawn a named worker thread, optionally pinned to `core`
pub fn spawn_worker<F, T>(name: String, core: Option<usize>, f: F) -> io::Result<JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let thread_name = name.clone();
    thread::Builder::new().name(name).spawn(move || {
        if let Some(id) = core {
            if core_affinity::set_for_current(core_affinity::CoreId { id }) {
                debug!("{} pinned to core {}", thread_name, id);
            } else {
                warn!("{}: failed to pin to core {}", thread_name, id);
            }
        }
        f()
    })
}

/// Pick a core for the n-th worker from the configured list
pub fn core_for(cores: &[usize], n: usize) -> Option<usize> {
    if cores.is_empty() {
        None
    } else {
        Some(cores[n % cores.len()])
    }
}

/// Detected sensor node info
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundSensor {
    pub path: String,
    pub card: String,
}

/// Auto-detect a V4L2 capture node that can feed the FLITE stage
#[cfg(feature = "v4l2-sensor")]
pub fn auto_detect_sensor() -> crate::Result<FoundSensor> {
    use std::path::Path;
    use tracing::info;
    use v4l::{capability::Flags, Device};

    info!("Auto-detecting sensor nodes...");

    for i in 0..10 {
        let path = format!("/dev/video{}", i);
        if !Path::new(&path).exists() {
            continue;
        }

        if let Ok(dev) = Device::with_path(&path) {
            if let Ok(caps) = dev.query_caps() {
                if caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
                    info!("Found capture node: {} - {}", path, caps.card);
                    return Ok(FoundSensor {
                        path,
                        card: caps.card,
                    });
                }
            }
        }
    }

    Err(crate::Error::Config("no capture node found".into()))
}

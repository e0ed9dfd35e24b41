//! Stall watchdog

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use metrics::counter;
use tracing::{error, trace};

use super::Shared;
use crate::utils::monotonic_ns;
use crate::FatalPolicy;

impl Shared {
    /// Declare the device dead when frames are in flight and no stage has
    /// completed for `stall_timeout_ms`
    pub(super) fn monitor_loop(&self, stop: Arc<AtomicBool>) {
        let interval = Duration::from_millis(self.config.monitor.interval_ms.max(1));
        let stall_ns = self.config.monitor.stall_timeout_ms.saturating_mul(1_000_000);

        while !stop.load(Ordering::Acquire) {
            thread::sleep(interval);
            if self.in_flight() == 0 {
                self.touch_progress();
                continue;
            }
            if self.flushing.load(Ordering::Acquire) {
                continue;
            }

            let idle = monotonic_ns().saturating_sub(self.last_progress.load(Ordering::Relaxed));
            if idle < stall_ns {
                continue;
            }

            let reason = format!(
                "no stage completed for {:?} with {} frames in flight",
                Duration::from_nanos(idle),
                self.in_flight()
            );
            error!("{}", reason);
            counter!("camera_device_errors_total").increment(1);
            self.dump();
            self.requests.notify_device_error();
            match self.config.monitor.fatal_policy {
                FatalPolicy::Abort => std::process::abort(),
                FatalPolicy::Report => {
                    self.requests.set_fatal(reason);
                    break;
                }
            }
        }
        trace!("monitor exits");
    }
}

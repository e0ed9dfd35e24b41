use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use tracing::{debug, trace};

use super::{StageCommand, StageDriver, StageOutput};
use crate::error::{Error, Result};
use crate::metadata::{MetaTag, MetaValue, AE_STATE_CONVERGED, AE_STATE_SEARCHING};
use crate::utils::{lock, monotonic_ns};

/// Frames on which a simulated stage misbehaves
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    /// Frame counts whose submit fails
    pub fail: HashSet<u32>,
    /// Extra processing time for given frame counts
    pub stall: HashMap<u32, Duration>,
}

impl FaultPlan {
    pub fn fail_on(frame_counts: impl IntoIterator<Item = u32>) -> Self {
        Self {
            fail: frame_counts.into_iter().collect(),
            stall: HashMap::new(),
        }
    }

    pub fn stall_on(frame_count: u32, duration: Duration) -> Self {
        Self {
            fail: HashSet::new(),
            stall: HashMap::from([(frame_count, duration)]),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Sensor,
    ThreeA,
    Plain,
}

/// Software stand-in for a hardware stage
pub struct SimulatedDriver {
    name: String,
    kind: Kind,
    latency: Duration,
    faults: Mutex<FaultPlan>,
    submitted: AtomicU64,
    prepared: AtomicU64,
}

impl SimulatedDriver {
    pub fn new(name: impl Into<String>, latency: Duration) -> Self {
        Self::with_kind(name.into(), Kind::Plain, latency)
    }

    /// Sensor front-end: stamps start-of-exposure
    pub fn sensor(name: impl Into<String>, latency: Duration) -> Self {
        Self::with_kind(name.into(), Kind::Sensor, latency)
    }

    /// 3A block: reports AE state
    pub fn three_a(name: impl Into<String>, latency: Duration) -> Self {
        Self::with_kind(name.into(), Kind::ThreeA, latency)
    }

    fn with_kind(name: String, kind: Kind, latency: Duration) -> Self {
        Self {
            name,
            kind,
            latency,
            faults: Mutex::new(FaultPlan::default()),
            submitted: AtomicU64::new(0),
            prepared: AtomicU64::new(0),
        }
    }

    pub fn with_faults(self, plan: FaultPlan) -> Self {
        *lock(&self.faults) = plan;
        self
    }

    pub fn set_faults(&self, plan: FaultPlan) {
        *lock(&self.faults) = plan;
    }

    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    pub fn prepared(&self) -> u64 {
        self.prepared.load(Ordering::Relaxed)
    }
}

impl StageDriver for SimulatedDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn prepare(&self, count: usize) -> Result<()> {
        debug!("{}: prepared {} buffers", self.name, count);
        self.prepared.store(count as u64, Ordering::Relaxed);
        Ok(())
    }

    fn submit(&self, cmd: &StageCommand) -> Result<StageOutput> {
        self.submitted.fetch_add(1, Ordering::Relaxed);
        let started = monotonic_ns();

        let (fail, stall) = {
            let faults = lock(&self.faults);
            (
                faults.fail.contains(&cmd.frame_count),
                faults.stall.get(&cmd.frame_count).copied(),
            )
        };

        thread::sleep(self.latency + stall.unwrap_or_default());

        if fail {
            return Err(Error::Stage {
                pipe: cmd.pipe,
                reason: format!("{}: injected fault on frame {}", self.name, cmd.frame_count),
            });
        }

        let pattern = cmd.frame_count as u8;
        for buffer in cmd.outputs() {
            for plane in buffer.image_planes() {
                plane.fill(pattern);
            }
        }
        trace!("{}: frame {} done", self.name, cmd.frame_count);

        let mut output = StageOutput::default();
        match self.kind {
            Kind::Sensor => {
                output.timestamp_ns = Some(started);
                output
                    .metadata
                    .set(MetaTag::SensorTimestamp, MetaValue::I64(started as i64))
                    .set(MetaTag::SensorExposureTime, MetaValue::I64(cmd.shot.exposure_ns))
                    .set(
                        MetaTag::SensorFrameDuration,
                        MetaValue::I64(cmd.shot.frame_duration_ns),
                    )
                    .set(MetaTag::SensorSensitivity, MetaValue::I32(cmd.shot.sensitivity));
            }
            Kind::ThreeA => {
                let ae_state = if cmd.shot.manual_exposure || cmd.frame_count > 2 {
                    AE_STATE_CONVERGED
                } else {
                    AE_STATE_SEARCHING
                };
                output
                    .metadata
                    .set(MetaTag::ControlAeState, MetaValue::U8(ae_state))
                    .set(MetaTag::ControlAfState, MetaValue::U8(2));
            }
            Kind::Plain => {}
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::SyncMode;
    use crate::metadata::ShotSettings;
    use crate::pipeline::PipeId;
    use crate::SensorConfig;

    fn command(frame_count: u32) -> StageCommand {
        StageCommand {
            pipe: PipeId::Flite,
            frame_count,
            src: None,
            dst: None,
            taps: vec![],
            shot: ShotSettings::for_sensor(&SensorConfig::default()),
            sync: SyncMode::Blocking,
        }
    }

    #[test]
    fn sensor_stamps_timestamp() {
        let driver = SimulatedDriver::sensor("flite", Duration::ZERO);
        let output = driver.submit(&command(1)).unwrap();
        assert!(output.timestamp_ns.is_some());
        assert!(output.metadata.get_i64(MetaTag::SensorTimestamp).is_some());
        assert_eq!(driver.submitted(), 1);
    }

    #[test]
    fn injected_fault_fails_only_that_frame() {
        let driver =
            SimulatedDriver::new("mcsc", Duration::ZERO).with_faults(FaultPlan::fail_on([2]));
        assert!(driver.submit(&command(1)).is_ok());
        assert!(matches!(
            driver.submit(&command(2)),
            Err(Error::Stage { pipe: PipeId::Flite, .. })
        ));
        assert!(driver.submit(&command(3)).is_ok());
    }
}

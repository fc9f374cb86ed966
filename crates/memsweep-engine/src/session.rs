//! Sweep session and the immutable report it finalizes into

use crate::controller::OffsetState;
use chrono::{DateTime, Utc};
use memsweep_core::{
    DeviceIdentity, OffsetBounds, OffsetMhz, StabilitySample, StructRevision, SweepConfig, Verdict,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// What tipped the detector over the cliff
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum CliffCause {
    DataErrors {
        offset: OffsetMhz,
        count: u64,
    },
    BandwidthDrop {
        offset: OffsetMhz,
        bandwidth_gbps: f64,
        baseline_gbps: f64,
    },
}

/// Why a sweep stopped
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason", content = "detail")]
pub enum StopReason {
    CliffDetected(CliffCause),
    WatchdogTimeout,
    TestFault(String),
    Cancelled,
    UpperBoundReached,
    SessionTimeLimit,
    ThermalLimit { temperature_c: f64 },
    PowerLimit { power_draw_w: f64 },
    BoundsChanged,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::CliffDetected(CliffCause::DataErrors { offset, count }) => {
                write!(f, "cliff: {} errors at {:+} MHz", count, offset)
            }
            StopReason::CliffDetected(CliffCause::BandwidthDrop {
                offset,
                bandwidth_gbps,
                baseline_gbps,
            }) => write!(
                f,
                "cliff: {:.1} GB/s at {:+} MHz vs {:.1} GB/s baseline",
                bandwidth_gbps, offset, baseline_gbps
            ),
            StopReason::WatchdogTimeout => write!(f, "watchdog timeout"),
            StopReason::TestFault(msg) => write!(f, "test fault: {}", msg),
            StopReason::Cancelled => write!(f, "cancelled"),
            StopReason::UpperBoundReached => write!(f, "upper bound reached"),
            StopReason::SessionTimeLimit => write!(f, "session time limit"),
            StopReason::ThermalLimit { temperature_c } => {
                write!(f, "thermal limit ({:.1}°C)", temperature_c)
            }
            StopReason::PowerLimit { power_draw_w } => {
                write!(f, "power limit ({:.0} W)", power_draw_w)
            }
            StopReason::BoundsChanged => write!(f, "device bounds changed"),
        }
    }
}

/// Highest bandwidth seen at a stable offset
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PeakBandwidth {
    pub offset: OffsetMhz,
    pub bandwidth_gbps: f64,
}

/// A running sweep. Samples are appended in temporal order.
#[derive(Debug)]
pub struct SweepSession {
    id: Uuid,
    device: DeviceIdentity,
    revision: Option<StructRevision>,
    bounds: Option<OffsetBounds>,
    started_at: DateTime<Utc>,
    start_offset: OffsetMhz,
    step_mhz: u32,
    upper_bound: OffsetMhz,
    samples: Vec<StabilitySample>,
    verdicts: Vec<Verdict>,
    first_regression: Option<OffsetMhz>,
}

impl SweepSession {
    pub fn new(device: DeviceIdentity, config: &SweepConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            device,
            revision: None,
            bounds: None,
            started_at: Utc::now(),
            start_offset: config.start_offset.unwrap_or(0),
            step_mhz: config.step_mhz,
            upper_bound: config.max_offset,
            samples: Vec::new(),
            verdicts: Vec::new(),
            first_regression: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Fix the device facts and the planned range once discovery is done
    pub fn plan(
        &mut self,
        revision: StructRevision,
        bounds: OffsetBounds,
        start_offset: OffsetMhz,
        upper_bound: OffsetMhz,
    ) {
        self.revision = Some(revision);
        self.bounds = Some(bounds);
        self.start_offset = start_offset;
        self.upper_bound = upper_bound;
    }

    /// Append a sample with the verdict the controller recorded for it
    pub fn push(&mut self, sample: StabilitySample, verdict: Verdict) {
        self.samples.push(sample);
        self.verdicts.push(verdict);
    }

    pub fn set_first_regression(&mut self, offset: Option<OffsetMhz>) {
        self.first_regression = offset;
    }

    pub fn samples(&self) -> &[StabilitySample] {
        &self.samples
    }

    /// Finalize into an immutable report
    pub fn finish(self, outcome: SessionOutcome) -> SweepReport {
        let peak = self
            .samples
            .iter()
            .zip(&self.verdicts)
            .filter(|(_, verdict)| verdict.is_stable())
            .map(|(s, _)| PeakBandwidth {
                offset: s.offset,
                bandwidth_gbps: s.bandwidth_gbps,
            })
            .fold(None, |best: Option<PeakBandwidth>, p| match best {
                Some(b) if b.bandwidth_gbps >= p.bandwidth_gbps => Some(b),
                _ => Some(p),
            });
        let first_error_offset = self
            .samples
            .iter()
            .find(|s| s.error_count > 0)
            .map(|s| s.offset);

        SweepReport {
            id: self.id,
            device: self.device,
            revision: self.revision,
            bounds: self.bounds,
            started_at: self.started_at,
            finished_at: Utc::now(),
            start_offset: self.start_offset,
            step_mhz: self.step_mhz,
            upper_bound: self.upper_bound,
            samples: self.samples,
            verdicts: self.verdicts,
            stop_reason: outcome.stop_reason,
            recommended_offset: outcome.recommended_offset,
            peak,
            first_regression_offset: self.first_regression,
            first_error_offset,
            final_state: outcome.final_state,
            profile_path: outcome.profile_path,
            hard_failure: outcome.hard_failure,
        }
    }
}

/// How a session ended, as known by the orchestrator
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOutcome {
    pub stop_reason: Option<StopReason>,
    pub recommended_offset: Option<OffsetMhz>,
    /// `None` when the device was never touched
    pub final_state: Option<OffsetState>,
    pub profile_path: Option<PathBuf>,
    pub hard_failure: Option<String>,
}

/// Immutable record of a finished sweep
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepReport {
    pub id: Uuid,
    pub device: DeviceIdentity,
    pub revision: Option<StructRevision>,
    pub bounds: Option<OffsetBounds>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub start_offset: OffsetMhz,
    pub step_mhz: u32,
    pub upper_bound: OffsetMhz,
    pub samples: Vec<StabilitySample>,
    /// Verdict of each sample, index for index
    pub verdicts: Vec<Verdict>,
    pub stop_reason: Option<StopReason>,
    /// Highest offset that passed; `None` when nothing passed
    pub recommended_offset: Option<OffsetMhz>,
    pub peak: Option<PeakBandwidth>,
    /// First step-over-step bandwidth regression beyond the threshold
    pub first_regression_offset: Option<OffsetMhz>,
    pub first_error_offset: Option<OffsetMhz>,
    pub final_state: Option<OffsetState>,
    pub profile_path: Option<PathBuf>,
    /// Set when the session ended on a hard failure
    pub hard_failure: Option<String>,
}

impl SweepReport {
    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }

    pub fn is_success(&self) -> bool {
        self.hard_failure.is_none()
    }

    /// Samples paired with their verdicts, in test order
    pub fn judged_samples(&self) -> impl Iterator<Item = (&StabilitySample, Verdict)> + '_ {
        self.samples.iter().zip(self.verdicts.iter().copied())
    }
}

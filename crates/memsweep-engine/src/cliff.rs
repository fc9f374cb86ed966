//! Cliff detection over the bandwidth/error series
//!
//! The baseline is the mean bandwidth of the first `window` clean samples.
//! A sweep stops on the first sample with data errors, on a bandwidth drop
//! below `cliff_fraction` of the baseline, or on an incomplete step. Data
//! errors stop the sweep even before a baseline exists.

use crate::session::{CliffCause, StopReason};
use memsweep_core::{OffsetMhz, SampleStatus, StabilitySample, SweepConfig};
use tracing::{debug, info};

/// Detector verdict for one sample
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Continue,
    Stop(StopReason),
}

#[derive(Debug, Clone)]
pub struct CliffDetector {
    cliff_fraction: f64,
    regression_threshold: f64,
    window: usize,
    baseline_samples: Vec<f64>,
    previous: Option<f64>,
    first_regression: Option<OffsetMhz>,
}

impl CliffDetector {
    pub fn new(cliff_fraction: f64, regression_threshold: f64, window: usize) -> Self {
        Self {
            cliff_fraction,
            regression_threshold,
            window: window.max(1),
            baseline_samples: Vec::new(),
            previous: None,
            first_regression: None,
        }
    }

    pub fn from_config(config: &SweepConfig) -> Self {
        Self::new(
            config.cliff_fraction,
            config.regression_threshold,
            config.baseline_window,
        )
    }

    /// Mean bandwidth of the baseline samples, once seeded
    pub fn baseline(&self) -> Option<f64> {
        if self.baseline_samples.is_empty() {
            return None;
        }
        Some(self.baseline_samples.iter().sum::<f64>() / self.baseline_samples.len() as f64)
    }

    /// Offset of the first step-over-step regression beyond the threshold
    pub fn first_regression(&self) -> Option<OffsetMhz> {
        self.first_regression
    }

    pub fn observe(&mut self, sample: &StabilitySample) -> Decision {
        match &sample.status {
            SampleStatus::TimedOut => return Decision::Stop(StopReason::WatchdogTimeout),
            SampleStatus::Faulted(msg) => return Decision::Stop(StopReason::TestFault(msg.clone())),
            SampleStatus::Completed => {}
        }

        if sample.error_count > 0 {
            return Decision::Stop(StopReason::CliffDetected(CliffCause::DataErrors {
                offset: sample.offset,
                count: sample.error_count,
            }));
        }

        let bandwidth = sample.bandwidth_gbps;
        if let Some(baseline) = self.baseline() {
            if bandwidth < self.cliff_fraction * baseline {
                return Decision::Stop(StopReason::CliffDetected(CliffCause::BandwidthDrop {
                    offset: sample.offset,
                    bandwidth_gbps: bandwidth,
                    baseline_gbps: baseline,
                }));
            }
        }

        if let Some(previous) = self.previous {
            let drop = if previous > 0.0 {
                (previous - bandwidth) / previous
            } else {
                0.0
            };
            if drop > self.regression_threshold && self.first_regression.is_none() {
                info!(
                    "Bandwidth regression of {:.1}% at {:+} MHz",
                    drop * 100.0,
                    sample.offset
                );
                self.first_regression = Some(sample.offset);
            }
        }

        if self.baseline_samples.len() < self.window {
            self.baseline_samples.push(bandwidth);
            debug!(
                "Baseline now {:.2} GB/s over {} samples",
                self.baseline().unwrap_or(bandwidth),
                self.baseline_samples.len()
            );
        }
        self.previous = Some(bandwidth);

        Decision::Continue
    }
}

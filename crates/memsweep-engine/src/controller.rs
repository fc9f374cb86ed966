//! Offset controller: the safety state machine for one device
//!
//! The controller is the only writer of the device memory offset. Every
//! write goes through the retry policy and is bounded by `apply_timeout`.
//! Rollback is reachable from every state and always reapplies the last
//! verified stable offset, or stock when nothing has been verified.

use crate::profile::OcProfile;
use crate::retry::RetryPolicy;
use memsweep_core::{ControlSurface, Device, Error, OffsetMhz, Result, Verdict};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Where a rollback returned the device to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestorePoint {
    Stock,
    Stable(OffsetMhz),
}

impl RestorePoint {
    pub fn offset(&self) -> OffsetMhz {
        match self {
            RestorePoint::Stock => 0,
            RestorePoint::Stable(offset) => *offset,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OffsetState {
    Stock,
    Candidate(OffsetMhz),
    Applied(OffsetMhz),
    Stable(OffsetMhz),
    Unstable(OffsetMhz),
    RolledBack(RestorePoint),
    Saved(OffsetMhz),
    Indeterminate,
}

impl OffsetState {
    /// The device sits at an offset that passed verification, or at stock
    pub fn is_safe(&self) -> bool {
        matches!(
            self,
            OffsetState::Stock
                | OffsetState::Stable(_)
                | OffsetState::RolledBack(_)
                | OffsetState::Saved(_)
        )
    }
}

impl fmt::Display for OffsetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OffsetState::Stock => write!(f, "stock"),
            OffsetState::Candidate(v) => write!(f, "candidate({:+})", v),
            OffsetState::Applied(v) => write!(f, "applied({:+})", v),
            OffsetState::Stable(v) => write!(f, "stable({:+})", v),
            OffsetState::Unstable(v) => write!(f, "unstable({:+})", v),
            OffsetState::RolledBack(RestorePoint::Stock) => write!(f, "rolled back to stock"),
            OffsetState::RolledBack(RestorePoint::Stable(v)) => {
                write!(f, "rolled back to {:+}", v)
            }
            OffsetState::Saved(v) => write!(f, "saved({:+})", v),
            OffsetState::Indeterminate => write!(f, "indeterminate"),
        }
    }
}

/// Proof that an offset passed a stability test.
///
/// Only the controller mints these, so anything accepting one (such as the
/// capability cache) can only ever learn offsets with a stable verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StableOffset {
    offset: OffsetMhz,
}

impl StableOffset {
    fn new(offset: OffsetMhz) -> Self {
        Self { offset }
    }

    #[cfg(test)]
    pub(crate) fn new_for_test(offset: OffsetMhz) -> Self {
        Self::new(offset)
    }

    pub fn offset(&self) -> OffsetMhz {
        self.offset
    }
}

pub struct OffsetController {
    surface: Arc<dyn ControlSurface>,
    device: Device,
    retry: RetryPolicy,
    apply_timeout: Duration,
    state: OffsetState,
    last_stable: Option<OffsetMhz>,
}

impl OffsetController {
    /// Take control of `device`, assumed to be at stock
    pub fn new(
        surface: Arc<dyn ControlSurface>,
        device: Device,
        retry: RetryPolicy,
        apply_timeout: Duration,
    ) -> Self {
        Self {
            surface,
            device,
            retry,
            apply_timeout,
            state: OffsetState::Stock,
            last_stable: None,
        }
    }

    pub fn state(&self) -> OffsetState {
        self.state
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Highest offset recorded stable this session
    pub fn last_stable(&self) -> Option<OffsetMhz> {
        self.last_stable
    }

    /// Token for the last stable offset, if any
    pub fn stable_token(&self) -> Option<StableOffset> {
        self.last_stable.map(StableOffset::new)
    }

    pub fn propose(&mut self, offset: OffsetMhz) -> Result<OffsetMhz> {
        match self.state {
            OffsetState::Applied(current) => {
                return Err(Error::transition(format!(
                    "cannot propose {:+} while {:+} is unresolved",
                    offset, current
                )));
            }
            OffsetState::Unstable(current) => {
                return Err(Error::transition(format!(
                    "cannot propose {:+} before rolling back unstable {:+}",
                    offset, current
                )));
            }
            OffsetState::Indeterminate => {
                return Err(Error::transition(
                    "cannot propose while the device state is indeterminate",
                ));
            }
            _ => {}
        }

        let bounds = self.device.bounds;
        if !bounds.contains(offset) {
            return Err(Error::OutOfBoundsOffset {
                offset,
                min: bounds.min,
                max: bounds.max,
            });
        }

        self.state = OffsetState::Candidate(offset);
        Ok(offset)
    }

    /// Apply the proposed candidate
    pub async fn apply(&mut self) -> Result<OffsetMhz> {
        let offset = match self.state {
            OffsetState::Candidate(offset) => offset,
            other => {
                return Err(Error::transition(format!("cannot apply from {}", other)));
            }
        };

        match self.write_offset(offset).await {
            Ok(()) => {
                self.state = OffsetState::Applied(offset);
                info!("Applied memory offset {:+} MHz to {}", offset, self.device.identity);
                Ok(offset)
            }
            Err(e) => {
                warn!("Applying {:+} MHz failed, rolling back: {}", offset, e);
                self.rollback().await?;
                Err(Error::apply_failed(offset, e.to_string()))
            }
        }
    }

    /// Record the verdict for the applied offset
    pub fn record(&mut self, verdict: Verdict) -> Result<Option<StableOffset>> {
        let offset = match self.state {
            OffsetState::Applied(offset) => offset,
            other => {
                return Err(Error::transition(format!(
                    "cannot record a verdict from {}",
                    other
                )));
            }
        };

        match verdict {
            Verdict::Stable => {
                self.state = OffsetState::Stable(offset);
                self.last_stable = Some(offset);
                Ok(Some(StableOffset::new(offset)))
            }
            Verdict::Unstable => {
                self.state = OffsetState::Unstable(offset);
                Ok(None)
            }
        }
    }

    /// Reapply the last stable offset, or stock. Callable from any state.
    pub async fn rollback(&mut self) -> Result<RestorePoint> {
        let point = match self.last_stable {
            Some(offset) => RestorePoint::Stable(offset),
            None => RestorePoint::Stock,
        };

        match self.write_offset(point.offset()).await {
            Ok(()) => {
                info!(
                    "Rolled back {} from {} to {:+} MHz",
                    self.device.identity,
                    self.state,
                    point.offset()
                );
                self.state = OffsetState::RolledBack(point);
                Ok(point)
            }
            Err(e) => {
                error!(
                    "Rollback of {} to {:+} MHz failed, device state unknown: {}",
                    self.device.identity,
                    point.offset(),
                    e
                );
                self.state = OffsetState::Indeterminate;
                Err(Error::safety(format!(
                    "rollback to {:+} MHz failed: {}",
                    point.offset(),
                    e
                )))
            }
        }
    }

    /// Return the memory clock to stock regardless of what passed
    pub async fn reset_to_stock(&mut self) -> Result<()> {
        match self.write_offset(0).await {
            Ok(()) => {
                info!("Reset {} to stock memory clock", self.device.identity);
                self.state = OffsetState::Stock;
                Ok(())
            }
            Err(e) => {
                error!("Reset of {} to stock failed: {}", self.device.identity, e);
                self.state = OffsetState::Indeterminate;
                Err(Error::safety(format!("reset to stock failed: {}", e)))
            }
        }
    }

    /// Persist the current verified offsets as a profile
    pub async fn commit(&mut self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let offset = match self.state {
            OffsetState::Stable(offset)
            | OffsetState::Saved(offset)
            | OffsetState::RolledBack(RestorePoint::Stable(offset)) => offset,
            other => {
                return Err(Error::transition(format!(
                    "cannot commit from {}; only verified offsets are saved",
                    other
                )));
            }
        };

        let mut offsets = self.device.offsets.clone();
        offsets.memory_mhz = offset;
        let saved = OcProfile::new(&self.device.identity, &offsets).save_to(path).await?;
        self.state = OffsetState::Saved(offset);
        Ok(saved)
    }

    async fn write_offset(&mut self, offset: OffsetMhz) -> Result<()> {
        let surface = &*self.surface;
        let identity = &self.device.identity;
        let write = self.retry.invoke("set_memory_offset", move || {
            surface.set_memory_offset(identity, offset)
        });

        match tokio::time::timeout(self.apply_timeout, write).await {
            Ok(Ok(())) => {
                self.device.offsets.memory_mhz = offset;
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::watchdog(format!(
                "set_memory_offset({:+}) exceeded {:?}",
                offset, self.apply_timeout
            ))),
        }
    }
}

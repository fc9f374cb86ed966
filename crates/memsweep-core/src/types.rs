//! Core type definitions for memsweep

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Clock offset in MHz relative to the stock clock
pub type OffsetMhz = i32;

/// Identity of a physical device as seen by the control surface
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// PCI vendor id
    pub vendor_id: u16,

    /// Device index on this host
    pub index: u32,

    /// Marketing name reported by the driver
    pub name: String,

    /// PCI bus number
    pub bus_id: u32,
}

impl DeviceIdentity {
    /// Create a new device identity
    pub fn new(vendor_id: u16, index: u32, name: impl Into<String>, bus_id: u32) -> Self {
        Self {
            vendor_id,
            index,
            name: name.into(),
            bus_id,
        }
    }

    /// Stable key used for caches and session locks
    pub fn key(&self) -> String {
        format!(
            "{:04x}:{} [Bus {}] #{}",
            self.vendor_id, self.name, self.bus_id, self.index
        )
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GPU {} ({}, bus {})", self.index, self.name, self.bus_id)
    }
}

/// Driver structure-layout revision.
///
/// Offset ranges and struct layouts change with the driver, so anything learned
/// about a device is only trusted while this token is unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StructRevision {
    /// Driver version string
    pub driver_version: String,

    /// Struct layout version used by the control API
    pub layout: u32,
}

impl StructRevision {
    pub fn new(driver_version: impl Into<String>, layout: u32) -> Self {
        Self {
            driver_version: driver_version.into(),
            layout,
        }
    }
}

impl fmt::Display for StructRevision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (layout v{})", self.driver_version, self.layout)
    }
}

/// Inclusive range of memory offsets the device accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OffsetBounds {
    pub min: OffsetMhz,
    pub max: OffsetMhz,
}

impl OffsetBounds {
    pub fn new(min: OffsetMhz, max: OffsetMhz) -> Self {
        Self { min, max }
    }

    /// Check if an offset lies within the bounds
    pub fn contains(&self, offset: OffsetMhz) -> bool {
        offset >= self.min && offset <= self.max
    }

    /// Bounds are usable only when non-empty
    pub fn is_valid(&self) -> bool {
        self.min <= self.max
    }
}

impl fmt::Display for OffsetBounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:+}, {:+}] MHz", self.min, self.max)
    }
}

/// Offsets currently applied to a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceOffsets {
    /// Core clock offset in MHz
    pub core_mhz: OffsetMhz,

    /// Memory clock offset in MHz
    pub memory_mhz: OffsetMhz,

    /// Power limit as a percentage of the default limit
    pub power_limit_pct: f64,

    /// Manual fan speed; `None` means automatic control
    pub fan_pct: Option<u8>,
}

impl Default for DeviceOffsets {
    fn default() -> Self {
        Self {
            core_mhz: 0,
            memory_mhz: 0,
            power_limit_pct: 100.0,
            fan_pct: None,
        }
    }
}

/// A device under the exclusive control of one sweep session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub identity: DeviceIdentity,
    pub revision: StructRevision,
    pub bounds: OffsetBounds,
    pub offsets: DeviceOffsets,
}

impl Device {
    pub fn new(identity: DeviceIdentity, revision: StructRevision, bounds: OffsetBounds) -> Self {
        Self {
            identity,
            revision,
            bounds,
            offsets: DeviceOffsets::default(),
        }
    }
}

/// Point-in-time sensor readings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Telemetry {
    /// GPU core temperature in Celsius
    pub temperature_c: f64,

    /// Board power draw in watts
    pub power_draw_w: f64,

    /// Current graphics clock in MHz
    pub core_clock_mhz: u32,

    /// Current memory clock in MHz
    pub memory_clock_mhz: u32,
}

/// Bytes moved by one memory transfer and the device time it took
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferStats {
    pub bytes: u64,
    pub elapsed: Duration,
}

impl TransferStats {
    pub fn new(bytes: u64, elapsed: Duration) -> Self {
        Self { bytes, elapsed }
    }

    /// Accumulate another transfer into this one
    pub fn accumulate(&mut self, other: TransferStats) {
        self.bytes += other.bytes;
        self.elapsed += other.elapsed;
    }

    /// Effective bandwidth in GB/s (decimal gigabytes)
    pub fn bandwidth_gbps(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.bytes as f64 / secs / 1e9
    }
}

/// How a stability test step ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "detail")]
pub enum SampleStatus {
    /// All passes ran to completion
    Completed,
    /// The watchdog expired before the step finished
    TimedOut,
    /// The memory backend failed mid-test
    Faulted(String),
}

/// Verdict for one tested offset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Stable,
    Unstable,
}

impl Verdict {
    pub fn is_stable(&self) -> bool {
        matches!(self, Verdict::Stable)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Stable => write!(f, "stable"),
            Verdict::Unstable => write!(f, "unstable"),
        }
    }
}

/// One measurement at one offset. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StabilitySample {
    /// Memory offset the sample was taken at
    pub offset: OffsetMhz,

    /// Effective bandwidth in GB/s
    pub bandwidth_gbps: f64,

    /// Number of mismatching words found on read-back
    pub error_count: u64,

    /// Wall-clock duration of the step
    pub duration: Duration,

    /// When the step finished
    pub timestamp: DateTime<Utc>,

    /// How the step ended
    pub status: SampleStatus,

    /// Complete pattern passes over the test region
    pub passes: u32,

    /// Word addresses of the first mismatches (capped)
    pub error_addresses: Vec<u64>,

    /// Sensor readings taken right after the step
    pub telemetry: Option<Telemetry>,
}

impl StabilitySample {
    /// Tester verdict: any error or an incomplete step is unstable
    pub fn verdict(&self) -> Verdict {
        if self.status == SampleStatus::Completed && self.error_count == 0 {
            Verdict::Stable
        } else {
            Verdict::Unstable
        }
    }

    /// Whether the step ran to completion
    pub fn is_complete(&self) -> bool {
        self.status == SampleStatus::Completed
    }

    /// Attach telemetry read after the step
    pub fn with_telemetry(mut self, telemetry: Option<Telemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }
}

//! Core traits for memsweep components
//!
//! These traits define the hardware seams of a sweep: the vendor control
//! surface that applies clock offsets, and the memory backend the stability
//! tester drives. Adapters implement them for real and simulated devices.

use crate::error::DriverError;
use crate::types::{DeviceIdentity, OffsetBounds, OffsetMhz, StructRevision, Telemetry, TransferStats};
use crate::Result;
use async_trait::async_trait;

/// Result of a raw control surface call
pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// Trait for the vendor clock-control API
///
/// Every call may fail with a [`DriverError`]; callers are expected to route
/// them through a retry policy that understands transient lock contention.
#[async_trait]
pub trait ControlSurface: Send + Sync {
    /// Enumerate controllable devices
    async fn list_devices(&self) -> DriverResult<Vec<DeviceIdentity>>;

    /// Read the range of memory offsets the device accepts
    async fn get_bounds(&self, device: &DeviceIdentity) -> DriverResult<OffsetBounds>;

    /// Read the memory offset currently applied
    async fn get_memory_offset(&self, device: &DeviceIdentity) -> DriverResult<OffsetMhz>;

    /// Apply a memory clock offset
    async fn set_memory_offset(&self, device: &DeviceIdentity, offset: OffsetMhz) -> DriverResult<()>;

    /// Apply a core clock offset
    async fn set_core_offset(&self, device: &DeviceIdentity, offset: OffsetMhz) -> DriverResult<()>;

    /// Set the power limit as a percentage of default
    async fn set_power_limit(&self, device: &DeviceIdentity, percent: f64) -> DriverResult<()>;

    /// Set a manual fan speed, or return to automatic with `None`
    async fn set_fan_speed(&self, device: &DeviceIdentity, percent: Option<u8>) -> DriverResult<()>;

    /// Read current sensor values
    async fn read_telemetry(&self, device: &DeviceIdentity) -> DriverResult<Telemetry>;

    /// Read the driver version and struct layout in use
    async fn get_struct_revision(&self, device: &DeviceIdentity) -> DriverResult<StructRevision>;
}

/// Trait for the device memory exercised by the stability tester
#[async_trait]
pub trait MemoryBackend: Send + Sync {
    /// Number of 32-bit words available for testing
    fn capacity_words(&self) -> u64;

    /// Write `data` starting at word `offset`
    async fn write_words(&self, offset: u64, data: &[u32]) -> Result<TransferStats>;

    /// Fill `out` with words read starting at word `offset`
    async fn read_words(&self, offset: u64, out: &mut [u32]) -> Result<TransferStats>;
}

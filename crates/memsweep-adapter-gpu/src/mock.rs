//! Mock GPU for testing
//!
//! `MockGpu` simulates the vendor control surface and device memory of one or
//! more GPUs. Bandwidth, errors and temperature follow the model in
//! [`MockGpuConfig`]; tests can override any of them per offset and script
//! driver failures per operation.

use crate::config::{MockGpuConfig, MockOp};

use async_trait::async_trait;
use memsweep_core::{
    ControlSurface, DeviceIdentity, DeviceOffsets, DriverError, DriverResult, DriverStatus,
    MemoryBackend, OffsetBounds, OffsetMhz, Result, StructRevision, Telemetry, TransferStats,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

/// PCI vendor id reported by mock devices
pub const MOCK_VENDOR_ID: u16 = 0x10de;

/// A read at a hanging offset never completes within any sane watchdog
const HANG_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

struct MockState {
    config: MockGpuConfig,
    bounds: OffsetBounds,
    revision: StructRevision,
    offsets: HashMap<u32, DeviceOffsets>,
    history: HashMap<u32, Vec<OffsetMhz>>,
    memory: HashMap<u32, Vec<u32>>,
    calls: HashMap<MockOp, u32>,
    queued_failures: HashMap<MockOp, VecDeque<DriverStatus>>,
    sticky_failures: HashMap<MockOp, DriverStatus>,
    bandwidth_overrides: HashMap<OffsetMhz, f64>,
    error_overrides: HashMap<OffsetMhz, u64>,
    temperature_overrides: HashMap<OffsetMhz, f64>,
    hang_offsets: HashSet<OffsetMhz>,
    fault_offsets: HashSet<OffsetMhz>,
    bounds_change: Option<(u32, OffsetBounds)>,
}

impl MockState {
    fn memory_offset(&self, device: u32) -> OffsetMhz {
        self.offsets.get(&device).map(|o| o.memory_mhz).unwrap_or(0)
    }

    fn bandwidth_at(&self, offset: OffsetMhz) -> f64 {
        self.bandwidth_overrides
            .get(&offset)
            .copied()
            .unwrap_or_else(|| self.config.bandwidth_at(offset))
    }

    fn errors_at(&self, offset: OffsetMhz) -> u64 {
        self.error_overrides
            .get(&offset)
            .copied()
            .unwrap_or_else(|| self.config.errors_at(offset))
    }

    fn temperature_at(&self, offset: OffsetMhz) -> f64 {
        self.temperature_overrides
            .get(&offset)
            .copied()
            .unwrap_or_else(|| self.config.temperature_at(offset))
    }

    /// Count the call and return the scripted failure, if any
    fn check(&mut self, op: MockOp, device: Option<&DeviceIdentity>) -> DriverResult<()> {
        *self.calls.entry(op).or_insert(0) += 1;

        if let Some(status) = self.queued_failures.get_mut(&op).and_then(|q| q.pop_front()) {
            debug!("Mock {} failing with scripted {}", op.name(), status);
            return Err(DriverError::new(status, op.name()));
        }
        if let Some(status) = self.sticky_failures.get(&op) {
            return Err(DriverError::new(*status, op.name()));
        }
        if let Some(device) = device {
            if device.index >= self.config.device_count {
                return Err(DriverError::new(DriverStatus::DeviceNotFound, op.name()));
            }
        }
        Ok(())
    }
}

/// Simulated GPU implementing [`ControlSurface`]
#[derive(Clone)]
pub struct MockGpu {
    state: Arc<Mutex<MockState>>,
}

impl MockGpu {
    /// Create a new mock GPU
    pub fn new(config: MockGpuConfig) -> Self {
        info!(
            "Creating mock GPU '{}' x{} with bounds {}",
            config.device_name, config.device_count, config.bounds
        );

        let mut queued_failures: HashMap<MockOp, VecDeque<DriverStatus>> = HashMap::new();
        let mut sticky_failures = HashMap::new();
        for failure in &config.failures {
            let Some(op) = MockOp::from_name(&failure.operation) else {
                warn!("Ignoring failure scripted for unknown operation '{}'", failure.operation);
                continue;
            };
            let status = DriverStatus::from_code(failure.code);
            debug!("Mock {} scripted to fail with {}", op.name(), status);
            match failure.times {
                Some(times) => queued_failures
                    .entry(op)
                    .or_default()
                    .extend(std::iter::repeat(status).take(times as usize)),
                None => {
                    sticky_failures.insert(op, status);
                }
            }
        }

        let state = MockState {
            bounds: config.bounds,
            revision: StructRevision::new(config.driver_version.clone(), config.struct_layout),
            config,
            offsets: HashMap::new(),
            history: HashMap::new(),
            memory: HashMap::new(),
            calls: HashMap::new(),
            queued_failures,
            sticky_failures,
            bandwidth_overrides: HashMap::new(),
            error_overrides: HashMap::new(),
            temperature_overrides: HashMap::new(),
            hang_offsets: HashSet::new(),
            fault_offsets: HashSet::new(),
            bounds_change: None,
        };

        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Identity of device `index`
    pub fn identity(&self, index: u32) -> DeviceIdentity {
        let state = self.lock();
        DeviceIdentity::new(MOCK_VENDOR_ID, index, state.config.device_name.clone(), index + 1)
    }

    /// Memory backend bound to device `index`
    pub fn memory(&self, index: u32) -> MockMemory {
        MockMemory {
            state: Arc::clone(&self.state),
            device: index,
        }
    }

    /// Fail the next `times` calls of `op` with `status`
    pub fn fail_next(&self, op: MockOp, status: DriverStatus, times: u32) {
        let mut state = self.lock();
        let queue = state.queued_failures.entry(op).or_default();
        for _ in 0..times {
            queue.push_back(status);
        }
    }

    /// Fail every call of `op` with `status` until cleared
    pub fn fail_always(&self, op: MockOp, status: DriverStatus) {
        self.lock().sticky_failures.insert(op, status);
    }

    pub fn clear_failures(&self, op: MockOp) {
        let mut state = self.lock();
        state.sticky_failures.remove(&op);
        state.queued_failures.remove(&op);
    }

    /// Override the modelled bandwidth at one offset
    pub fn set_bandwidth(&self, offset: OffsetMhz, gbps: f64) {
        self.lock().bandwidth_overrides.insert(offset, gbps);
    }

    /// Override the modelled errors per pass at one offset
    pub fn inject_errors(&self, offset: OffsetMhz, per_pass: u64) {
        self.lock().error_overrides.insert(offset, per_pass);
    }

    /// Override the modelled temperature at one offset
    pub fn set_temperature(&self, offset: OffsetMhz, celsius: f64) {
        self.lock().temperature_overrides.insert(offset, celsius);
    }

    /// Reads never complete while this offset is applied
    pub fn hang_at(&self, offset: OffsetMhz) {
        self.lock().hang_offsets.insert(offset);
    }

    /// Reads fail while this offset is applied
    pub fn fault_at(&self, offset: OffsetMhz) {
        self.lock().fault_offsets.insert(offset);
    }

    pub fn set_bounds(&self, bounds: OffsetBounds) {
        self.lock().bounds = bounds;
    }

    /// Switch to `bounds` once `sets` memory offsets have been applied
    pub fn change_bounds_after(&self, sets: u32, bounds: OffsetBounds) {
        self.lock().bounds_change = Some((sets, bounds));
    }

    pub fn set_revision(&self, revision: StructRevision) {
        self.lock().revision = revision;
    }

    /// Memory offset currently applied to device `index`
    pub fn memory_offset(&self, index: u32) -> OffsetMhz {
        self.lock().memory_offset(index)
    }

    /// Every memory offset applied to device `index`, in order
    pub fn memory_offset_history(&self, index: u32) -> Vec<OffsetMhz> {
        self.lock().history.get(&index).cloned().unwrap_or_default()
    }

    pub fn offsets(&self, index: u32) -> DeviceOffsets {
        self.lock().offsets.get(&index).cloned().unwrap_or_default()
    }

    /// Number of calls made to `op`, failed ones included
    pub fn call_count(&self, op: MockOp) -> u32 {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }
}

#[async_trait]
impl ControlSurface for MockGpu {
    async fn list_devices(&self) -> DriverResult<Vec<DeviceIdentity>> {
        let count = {
            let mut state = self.lock();
            state.check(MockOp::ListDevices, None)?;
            state.config.device_count
        };
        let devices: Vec<DeviceIdentity> = (0..count).map(|i| self.identity(i)).collect();
        debug!("Discovered {} mock GPUs", devices.len());
        Ok(devices)
    }

    async fn get_bounds(&self, device: &DeviceIdentity) -> DriverResult<OffsetBounds> {
        let mut state = self.lock();
        state.check(MockOp::GetBounds, Some(device))?;
        Ok(state.bounds)
    }

    async fn get_memory_offset(&self, device: &DeviceIdentity) -> DriverResult<OffsetMhz> {
        let mut state = self.lock();
        state.check(MockOp::GetMemoryOffset, Some(device))?;
        Ok(state.memory_offset(device.index))
    }

    async fn set_memory_offset(&self, device: &DeviceIdentity, offset: OffsetMhz) -> DriverResult<()> {
        let mut state = self.lock();
        state.check(MockOp::SetMemoryOffset, Some(device))?;
        if !state.bounds.contains(offset) {
            return Err(DriverError::new(
                DriverStatus::InvalidArgument,
                MockOp::SetMemoryOffset.name(),
            ));
        }

        state.offsets.entry(device.index).or_default().memory_mhz = offset;
        state.history.entry(device.index).or_default().push(offset);
        debug!("Mock GPU {} memory offset set to {:+} MHz", device.index, offset);

        let sets = state.calls.get(&MockOp::SetMemoryOffset).copied().unwrap_or(0);
        if let Some((after, bounds)) = state.bounds_change {
            if sets >= after {
                info!("Mock GPU bounds changing to {}", bounds);
                state.bounds = bounds;
                state.bounds_change = None;
            }
        }
        Ok(())
    }

    async fn set_core_offset(&self, device: &DeviceIdentity, offset: OffsetMhz) -> DriverResult<()> {
        let mut state = self.lock();
        state.check(MockOp::SetCoreOffset, Some(device))?;
        state.offsets.entry(device.index).or_default().core_mhz = offset;
        Ok(())
    }

    async fn set_power_limit(&self, device: &DeviceIdentity, percent: f64) -> DriverResult<()> {
        let mut state = self.lock();
        state.check(MockOp::SetPowerLimit, Some(device))?;
        if !(50.0..=150.0).contains(&percent) {
            return Err(DriverError::new(
                DriverStatus::InvalidArgument,
                MockOp::SetPowerLimit.name(),
            ));
        }
        state.offsets.entry(device.index).or_default().power_limit_pct = percent;
        Ok(())
    }

    async fn set_fan_speed(&self, device: &DeviceIdentity, percent: Option<u8>) -> DriverResult<()> {
        let mut state = self.lock();
        state.check(MockOp::SetFanSpeed, Some(device))?;
        if matches!(percent, Some(p) if p > 100) {
            return Err(DriverError::new(
                DriverStatus::InvalidArgument,
                MockOp::SetFanSpeed.name(),
            ));
        }
        state.offsets.entry(device.index).or_default().fan_pct = percent;
        Ok(())
    }

    async fn read_telemetry(&self, device: &DeviceIdentity) -> DriverResult<Telemetry> {
        let mut state = self.lock();
        state.check(MockOp::ReadTelemetry, Some(device))?;
        let offsets = state.offsets.get(&device.index).cloned().unwrap_or_default();
        Ok(Telemetry {
            temperature_c: state.temperature_at(offsets.memory_mhz),
            power_draw_w: 220.0 + offsets.memory_mhz.max(0) as f64 * 0.02,
            core_clock_mhz: (1710 + offsets.core_mhz).max(0) as u32,
            memory_clock_mhz: (9501 + offsets.memory_mhz).max(0) as u32,
        })
    }

    async fn get_struct_revision(&self, device: &DeviceIdentity) -> DriverResult<StructRevision> {
        let mut state = self.lock();
        state.check(MockOp::GetStructRevision, Some(device))?;
        Ok(state.revision.clone())
    }
}

/// Device memory of one mock GPU, implementing [`MemoryBackend`]
///
/// Transfers take simulated device time derived from the bandwidth at the
/// currently applied memory offset.
#[derive(Clone)]
pub struct MockMemory {
    state: Arc<Mutex<MockState>>,
    device: u32,
}

impl MockMemory {
    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn transfer_time(bytes: u64, bandwidth_gbps: f64) -> Duration {
        Duration::from_secs_f64(bytes as f64 / (bandwidth_gbps * 1e9))
    }
}

#[async_trait]
impl MemoryBackend for MockMemory {
    fn capacity_words(&self) -> u64 {
        self.lock().config.memory_words
    }

    async fn write_words(&self, offset: u64, data: &[u32]) -> Result<TransferStats> {
        let elapsed = {
            let mut state = self.lock();
            let words = state.config.memory_words;
            let end = offset as usize + data.len();
            if end as u64 > words {
                return Err(memsweep_core::Error::memory(format!(
                    "write past end of device memory: {} > {}",
                    end, words
                )));
            }
            let applied = state.memory_offset(self.device);
            if state.fault_offsets.contains(&applied) {
                return Err(memsweep_core::Error::memory(format!(
                    "device lost at {:+} MHz",
                    applied
                )));
            }
            let bandwidth = state.bandwidth_at(applied);
            let memory = state
                .memory
                .entry(self.device)
                .or_insert_with(|| vec![0; words as usize]);
            memory[offset as usize..end].copy_from_slice(data);
            Self::transfer_time(data.len() as u64 * 4, bandwidth)
        };

        tokio::time::sleep(elapsed).await;
        Ok(TransferStats::new(data.len() as u64 * 4, elapsed))
    }

    async fn read_words(&self, offset: u64, out: &mut [u32]) -> Result<TransferStats> {
        let (elapsed, hang) = {
            let mut state = self.lock();
            let words = state.config.memory_words;
            let end = offset as usize + out.len();
            if end as u64 > words {
                return Err(memsweep_core::Error::memory(format!(
                    "read past end of device memory: {} > {}",
                    end, words
                )));
            }
            let applied = state.memory_offset(self.device);
            if state.fault_offsets.contains(&applied) {
                return Err(memsweep_core::Error::memory(format!(
                    "device lost at {:+} MHz",
                    applied
                )));
            }
            let bandwidth = state.bandwidth_at(applied);
            let errors = state.errors_at(applied);
            let hang = state.hang_offsets.contains(&applied);
            let memory = state
                .memory
                .entry(self.device)
                .or_insert_with(|| vec![0; words as usize]);
            out.copy_from_slice(&memory[offset as usize..end]);

            // Corruption lands in the first chunk so each pass reports exactly `errors`
            if offset == 0 && !out.is_empty() {
                let stride = (out.len() as u64 / errors.max(1)).max(1) as usize;
                for i in 0..errors.min(out.len() as u64) as usize {
                    let idx = i * stride;
                    out[idx] ^= 1 << (idx % 32);
                }
            }
            (Self::transfer_time(out.len() as u64 * 4, bandwidth), hang)
        };

        if hang {
            debug!("Mock GPU {} read hanging", self.device);
            tokio::time::sleep(HANG_DURATION).await;
        }
        tokio::time::sleep(elapsed).await;
        Ok(TransferStats::new(out.len() as u64 * 4, elapsed))
    }
}

//! Direct clock control outside a sweep
//!
//! Reading the current settings, applying a saved profile, resetting to
//! stock and a one-off pattern test at whatever offset is applied. Every
//! call holds the device's session lock, so none of them can interleave
//! with a running sweep.

use crate::controller::OffsetController;
use crate::lock::SessionRegistry;
use crate::patterns::BitPattern;
use crate::profile::OcProfile;
use crate::retry::RetryPolicy;
use crate::tester::{PatternTester, TestRun};
use memsweep_core::{
    Config, ControlSurface, Device, DeviceIdentity, DeviceOffsets, Error, MemoryBackend,
    OffsetBounds, OffsetMhz, Result, Telemetry,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Power limit the driver restores on reset
pub const STOCK_POWER_LIMIT_PCT: f64 = 100.0;

/// Live clock settings of one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClockStatus {
    pub device: DeviceIdentity,
    pub bounds: OffsetBounds,
    pub memory_offset_mhz: OffsetMhz,
    pub telemetry: Option<Telemetry>,
}

pub struct ClockControl {
    surface: Arc<dyn ControlSurface>,
    config: Config,
    retry: RetryPolicy,
    registry: SessionRegistry,
}

impl ClockControl {
    pub fn new(surface: Arc<dyn ControlSurface>, config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            surface,
            retry: RetryPolicy::from_config(&config.retry),
            config,
            registry: SessionRegistry::global().clone(),
        })
    }

    pub fn with_registry(mut self, registry: SessionRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub async fn status(&self, identity: &DeviceIdentity) -> Result<ClockStatus> {
        let surface = &*self.surface;
        let bounds = self
            .retry
            .invoke("get_bounds", move || surface.get_bounds(identity))
            .await?;
        let memory_offset_mhz = self
            .retry
            .invoke("get_memory_offset", move || surface.get_memory_offset(identity))
            .await?;
        let telemetry = match self
            .retry
            .invoke("read_telemetry", move || surface.read_telemetry(identity))
            .await
        {
            Ok(telemetry) => Some(telemetry),
            Err(e) => {
                warn!("Telemetry unavailable for {}: {}", identity, e);
                None
            }
        };

        Ok(ClockStatus {
            device: identity.clone(),
            bounds,
            memory_offset_mhz,
            telemetry,
        })
    }

    /// Apply `profile` to `identity`.
    ///
    /// The memory offset goes through an [`OffsetController`]; if it or any
    /// later setting fails, the memory clock is rolled back to stock before
    /// the error is returned.
    pub async fn apply_profile(
        &self,
        identity: &DeviceIdentity,
        profile: &OcProfile,
    ) -> Result<DeviceOffsets> {
        let _guard = self.registry.acquire(identity)?;
        if profile.gpu_name != identity.name {
            warn!(
                "Profile was saved for '{}', applying it to '{}'",
                profile.gpu_name, identity.name
            );
        }

        let mut controller = self.controller(identity).await?;
        controller.propose(profile.mem_offset_mhz)?;
        controller.apply().await?;

        if let Err(e) = self.apply_secondary(identity, profile).await {
            warn!("Profile only partly applied to {}, rolling back: {}", identity, e);
            controller.rollback().await?;
            return Err(e);
        }

        let offsets = DeviceOffsets {
            core_mhz: profile.core_offset_mhz,
            memory_mhz: profile.mem_offset_mhz,
            power_limit_pct: profile.power_limit_pct,
            fan_pct: profile.fan_pct,
        };
        info!(
            "Applied profile to {}: core {:+} MHz, memory {:+} MHz, power {:.0}%",
            identity, offsets.core_mhz, offsets.memory_mhz, offsets.power_limit_pct
        );
        Ok(offsets)
    }

    async fn apply_secondary(&self, identity: &DeviceIdentity, profile: &OcProfile) -> Result<()> {
        let surface = &*self.surface;
        let core = profile.core_offset_mhz;
        self.retry
            .invoke("set_core_offset", move || surface.set_core_offset(identity, core))
            .await?;
        let power = profile.power_limit_pct;
        self.retry
            .invoke("set_power_limit", move || surface.set_power_limit(identity, power))
            .await?;
        let fan = profile.fan_pct;
        self.retry
            .invoke("set_fan_speed", move || surface.set_fan_speed(identity, fan))
            .await?;
        Ok(())
    }

    /// Return every clock setting to stock.
    ///
    /// The memory clock goes first. The remaining settings are all attempted
    /// even when one fails; the first failure is returned.
    pub async fn reset(&self, identity: &DeviceIdentity) -> Result<()> {
        let _guard = self.registry.acquire(identity)?;
        let mut controller = self.controller(identity).await?;
        controller.reset_to_stock().await?;

        let surface = &*self.surface;
        let results = [
            self.retry
                .invoke("set_core_offset", move || surface.set_core_offset(identity, 0))
                .await,
            self.retry
                .invoke("set_power_limit", move || {
                    surface.set_power_limit(identity, STOCK_POWER_LIMIT_PCT)
                })
                .await,
            self.retry
                .invoke("set_fan_speed", move || surface.set_fan_speed(identity, None))
                .await,
        ];

        let mut first_error = None;
        for result in results {
            if let Err(e) = result {
                warn!("Reset of {} incomplete: {}", identity, e);
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => {
                info!("Reset {} to stock", identity);
                Ok(())
            }
        }
    }

    /// One pattern test at the offset currently applied to `identity`
    pub async fn memtest(
        &self,
        identity: &DeviceIdentity,
        backend: Arc<dyn MemoryBackend>,
        cancel: &CancellationToken,
    ) -> Result<TestRun> {
        let _guard = self.registry.acquire(identity)?;
        let surface = &*self.surface;
        let offset = self
            .retry
            .invoke("get_memory_offset", move || surface.get_memory_offset(identity))
            .await?;

        let patterns =
            BitPattern::parse_list(&self.config.tester.patterns, self.config.tester.random_seed)?;
        let sweep = &self.config.sweep;
        let tester = PatternTester::new(backend, &self.config.tester, sweep.watchdog_timeout());
        info!("Testing memory of {} at {:+} MHz", identity, offset);

        let run = tester.run(offset, sweep.step_duration(), &patterns, cancel).await;
        let run = match run {
            TestRun::Sample(sample) => {
                let telemetry = self
                    .retry
                    .invoke("read_telemetry", move || surface.read_telemetry(identity))
                    .await
                    .ok();
                TestRun::Sample(sample.with_telemetry(telemetry))
            }
            TestRun::Cancelled => TestRun::Cancelled,
        };
        Ok(run)
    }

    /// A controller over `identity` with freshly read bounds
    async fn controller(&self, identity: &DeviceIdentity) -> Result<OffsetController> {
        let surface = &*self.surface;
        let revision = self
            .retry
            .invoke("get_struct_revision", move || surface.get_struct_revision(identity))
            .await?;
        let bounds = self
            .retry
            .invoke("get_bounds", move || surface.get_bounds(identity))
            .await?;
        if !bounds.is_valid() {
            return Err(Error::Other(anyhow::anyhow!(
                "driver reported empty offset bounds {}",
                bounds
            )));
        }

        Ok(OffsetController::new(
            Arc::clone(&self.surface),
            Device::new(identity.clone(), revision, bounds),
            self.retry.clone(),
            self.config.safety.apply_timeout(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memsweep_adapter_gpu::{MockGpu, MockGpuConfig, MockOp};
    use memsweep_core::{DriverStatus, Verdict};

    fn gpu() -> MockGpu {
        MockGpu::new(
            MockGpuConfig::flat(100.0, OffsetBounds::new(-500, 1000)).with_memory_words(16 * 1024),
        )
    }

    fn control(gpu: &MockGpu) -> ClockControl {
        let mut config = Config::default();
        config.sweep.step_duration_ms = 5;
        config.sweep.watchdog_timeout_ms = 1_000;
        config.tester.region_bytes = 64 * 1024;
        config.tester.chunk_bytes = 16 * 1024;
        ClockControl::new(Arc::new(gpu.clone()), config)
            .unwrap()
            .with_registry(SessionRegistry::new())
    }

    fn profile(gpu: &MockGpu, memory_mhz: OffsetMhz) -> OcProfile {
        let offsets = DeviceOffsets {
            core_mhz: 120,
            memory_mhz,
            power_limit_pct: 110.0,
            fan_pct: Some(70),
        };
        OcProfile::new(&gpu.identity(0), &offsets)
    }

    #[tokio::test]
    async fn test_apply_profile_sets_every_clock() {
        let gpu = gpu();
        let applied = control(&gpu)
            .apply_profile(&gpu.identity(0), &profile(&gpu, 600))
            .await
            .unwrap();

        assert_eq!(applied.memory_mhz, 600);
        let offsets = gpu.offsets(0);
        assert_eq!(offsets.memory_mhz, 600);
        assert_eq!(offsets.core_mhz, 120);
        assert_eq!(offsets.power_limit_pct, 110.0);
        assert_eq!(offsets.fan_pct, Some(70));
    }

    #[tokio::test(start_paused = true)]
    async fn test_apply_profile_survives_contention() {
        let gpu = gpu();
        gpu.fail_next(MockOp::SetMemoryOffset, DriverStatus::InvalidUserPrivilege, 2);
        control(&gpu)
            .apply_profile(&gpu.identity(0), &profile(&gpu, 400))
            .await
            .unwrap();

        assert_eq!(gpu.memory_offset(0), 400);
        assert_eq!(gpu.call_count(MockOp::SetMemoryOffset), 3);
    }

    #[tokio::test]
    async fn test_out_of_bounds_profile_touches_nothing() {
        let gpu = gpu();
        let err = control(&gpu)
            .apply_profile(&gpu.identity(0), &profile(&gpu, 1500))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::OutOfBoundsOffset { offset: 1500, .. }));
        assert_eq!(gpu.call_count(MockOp::SetMemoryOffset), 0);
        assert_eq!(gpu.call_count(MockOp::SetCoreOffset), 0);
    }

    #[tokio::test]
    async fn test_partial_profile_rolls_memory_back() {
        let gpu = gpu();
        gpu.fail_always(MockOp::SetPowerLimit, DriverStatus::NotSupported);
        let err = control(&gpu)
            .apply_profile(&gpu.identity(0), &profile(&gpu, 600))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::PermanentDriver(_)));
        assert_eq!(gpu.memory_offset_history(0), vec![600, 0]);
        assert_eq!(gpu.memory_offset(0), 0);
    }

    #[tokio::test]
    async fn test_reset_restores_stock() {
        let gpu = gpu();
        let control = control(&gpu);
        let identity = gpu.identity(0);
        control.apply_profile(&identity, &profile(&gpu, 600)).await.unwrap();

        control.reset(&identity).await.unwrap();
        assert_eq!(gpu.offsets(0), DeviceOffsets::default());

        let status = control.status(&identity).await.unwrap();
        assert_eq!(status.memory_offset_mhz, 0);
        assert_eq!(status.bounds, OffsetBounds::new(-500, 1000));
        assert!(status.telemetry.is_some());
    }

    #[tokio::test]
    async fn test_reset_attempts_every_setting() {
        let gpu = gpu();
        gpu.fail_always(MockOp::SetCoreOffset, DriverStatus::NotSupported);
        let err = control(&gpu).reset(&gpu.identity(0)).await.unwrap_err();

        assert!(matches!(err, Error::PermanentDriver(_)));
        assert_eq!(gpu.call_count(MockOp::SetPowerLimit), 1);
        assert_eq!(gpu.call_count(MockOp::SetFanSpeed), 1);
        assert_eq!(gpu.memory_offset(0), 0);
    }

    #[tokio::test]
    async fn test_reset_refused_while_device_busy() {
        let gpu = gpu();
        let registry = SessionRegistry::new();
        let control = control(&gpu).with_registry(registry.clone());
        let _sweep = registry.acquire(&gpu.identity(0)).unwrap();

        let err = control.reset(&gpu.identity(0)).await.unwrap_err();
        assert!(matches!(err, Error::SessionBusy(_)));
        assert_eq!(gpu.call_count(MockOp::SetMemoryOffset), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_memtest_at_current_offset() {
        let gpu = gpu();
        let identity = gpu.identity(0);
        gpu.set_memory_offset(&identity, 300).await.unwrap();
        gpu.inject_errors(300, 2);

        let run = control(&gpu)
            .memtest(&identity, Arc::new(gpu.memory(0)), &CancellationToken::new())
            .await
            .unwrap();
        match run {
            TestRun::Sample(sample) => {
                assert_eq!(sample.offset, 300);
                assert!(sample.error_count > 0);
                assert_eq!(sample.verdict(), Verdict::Unstable);
                assert!(sample.telemetry.is_some());
            }
            TestRun::Cancelled => panic!("memtest was not cancelled"),
        }
        // testing never changes the clocks
        assert_eq!(gpu.memory_offset_history(0), vec![300]);
    }
}

//! Sweep orchestrator
//!
//! Drives one sweep session per device: discover (or reuse cached) bounds, then
//! propose, apply, settle, test, read telemetry and judge each offset until
//! the cliff, the upper bound or an external stop. Whatever happens, the
//! device ends at a verified stable offset or at stock, or the failure is
//! reported as a safety violation.

use crate::cache::{CapabilityCache, CapabilityCacheEntry, Lookup, Validation};
use crate::cliff::{CliffDetector, Decision};
use crate::controller::{OffsetController, OffsetState};
use crate::lock::SessionRegistry;
use crate::patterns::BitPattern;
use crate::retry::RetryPolicy;
use crate::session::{SessionOutcome, StopReason, SweepReport, SweepSession};
use crate::tester::{PatternTester, TestRun};
use memsweep_adapter_gpu::{DeviceHealth, HealthThresholds};
use memsweep_core::{
    Config, ControlSurface, Device, DeviceIdentity, Error, MemoryBackend, OffsetBounds, OffsetMhz,
    Result, StructRevision, Telemetry, Verdict,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A hard failure, with the report of everything measured before it
#[derive(Debug, thiserror::Error)]
#[error("sweep failed: {error}")]
pub struct SweepFailure {
    #[source]
    pub error: Error,
    pub report: SweepReport,
}

/// What discovery learned about the device
#[derive(Debug, Clone)]
struct Discovery {
    revision: StructRevision,
    bounds: OffsetBounds,
    last_known_good: Option<OffsetMhz>,
}

/// The planned range of one session
#[derive(Debug, Clone, Copy)]
struct Plan {
    bounds: OffsetBounds,
    start: OffsetMhz,
    upper: OffsetMhz,
    start_from_cache: bool,
}

pub struct SweepOrchestrator {
    surface: Arc<dyn ControlSurface>,
    backend: Arc<dyn MemoryBackend>,
    config: Config,
    retry: RetryPolicy,
    patterns: Vec<BitPattern>,
    cache: Option<Mutex<CapabilityCache>>,
    registry: SessionRegistry,
    profile_path: Option<PathBuf>,
}

impl SweepOrchestrator {
    pub fn new(
        surface: Arc<dyn ControlSurface>,
        backend: Arc<dyn MemoryBackend>,
        config: Config,
    ) -> Result<Self> {
        config.validate()?;
        let patterns = BitPattern::parse_list(&config.tester.patterns, config.tester.random_seed)?;
        Ok(Self {
            surface,
            backend,
            retry: RetryPolicy::from_config(&config.retry),
            patterns,
            config,
            cache: None,
            registry: SessionRegistry::global().clone(),
            profile_path: None,
        })
    }

    /// Consult and update `cache` around every session
    pub fn with_cache(mut self, cache: CapabilityCache) -> Self {
        self.cache = Some(Mutex::new(cache));
        self
    }

    pub fn with_registry(mut self, registry: SessionRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Save the recommended offset as a profile at `path` when done
    pub fn with_profile_output(mut self, path: impl Into<PathBuf>) -> Self {
        self.profile_path = Some(path.into());
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run one sweep session against `identity`
    pub async fn run(
        &self,
        identity: &DeviceIdentity,
        cancel: CancellationToken,
    ) -> std::result::Result<SweepReport, SweepFailure> {
        let mut session = SweepSession::new(identity.clone(), &self.config.sweep);

        let _guard = match self.registry.acquire(identity) {
            Ok(guard) => guard,
            Err(e) => return Err(Self::untouched_failure(session, e)),
        };
        info!("Starting sweep session {} on {}", session.id(), identity);

        let discovery = match self.discover(identity).await {
            Ok(discovery) => discovery,
            Err(e) => return Err(Self::untouched_failure(session, e)),
        };
        let plan = match self.plan(&discovery) {
            Ok(plan) => plan,
            Err(e) => return Err(Self::untouched_failure(session, e)),
        };
        session.plan(discovery.revision.clone(), discovery.bounds, plan.start, plan.upper);
        info!(
            "Sweeping {} from {:+} to {:+} MHz in {} MHz steps (bounds {})",
            identity, plan.start, plan.upper, self.config.sweep.step_mhz, plan.bounds
        );

        let device = Device::new(identity.clone(), discovery.revision, discovery.bounds);
        let mut controller = OffsetController::new(
            Arc::clone(&self.surface),
            device,
            self.retry.clone(),
            self.config.safety.apply_timeout(),
        );

        if let Err(e) = self.ensure_stock(&mut controller).await {
            return Err(self.abort(session, controller, e).await);
        }

        match self.drive(&mut session, &mut controller, &plan, &cancel).await {
            Ok(reason) => self.finish(session, controller, &plan, reason).await,
            Err(e) => Err(self.abort(session, controller, e).await),
        }
    }

    /// Read revision and bounds, from the cache when it is still valid
    async fn discover(&self, identity: &DeviceIdentity) -> Result<Discovery> {
        let surface = &*self.surface;
        let revision = self
            .retry
            .invoke("get_struct_revision", move || surface.get_struct_revision(identity))
            .await?;

        if let Some(cache) = &self.cache {
            let mut cache = cache.lock().await;
            match cache.lookup(identity) {
                Lookup::Hit(entry) => match CapabilityCache::validate(&entry, &revision) {
                    Validation::Valid => {
                        info!("Using cached capabilities for {} ({})", identity, entry.bounds);
                        return Ok(Discovery {
                            revision,
                            bounds: entry.bounds,
                            last_known_good: entry.last_known_good,
                        });
                    }
                    Validation::Stale { cached, current } => {
                        info!(
                            "Cached capabilities of {} are stale ({} -> {}), reading them again",
                            identity, cached, current
                        );
                        if let Err(e) = cache.invalidate(identity).await {
                            warn!("Could not invalidate device cache entry: {}", e);
                        }
                    }
                },
                Lookup::Miss => debug!("No cached capabilities for {}", identity),
            }
        }

        let started = Instant::now();
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
        let discovery_time_ms = started.elapsed().as_millis() as u64;

        if let Some(cache) = &self.cache {
            let entry =
                CapabilityCacheEntry::new(identity.clone(), revision.clone(), bounds, discovery_time_ms);
            if let Err(e) = cache.lock().await.store(entry).await {
                warn!("Could not write device cache: {}", e);
            }
        }

        Ok(Discovery {
            revision,
            bounds,
            last_known_good: None,
        })
    }

    fn plan(&self, discovery: &Discovery) -> Result<Plan> {
        let sweep = &self.config.sweep;
        let bounds = discovery.bounds;
        let upper = sweep.max_offset.min(bounds.max);
        if upper < bounds.min {
            return Err(Error::config(format!(
                "max offset {:+} is below the device minimum {:+}",
                sweep.max_offset, bounds.min
            )));
        }

        let start_from_cache = sweep.start_offset.is_none() && discovery.last_known_good.is_some();
        let requested = sweep.start_offset.or(discovery.last_known_good).unwrap_or(0);
        let start = requested.clamp(bounds.min, upper);
        if start != requested {
            warn!(
                "Start offset {:+} MHz clamped to {:+} MHz by device bounds",
                requested, start
            );
        }

        Ok(Plan {
            bounds,
            start,
            upper,
            start_from_cache,
        })
    }

    /// The controller assumes stock; make the hardware agree
    async fn ensure_stock(&self, controller: &mut OffsetController) -> Result<()> {
        let surface = &*self.surface;
        let identity = &controller.device().identity;
        let current = self
            .retry
            .invoke("get_memory_offset", move || surface.get_memory_offset(identity))
            .await;

        match current {
            Ok(0) => Ok(()),
            Ok(offset) => {
                warn!("Device starts at {:+} MHz, resetting to stock first", offset);
                controller.reset_to_stock().await
            }
            Err(e) => {
                warn!("Could not read current memory offset ({}), resetting to stock", e);
                controller.reset_to_stock().await
            }
        }
    }

    async fn drive(
        &self,
        session: &mut SweepSession,
        controller: &mut OffsetController,
        plan: &Plan,
        cancel: &CancellationToken,
    ) -> Result<StopReason> {
        let sweep = &self.config.sweep;
        let tester = PatternTester::new(
            Arc::clone(&self.backend),
            &self.config.tester,
            sweep.watchdog_timeout(),
        );
        let mut detector = CliffDetector::from_config(sweep);
        let safety = &self.config.safety;
        let thresholds = HealthThresholds::with_limits(safety.thermal_limit_c, safety.power_limit_w);
        let identity = controller.device().identity.clone();
        let deadline = Instant::now() + sweep.max_session();

        let mut offset = plan.start;
        let mut step_index = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Ok(StopReason::Cancelled);
            }
            if Instant::now() >= deadline {
                return Ok(StopReason::SessionTimeLimit);
            }
            let interval = sweep.bounds_check_interval;
            if interval > 0 && step_index > 0 && step_index % interval == 0 {
                self.check_bounds(&identity, plan.bounds).await?;
            }

            controller.propose(offset)?;
            controller.apply().await?;

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(StopReason::Cancelled),
                _ = tokio::time::sleep(sweep.settle()) => {}
            }

            let sample = match tester
                .run(offset, sweep.step_duration(), &self.patterns, cancel)
                .await
            {
                TestRun::Sample(sample) => sample,
                TestRun::Cancelled => return Ok(StopReason::Cancelled),
            };
            let telemetry = self.read_telemetry(&identity).await;
            let sample = sample.with_telemetry(telemetry.clone());

            let mut decision = detector.observe(&sample);
            session.set_first_regression(detector.first_regression());
            if decision == Decision::Continue {
                if let Some(reason) = Self::health_stop(telemetry.as_ref(), &thresholds) {
                    warn!("{} at {:+} MHz: {}, stopping", identity, offset, reason);
                    decision = Decision::Stop(reason);
                }
            }

            let verdict = match decision {
                Decision::Continue => Verdict::Stable,
                Decision::Stop(_) => Verdict::Unstable,
            };
            info!(
                "{:+} MHz: {:.2} GB/s, {} errors, {} passes -> {}",
                offset, sample.bandwidth_gbps, sample.error_count, sample.passes, verdict
            );
            session.push(sample, verdict);
            controller.record(verdict)?;

            if let Decision::Stop(reason) = decision {
                info!("Stopping sweep of {}: {}", identity, reason);
                return Ok(reason);
            }
            if offset >= plan.upper {
                return Ok(StopReason::UpperBoundReached);
            }

            offset = next_offset(offset, sweep.step_mhz, plan.upper);
            step_index += 1;
        }
    }

    async fn check_bounds(&self, identity: &DeviceIdentity, expected: OffsetBounds) -> Result<()> {
        let surface = &*self.surface;
        let current = self
            .retry
            .invoke("get_bounds", move || surface.get_bounds(identity))
            .await?;
        if current != expected {
            warn!(
                "Bounds of {} changed mid-session: {} -> {}",
                identity, expected, current
            );
            return Err(Error::bounds_changed(format!(
                "expected {}, driver now reports {}",
                expected, current
            )));
        }
        Ok(())
    }

    async fn read_telemetry(&self, identity: &DeviceIdentity) -> Option<Telemetry> {
        let surface = &*self.surface;
        match self
            .retry
            .invoke("read_telemetry", move || surface.read_telemetry(identity))
            .await
        {
            Ok(telemetry) => Some(telemetry),
            Err(e) => {
                warn!("Telemetry unavailable for {}: {}", identity, e);
                None
            }
        }
    }

    /// A critical health check ends the sweep; heat wins over power
    fn health_stop(
        telemetry: Option<&Telemetry>,
        thresholds: &HealthThresholds,
    ) -> Option<StopReason> {
        let telemetry = telemetry?;
        let health = DeviceHealth::from_telemetry(telemetry, thresholds);
        debug!("Health score {:.0}", health.score);
        if health.has_warnings() {
            warn!("Device health: {}", health.messages().join("; "));
        }
        if !health.is_critical() {
            return None;
        }
        if health.check_is_critical("temperature") {
            Some(StopReason::ThermalLimit {
                temperature_c: telemetry.temperature_c,
            })
        } else {
            Some(StopReason::PowerLimit {
                power_draw_w: telemetry.power_draw_w,
            })
        }
    }

    async fn finish(
        &self,
        session: SweepSession,
        mut controller: OffsetController,
        plan: &Plan,
        stop_reason: StopReason,
    ) -> std::result::Result<SweepReport, SweepFailure> {
        if !matches!(controller.state(), OffsetState::Stable(_)) {
            if let Err(e) = controller.rollback().await {
                return Err(Self::failure(session, &controller, Some(stop_reason), e));
            }
        }

        let mut profile_path = None;
        if let Some(path) = &self.profile_path {
            if controller.last_stable().is_some() {
                match controller.commit(path).await {
                    Ok(saved) => profile_path = Some(saved),
                    Err(e) => warn!("Could not save profile: {}", e),
                }
            } else {
                warn!("No stable offset found, profile not saved");
            }
        }

        let stable = controller.stable_token();
        if self.config.safety.restore_stock_on_exit {
            if let Err(e) = controller.reset_to_stock().await {
                return Err(Self::failure(session, &controller, Some(stop_reason), e));
            }
        }

        if let Some(cache) = &self.cache {
            let identity = &controller.device().identity;
            let mut cache = cache.lock().await;
            let result = match stable {
                Some(stable) => cache.update_last_known_good(identity, stable).await,
                None if plan.start_from_cache => {
                    info!("Cached last-known-good of {} no longer passes, forgetting it", identity);
                    cache.forget_last_known_good(identity).await
                }
                None => Ok(()),
            };
            if let Err(e) = result {
                warn!("Could not update device cache: {}", e);
            }
        }

        let report = session.finish(SessionOutcome {
            stop_reason: Some(stop_reason),
            recommended_offset: controller.last_stable(),
            final_state: Some(controller.state()),
            profile_path,
            hard_failure: None,
        });
        match report.recommended_offset {
            Some(offset) => info!(
                "Sweep of {} finished ({}), recommended memory offset {:+} MHz",
                report.device,
                report.stop_reason.as_ref().map(|r| r.to_string()).unwrap_or_default(),
                offset
            ),
            None => warn!("Sweep of {} finished without a stable offset", report.device),
        }
        Ok(report)
    }

    /// Return the device to safety after a hard failure and build the report
    async fn abort(
        &self,
        session: SweepSession,
        mut controller: OffsetController,
        mut error: Error,
    ) -> SweepFailure {
        let stop_reason = match error {
            Error::BoundsChanged(_) => Some(StopReason::BoundsChanged),
            _ => None,
        };

        if stop_reason.is_some() {
            if let Some(cache) = &self.cache {
                if let Err(e) = cache.lock().await.invalidate(&controller.device().identity).await {
                    warn!("Could not invalidate device cache entry: {}", e);
                }
            }
        }

        if !error.is_safety_critical() && !controller.state().is_safe() {
            if let Err(rollback_error) = controller.rollback().await {
                error = rollback_error;
            }
        }
        if !error.is_safety_critical() && self.config.safety.restore_stock_on_exit {
            if let Err(reset_error) = controller.reset_to_stock().await {
                error = reset_error;
            }
        }

        Self::failure(session, &controller, stop_reason, error)
    }

    fn failure(
        session: SweepSession,
        controller: &OffsetController,
        stop_reason: Option<StopReason>,
        error: Error,
    ) -> SweepFailure {
        error!(
            "Sweep of {} failed in state {}: {}",
            controller.device().identity,
            controller.state(),
            error
        );
        let report = session.finish(SessionOutcome {
            stop_reason,
            recommended_offset: controller.last_stable(),
            final_state: Some(controller.state()),
            profile_path: None,
            hard_failure: Some(error.to_string()),
        });
        SweepFailure { error, report }
    }

    fn untouched_failure(session: SweepSession, error: Error) -> SweepFailure {
        error!("Sweep could not start: {}", error);
        let report = session.finish(SessionOutcome {
            stop_reason: None,
            recommended_offset: None,
            final_state: None,
            profile_path: None,
            hard_failure: Some(error.to_string()),
        });
        SweepFailure { error, report }
    }
}

/// Advance by `step` without wrapping, never past `upper`
fn next_offset(offset: OffsetMhz, step: u32, upper: OffsetMhz) -> OffsetMhz {
    let step = OffsetMhz::try_from(step).unwrap_or(OffsetMhz::MAX);
    offset.saturating_add(step).min(upper)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::RestorePoint;
    use crate::profile::OcProfile;
    use crate::session::CliffCause;
    use memsweep_adapter_gpu::{MockGpu, MockGpuConfig, MockOp};
    use memsweep_core::{DriverStatus, SampleStatus};
    use std::time::Duration;
    use tempfile::TempDir;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.sweep.max_offset = 2000;
        config.sweep.step_mhz = 50;
        config.sweep.step_duration_ms = 5;
        config.sweep.watchdog_timeout_ms = 1_000;
        config.sweep.settle_ms = 10;
        config.tester.region_bytes = 64 * 1024;
        config.tester.chunk_bytes = 16 * 1024;
        config
    }

    fn flat_gpu() -> MockGpu {
        MockGpu::new(
            MockGpuConfig::flat(100.0, OffsetBounds::new(0, 2000)).with_memory_words(16 * 1024),
        )
    }

    fn orchestrator(gpu: &MockGpu, config: Config) -> SweepOrchestrator {
        SweepOrchestrator::new(Arc::new(gpu.clone()), Arc::new(gpu.memory(0)), config)
            .unwrap()
            .with_registry(SessionRegistry::new())
    }

    async fn sweep(gpu: &MockGpu, config: Config) -> SweepReport {
        orchestrator(gpu, config)
            .run(&gpu.identity(0), CancellationToken::new())
            .await
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_bandwidth_cliff_scenario() {
        let gpu = MockGpu::new(
            MockGpuConfig::flat(100.0, OffsetBounds::new(0, 2000))
                .with_memory_words(16 * 1024)
                .with_cliff(550, 0.7),
        );
        let report = sweep(&gpu, test_config()).await;

        assert_eq!(report.recommended_offset, Some(500));
        assert_eq!(report.samples.len(), 12);
        assert_eq!(report.verdicts.len(), 12);
        assert!(report.verdicts[..11].iter().all(|v| v.is_stable()));
        assert_eq!(report.verdicts[11], Verdict::Unstable);
        assert!(matches!(
            report.stop_reason,
            Some(StopReason::CliffDetected(CliffCause::BandwidthDrop { offset: 550, .. }))
        ));
        assert_eq!(
            report.final_state,
            Some(OffsetState::RolledBack(RestorePoint::Stable(500)))
        );
        assert_eq!(gpu.memory_offset(0), 500);
        assert_eq!(report.first_error_offset, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_data_error_scenario() {
        let gpu = flat_gpu();
        gpu.set_bandwidth(300, 99.0);
        gpu.inject_errors(300, 3);
        let report = sweep(&gpu, test_config()).await;

        assert_eq!(report.recommended_offset, Some(250));
        assert_eq!(
            report.stop_reason,
            Some(StopReason::CliffDetected(CliffCause::DataErrors {
                offset: 300,
                count: 3
            }))
        );
        assert_eq!(report.first_error_offset, Some(300));
        assert_eq!(gpu.memory_offset(0), 250);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hang_scenario() {
        let gpu = flat_gpu();
        gpu.hang_at(400);
        let report = sweep(&gpu, test_config()).await;

        assert_eq!(report.recommended_offset, Some(350));
        assert_eq!(report.stop_reason, Some(StopReason::WatchdogTimeout));
        let last = report.samples.last().unwrap();
        assert_eq!(last.offset, 400);
        assert_eq!(last.status, SampleStatus::TimedOut);
        assert_eq!(gpu.memory_offset(0), 350);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_contention_scenario() {
        let gpu = flat_gpu();
        gpu.set_bandwidth(200, 50.0);
        gpu.fail_next(MockOp::SetMemoryOffset, DriverStatus::InvalidUserPrivilege, 2);
        let report = sweep(&gpu, test_config()).await;

        assert!(report.is_success());
        assert_eq!(report.samples[0].offset, 0);
        assert_eq!(report.recommended_offset, Some(150));
        // two contended calls, then the five applies and one rollback
        assert_eq!(gpu.call_count(MockOp::SetMemoryOffset), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_upper_bound_with_clamped_last_step() {
        let gpu = flat_gpu();
        let mut config = test_config();
        config.sweep.step_mhz = 75;
        config.sweep.max_offset = 200;
        let report = sweep(&gpu, config).await;

        let offsets: Vec<OffsetMhz> = report.samples.iter().map(|s| s.offset).collect();
        assert_eq!(offsets, vec![0, 75, 150, 200]);
        assert_eq!(report.stop_reason, Some(StopReason::UpperBoundReached));
        assert_eq!(report.final_state, Some(OffsetState::Stable(200)));
        assert_eq!(report.recommended_offset, Some(200));
        assert_eq!(report.upper_bound, 200);
    }

    #[tokio::test(start_paused = true)]
    async fn test_upper_bound_limited_by_device() {
        let gpu = MockGpu::new(
            MockGpuConfig::flat(100.0, OffsetBounds::new(0, 100)).with_memory_words(16 * 1024),
        );
        let report = sweep(&gpu, test_config()).await;
        assert_eq!(report.upper_bound, 100);
        assert_eq!(report.recommended_offset, Some(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_leaves_device_safe() {
        let gpu = flat_gpu();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            trigger.cancel();
        });

        let report = orchestrator(&gpu, test_config())
            .run(&gpu.identity(0), cancel)
            .await
            .unwrap();

        assert_eq!(report.stop_reason, Some(StopReason::Cancelled));
        assert!(report.final_state.map(|s| s.is_safe()).unwrap_or(false));
        assert_eq!(gpu.memory_offset(0), report.recommended_offset.unwrap_or(0));
        assert!(report.samples.len() < 40);
    }

    #[tokio::test(start_paused = true)]
    async fn test_thermal_limit_stops() {
        let gpu = flat_gpu();
        gpu.set_temperature(200, 95.0);
        let report = sweep(&gpu, test_config()).await;

        assert!(matches!(
            report.stop_reason,
            Some(StopReason::ThermalLimit { temperature_c }) if temperature_c == 95.0
        ));
        assert_eq!(report.recommended_offset, Some(150));
        assert_eq!(gpu.memory_offset(0), 150);
        assert!(report.samples.last().unwrap().telemetry.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_power_limit_stops() {
        // the mock draws 220 W plus 0.02 W per MHz of memory offset
        let gpu = flat_gpu();
        let mut config = test_config();
        config.safety.power_limit_w = 224.5;
        let report = sweep(&gpu, config).await;

        assert!(matches!(
            report.stop_reason,
            Some(StopReason::PowerLimit { power_draw_w }) if power_draw_w > 224.5
        ));
        assert_eq!(report.recommended_offset, Some(200));
        assert_eq!(gpu.memory_offset(0), 200);
    }

    #[test]
    fn test_next_offset_never_wraps() {
        assert_eq!(next_offset(0, 50, 2000), 50);
        assert_eq!(next_offset(1950, 75, 2000), 2000);
        assert_eq!(next_offset(0, 3_000_000_000, 2000), 2000);
        assert_eq!(next_offset(i32::MAX - 10, 50, i32::MAX), i32::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_time_limit() {
        let gpu = flat_gpu();
        let mut config = test_config();
        config.sweep.max_session_ms = 150;
        let report = sweep(&gpu, config).await;

        assert_eq!(report.stop_reason, Some(StopReason::SessionTimeLimit));
        assert!(report.final_state.map(|s| s.is_safe()).unwrap_or(false));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounds_change_aborts_and_invalidates() {
        let dir = TempDir::new().unwrap();
        let cache_path = dir.path().join("device_cache.json");
        let gpu = flat_gpu();
        gpu.change_bounds_after(3, OffsetBounds::new(0, 1000));

        let mut config = test_config();
        config.sweep.bounds_check_interval = 2;
        let failure = orchestrator(&gpu, config)
            .with_cache(CapabilityCache::open(&cache_path))
            .run(&gpu.identity(0), CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(failure.error, Error::BoundsChanged(_)));
        assert_eq!(failure.report.stop_reason, Some(StopReason::BoundsChanged));
        assert_eq!(failure.report.samples.len(), 4);
        assert_eq!(failure.report.recommended_offset, Some(150));
        assert_eq!(gpu.memory_offset(0), 150);
        assert_eq!(
            CapabilityCache::open(&cache_path).lookup(&gpu.identity(0)),
            Lookup::Miss
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_skips_discovery_and_resumes_from_last_known_good() {
        let dir = TempDir::new().unwrap();
        let cache_path = dir.path().join("device_cache.json");
        let gpu = MockGpu::new(
            MockGpuConfig::flat(100.0, OffsetBounds::new(0, 2000))
                .with_memory_words(16 * 1024)
                .with_cliff(550, 0.7),
        );

        let first = orchestrator(&gpu, test_config())
            .with_cache(CapabilityCache::open(&cache_path))
            .run(&gpu.identity(0), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(first.recommended_offset, Some(500));
        assert_eq!(gpu.call_count(MockOp::GetBounds), 1);

        let second = orchestrator(&gpu, test_config())
            .with_cache(CapabilityCache::open(&cache_path))
            .run(&gpu.identity(0), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(gpu.call_count(MockOp::GetBounds), 1);
        assert_eq!(second.start_offset, 500);
        assert_eq!(second.samples.len(), 2);
        assert_eq!(second.recommended_offset, Some(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_cache_is_rediscovered() {
        let dir = TempDir::new().unwrap();
        let cache_path = dir.path().join("device_cache.json");
        let gpu = flat_gpu();
        let mut config = test_config();
        config.sweep.max_offset = 100;

        sweep_with_cache(&gpu, config.clone(), &cache_path).await;
        gpu.set_revision(StructRevision::new("560.70", 2));
        let report = sweep_with_cache(&gpu, config, &cache_path).await;

        assert_eq!(gpu.call_count(MockOp::GetBounds), 2);
        assert_eq!(report.start_offset, 0);
        match CapabilityCache::open(&cache_path).lookup(&gpu.identity(0)) {
            Lookup::Hit(entry) => assert_eq!(entry.revision.driver_version, "560.70"),
            Lookup::Miss => panic!("expected a fresh cache entry"),
        }
    }

    async fn sweep_with_cache(gpu: &MockGpu, config: Config, path: &std::path::Path) -> SweepReport {
        orchestrator(gpu, config)
            .with_cache(CapabilityCache::open(path))
            .run(&gpu.identity(0), CancellationToken::new())
            .await
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_busy() {
        let gpu = flat_gpu();
        let registry = SessionRegistry::new();
        let _held = registry.acquire(&gpu.identity(0)).unwrap();

        let failure = orchestrator(&gpu, test_config())
            .with_registry(registry)
            .run(&gpu.identity(0), CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(failure.error, Error::SessionBusy(_)));
        assert!(failure.report.samples.is_empty());
        assert_eq!(failure.report.final_state, None);
        assert!(gpu.memory_offset_history(0).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_apply_failure_is_hard_failure() {
        let gpu = flat_gpu();
        gpu.fail_next(MockOp::SetMemoryOffset, DriverStatus::InvalidArgument, 1);

        let failure = orchestrator(&gpu, test_config())
            .run(&gpu.identity(0), CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(failure.error, Error::ApplyFailed { offset: 0, .. }));
        assert_eq!(
            failure.report.final_state,
            Some(OffsetState::RolledBack(RestorePoint::Stock))
        );
        assert!(failure.report.hard_failure.is_some());
        assert_eq!(gpu.memory_offset(0), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_rollback_is_safety_violation() {
        let gpu = flat_gpu();
        gpu.fail_always(MockOp::SetMemoryOffset, DriverStatus::DeviceRemoved);

        let failure = orchestrator(&gpu, test_config())
            .run(&gpu.identity(0), CancellationToken::new())
            .await
            .unwrap_err();

        assert!(failure.error.is_safety_critical());
        assert_eq!(failure.report.final_state, Some(OffsetState::Indeterminate));
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_failure_is_hard_failure() {
        let gpu = flat_gpu();
        gpu.fail_always(MockOp::GetBounds, DriverStatus::NotSupported);

        let failure = orchestrator(&gpu, test_config())
            .run(&gpu.identity(0), CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(failure.error, Error::PermanentDriver(_)));
        assert_eq!(failure.report.final_state, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_stock_and_save_profile() {
        let dir = TempDir::new().unwrap();
        let gpu = MockGpu::new(
            MockGpuConfig::flat(100.0, OffsetBounds::new(0, 2000))
                .with_memory_words(16 * 1024)
                .with_cliff(550, 0.7),
        );
        let mut config = test_config();
        config.safety.restore_stock_on_exit = true;

        let report = orchestrator(&gpu, config)
            .with_profile_output(dir.path().join("best"))
            .run(&gpu.identity(0), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.recommended_offset, Some(500));
        assert_eq!(report.final_state, Some(OffsetState::Stock));
        assert_eq!(gpu.memory_offset(0), 0);

        let path = report.profile_path.unwrap();
        assert_eq!(path, dir.path().join("best.json"));
        assert_eq!(OcProfile::load(path).unwrap().mem_offset_mhz, 500);
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_not_at_stock_is_reset_first() {
        let gpu = flat_gpu();
        gpu.set_memory_offset(&gpu.identity(0), 700).await.unwrap();
        let mut config = test_config();
        config.sweep.max_offset = 50;

        let report = sweep(&gpu, config).await;
        assert_eq!(gpu.memory_offset_history(0)[..2], [700, 0]);
        assert_eq!(report.recommended_offset, Some(50));
    }
}

//! Configuration management for memsweep
//!
//! Provides a layered configuration system that supports YAML files and
//! environment variables on top of built-in defaults.

use crate::types::OffsetMhz;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Names of the bit patterns run at every step, in order
pub const DEFAULT_PATTERNS: &[&str] = &[
    "zeros",
    "ones",
    "checkerboard",
    "inverse_checkerboard",
    "walking_ones",
    "address",
    "random",
];

/// Largest accepted sweep step
pub const MAX_STEP_MHZ: u32 = 10_000;

/// Main configuration structure for memsweep
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Sweep loop and cliff detection knobs
    pub sweep: SweepConfig,

    /// Retry policy for control surface calls
    pub retry: RetryConfig,

    /// Pattern stability tester
    pub tester: TesterConfig,

    /// Capability cache
    pub cache: CacheConfig,

    /// Safety limits
    pub safety: SafetyConfig,

    /// Logging output
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from multiple sources with precedence:
    /// 1. Environment variables (highest)
    /// 2. Configuration file
    /// 3. Defaults (lowest)
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder();

        // Start with defaults
        builder = builder.add_source(config::Config::try_from(&Self::default())?);

        // Add configuration file if it exists
        if let Ok(config_path) = std::env::var("MEMSWEEP_CONFIG") {
            builder = builder.add_source(config::File::with_name(&config_path).required(false));
        } else {
            builder = builder.add_source(config::File::with_name("./memsweep.yaml").required(false));
        }

        // MEMSWEEP_SWEEP__STEP_MHZ=25 style overrides
        builder = builder.add_source(
            config::Environment::with_prefix("MEMSWEEP")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        let parsed: Self = config.try_deserialize()?;

        parsed.validate()?;

        Ok(parsed)
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let builder = config::Config::builder()
            .add_source(config::Config::try_from(&Self::default())?)
            .add_source(config::File::from(path));

        let config = builder.build()?;
        let parsed: Self = config.try_deserialize()?;
        parsed.validate()?;

        Ok(parsed)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.sweep.validate()?;
        self.retry.validate()?;
        self.tester.validate()?;
        self.safety.validate()?;
        self.logging.validate()?;
        Ok(())
    }
}

/// Sweep loop configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    /// First offset to test; falls back to the cached last-known-good, then 0
    pub start_offset: Option<OffsetMhz>,

    /// Highest offset to test; clamped to the device maximum
    pub max_offset: OffsetMhz,

    /// Offset increment between steps
    pub step_mhz: u32,

    /// Pattern test duration per step
    pub step_duration_ms: u64,

    /// Hard limit for one test step
    pub watchdog_timeout_ms: u64,

    /// Wait after each offset change before measuring
    pub settle_ms: u64,

    /// Hard limit for the whole session
    pub max_session_ms: u64,

    /// Stop when bandwidth falls below this fraction of the baseline
    pub cliff_fraction: f64,

    /// Step-over-step drop recorded as the first regression
    pub regression_threshold: f64,

    /// Number of clean samples averaged into the baseline
    pub baseline_window: usize,

    /// Re-read device bounds every N steps (0 disables)
    pub bounds_check_interval: u32,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            start_offset: None,
            max_offset: 1500,
            step_mhz: 50,
            step_duration_ms: 10_000,
            watchdog_timeout_ms: 60_000,
            settle_ms: 2_000,
            max_session_ms: 3_600_000,
            cliff_fraction: 0.85,
            regression_threshold: 0.02,
            baseline_window: 3,
            bounds_check_interval: 0,
        }
    }
}

impl SweepConfig {
    pub fn step_duration(&self) -> Duration {
        Duration::from_millis(self.step_duration_ms)
    }

    pub fn watchdog_timeout(&self) -> Duration {
        Duration::from_millis(self.watchdog_timeout_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn max_session(&self) -> Duration {
        Duration::from_millis(self.max_session_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.step_mhz == 0 || self.step_mhz > MAX_STEP_MHZ {
            return Err(crate::Error::config(format!(
                "Sweep step must be between 1 and {} MHz",
                MAX_STEP_MHZ
            )));
        }
        if self.step_duration_ms == 0 {
            return Err(crate::Error::config("Step duration must be greater than 0"));
        }
        if self.watchdog_timeout_ms <= self.step_duration_ms {
            return Err(crate::Error::config(
                "Watchdog timeout must be longer than the step duration",
            ));
        }
        if !(self.cliff_fraction > 0.0 && self.cliff_fraction < 1.0) {
            return Err(crate::Error::config("Cliff fraction must be in (0, 1)"));
        }
        if !(self.regression_threshold >= 0.0 && self.regression_threshold < 1.0) {
            return Err(crate::Error::config("Regression threshold must be in [0, 1)"));
        }
        if self.baseline_window == 0 {
            return Err(crate::Error::config("Baseline window must be at least 1"));
        }
        if let Some(start) = self.start_offset {
            if start > self.max_offset {
                return Err(crate::Error::config(format!(
                    "Start offset {} is above max offset {}",
                    start, self.max_offset
                )));
            }
        }
        Ok(())
    }
}

/// Retry policy configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first one
    pub max_attempts: u32,

    pub initial_backoff_ms: u64,

    pub backoff_multiplier: f64,

    pub max_backoff_ms: u64,

    /// Wall-clock budget for all attempts of one operation
    pub budget_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff_ms: 100,
            backoff_multiplier: 2.0,
            max_backoff_ms: 1_000,
            budget_ms: 3_000,
        }
    }
}

impl RetryConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn budget(&self) -> Duration {
        Duration::from_millis(self.budget_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(crate::Error::config("Retry attempts must be at least 1"));
        }
        if !(self.backoff_multiplier.is_finite() && self.backoff_multiplier >= 1.0) {
            return Err(crate::Error::config(
                "Backoff multiplier must be a finite number >= 1.0",
            ));
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(crate::Error::config(
                "Max backoff must not be shorter than the initial backoff",
            ));
        }
        Ok(())
    }
}

/// Pattern tester configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TesterConfig {
    /// Bytes of device memory exercised per pass
    pub region_bytes: u64,

    /// Bytes per write/read transfer
    pub chunk_bytes: u64,

    /// Pattern names run at every step
    pub patterns: Vec<String>,

    /// Seed of the random pattern
    pub random_seed: u64,

    /// Number of mismatching addresses kept per sample
    pub max_error_addresses: usize,
}

impl Default for TesterConfig {
    fn default() -> Self {
        Self {
            region_bytes: 64 * 1024 * 1024,
            chunk_bytes: 1024 * 1024,
            patterns: DEFAULT_PATTERNS.iter().map(|p| p.to_string()).collect(),
            random_seed: 0x5eed_cafe,
            max_error_addresses: 16,
        }
    }
}

impl TesterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_bytes == 0 || self.chunk_bytes % 4 != 0 {
            return Err(crate::Error::config(
                "Chunk size must be a non-zero multiple of 4 bytes",
            ));
        }
        if self.region_bytes < self.chunk_bytes {
            return Err(crate::Error::config(
                "Test region must hold at least one chunk",
            ));
        }
        if self.patterns.is_empty() {
            return Err(crate::Error::config("At least one pattern is required"));
        }
        Ok(())
    }
}

/// Capability cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,

    /// Cache file; defaults to `~/.memsweep/device_cache.json`
    pub path: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
        }
    }
}

impl CacheConfig {
    /// Resolved cache file location
    pub fn resolved_path(&self) -> PathBuf {
        self.path.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".memsweep")
                .join("device_cache.json")
        })
    }
}

/// Safety limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// Stop the sweep above this GPU temperature
    pub thermal_limit_c: f64,

    /// Stop the sweep above this board power draw
    pub power_limit_w: f64,

    /// Hard limit for one apply or rollback, retries included
    pub apply_timeout_ms: u64,

    /// Reset the memory offset to stock once the sweep finishes
    pub restore_stock_on_exit: bool,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            thermal_limit_c: 90.0,
            power_limit_w: 450.0,
            apply_timeout_ms: 10_000,
            restore_stock_on_exit: false,
        }
    }
}

impl SafetyConfig {
    pub fn apply_timeout(&self) -> Duration {
        Duration::from_millis(self.apply_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.thermal_limit_c <= 0.0 {
            return Err(crate::Error::config("Thermal limit must be positive"));
        }
        if !(self.power_limit_w.is_finite() && self.power_limit_w > 0.0) {
            return Err(crate::Error::config("Power limit must be positive"));
        }
        if self.apply_timeout_ms == 0 {
            return Err(crate::Error::config("Apply timeout must be greater than 0"));
        }
        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,

    pub show_target: bool,

    pub show_thread_ids: bool,

    pub show_line_numbers: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            show_target: true,
            show_thread_ids: false,
            show_line_numbers: false,
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> Result<()> {
        match self.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(crate::Error::config(format!("Invalid log level: {}", other)));
            }
        }
        match self.format.as_str() {
            "text" | "json" => Ok(()),
            other => Err(crate::Error::config(format!("Invalid log format: {}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.sweep.step_mhz, 50);
        assert_eq!(config.sweep.cliff_fraction, 0.85);
        assert_eq!(config.retry.backoff_multiplier, 2.0);
        assert_eq!(config.tester.patterns.len(), DEFAULT_PATTERNS.len());
    }

    #[test]
    fn test_duration_accessors() {
        let config = Config::default();
        assert_eq!(config.sweep.step_duration(), Duration::from_secs(10));
        assert_eq!(config.sweep.settle(), Duration::from_secs(2));
        assert_eq!(config.retry.budget(), Duration::from_secs(3));
        assert_eq!(config.safety.apply_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.sweep.cliff_fraction = 1.2;
        assert!(config.validate().is_err());
        config.sweep.cliff_fraction = 0.85;

        config.sweep.watchdog_timeout_ms = config.sweep.step_duration_ms;
        assert!(config.validate().is_err());
        config.sweep.watchdog_timeout_ms = 60_000;

        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());
        config.retry.max_attempts = 4;

        config.tester.chunk_bytes = 3;
        assert!(config.validate().is_err());
        config.tester.chunk_bytes = 1024;

        config.logging.format = "xml".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_retry_multiplier_must_be_finite() {
        let mut retry = RetryConfig::default();
        retry.backoff_multiplier = f64::NAN;
        assert!(retry.validate().is_err());
        retry.backoff_multiplier = f64::INFINITY;
        assert!(retry.validate().is_err());
        retry.backoff_multiplier = 0.5;
        assert!(retry.validate().is_err());
        retry.backoff_multiplier = 10.0;
        assert!(retry.validate().is_ok());
    }

    #[test]
    fn test_step_size_is_bounded() {
        let mut sweep = SweepConfig::default();
        sweep.step_mhz = MAX_STEP_MHZ;
        assert!(sweep.validate().is_ok());
        sweep.step_mhz = 3_000_000_000;
        assert!(sweep.validate().is_err());
        sweep.step_mhz = 0;
        assert!(sweep.validate().is_err());
    }

    #[test]
    fn test_start_above_max_rejected() {
        let mut sweep = SweepConfig::default();
        sweep.start_offset = Some(2000);
        sweep.max_offset = 1000;
        assert!(sweep.validate().is_err());
    }

    #[test]
    fn test_load_from_file_overrides_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("memsweep.yaml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "sweep:\n  step_mhz: 25\n  max_offset: 900\nsafety:\n  thermal_limit_c: 80.0\n"
        )
        .unwrap();

        let config = Config::load_from_file(&path).unwrap();
        assert_eq!(config.sweep.step_mhz, 25);
        assert_eq!(config.sweep.max_offset, 900);
        assert_eq!(config.safety.thermal_limit_c, 80.0);
        // untouched sections keep their defaults
        assert_eq!(config.retry, RetryConfig::default());
    }

    #[test]
    fn test_cache_path_override() {
        let cache = CacheConfig {
            enabled: true,
            path: Some(PathBuf::from("/tmp/cache.json")),
        };
        assert_eq!(cache.resolved_path(), PathBuf::from("/tmp/cache.json"));
        assert!(CacheConfig::default()
            .resolved_path()
            .ends_with(".memsweep/device_cache.json"));
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();

        let yaml = serde_yaml::to_string(&config).unwrap();
        let deserialized: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(config, deserialized);
    }
}

//! Configuration for the memsweep CLI
//!
//! Engine settings come from [`memsweep_core::Config`]. The same file may
//! carry an `adapter:` section selecting the memory backend and shaping the
//! simulated device.

use crate::{MemtestArgs, SweepArgs};
use anyhow::{Context, Result};
use memsweep_adapter_gpu::AdapterConfig;
use memsweep_core::Config;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Configuration used when the caller names no file
const DEFAULT_CONFIG_FILE: &str = "memsweep.yaml";

#[derive(Debug, Default, Deserialize)]
struct AdapterSection {
    #[serde(default)]
    adapter: AdapterConfig,
}

/// CLI configuration
#[derive(Debug, Clone)]
pub struct CliConfig {
    /// Engine configuration
    pub engine: Config,

    /// Backend selection
    pub adapter: AdapterConfig,

    /// Configuration source path
    source: Option<PathBuf>,
}

impl CliConfig {
    /// Load from `config_path`, or from the default locations when absent
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        match config_path {
            Some(path) => Self::load_from_file(path),
            None => {
                let engine = Config::load().context("Failed to load configuration")?;
                let default_path = PathBuf::from(DEFAULT_CONFIG_FILE);
                let (adapter, source) = if default_path.exists() {
                    (Self::load_adapter(&default_path)?, Some(default_path))
                } else {
                    (AdapterConfig::default(), None)
                };
                Ok(Self {
                    engine,
                    adapter,
                    source,
                })
            }
        }
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let engine = Config::load_from_file(path)
            .with_context(|| format!("Failed to load config file: {}", path.display()))?;
        let adapter = Self::load_adapter(path)?;
        Ok(Self {
            engine,
            adapter,
            source: Some(path.to_path_buf()),
        })
    }

    fn load_adapter(path: &Path) -> Result<AdapterConfig> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let section: AdapterSection = if path.extension().and_then(|s| s.to_str()) == Some("json") {
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse JSON config: {}", path.display()))?
        } else {
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse YAML config: {}", path.display()))?
        };

        section
            .adapter
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid adapter configuration: {}", e))?;
        Ok(section.adapter)
    }

    #[cfg(test)]
    pub fn for_test(engine: Config, adapter: AdapterConfig) -> Self {
        Self {
            engine,
            adapter,
            source: None,
        }
    }

    /// Where the configuration was read from, if anywhere
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Apply command-line overrides for a sweep and re-validate
    pub fn apply_sweep_args(&mut self, args: &SweepArgs) -> Result<()> {
        let sweep = &mut self.engine.sweep;
        if let Some(start) = args.start {
            sweep.start_offset = Some(start);
        }
        if let Some(max) = args.max {
            sweep.max_offset = max;
        }
        if let Some(step) = args.step {
            sweep.step_mhz = step;
        }
        if let Some(duration) = args.duration_ms {
            sweep.step_duration_ms = duration;
        }
        if let Some(timeout) = args.timeout_ms {
            sweep.watchdog_timeout_ms = timeout;
        }
        if let Some(settle) = args.settle_ms {
            sweep.settle_ms = settle;
        }
        if let Some(fraction) = args.cliff_fraction {
            sweep.cliff_fraction = fraction;
        }
        if let Some(threshold) = args.regression_threshold {
            sweep.regression_threshold = threshold;
        }
        if let Some(secs) = args.max_session_secs {
            sweep.max_session_ms = secs.saturating_mul(1000);
        }
        if args.restore_stock {
            self.engine.safety.restore_stock_on_exit = true;
        }
        if args.no_cache {
            self.engine.cache.enabled = false;
        }
        if let Some(memory) = args.memory {
            self.adapter.memory = memory;
        }
        self.validate()
    }

    /// Apply command-line overrides for a single memory test
    pub fn apply_memtest_args(&mut self, args: &MemtestArgs) -> Result<()> {
        if let Some(duration) = args.duration_ms {
            self.engine.sweep.step_duration_ms = duration;
        }
        if let Some(timeout) = args.timeout_ms {
            self.engine.sweep.watchdog_timeout_ms = timeout;
        }
        if let Some(memory) = args.memory {
            self.adapter.memory = memory;
        }
        self.validate()
    }

    fn validate(&self) -> Result<()> {
        self.engine.validate()?;
        self.adapter
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid adapter configuration: {}", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memsweep_adapter_gpu::MemoryTarget;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn yaml_file(content: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_engine_and_adapter_sections() {
        let file = yaml_file(
            r#"
sweep:
  step_mhz: 25
  max_offset: 900
adapter:
  memory: host
  host_memory_bytes: 1048576
  mock:
    device_count: 2
"#,
        );

        let config = CliConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.engine.sweep.step_mhz, 25);
        assert_eq!(config.engine.sweep.max_offset, 900);
        assert_eq!(config.adapter.memory, MemoryTarget::Host);
        assert_eq!(config.adapter.host_memory_bytes, 1024 * 1024);
        assert_eq!(config.adapter.mock.device_count, 2);
        assert_eq!(config.adapter.mock.device_name, "Mock GeForce RTX 3080");
        assert_eq!(config.source(), Some(file.path()));
    }

    #[test]
    fn test_missing_adapter_section_uses_defaults() {
        let file = yaml_file("sweep:\n  step_mhz: 10\n");
        let config = CliConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.adapter.memory, MemoryTarget::Device);
        assert_eq!(config.engine.sweep.step_mhz, 10);
    }

    #[test]
    fn test_sweep_overrides() {
        let file = yaml_file("sweep:\n  step_mhz: 10\n");
        let mut config = CliConfig::load_from_file(file.path()).unwrap();

        let args = SweepArgs {
            start: Some(-100),
            step: Some(20),
            duration_ms: Some(500),
            timeout_ms: Some(5_000),
            max_session_secs: Some(60),
            restore_stock: true,
            no_cache: true,
            memory: Some(MemoryTarget::Host),
            ..SweepArgs::default()
        };
        config.apply_sweep_args(&args).unwrap();

        let sweep = &config.engine.sweep;
        assert_eq!(sweep.start_offset, Some(-100));
        assert_eq!(sweep.step_mhz, 20);
        assert_eq!(sweep.step_duration_ms, 500);
        assert_eq!(sweep.watchdog_timeout_ms, 5_000);
        assert_eq!(sweep.max_session_ms, 60_000);
        assert!(config.engine.safety.restore_stock_on_exit);
        assert!(!config.engine.cache.enabled);
        assert_eq!(config.adapter.memory, MemoryTarget::Host);
    }

    #[test]
    fn test_memtest_overrides() {
        let file = yaml_file("sweep:\n  step_duration_ms: 2000\n");
        let mut config = CliConfig::load_from_file(file.path()).unwrap();

        let args = MemtestArgs {
            gpu: 0,
            duration_ms: Some(750),
            timeout_ms: None,
            memory: Some(MemoryTarget::Host),
        };
        config.apply_memtest_args(&args).unwrap();
        assert_eq!(config.engine.sweep.step_duration_ms, 750);
        assert_eq!(config.adapter.memory, MemoryTarget::Host);

        let args = MemtestArgs {
            duration_ms: Some(90_000),
            ..args
        };
        assert!(config.apply_memtest_args(&args).is_err());
    }

    #[test]
    fn test_invalid_override_is_rejected() {
        let file = yaml_file("sweep:\n  step_mhz: 10\n");
        let mut config = CliConfig::load_from_file(file.path()).unwrap();

        let args = SweepArgs {
            duration_ms: Some(90_000),
            ..SweepArgs::default()
        };
        assert!(config.apply_sweep_args(&args).is_err());
    }
}

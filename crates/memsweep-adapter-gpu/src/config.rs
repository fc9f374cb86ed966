//! Adapter configuration

use memsweep_core::{OffsetBounds, OffsetMhz};
use serde::{Deserialize, Serialize};

/// Memory exercised by the stability tester
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryTarget {
    /// Memory behind the (simulated) device
    Device,
    /// System RAM, for timing the tester itself
    Host,
}

/// Adapter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    /// Memory target for the tester
    pub memory: MemoryTarget,

    /// Size of the host buffer when `memory` is `Host`
    pub host_memory_bytes: u64,

    /// Simulated device behaviour
    pub mock: MockGpuConfig,
}

/// Behaviour of the simulated GPU
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MockGpuConfig {
    /// Number of devices reported by `list_devices`
    pub device_count: u32,

    /// Marketing name of every device
    pub device_name: String,

    /// Memory offset range accepted by the device
    pub bounds: OffsetBounds,

    pub driver_version: String,

    pub struct_layout: u32,

    /// Words of device memory per device
    pub memory_words: u64,

    /// Bandwidth at stock clocks
    pub base_bandwidth_gbps: f64,

    /// Fractional bandwidth gain per MHz of offset
    pub gain_per_mhz: f64,

    /// Offset at which bandwidth collapses
    pub cliff_offset: Option<OffsetMhz>,

    /// Bandwidth multiplier at and beyond the cliff
    pub cliff_factor: f64,

    /// Offset at which read-back errors start
    pub error_onset: Option<OffsetMhz>,

    /// Words corrupted per pass once errors start
    pub errors_per_pass: u64,

    /// Core temperature at stock clocks
    pub base_temperature_c: f64,

    /// Temperature rise per 100 MHz of memory offset
    pub temperature_per_100mhz: f64,

    /// Driver failures injected from the first call on
    pub failures: Vec<ScriptedFailure>,
}

/// A driver status returned by one control surface operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptedFailure {
    /// Operation name, e.g. `set_memory_offset`
    pub operation: String,

    /// Raw driver status code, e.g. -104
    pub code: i32,

    /// Number of failing calls; every call fails when absent
    #[serde(default)]
    pub times: Option<u32>,
}

/// Control surface operations, for scripting failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    ListDevices,
    GetBounds,
    GetMemoryOffset,
    SetMemoryOffset,
    SetCoreOffset,
    SetPowerLimit,
    SetFanSpeed,
    ReadTelemetry,
    GetStructRevision,
}

impl MockOp {
    const ALL: [MockOp; 9] = [
        MockOp::ListDevices,
        MockOp::GetBounds,
        MockOp::GetMemoryOffset,
        MockOp::SetMemoryOffset,
        MockOp::SetCoreOffset,
        MockOp::SetPowerLimit,
        MockOp::SetFanSpeed,
        MockOp::ReadTelemetry,
        MockOp::GetStructRevision,
    ];

    /// Operation with the control surface method name `name`
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.name() == name)
    }

    pub fn name(&self) -> &'static str {
        match self {
            MockOp::ListDevices => "list_devices",
            MockOp::GetBounds => "get_bounds",
            MockOp::GetMemoryOffset => "get_memory_offset",
            MockOp::SetMemoryOffset => "set_memory_offset",
            MockOp::SetCoreOffset => "set_core_offset",
            MockOp::SetPowerLimit => "set_power_limit",
            MockOp::SetFanSpeed => "set_fan_speed",
            MockOp::ReadTelemetry => "read_telemetry",
            MockOp::GetStructRevision => "get_struct_revision",
        }
    }
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            memory: MemoryTarget::Device,
            host_memory_bytes: 64 * 1024 * 1024,
            mock: MockGpuConfig::default(),
        }
    }
}

impl AdapterConfig {
    pub fn new(memory: MemoryTarget) -> Self {
        Self {
            memory,
            ..Self::default()
        }
    }

    pub fn with_mock(mut self, mock: MockGpuConfig) -> Self {
        self.mock = mock;
        self
    }

    pub fn with_host_memory_bytes(mut self, bytes: u64) -> Self {
        self.host_memory_bytes = bytes;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.memory == MemoryTarget::Host && self.host_memory_bytes < 4 {
            return Err("Host memory buffer must hold at least one word".to_string());
        }
        self.mock.validate()
    }
}

impl Default for MockGpuConfig {
    fn default() -> Self {
        Self {
            device_count: 1,
            device_name: "Mock GeForce RTX 3080".to_string(),
            bounds: OffsetBounds::new(-1000, 1500),
            driver_version: "555.85".to_string(),
            struct_layout: 1,
            memory_words: 16 * 1024 * 1024,
            base_bandwidth_gbps: 760.0,
            gain_per_mhz: 0.0001,
            cliff_offset: Some(1100),
            cliff_factor: 0.7,
            error_onset: Some(1250),
            errors_per_pass: 4,
            base_temperature_c: 62.0,
            temperature_per_100mhz: 0.8,
            failures: Vec::new(),
        }
    }
}

impl MockGpuConfig {
    /// A flat-bandwidth device with no cliff or errors
    pub fn flat(bandwidth_gbps: f64, bounds: OffsetBounds) -> Self {
        Self {
            bounds,
            base_bandwidth_gbps: bandwidth_gbps,
            gain_per_mhz: 0.0,
            cliff_offset: None,
            error_onset: None,
            temperature_per_100mhz: 0.0,
            ..Self::default()
        }
    }

    pub fn with_device_count(mut self, count: u32) -> Self {
        self.device_count = count;
        self
    }

    pub fn with_bounds(mut self, bounds: OffsetBounds) -> Self {
        self.bounds = bounds;
        self
    }

    pub fn with_memory_words(mut self, words: u64) -> Self {
        self.memory_words = words;
        self
    }

    pub fn with_cliff(mut self, offset: OffsetMhz, factor: f64) -> Self {
        self.cliff_offset = Some(offset);
        self.cliff_factor = factor;
        self
    }

    pub fn with_errors(mut self, onset: OffsetMhz, per_pass: u64) -> Self {
        self.error_onset = Some(onset);
        self.errors_per_pass = per_pass;
        self
    }

    pub fn with_revision(mut self, driver_version: impl Into<String>, layout: u32) -> Self {
        self.driver_version = driver_version.into();
        self.struct_layout = layout;
        self
    }

    pub fn with_failure(
        mut self,
        operation: impl Into<String>,
        code: i32,
        times: Option<u32>,
    ) -> Self {
        self.failures.push(ScriptedFailure {
            operation: operation.into(),
            code,
            times,
        });
        self
    }

    /// Modelled bandwidth at `offset`
    pub fn bandwidth_at(&self, offset: OffsetMhz) -> f64 {
        let gain = 1.0 + self.gain_per_mhz * offset as f64;
        let bandwidth = self.base_bandwidth_gbps * gain;
        match self.cliff_offset {
            Some(cliff) if offset >= cliff => bandwidth * self.cliff_factor,
            _ => bandwidth,
        }
    }

    /// Modelled words corrupted per pass at `offset`
    pub fn errors_at(&self, offset: OffsetMhz) -> u64 {
        match self.error_onset {
            Some(onset) if offset >= onset => self.errors_per_pass,
            _ => 0,
        }
    }

    /// Modelled temperature at `offset`
    pub fn temperature_at(&self, offset: OffsetMhz) -> f64 {
        self.base_temperature_c + self.temperature_per_100mhz * offset.max(0) as f64 / 100.0
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.device_count == 0 {
            return Err("Mock GPU needs at least one device".to_string());
        }
        if !self.bounds.is_valid() {
            return Err(format!("Invalid offset bounds {}", self.bounds));
        }
        if self.memory_words == 0 {
            return Err("Mock GPU memory must not be empty".to_string());
        }
        if self.base_bandwidth_gbps <= 0.0 {
            return Err("Base bandwidth must be positive".to_string());
        }
        if !(self.cliff_factor > 0.0 && self.cliff_factor <= 1.0) {
            return Err("Cliff factor must be in (0, 1]".to_string());
        }
        if let Some(failure) = self
            .failures
            .iter()
            .find(|f| MockOp::from_name(&f.operation).is_none())
        {
            return Err(format!("Unknown mock operation '{}'", failure.operation));
        }
        Ok(())
    }
}

impl std::fmt::Display for MemoryTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemoryTarget::Device => write!(f, "device"),
            MemoryTarget::Host => write!(f, "host"),
        }
    }
}

impl std::str::FromStr for MemoryTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "device" | "gpu" => Ok(MemoryTarget::Device),
            "host" | "ram" => Ok(MemoryTarget::Host),
            _ => Err(format!("Unknown memory target: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adapter_config_builder() {
        let config = AdapterConfig::new(MemoryTarget::Host)
            .with_host_memory_bytes(1024)
            .with_mock(MockGpuConfig::default().with_device_count(2));

        assert_eq!(config.memory, MemoryTarget::Host);
        assert_eq!(config.host_memory_bytes, 1024);
        assert_eq!(config.mock.device_count, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_mock_config_validation() {
        assert!(MockGpuConfig::default().validate().is_ok());
        assert!(MockGpuConfig::default().with_device_count(0).validate().is_err());
        assert!(MockGpuConfig::default()
            .with_bounds(OffsetBounds::new(100, 0))
            .validate()
            .is_err());
        assert!(MockGpuConfig::default().with_cliff(500, 0.0).validate().is_err());
        assert!(MockGpuConfig::default()
            .with_failure("overclock_everything", -104, None)
            .validate()
            .is_err());
    }

    #[test]
    fn test_scripted_failures_from_yaml() {
        let yaml = r#"
device_count: 2
failures:
  - operation: set_memory_offset
    code: -104
    times: 3
  - operation: set_fan_speed
    code: -14
"#;
        let mock: MockGpuConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(mock.validate().is_ok());
        assert_eq!(mock.device_count, 2);
        assert_eq!(
            mock.failures,
            vec![
                ScriptedFailure {
                    operation: "set_memory_offset".to_string(),
                    code: -104,
                    times: Some(3),
                },
                ScriptedFailure {
                    operation: "set_fan_speed".to_string(),
                    code: -14,
                    times: None,
                },
            ]
        );
    }

    #[test]
    fn test_bandwidth_model() {
        let mock = MockGpuConfig::flat(100.0, OffsetBounds::new(0, 2000)).with_cliff(550, 0.7);
        assert_eq!(mock.bandwidth_at(0), 100.0);
        assert_eq!(mock.bandwidth_at(500), 100.0);
        assert!((mock.bandwidth_at(550) - 70.0).abs() < 1e-9);
    }

    #[test]
    fn test_error_and_temperature_model() {
        let mock = MockGpuConfig::default().with_errors(300, 3);
        assert_eq!(mock.errors_at(250), 0);
        assert_eq!(mock.errors_at(300), 3);
        assert!(mock.temperature_at(1000) > mock.temperature_at(0));
        assert_eq!(mock.temperature_at(-500), mock.base_temperature_c);
    }

    #[test]
    fn test_memory_target_parsing() {
        assert_eq!("device".parse::<MemoryTarget>().unwrap(), MemoryTarget::Device);
        assert_eq!("HOST".parse::<MemoryTarget>().unwrap(), MemoryTarget::Host);
        assert!("vram2".parse::<MemoryTarget>().is_err());
        assert_eq!(MemoryTarget::Host.to_string(), "host");
    }
}

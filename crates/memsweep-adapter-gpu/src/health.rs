//! Device health checks over telemetry snapshots

use memsweep_core::Telemetry;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Device health status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HealthStatus {
    /// Device is healthy
    Healthy,
    /// Device has warnings
    Warning(Vec<String>),
    /// Device is in critical state
    Critical(Vec<String>),
}

/// Limits a telemetry snapshot is checked against
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthThresholds {
    pub temperature_warning_c: f64,
    pub temperature_critical_c: f64,
    pub power_warning_w: f64,
    pub power_critical_w: f64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            temperature_warning_c: 80.0,
            temperature_critical_c: 90.0,
            power_warning_w: 350.0,
            power_critical_w: 450.0,
        }
    }
}

impl HealthThresholds {
    /// Thresholds turning critical at `thermal_limit_c` and `power_limit_w`
    pub fn with_limits(thermal_limit_c: f64, power_limit_w: f64) -> Self {
        let defaults = Self::default();
        Self {
            temperature_warning_c: defaults.temperature_warning_c.min(thermal_limit_c - 5.0),
            temperature_critical_c: thermal_limit_c,
            power_warning_w: defaults.power_warning_w.min(power_limit_w * 0.9),
            power_critical_w: power_limit_w,
        }
    }
}

/// Health of one device at one point in time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceHealth {
    /// Overall health status
    pub status: HealthStatus,

    /// Individual health checks
    pub checks: HashMap<String, HealthCheck>,

    /// Health score (0-100)
    pub score: f64,

    /// Timestamp of health check
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Individual health check result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    pub name: String,
    pub status: CheckStatus,
    pub value: f64,
    pub threshold: f64,
    pub message: Option<String>,
}

/// Health check status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckStatus {
    Pass,
    Warning,
    Critical,
}

impl DeviceHealth {
    /// Evaluate a telemetry snapshot
    pub fn from_telemetry(telemetry: &Telemetry, thresholds: &HealthThresholds) -> Self {
        let mut checks = HashMap::new();
        let mut warnings = Vec::new();
        let mut criticals = Vec::new();

        let temp = telemetry.temperature_c;
        let temp_check = if temp >= thresholds.temperature_critical_c {
            criticals.push(format!("GPU temperature too high: {:.1}°C", temp));
            HealthCheck {
                name: "temperature".to_string(),
                status: CheckStatus::Critical,
                value: temp,
                threshold: thresholds.temperature_critical_c,
                message: Some("Temperature critical".to_string()),
            }
        } else if temp >= thresholds.temperature_warning_c {
            warnings.push(format!("GPU temperature high: {:.1}°C", temp));
            HealthCheck {
                name: "temperature".to_string(),
                status: CheckStatus::Warning,
                value: temp,
                threshold: thresholds.temperature_warning_c,
                message: Some("Temperature warning".to_string()),
            }
        } else {
            HealthCheck {
                name: "temperature".to_string(),
                status: CheckStatus::Pass,
                value: temp,
                threshold: thresholds.temperature_warning_c,
                message: None,
            }
        };
        checks.insert("temperature".to_string(), temp_check);

        let power = telemetry.power_draw_w;
        let power_check = if power >= thresholds.power_critical_w {
            criticals.push(format!("GPU power draw too high: {:.0} W", power));
            HealthCheck {
                name: "power".to_string(),
                status: CheckStatus::Critical,
                value: power,
                threshold: thresholds.power_critical_w,
                message: Some("Power draw critical".to_string()),
            }
        } else if power >= thresholds.power_warning_w {
            warnings.push(format!("GPU power draw high: {:.0} W", power));
            HealthCheck {
                name: "power".to_string(),
                status: CheckStatus::Warning,
                value: power,
                threshold: thresholds.power_warning_w,
                message: Some("Power draw warning".to_string()),
            }
        } else {
            HealthCheck {
                name: "power".to_string(),
                status: CheckStatus::Pass,
                value: power,
                threshold: thresholds.power_warning_w,
                message: None,
            }
        };
        checks.insert("power".to_string(), power_check);

        let status = if !criticals.is_empty() {
            HealthStatus::Critical(criticals)
        } else if !warnings.is_empty() {
            HealthStatus::Warning(warnings)
        } else {
            HealthStatus::Healthy
        };

        let score = Self::calculate_health_score(&checks);

        Self {
            status,
            checks,
            score,
            timestamp: chrono::Utc::now(),
        }
    }

    fn calculate_health_score(checks: &HashMap<String, HealthCheck>) -> f64 {
        if checks.is_empty() {
            return 0.0;
        }

        let total_score: f64 = checks
            .values()
            .map(|check| match check.status {
                CheckStatus::Pass => 100.0,
                CheckStatus::Warning => 70.0,
                CheckStatus::Critical => 0.0,
            })
            .sum();

        total_score / checks.len() as f64
    }

    pub fn has_warnings(&self) -> bool {
        matches!(self.status, HealthStatus::Warning(_))
    }

    pub fn is_critical(&self) -> bool {
        matches!(self.status, HealthStatus::Critical(_))
    }

    /// Whether the named check failed critically
    pub fn check_is_critical(&self, name: &str) -> bool {
        self.checks
            .get(name)
            .map(|check| check.status == CheckStatus::Critical)
            .unwrap_or(false)
    }

    /// Messages for every failing check
    pub fn messages(&self) -> Vec<String> {
        match &self.status {
            HealthStatus::Healthy => Vec::new(),
            HealthStatus::Warning(msgs) | HealthStatus::Critical(msgs) => msgs.clone(),
        }
    }
}

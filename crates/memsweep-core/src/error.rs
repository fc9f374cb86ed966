//! Error handling for memsweep
//!
//! Provides the driver status table returned by control surfaces, plus the
//! unified error and result types used across the memsweep crates.

use crate::types::OffsetMhz;
use std::fmt;

/// Result type alias for memsweep operations
pub type Result<T> = std::result::Result<T, Error>;

/// Status codes reported by the vendor control API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverStatus {
    /// Generic failure
    Error,
    LibraryNotFound,
    NoImplementation,
    ApiNotInitialized,
    InvalidArgument,
    DeviceNotFound,
    EndEnumeration,
    InvalidHandle,
    /// Struct version mismatch, seen while another tool re-initializes the API
    IncompatibleStructVersion,
    NotSupported,
    InsufficientBuffer,
    /// The control handle is held by a competing overclock tool
    InvalidUserPrivilege,
    /// The device disappeared from the bus
    DeviceRemoved,
    /// Any code not in the table above
    Unknown(i32),
}

impl DriverStatus {
    /// Map a raw numeric status to a known code
    pub fn from_code(code: i32) -> Self {
        match code {
            -1 => DriverStatus::Error,
            -2 => DriverStatus::LibraryNotFound,
            -3 => DriverStatus::NoImplementation,
            -4 => DriverStatus::ApiNotInitialized,
            -5 => DriverStatus::InvalidArgument,
            -6 => DriverStatus::DeviceNotFound,
            -7 => DriverStatus::EndEnumeration,
            -8 => DriverStatus::InvalidHandle,
            -9 => DriverStatus::IncompatibleStructVersion,
            -14 => DriverStatus::NotSupported,
            -40 => DriverStatus::InsufficientBuffer,
            -104 => DriverStatus::InvalidUserPrivilege,
            -151 => DriverStatus::DeviceRemoved,
            other => DriverStatus::Unknown(other),
        }
    }

    /// Raw numeric status
    pub fn code(&self) -> i32 {
        match self {
            DriverStatus::Error => -1,
            DriverStatus::LibraryNotFound => -2,
            DriverStatus::NoImplementation => -3,
            DriverStatus::ApiNotInitialized => -4,
            DriverStatus::InvalidArgument => -5,
            DriverStatus::DeviceNotFound => -6,
            DriverStatus::EndEnumeration => -7,
            DriverStatus::InvalidHandle => -8,
            DriverStatus::IncompatibleStructVersion => -9,
            DriverStatus::NotSupported => -14,
            DriverStatus::InsufficientBuffer => -40,
            DriverStatus::InvalidUserPrivilege => -104,
            DriverStatus::DeviceRemoved => -151,
            DriverStatus::Unknown(code) => *code,
        }
    }

    /// Lock contention with another tool; clears up on its own
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DriverStatus::InvalidUserPrivilege | DriverStatus::IncompatibleStructVersion
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            DriverStatus::Error => "ERROR",
            DriverStatus::LibraryNotFound => "LIBRARY_NOT_FOUND",
            DriverStatus::NoImplementation => "NO_IMPLEMENTATION",
            DriverStatus::ApiNotInitialized => "API_NOT_INITIALIZED",
            DriverStatus::InvalidArgument => "INVALID_ARGUMENT",
            DriverStatus::DeviceNotFound => "DEVICE_NOT_FOUND",
            DriverStatus::EndEnumeration => "END_ENUMERATION",
            DriverStatus::InvalidHandle => "INVALID_HANDLE",
            DriverStatus::IncompatibleStructVersion => "INCOMPATIBLE_STRUCT_VERSION",
            DriverStatus::NotSupported => "NOT_SUPPORTED",
            DriverStatus::InsufficientBuffer => "INSUFFICIENT_BUFFER",
            DriverStatus::InvalidUserPrivilege => "INVALID_USER_PRIVILEGE",
            DriverStatus::DeviceRemoved => "DEVICE_REMOVED",
            DriverStatus::Unknown(_) => "UNKNOWN",
        }
    }
}

impl fmt::Display for DriverStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.code())
    }
}

/// A failed call on the control surface
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{operation} failed: {status}")]
pub struct DriverError {
    pub status: DriverStatus,
    pub operation: String,
}

impl DriverError {
    pub fn new(status: DriverStatus, operation: impl Into<String>) -> Self {
        Self {
            status,
            operation: operation.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.status.is_transient()
    }
}

/// Unified error type for memsweep
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Transient driver failure that outlived the retry budget
    #[error("Transient driver error after {attempts} attempts: {source}")]
    TransientDriver {
        source: DriverError,
        attempts: u32,
    },

    /// Driver failure that must not be retried
    #[error("Driver error: {0}")]
    PermanentDriver(DriverError),

    /// Offset outside the device bounds
    #[error("Offset {offset:+} MHz outside device bounds [{min:+}, {max:+}]")]
    OutOfBoundsOffset {
        offset: OffsetMhz,
        min: OffsetMhz,
        max: OffsetMhz,
    },

    /// The tested offset produced errors or collapsed bandwidth
    #[error("Unstable offset detected at {0:+} MHz")]
    UnstableOffsetDetected(OffsetMhz),

    /// A bounded operation exceeded its watchdog
    #[error("Watchdog timeout: {0}")]
    WatchdogTimeout(String),

    /// The device could not be returned to a known-safe offset
    #[error("Safety violation: {0}")]
    SafetyViolation(String),

    /// Applying an offset failed; the device was rolled back
    #[error("Failed to apply offset {offset:+} MHz: {reason}")]
    ApplyFailed { offset: OffsetMhz, reason: String },

    /// The offset state machine refused a transition
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// Another session already owns the device
    #[error("Session busy: {0}")]
    SessionBusy(String),

    /// Device bounds changed under a running session
    #[error("Device bounds changed: {0}")]
    BoundsChanged(String),

    /// The memory backend failed a transfer
    #[error("Memory backend error: {0}")]
    MemoryBackend(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    InvalidConfiguration(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Configuration parsing errors
    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    /// Generic error with context
    #[error("Error: {0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    /// Create a watchdog timeout error
    pub fn watchdog(msg: impl Into<String>) -> Self {
        Self::WatchdogTimeout(msg.into())
    }

    /// Create a safety violation error
    pub fn safety(msg: impl Into<String>) -> Self {
        Self::SafetyViolation(msg.into())
    }

    /// Create an invalid transition error
    pub fn transition(msg: impl Into<String>) -> Self {
        Self::InvalidTransition(msg.into())
    }

    /// Create a session busy error
    pub fn session_busy(msg: impl Into<String>) -> Self {
        Self::SessionBusy(msg.into())
    }

    /// Create a bounds changed error
    pub fn bounds_changed(msg: impl Into<String>) -> Self {
        Self::BoundsChanged(msg.into())
    }

    /// Create a memory backend error
    pub fn memory(msg: impl Into<String>) -> Self {
        Self::MemoryBackend(msg.into())
    }

    /// Create an apply failure
    pub fn apply_failed(offset: OffsetMhz, reason: impl Into<String>) -> Self {
        Self::ApplyFailed {
            offset,
            reason: reason.into(),
        }
    }

    /// The device may be left at an unverified offset
    pub fn is_safety_critical(&self) -> bool {
        matches!(self, Error::SafetyViolation(_))
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Error::TransientDriver { .. } => "transient_driver",
            Error::PermanentDriver(_) => "permanent_driver",
            Error::OutOfBoundsOffset { .. } => "out_of_bounds",
            Error::UnstableOffsetDetected(_) => "unstable_offset",
            Error::WatchdogTimeout(_) => "watchdog_timeout",
            Error::SafetyViolation(_) => "safety_violation",
            Error::ApplyFailed { .. } => "apply_failed",
            Error::InvalidTransition(_) => "invalid_transition",
            Error::SessionBusy(_) => "session_busy",
            Error::BoundsChanged(_) => "bounds_changed",
            Error::MemoryBackend(_) => "memory_backend",
            Error::InvalidConfiguration(_) => "configuration",
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            Error::Yaml(_) => "yaml",
            Error::Config(_) => "config",
            Error::Other(_) => "other",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_table() {
        assert_eq!(DriverStatus::from_code(-104), DriverStatus::InvalidUserPrivilege);
        assert_eq!(DriverStatus::from_code(-9), DriverStatus::IncompatibleStructVersion);
        assert_eq!(DriverStatus::from_code(-5).code(), -5);
        assert_eq!(DriverStatus::from_code(-999), DriverStatus::Unknown(-999));
        assert_eq!(DriverStatus::Unknown(-999).code(), -999);
    }

    #[test]
    fn test_transient_codes() {
        let transient = |code| {
            DriverError::new(DriverStatus::from_code(code), "set_memory_offset").is_transient()
        };
        assert!(transient(-104));
        assert!(transient(-9));
        assert!(!transient(-5));
        assert!(!transient(-1));
        assert!(!transient(-12345));
    }

    #[test]
    fn test_error_display() {
        let err = Error::OutOfBoundsOffset {
            offset: 2100,
            min: 0,
            max: 2000,
        };
        assert_eq!(
            err.to_string(),
            "Offset +2100 MHz outside device bounds [+0, +2000]"
        );

        let driver = DriverError::new(DriverStatus::InvalidArgument, "set_memory_offset");
        assert_eq!(
            driver.to_string(),
            "set_memory_offset failed: INVALID_ARGUMENT (-5)"
        );
    }

    #[test]
    fn test_error_classification() {
        let transient = Error::TransientDriver {
            source: DriverError::new(DriverStatus::InvalidUserPrivilege, "get_bounds"),
            attempts: 4,
        };
        assert!(!transient.is_safety_critical());
        assert_eq!(transient.category(), "transient_driver");

        let safety = Error::safety("rollback failed");
        assert!(safety.is_safety_critical());
        assert_eq!(
            Error::UnstableOffsetDetected(350).to_string(),
            "Unstable offset detected at +350 MHz"
        );
    }

    #[test]
    fn test_error_categories() {
        assert_eq!(Error::config("test").category(), "configuration");
        assert_eq!(Error::apply_failed(100, "x").category(), "apply_failed");
        assert_eq!(Error::watchdog("test").category(), "watchdog_timeout");
    }
}

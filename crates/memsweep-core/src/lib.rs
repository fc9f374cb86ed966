//! # memsweep-core
//!
//! Core types, traits, and utilities for memsweep, a memory-clock overclock
//! sweep engine for graphics accelerators.
//!
//! This crate provides the foundational data structures and interfaces that are
//! shared across all other memsweep components. It includes:
//!
//! - Device identity, offset bounds, telemetry and stability sample types
//! - Traits for the vendor control surface and the device memory backend
//! - Layered configuration with validation
//! - Error handling types, including the driver status table

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

// Re-export commonly used types at the crate root
pub use config::{
    CacheConfig, Config, LoggingConfig, RetryConfig, SafetyConfig, SweepConfig, TesterConfig,
    MAX_STEP_MHZ,
};
pub use error::{DriverError, DriverStatus, Error, Result};
pub use traits::{ControlSurface, DriverResult, MemoryBackend};
pub use types::{
    Device, DeviceIdentity, DeviceOffsets, OffsetBounds, OffsetMhz, SampleStatus,
    StabilitySample, StructRevision, Telemetry, TransferStats, Verdict,
};

//! # memsweep-adapter-gpu
//!
//! Device adapters for memsweep: implementations of the control surface and
//! memory backend traits, plus telemetry health checks.
//!
//! This crate provides:
//! - A scriptable simulated GPU (`mock` feature) with a bandwidth, error and
//!   temperature model and per-operation driver failure injection
//! - A system RAM memory backend with wall-clock timing
//! - Health evaluation of telemetry snapshots, used by the thermal guard
//!
//! The vendor driver binding itself lives outside this workspace and plugs in
//! through [`memsweep_core::ControlSurface`].
//!
//! ## Example
//!
//! ```rust
//! # #[cfg(feature = "mock")]
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! use memsweep_adapter_gpu::{MockGpu, MockGpuConfig};
//! use memsweep_core::ControlSurface;
//!
//! let gpu = MockGpu::new(MockGpuConfig::default());
//! let devices = gpu.list_devices().await?;
//! gpu.set_memory_offset(&devices[0], 500).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod health;
pub mod host;

// Simulated device for tests and demos
#[cfg(any(feature = "mock", test))]
pub mod mock;

// Re-export main types
pub use config::{AdapterConfig, MemoryTarget, MockGpuConfig, MockOp, ScriptedFailure};
pub use health::{CheckStatus, DeviceHealth, HealthCheck, HealthStatus, HealthThresholds};
pub use host::HostMemory;

#[cfg(any(feature = "mock", test))]
pub use mock::{MockGpu, MockMemory};

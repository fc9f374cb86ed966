//! # memsweep-engine
//!
//! Finds the highest memory clock offset a GPU sustains without data errors
//! or a bandwidth collapse, without ever leaving the device at an unverified
//! offset.
//!
//! This crate provides:
//! - The offset controller, a safety state machine that owns every offset write
//! - A retry policy that separates transient driver failures from permanent ones
//! - A bit-pattern stability tester guarded by a watchdog
//! - Cliff detection over the bandwidth and error series
//! - A persistent per-device capability cache
//! - The sweep orchestrator tying them together into sessions
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use memsweep_adapter_gpu::{MockGpu, MockGpuConfig};
//! use memsweep_core::Config;
//! use memsweep_engine::SweepOrchestrator;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let gpu = MockGpu::new(MockGpuConfig::default());
//!     let orchestrator = SweepOrchestrator::new(
//!         Arc::new(gpu.clone()),
//!         Arc::new(gpu.memory(0)),
//!         Config::default(),
//!     )?;
//!
//!     let report = orchestrator.run(&gpu.identity(0), CancellationToken::new()).await?;
//!     println!("recommended offset: {:?}", report.recommended_offset);
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod cliff;
pub mod clocks;
pub mod controller;
pub mod lock;
pub mod orchestrator;
pub mod patterns;
pub mod profile;
pub mod retry;
pub mod session;
pub mod tester;

// Re-export main types
pub use cache::{CapabilityCache, CapabilityCacheEntry, Lookup, Validation};
pub use cliff::{CliffDetector, Decision};
pub use clocks::{ClockControl, ClockStatus, STOCK_POWER_LIMIT_PCT};
pub use controller::{OffsetController, OffsetState, RestorePoint, StableOffset};
pub use lock::{SessionGuard, SessionRegistry};
pub use orchestrator::{SweepFailure, SweepOrchestrator};
pub use patterns::BitPattern;
pub use profile::{OcProfile, PROFILE_SCHEMA};
pub use retry::{classify, Classification, RetryContext, RetryPolicy};
pub use session::{
    CliffCause, PeakBandwidth, SessionOutcome, StopReason, SweepReport, SweepSession,
};
pub use tester::{PatternTester, TestRun};

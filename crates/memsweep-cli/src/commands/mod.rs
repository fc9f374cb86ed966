//! Command implementations for the memsweep CLI

pub mod cache;
pub mod device;
pub mod profile;
pub mod sweep;

use crate::config::CliConfig;
use anyhow::{Context, Result};
use memsweep_adapter_gpu::{HostMemory, MemoryTarget, MockGpu};
use memsweep_core::{ControlSurface, DeviceIdentity, MemoryBackend};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Open the simulated GPU and find device `index` on it
pub async fn open_device(config: &CliConfig, index: u32) -> Result<(MockGpu, DeviceIdentity)> {
    let gpu = MockGpu::new(config.adapter.mock.clone());
    let devices = gpu
        .list_devices()
        .await
        .context("Failed to enumerate GPUs")?;
    let identity = devices
        .into_iter()
        .find(|d| d.index == index)
        .ok_or_else(|| anyhow::anyhow!("GPU {} not found", index))?;
    Ok((gpu, identity))
}

/// Memory the tester exercises for `identity`
pub fn memory_backend(
    config: &CliConfig,
    gpu: &MockGpu,
    identity: &DeviceIdentity,
) -> Arc<dyn MemoryBackend> {
    info!("Testing {} memory of {}", config.adapter.memory, identity);
    match config.adapter.memory {
        MemoryTarget::Device => Arc::new(gpu.memory(identity.index)),
        MemoryTarget::Host => Arc::new(HostMemory::new(config.adapter.host_memory_bytes)),
    }
}

/// Token cancelled on the first Ctrl-C
pub fn interrupt_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, returning the device to a safe offset");
            interrupt.cancel();
        }
    });
    cancel
}

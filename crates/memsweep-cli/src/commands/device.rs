//! The `status`, `reset` and `memtest` commands

use super::sweep::SampleRow;
use super::{interrupt_token, memory_backend, open_device};
use crate::config::CliConfig;
use crate::output::{format_offset, Formattable, OutputFormat, OutputFormatter};
use crate::MemtestArgs;
use anyhow::Result;
use memsweep_core::{DeviceIdentity, Error, MemoryBackend, StabilitySample, Verdict};
use memsweep_engine::{ClockControl, ClockStatus, TestRun};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Clock settings for display
#[derive(Debug, Serialize)]
pub struct ClockStatusInfo {
    pub device: String,
    pub bounds: String,
    pub memory_offset: String,
    pub temperature: String,
    pub power_draw: String,
    pub core_clock: String,
    pub memory_clock: String,
}

impl From<&ClockStatus> for ClockStatusInfo {
    fn from(status: &ClockStatus) -> Self {
        let telemetry = status.telemetry.as_ref();
        let or_dash = |value: Option<String>| value.unwrap_or_else(|| "-".to_string());
        Self {
            device: status.device.to_string(),
            bounds: status.bounds.to_string(),
            memory_offset: format_offset(Some(status.memory_offset_mhz)),
            temperature: or_dash(telemetry.map(|t| format!("{:.0}°C", t.temperature_c))),
            power_draw: or_dash(telemetry.map(|t| format!("{:.0} W", t.power_draw_w))),
            core_clock: or_dash(telemetry.map(|t| format!("{} MHz", t.core_clock_mhz))),
            memory_clock: or_dash(telemetry.map(|t| format!("{} MHz", t.memory_clock_mhz))),
        }
    }
}

impl Formattable for ClockStatusInfo {
    fn table_headers() -> Vec<String> {
        vec![
            "Device".to_string(),
            "Bounds".to_string(),
            "Memory Offset".to_string(),
            "Temp".to_string(),
            "Power".to_string(),
            "Core Clock".to_string(),
            "Memory Clock".to_string(),
        ]
    }

    fn table_row(&self) -> Vec<String> {
        vec![
            self.device.clone(),
            self.bounds.clone(),
            self.memory_offset.clone(),
            self.temperature.clone(),
            self.power_draw.clone(),
            self.core_clock.clone(),
            self.memory_clock.clone(),
        ]
    }

    fn key_value_pairs(&self) -> Vec<(String, String)> {
        Self::table_headers().into_iter().zip(self.table_row()).collect()
    }
}

async fn open_control(config: &CliConfig, gpu: u32) -> Result<(ClockControl, DeviceIdentity)> {
    let (gpu, identity) = open_device(config, gpu).await?;
    let control = ClockControl::new(Arc::new(gpu), config.engine.clone())?;
    Ok((control, identity))
}

/// Show the live clock settings of one GPU
pub async fn run_status(config: &CliConfig, gpu: u32, output_format: OutputFormat) -> Result<()> {
    let (control, identity) = open_control(config, gpu).await?;
    let status = control.status(&identity).await?;

    let formatter = OutputFormatter::new(output_format);
    formatter.print_item(&ClockStatusInfo::from(&status))?;
    Ok(())
}

/// Return every clock of one GPU to stock
pub async fn run_reset(config: &CliConfig, gpu: u32, output_format: OutputFormat) -> Result<()> {
    let (control, identity) = open_control(config, gpu).await?;
    let formatter = OutputFormatter::new(output_format);

    match control.reset(&identity).await {
        Ok(()) => {
            formatter.print_success(&format!("{} reset to stock clocks", identity))?;
            Ok(())
        }
        Err(e) => {
            formatter.print_error(&format!("Reset of {} incomplete: {}", identity, e))?;
            Err(e.into())
        }
    }
}

/// Pattern-test memory once at the offset already applied
pub async fn run_memtest(
    mut config: CliConfig,
    args: MemtestArgs,
    output_format: OutputFormat,
) -> Result<()> {
    config.apply_memtest_args(&args)?;
    let (gpu, identity) = open_device(&config, args.gpu).await?;
    let backend = memory_backend(&config, &gpu, &identity);
    let control = ClockControl::new(Arc::new(gpu), config.engine.clone())?;

    let formatter = OutputFormatter::new(output_format);
    let Some(sample) = memtest(&control, &identity, backend, &interrupt_token()).await? else {
        formatter.print_warning("Memory test cancelled")?;
        return Ok(());
    };

    let verdict = sample.verdict();
    formatter.print_item(&SampleRow::from_sample(&sample, verdict))?;
    check_verdict(&sample)?;
    formatter.print_success(&format!(
        "Memory stable at {:+} MHz ({:.2} GB/s)",
        sample.offset, sample.bandwidth_gbps
    ))?;
    Ok(())
}

/// One test run; `None` when cancelled
async fn memtest(
    control: &ClockControl,
    identity: &DeviceIdentity,
    backend: Arc<dyn MemoryBackend>,
    cancel: &CancellationToken,
) -> Result<Option<StabilitySample>> {
    match control.memtest(identity, backend, cancel).await? {
        TestRun::Sample(sample) => Ok(Some(sample)),
        TestRun::Cancelled => Ok(None),
    }
}

fn check_verdict(sample: &StabilitySample) -> std::result::Result<(), Error> {
    match sample.verdict() {
        Verdict::Stable => Ok(()),
        Verdict::Unstable => Err(Error::UnstableOffsetDetected(sample.offset)),
    }
}

//! The `sweep` command

use super::{interrupt_token, memory_backend, open_device};
use crate::config::CliConfig;
use crate::output::{
    colorize_status, format_duration_ms, format_offset, Formattable, OutputFormat,
    OutputFormatter,
};
use crate::SweepArgs;
use anyhow::Result;
use memsweep_core::{DeviceIdentity, SampleStatus, StabilitySample, Verdict};
use memsweep_engine::{CapabilityCache, SweepFailure, SweepOrchestrator, SweepReport};
use serde::Serialize;
use std::sync::Arc;

/// One sample as a table row
#[derive(Debug, Serialize)]
pub struct SampleRow {
    pub offset: i32,
    pub bandwidth_gbps: f64,
    pub errors: u64,
    pub passes: u32,
    pub temperature_c: Option<f64>,
    pub status: String,
    pub verdict: String,
}

impl SampleRow {
    pub fn from_sample(sample: &StabilitySample, verdict: Verdict) -> Self {
        let status = match &sample.status {
            SampleStatus::Completed => "completed".to_string(),
            SampleStatus::TimedOut => "timed out".to_string(),
            SampleStatus::Faulted(_) => "faulted".to_string(),
        };
        Self {
            offset: sample.offset,
            bandwidth_gbps: sample.bandwidth_gbps,
            errors: sample.error_count,
            passes: sample.passes,
            temperature_c: sample.telemetry.as_ref().map(|t| t.temperature_c),
            status,
            verdict: verdict.to_string(),
        }
    }
}

impl Formattable for SampleRow {
    fn table_headers() -> Vec<String> {
        vec![
            "Offset".to_string(),
            "Bandwidth".to_string(),
            "Errors".to_string(),
            "Passes".to_string(),
            "Temp".to_string(),
            "Status".to_string(),
            "Verdict".to_string(),
        ]
    }

    fn table_row(&self) -> Vec<String> {
        vec![
            format_offset(Some(self.offset)),
            format!("{:.2} GB/s", self.bandwidth_gbps),
            self.errors.to_string(),
            self.passes.to_string(),
            self.temperature_c
                .map(|t| format!("{:.0}°C", t))
                .unwrap_or_else(|| "-".to_string()),
            self.status.clone(),
            colorize_status(&self.verdict).to_string(),
        ]
    }

    fn key_value_pairs(&self) -> Vec<(String, String)> {
        Self::table_headers().into_iter().zip(self.table_row()).collect()
    }
}

/// Headline facts of a report
#[derive(Debug, Serialize)]
pub struct ReportSummary {
    pub session: String,
    pub device: String,
    pub bounds: String,
    pub range: String,
    pub stop_reason: String,
    pub recommended: String,
    pub peak: String,
    pub first_regression: String,
    pub first_error: String,
    pub final_state: String,
    pub duration: String,
}

impl ReportSummary {
    pub fn from_report(report: &SweepReport) -> Self {
        Self {
            session: report.id.to_string(),
            device: report.device.to_string(),
            bounds: report
                .bounds
                .map(|b| b.to_string())
                .unwrap_or_else(|| "-".to_string()),
            range: format!(
                "{:+} to {:+} MHz in {} MHz steps",
                report.start_offset, report.upper_bound, report.step_mhz
            ),
            stop_reason: report
                .stop_reason
                .as_ref()
                .map(|r| r.to_string())
                .unwrap_or_else(|| "-".to_string()),
            recommended: format_offset(report.recommended_offset),
            peak: report
                .peak
                .map(|p| format!("{:.2} GB/s at {:+} MHz", p.bandwidth_gbps, p.offset))
                .unwrap_or_else(|| "-".to_string()),
            first_regression: format_offset(report.first_regression_offset),
            first_error: format_offset(report.first_error_offset),
            final_state: report
                .final_state
                .map(|s| s.to_string())
                .unwrap_or_else(|| "untouched".to_string()),
            duration: format_duration_ms(report.duration().num_milliseconds().max(0) as u64),
        }
    }
}

impl Formattable for ReportSummary {
    fn table_headers() -> Vec<String> {
        vec!["Device".to_string(), "Recommended".to_string(), "Stop".to_string()]
    }

    fn table_row(&self) -> Vec<String> {
        vec![
            self.device.clone(),
            self.recommended.clone(),
            self.stop_reason.clone(),
        ]
    }

    fn key_value_pairs(&self) -> Vec<(String, String)> {
        vec![
            ("Session".to_string(), self.session.clone()),
            ("Device".to_string(), self.device.clone()),
            ("Bounds".to_string(), self.bounds.clone()),
            ("Range".to_string(), self.range.clone()),
            ("Stopped".to_string(), self.stop_reason.clone()),
            ("Recommended".to_string(), self.recommended.clone()),
            ("Peak".to_string(), self.peak.clone()),
            ("First regression".to_string(), self.first_regression.clone()),
            ("First error".to_string(), self.first_error.clone()),
            ("Final state".to_string(), colorize_status(&self.final_state).to_string()),
            ("Duration".to_string(), self.duration.clone()),
        ]
    }
}

/// Build the orchestrator for `args` against the simulated device
pub async fn build_orchestrator(
    config: &CliConfig,
    args: &SweepArgs,
) -> Result<(SweepOrchestrator, DeviceIdentity)> {
    let (gpu, identity) = open_device(config, args.gpu).await?;
    let backend = memory_backend(config, &gpu, &identity);

    let mut orchestrator = SweepOrchestrator::new(Arc::new(gpu), backend, config.engine.clone())?;
    if config.engine.cache.enabled {
        let path = config.engine.cache.resolved_path();
        orchestrator = orchestrator.with_cache(CapabilityCache::open(path));
    }
    if let Some(save) = &args.save {
        orchestrator = orchestrator.with_profile_output(save);
    }
    Ok((orchestrator, identity))
}

/// Run a sweep, cancelling safely on Ctrl-C
pub async fn run_sweep(
    mut config: CliConfig,
    args: SweepArgs,
    output_format: OutputFormat,
) -> Result<()> {
    config.apply_sweep_args(&args)?;
    let (orchestrator, identity) = build_orchestrator(&config, &args).await?;

    let cancel = interrupt_token();

    let formatter = OutputFormatter::new(output_format);
    match orchestrator.run(&identity, cancel).await {
        Ok(report) => {
            print_report(&formatter, &report)?;
            match report.recommended_offset {
                Some(offset) => {
                    formatter.print_success(&format!("Stable memory offset: {:+} MHz", offset))?
                }
                None => formatter.print_warning("No stable memory offset found")?,
            }
            Ok(())
        }
        Err(SweepFailure { error, report }) => {
            print_report(&formatter, &report)?;
            formatter.print_error(&error.to_string())?;
            Err(error.into())
        }
    }
}

fn print_report(formatter: &OutputFormatter, report: &SweepReport) -> Result<()> {
    if formatter.format() == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    let rows: Vec<SampleRow> = report
        .judged_samples()
        .map(|(sample, verdict)| SampleRow::from_sample(sample, verdict))
        .collect();
    formatter.print_list(&rows)?;
    println!();
    formatter.print_item(&ReportSummary::from_report(report))?;
    if let Some(path) = &report.profile_path {
        formatter.print_info(&format!("Profile saved to {}", path.display()))?;
    }
    Ok(())
}

//! Overclock profile commands

use super::open_device;
use crate::config::CliConfig;
use crate::output::{format_offset, Formattable, OutputFormat, OutputFormatter};
use crate::ProfileCommands;
use anyhow::{Context, Result};
use memsweep_engine::{ClockControl, OcProfile};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

/// Saved profile for display
#[derive(Debug, Serialize)]
pub struct ProfileInfo {
    #[serde(flatten)]
    pub profile: OcProfile,
}

impl Formattable for ProfileInfo {
    fn table_headers() -> Vec<String> {
        vec![
            "GPU".to_string(),
            "Bus".to_string(),
            "Core".to_string(),
            "Memory".to_string(),
            "Power Limit".to_string(),
            "Fan".to_string(),
            "Saved".to_string(),
        ]
    }

    fn table_row(&self) -> Vec<String> {
        let p = &self.profile;
        vec![
            p.gpu_name.clone(),
            p.bus_id.to_string(),
            format_offset(Some(p.core_offset_mhz)),
            format_offset(Some(p.mem_offset_mhz)),
            format!("{:.0}%", p.power_limit_pct),
            p.fan_pct
                .map(|f| format!("{}%", f))
                .unwrap_or_else(|| "auto".to_string()),
            p.saved_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        ]
    }

    fn key_value_pairs(&self) -> Vec<(String, String)> {
        Self::table_headers().into_iter().zip(self.table_row()).collect()
    }
}

fn load(path: &Path) -> Result<OcProfile> {
    OcProfile::load(path).with_context(|| format!("Failed to load profile {}", path.display()))
}

/// Handle profile commands
pub async fn handle_profile_command(
    config: &CliConfig,
    action: ProfileCommands,
    output_format: OutputFormat,
) -> Result<()> {
    let formatter = OutputFormatter::new(output_format);

    match action {
        ProfileCommands::Show { path } => {
            let profile = load(&path)?;
            formatter.print_item(&ProfileInfo { profile })?;
        }
        ProfileCommands::Apply { path, gpu } => {
            let profile = load(&path)?;
            let (gpu, identity) = open_device(config, gpu).await?;
            let control = ClockControl::new(Arc::new(gpu), config.engine.clone())?;

            let offsets = control.apply_profile(&identity, &profile).await?;
            formatter.print_success(&format!(
                "Applied {} to {}: memory {:+} MHz, core {:+} MHz",
                path.display(),
                identity,
                offsets.memory_mhz,
                offsets.core_mhz
            ))?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use memsweep_adapter_gpu::{AdapterConfig, MockGpuConfig};
    use memsweep_core::{Config, DeviceIdentity, DeviceOffsets, OffsetBounds};
    use tempfile::TempDir;

    fn test_config() -> CliConfig {
        let adapter = AdapterConfig::default().with_mock(
            MockGpuConfig::flat(100.0, OffsetBounds::new(-500, 1000)).with_device_count(3),
        );
        CliConfig::for_test(Config::default(), adapter)
    }

    async fn saved_profile(dir: &TempDir, memory_mhz: i32) -> std::path::PathBuf {
        let identity = DeviceIdentity::new(0x10de, 0, "Mock GeForce RTX 3080", 1);
        let offsets = DeviceOffsets {
            core_mhz: 50,
            memory_mhz,
            ..DeviceOffsets::default()
        };
        OcProfile::new(&identity, &offsets)
            .save_to(dir.path().join("daily"))
            .await
            .unwrap()
    }

    #[test]
    fn test_profile_rows() {
        let identity = DeviceIdentity::new(0x10de, 0, "Mock GeForce RTX 3080", 1);
        let offsets = DeviceOffsets {
            memory_mhz: 500,
            ..DeviceOffsets::default()
        };
        let info = ProfileInfo {
            profile: OcProfile::new(&identity, &offsets),
        };

        let row = info.table_row();
        assert_eq!(row[2], "+0 MHz");
        assert_eq!(row[3], "+500 MHz");
        assert_eq!(row[4], "100%");
        assert_eq!(row[5], "auto");
    }

    #[tokio::test]
    async fn test_show_missing_profile_fails() {
        let dir = TempDir::new().unwrap();
        let action = ProfileCommands::Show {
            path: dir.path().join("missing.json"),
        };
        assert!(handle_profile_command(&test_config(), action, OutputFormat::Json)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_apply_profile() {
        let dir = TempDir::new().unwrap();
        let path = saved_profile(&dir, 700).await;

        let action = ProfileCommands::Apply { path, gpu: 0 };
        handle_profile_command(&test_config(), action, OutputFormat::Json)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_apply_out_of_bounds_profile_fails() {
        let dir = TempDir::new().unwrap();
        let path = saved_profile(&dir, 1200).await;

        let action = ProfileCommands::Apply { path, gpu: 2 };
        let err = handle_profile_command(&test_config(), action, OutputFormat::Json)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("outside device bounds"));
    }
}

//! Overclock profile files

use chrono::{DateTime, Utc};
use memsweep_core::{DeviceIdentity, DeviceOffsets, Error, OffsetMhz, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// Schema tag written into every profile
pub const PROFILE_SCHEMA: &str = "memsweep-profile/1";

/// Saved clock settings for one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcProfile {
    pub schema: String,
    pub saved_at: DateTime<Utc>,
    pub gpu_name: String,
    pub bus_id: u32,
    pub core_offset_mhz: OffsetMhz,
    pub mem_offset_mhz: OffsetMhz,
    pub power_limit_pct: f64,
    /// `None` means automatic fan control
    pub fan_pct: Option<u8>,
}

impl OcProfile {
    pub fn new(device: &DeviceIdentity, offsets: &DeviceOffsets) -> Self {
        Self {
            schema: PROFILE_SCHEMA.to_string(),
            saved_at: Utc::now(),
            gpu_name: device.name.clone(),
            bus_id: device.bus_id,
            core_offset_mhz: offsets.core_mhz,
            mem_offset_mhz: offsets.memory_mhz,
            power_limit_pct: offsets.power_limit_pct,
            fan_pct: offsets.fan_pct,
        }
    }

    /// Write the profile; a path without extension gets `.json`
    pub async fn save_to(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let mut path = path.as_ref().to_path_buf();
        if path.extension().is_none() {
            path.set_extension("json");
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        info!("Saved profile to {}", path.display());
        Ok(path)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read_to_string(path.as_ref())?;
        let profile: OcProfile = serde_json::from_str(&data)?;
        if profile.schema != PROFILE_SCHEMA {
            return Err(Error::config(format!(
                "Unsupported profile schema '{}' in {}",
                profile.schema,
                path.as_ref().display()
            )));
        }
        Ok(profile)
    }
}

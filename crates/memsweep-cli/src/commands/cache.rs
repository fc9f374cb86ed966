//! Capability cache commands

use crate::config::CliConfig;
use crate::output::{format_offset, Formattable, OutputFormat, OutputFormatter};
use crate::CacheCommands;
use anyhow::Result;
use memsweep_engine::{CapabilityCache, CapabilityCacheEntry};
use serde::Serialize;

/// Cache entry for display
#[derive(Debug, Serialize)]
pub struct CacheEntryInfo {
    pub device: String,
    pub driver: String,
    pub bounds: String,
    pub last_known_good: String,
    pub cached_at: String,
    pub discovery_time_ms: u64,
}

impl From<&CapabilityCacheEntry> for CacheEntryInfo {
    fn from(entry: &CapabilityCacheEntry) -> Self {
        Self {
            device: entry.identity.to_string(),
            driver: format!(
                "{} (layout {})",
                entry.revision.driver_version, entry.revision.layout
            ),
            bounds: entry.bounds.to_string(),
            last_known_good: format_offset(entry.last_known_good),
            cached_at: entry.cached_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            discovery_time_ms: entry.discovery_time_ms,
        }
    }
}

impl Formattable for CacheEntryInfo {
    fn table_headers() -> Vec<String> {
        vec![
            "Device".to_string(),
            "Driver".to_string(),
            "Bounds".to_string(),
            "Last Known Good".to_string(),
            "Cached".to_string(),
            "Discovery".to_string(),
        ]
    }

    fn table_row(&self) -> Vec<String> {
        vec![
            self.device.clone(),
            self.driver.clone(),
            self.bounds.clone(),
            self.last_known_good.clone(),
            self.cached_at.clone(),
            format!("{}ms", self.discovery_time_ms),
        ]
    }

    fn key_value_pairs(&self) -> Vec<(String, String)> {
        Self::table_headers().into_iter().zip(self.table_row()).collect()
    }
}

/// Handle cache commands
pub async fn handle_cache_command(
    config: &CliConfig,
    action: CacheCommands,
    output_format: OutputFormat,
) -> Result<()> {
    let formatter = OutputFormatter::new(output_format);
    let mut cache = CapabilityCache::open(config.engine.cache.resolved_path());

    match action {
        CacheCommands::Show => {
            let entries = list_entries(&cache);
            if output_format == OutputFormat::Table {
                formatter.print_info(&format!("Cache file: {}", cache.path().display()))?;
            }
            formatter.print_list(&entries)?;
        }
        CacheCommands::Clear => {
            let removed = cache.clear().await?;
            formatter.print_success(&format!(
                "Removed {} cached device(s) from {}",
                removed,
                cache.path().display()
            ))?;
        }
    }

    Ok(())
}

fn list_entries(cache: &CapabilityCache) -> Vec<CacheEntryInfo> {
    cache.entries().map(CacheEntryInfo::from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use memsweep_core::{DeviceIdentity, OffsetBounds, StructRevision};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_list_entries() {
        let dir = TempDir::new().unwrap();
        let mut cache = CapabilityCache::open(dir.path().join("device_cache.json"));
        assert!(list_entries(&cache).is_empty());

        let identity = DeviceIdentity::new(0x10de, 0, "Mock GeForce RTX 3080", 1);
        cache
            .store(CapabilityCacheEntry::new(
                identity,
                StructRevision::new("555.85", 1),
                OffsetBounds::new(-1000, 1500),
                42,
            ))
            .await
            .unwrap();

        let entries = list_entries(&cache);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].driver, "555.85 (layout 1)");
        assert_eq!(entries[0].last_known_good, "-");
        assert_eq!(entries[0].table_row()[5], "42ms");
    }
}

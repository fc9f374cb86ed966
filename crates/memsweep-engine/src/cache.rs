//! Per-device capability cache
//!
//! Remembers the offset bounds and last-known-good memory offset of every
//! device, keyed by device identity, so later sessions can skip discovery. An
//! entry is only trusted while the driver's struct revision is unchanged.
//! A missing or unreadable cache file behaves as an empty cache.

use crate::controller::StableOffset;
use chrono::{DateTime, Utc};
use memsweep_core::{DeviceIdentity, OffsetBounds, OffsetMhz, Result, StructRevision};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const CACHE_SCHEMA: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityCacheEntry {
    pub identity: DeviceIdentity,
    pub revision: StructRevision,
    pub bounds: OffsetBounds,
    /// Only ever set from a verified stable offset
    pub last_known_good: Option<OffsetMhz>,
    pub cached_at: DateTime<Utc>,
    /// Time the hardware discovery took
    pub discovery_time_ms: u64,
}

impl CapabilityCacheEntry {
    pub fn new(
        identity: DeviceIdentity,
        revision: StructRevision,
        bounds: OffsetBounds,
        discovery_time_ms: u64,
    ) -> Self {
        Self {
            identity,
            revision,
            bounds,
            last_known_good: None,
            cached_at: Utc::now(),
            discovery_time_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Hit(CapabilityCacheEntry),
    Miss,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Validation {
    Valid,
    Stale { cached: StructRevision, current: StructRevision },
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheFile {
    schema: u32,
    entries: BTreeMap<String, CapabilityCacheEntry>,
}

/// JSON-backed capability cache
#[derive(Debug)]
pub struct CapabilityCache {
    path: PathBuf,
    entries: BTreeMap<String, CapabilityCacheEntry>,
}

impl CapabilityCache {
    /// Open the cache at `path`; a missing, corrupt or unreadable file is empty
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match Self::read(&path) {
            Ok(Some(file)) => {
                debug!("Loaded {} cache entries from {}", file.entries.len(), path.display());
                file.entries
            }
            Ok(None) => BTreeMap::new(),
            Err(e) => {
                warn!("Ignoring unreadable device cache {}: {}", path.display(), e);
                BTreeMap::new()
            }
        };
        Self { path, entries }
    }

    fn read(path: &Path) -> Result<Option<CacheFile>> {
        if !path.exists() {
            return Ok(None);
        }
        let data = std::fs::read_to_string(path)?;
        let file: CacheFile = serde_json::from_str(&data)?;
        if file.schema != CACHE_SCHEMA {
            warn!(
                "Device cache {} has schema {}, expected {}",
                path.display(),
                file.schema,
                CACHE_SCHEMA
            );
            return Ok(None);
        }
        Ok(Some(file))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lookup(&self, identity: &DeviceIdentity) -> Lookup {
        match self.entries.get(&identity.key()) {
            Some(entry) => Lookup::Hit(entry.clone()),
            None => Lookup::Miss,
        }
    }

    /// Check a cached entry against the revision the driver reports now
    pub fn validate(entry: &CapabilityCacheEntry, current: &StructRevision) -> Validation {
        if &entry.revision == current {
            Validation::Valid
        } else {
            Validation::Stale {
                cached: entry.revision.clone(),
                current: current.clone(),
            }
        }
    }

    /// Insert or replace an entry and persist the cache
    pub async fn store(&mut self, entry: CapabilityCacheEntry) -> Result<()> {
        info!("Caching capabilities of {} ({})", entry.identity, entry.bounds);
        self.entries.insert(entry.identity.key(), entry);
        self.save().await
    }

    /// Drop the entry for `identity`; returns whether one existed
    pub async fn invalidate(&mut self, identity: &DeviceIdentity) -> Result<bool> {
        let removed = self.entries.remove(&identity.key()).is_some();
        if removed {
            info!("Invalidated cached capabilities of {}", identity);
            self.save().await?;
        }
        Ok(removed)
    }

    /// Record a verified stable offset as the device's last-known-good
    pub async fn update_last_known_good(
        &mut self,
        identity: &DeviceIdentity,
        stable: StableOffset,
    ) -> Result<()> {
        match self.entries.get_mut(&identity.key()) {
            Some(entry) => {
                entry.last_known_good = Some(stable.offset());
                self.save().await
            }
            None => {
                debug!("No cache entry for {}, last-known-good not stored", identity);
                Ok(())
            }
        }
    }

    /// Forget the last-known-good of a device that no longer passes there
    pub async fn forget_last_known_good(&mut self, identity: &DeviceIdentity) -> Result<()> {
        match self.entries.get_mut(&identity.key()) {
            Some(entry) if entry.last_known_good.is_some() => {
                entry.last_known_good = None;
                self.save().await
            }
            _ => Ok(()),
        }
    }

    /// Remove every entry; returns how many were dropped
    pub async fn clear(&mut self) -> Result<usize> {
        let count = self.entries.len();
        self.entries.clear();
        if tokio::fs::try_exists(&self.path).await? {
            tokio::fs::remove_file(&self.path).await?;
        }
        info!("Cleared {} device cache entries", count);
        Ok(count)
    }

    /// Entries ordered by device key
    pub fn entries(&self) -> impl Iterator<Item = &CapabilityCacheEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Write via a temporary file and rename so readers never see a torn file
    async fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = CacheFile {
            schema: CACHE_SCHEMA,
            entries: self.entries.clone(),
        };
        let json = serde_json::to_string_pretty(&file)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn identity(index: u32) -> DeviceIdentity {
        DeviceIdentity::new(0x10de, index, "Test GPU", index + 1)
    }

    fn entry(index: u32) -> CapabilityCacheEntry {
        CapabilityCacheEntry::new(
            identity(index),
            StructRevision::new("555.85", 1),
            OffsetBounds::new(-1000, 1500),
            1234,
        )
    }

    #[tokio::test]
    async fn test_store_and_lookup_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("device_cache.json");

        let mut stored = entry(0);
        stored.last_known_good = Some(450);
        let mut cache = CapabilityCache::open(&path);
        assert_eq!(cache.lookup(&identity(0)), Lookup::Miss);
        cache.store(stored.clone()).await.unwrap();

        let reopened = CapabilityCache::open(&path);
        let hit = match reopened.lookup(&identity(0)) {
            Lookup::Hit(hit) => hit,
            Lookup::Miss => panic!("expected a cache hit"),
        };
        assert_eq!(hit, stored);
        assert_eq!(
            CapabilityCache::validate(&hit, &StructRevision::new("555.85", 1)),
            Validation::Valid
        );
        assert_eq!(reopened.lookup(&identity(1)), Lookup::Miss);
    }

    #[test]
    fn test_revision_change_is_stale() {
        let cached = entry(0);
        assert!(matches!(
            CapabilityCache::validate(&cached, &StructRevision::new("560.70", 1)),
            Validation::Stale { .. }
        ));
        assert!(matches!(
            CapabilityCache::validate(&cached, &StructRevision::new("555.85", 2)),
            Validation::Stale { .. }
        ));
    }

    #[tokio::test]
    async fn test_corrupt_file_is_a_miss() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("device_cache.json");
        std::fs::write(&path, "{ not json").unwrap();

        let mut cache = CapabilityCache::open(&path);
        assert!(cache.is_empty());
        assert_eq!(cache.lookup(&identity(0)), Lookup::Miss);

        // the next store replaces the corrupt file
        cache.store(entry(0)).await.unwrap();
        assert_eq!(CapabilityCache::open(&path).len(), 1);
    }

    #[tokio::test]
    async fn test_store_failure_is_reported() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("not_a_dir");
        std::fs::write(&blocker, "").unwrap();

        let mut cache = CapabilityCache::open(blocker.join("device_cache.json"));
        assert!(cache.store(entry(0)).await.is_err());
    }

    #[tokio::test]
    async fn test_last_known_good_updates() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("device_cache.json");
        let mut cache = CapabilityCache::open(&path);
        cache.store(entry(0)).await.unwrap();

        cache
            .update_last_known_good(&identity(0), StableOffset::new_for_test(600))
            .await
            .unwrap();
        match CapabilityCache::open(&path).lookup(&identity(0)) {
            Lookup::Hit(hit) => assert_eq!(hit.last_known_good, Some(600)),
            Lookup::Miss => panic!("expected a cache hit"),
        }

        cache.forget_last_known_good(&identity(0)).await.unwrap();
        match cache.lookup(&identity(0)) {
            Lookup::Hit(hit) => assert_eq!(hit.last_known_good, None),
            Lookup::Miss => panic!("expected a cache hit"),
        }
    }

    #[tokio::test]
    async fn test_invalidate_and_clear() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("device_cache.json");
        let mut cache = CapabilityCache::open(&path);
        cache.store(entry(0)).await.unwrap();
        cache.store(entry(1)).await.unwrap();

        assert!(cache.invalidate(&identity(0)).await.unwrap());
        assert!(!cache.invalidate(&identity(0)).await.unwrap());
        assert_eq!(cache.entries().count(), 1);

        assert_eq!(cache.clear().await.unwrap(), 1);
        assert!(!path.exists());
        assert!(CapabilityCache::open(&path).is_empty());
    }
}

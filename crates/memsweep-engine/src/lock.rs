//! In-process exclusive session locks, one per device identity

use memsweep_core::{DeviceIdentity, Error, Result};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use tracing::debug;

/// Registry of devices currently owned by a sweep session
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    held: Arc<Mutex<HashSet<String>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide registry
    pub fn global() -> &'static SessionRegistry {
        static GLOBAL: OnceLock<SessionRegistry> = OnceLock::new();
        GLOBAL.get_or_init(SessionRegistry::new)
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take exclusive ownership of `identity` until the guard drops
    pub fn acquire(&self, identity: &DeviceIdentity) -> Result<SessionGuard> {
        let key = identity.key();
        if !self.lock().insert(key.clone()) {
            return Err(Error::session_busy(format!(
                "a sweep is already running on {}",
                identity
            )));
        }
        debug!("Acquired session lock for {}", identity);
        Ok(SessionGuard {
            registry: self.clone(),
            key,
        })
    }

    pub fn is_held(&self, identity: &DeviceIdentity) -> bool {
        self.lock().contains(&identity.key())
    }
}

/// Releases the device on drop
#[derive(Debug)]
pub struct SessionGuard {
    registry: SessionRegistry,
    key: String,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.key);
        debug!("Released session lock for {}", self.key);
    }
}

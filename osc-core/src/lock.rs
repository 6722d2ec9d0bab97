//! Per-resource locks
//!
//! Serializes reconcile operations on one cloud resource within a process: two
//! operations holding the same identifier never run their waits or mutations
//! concurrently.

use std::sync::Arc;

use dashmap::DashMap;
use log::debug;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Registry of async mutexes keyed by cloud identifier (vol-xxx, i-xxx, ...)
#[derive(Debug, Clone, Default)]
pub struct ResourceLocks {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

/// Held while an operation owns a resource; released on drop
#[derive(Debug)]
pub struct ResourceGuard {
    identifier: String,
    _guard: OwnedMutexGuard<()>,
}

impl ResourceGuard {
    pub fn identifier(&self) -> &str {
        &self.identifier
    }
}

impl ResourceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until no other operation holds `identifier`, then take it
    pub async fn lock(&self, identifier: &str) -> ResourceGuard {
        // Clone the Arc so the map shard is not held across the await
        let mutex = self
            .locks
            .entry(identifier.to_string())
            .or_default()
            .value()
            .clone();

        if mutex.try_lock().is_err() {
            debug!("waiting for lock on {}", identifier);
        }

        ResourceGuard {
            identifier: identifier.to_string(),
            _guard: mutex.lock_owned().await,
        }
    }

    /// Whether an operation currently holds `identifier`
    #[cfg(test)]
    pub(crate) fn is_locked(&self, identifier: &str) -> bool {
        self.locks
            .get(identifier)
            .is_some_and(|mutex| mutex.try_lock().is_err())
    }

    /// Forget mutexes nobody holds or waits on
    pub fn prune(&self) {
        self.locks.retain(|_, mutex| Arc::strong_count(mutex) > 1);
        debug!("{} resource locks in use", self.locks.len());
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.locks.len()
    }
}

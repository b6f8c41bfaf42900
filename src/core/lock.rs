//! Per-target install locks.
//!
//! Concurrent runs in one process may deploy to the same `host:path`. The
//! backup rename and the extraction chain must not interleave for one
//! target, so installs take the target's lock first. Nothing here is visible
//! to other processes.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Shared across runs via `Orchestrator`. Clones hand out the same locks.
#[derive(Clone, Default)]
pub struct TargetLocks {
    inner: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl TargetLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock key for one remote path on one host.
    pub fn key(host: &str, port: u16, remote_path: &str) -> String {
        format!("{}:{}:{}", host, port, remote_path)
    }

    /// Wait for exclusive use of `key`. Released when the guard drops.
    pub async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().await;
            // An entry only the map references has no holder and no waiter.
            map.retain(|k, lock| k == key || Arc::strong_count(lock) > 1);
            map.entry(key.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Number of targets with a lock entry. Idle entries are dropped on the
    /// next `acquire`.
    pub async fn tracked(&self) -> usize {
        self.inner.lock().await.len()
    }
}

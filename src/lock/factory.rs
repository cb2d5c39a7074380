use std::sync::Arc;

use crate::config::LockConfig;
use crate::error::{CoordError, Result};
use crate::lock::distributed::DistributedLock;
use crate::lock::document::LockDocument;
use crate::store::Repository;

/// Hands out [`DistributedLock`]s bound to this host and cleans up after a
/// previous incarnation of it.
#[derive(Clone)]
pub struct LockFactory {
    host_id: String,
    locks: Arc<dyn Repository<LockDocument>>,
    config: LockConfig,
}

impl LockFactory {
    pub fn new(
        host_id: impl Into<String>,
        locks: Arc<dyn Repository<LockDocument>>,
        config: LockConfig,
    ) -> Self {
        Self {
            host_id: host_id.into(),
            locks,
            config,
        }
    }

    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    /// Crash recovery: drop every lease and queue slot recorded under this
    /// host id. Must run before the host takes any lock, since anything it
    /// finds can only belong to a process that no longer exists.
    ///
    /// Returns the number of lock documents that were touched.
    pub async fn init(&self) -> Result<usize> {
        let host_id = self.host_id.as_str();
        let cleared = self
            .locks
            .update_all(
                &|d: &LockDocument| d.is_held_by_host(host_id),
                &|d: &mut LockDocument| {
                    d.release_host(host_id);
                },
            )
            .await?;
        if cleared > 0 {
            tracing::info!(host_id, cleared, "Released locks left by previous run");
        }
        Ok(cleared)
    }

    /// Ensure the lock document for `id` exists and return a handle to it.
    /// Creating a lock that already exists is not an error.
    pub async fn create(&self, id: &str) -> Result<DistributedLock> {
        match self.locks.insert(LockDocument::new(id)).await {
            Ok(()) | Err(CoordError::DuplicateKey(_)) => {}
            Err(e) => return Err(e),
        }
        Ok(self.get(id))
    }

    /// Handle to a lock without touching the store. The document is created
    /// lazily by the first acquisition.
    pub fn get(&self, id: &str) -> DistributedLock {
        DistributedLock::new(id, self.host_id.clone(), self.locks.clone(), self.config.clone())
    }

    /// Remove the lock document. Returns whether it existed.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let deleted = self.locks.delete(&|d: &LockDocument| d.id == id).await?;
        Ok(deleted.is_some())
    }
}

use std::sync::Arc;

use crate::error::Result;
use crate::lock::document::LockDocument;
use crate::store::{Repository, UpdateOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Reader,
    Writer,
}

impl std::fmt::Display for LockKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockKind::Reader => write!(f, "reader"),
            LockKind::Writer => write!(f, "writer"),
        }
    }
}

/// Handle to a granted lease.
///
/// Release it with [`LockGuard::release`] to observe the outcome. A guard
/// that is dropped without being released (panic, early return, a cancelled
/// future) schedules the release on the current tokio runtime instead, so
/// the lease is always given back exactly once.
pub struct LockGuard {
    locks: Arc<dyn Repository<LockDocument>>,
    resource_id: String,
    lock_id: String,
    kind: LockKind,
    released: bool,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("resource_id", &self.resource_id)
            .field("lock_id", &self.lock_id)
            .field("kind", &self.kind)
            .field("released", &self.released)
            .finish()
    }
}

impl LockGuard {
    pub(super) fn new(
        locks: Arc<dyn Repository<LockDocument>>,
        resource_id: String,
        lock_id: String,
        kind: LockKind,
    ) -> Self {
        Self {
            locks,
            resource_id,
            lock_id,
            kind,
            released: false,
        }
    }

    pub fn lock_id(&self) -> &str {
        &self.lock_id
    }

    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    pub fn kind(&self) -> LockKind {
        self.kind
    }

    /// Give the lease back and wait for the store to confirm.
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        release_lease(&*self.locks, &self.resource_id, &self.lock_id, self.kind).await
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        let locks = self.locks.clone();
        let resource_id = self.resource_id.clone();
        let lock_id = self.lock_id.clone();
        let kind = self.kind;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = release_lease(&*locks, &resource_id, &lock_id, kind).await {
                        tracing::warn!(
                            resource_id = %resource_id,
                            lock_id = %lock_id,
                            error = %e,
                            "Failed to release dropped lock"
                        );
                    }
                });
            }
            Err(_) => {
                tracing::warn!(
                    resource_id = %resource_id,
                    lock_id = %lock_id,
                    "Lock dropped outside a runtime; lease stays until it expires"
                );
            }
        }
    }
}

pub(crate) async fn release_lease(
    locks: &dyn Repository<LockDocument>,
    resource_id: &str,
    lock_id: &str,
    kind: LockKind,
) -> Result<()> {
    let released = match kind {
        LockKind::Writer => {
            locks
                .update(
                    &|d: &LockDocument| {
                        d.id == resource_id
                            && d.writer_lock.as_ref().is_some_and(|l| l.lock_id == lock_id)
                    },
                    &|d: &mut LockDocument| d.writer_lock = None,
                    UpdateOptions::default(),
                )
                .await?
        }
        LockKind::Reader => {
            locks
                .update(
                    &|d: &LockDocument| {
                        d.id == resource_id && d.reader_locks.iter().any(|l| l.lock_id == lock_id)
                    },
                    &|d: &mut LockDocument| d.reader_locks.retain(|l| l.lock_id != lock_id),
                    UpdateOptions::default(),
                )
                .await?
        }
    };

    if released.is_none() {
        // Already gone: expired and reclaimed, or cleared by crash recovery.
        tracing::debug!(resource_id, lock_id, kind = %kind, "Lease was no longer held");
    } else {
        tracing::debug!(resource_id, lock_id, kind = %kind, "Lease released");
    }
    Ok(())
}

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::LockConfig;
use crate::error::{CoordError, Result};
use crate::lock::document::{Lease, LockDocument, QueuedWriter};
use crate::lock::guard::{LockGuard, LockKind};
use crate::lock::timer::random_poll_interval;
use crate::store::{Repository, SharedFilter, Subscription, UpdateOptions};

/// A named reader-writer lock shared by every host that uses the same
/// lock repository.
///
/// Readers share the lock, writers are exclusive and served in arrival
/// order. Once a writer is queued no new reader gets in until the queue has
/// drained.
#[derive(Clone)]
pub struct DistributedLock {
    id: String,
    host_id: String,
    locks: Arc<dyn Repository<LockDocument>>,
    config: LockConfig,
}

impl std::fmt::Debug for DistributedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedLock")
            .field("id", &self.id)
            .field("host_id", &self.host_id)
            .finish()
    }
}

impl DistributedLock {
    pub(crate) fn new(
        id: impl Into<String>,
        host_id: impl Into<String>,
        locks: Arc<dyn Repository<LockDocument>>,
        config: LockConfig,
    ) -> Self {
        Self {
            id: id.into(),
            host_id: host_id.into(),
            locks,
            config,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Acquire a shared lease. `lease` falls back to the configured default;
    /// `None` for both means the lease never expires.
    pub async fn reader_lock(
        &self,
        lease: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<LockGuard> {
        if cancel.is_cancelled() {
            return Err(CoordError::Cancelled);
        }
        let lease = lease.or(self.config.default_lease);
        let lock_id = Uuid::new_v4().to_string();

        if !self.try_acquire_reader(&lock_id, lease).await? {
            let mut sub = self.subscribe().await?;
            let mut retried_now = false;
            loop {
                if cancel.is_cancelled() {
                    return Err(CoordError::Cancelled);
                }
                let now = Utc::now();
                let timeout = match sub.change().entity.as_ref() {
                    Some(doc) if !doc.is_available_for_reading(now) => {
                        self.wait_timeout(doc.reader_wait_deadline(), now)
                    }
                    _ => Duration::ZERO,
                };
                self.pause(&mut *sub, timeout, &mut retried_now, cancel)
                    .await?;
                if self.try_acquire_reader(&lock_id, lease).await? {
                    break;
                }
            }
        }

        tracing::debug!(resource_id = %self.id, lock_id = %lock_id, "Reader lock acquired");
        Ok(self.guard(lock_id, LockKind::Reader))
    }

    /// Acquire the exclusive lease, queueing behind earlier writers.
    ///
    /// If acquisition fails or is cancelled, this caller's queue entry is
    /// removed before the error is returned so that later writers are not
    /// stuck behind it.
    pub async fn writer_lock(
        &self,
        lease: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<LockGuard> {
        if cancel.is_cancelled() {
            return Err(CoordError::Cancelled);
        }
        let lease = lease.or(self.config.default_lease);
        let lock_id = Uuid::new_v4().to_string();

        if !self.try_acquire_writer(&lock_id, lease).await? {
            if let Err(e) = self.queue_and_wait(&lock_id, lease, cancel).await {
                // Runs regardless of `cancel`.
                if let Err(cleanup) = self.dequeue_writer(&lock_id).await {
                    tracing::warn!(
                        resource_id = %self.id,
                        lock_id = %lock_id,
                        error = %cleanup,
                        "Failed to remove abandoned writer from queue"
                    );
                }
                return Err(e);
            }
        }

        tracing::debug!(resource_id = %self.id, lock_id = %lock_id, "Writer lock acquired");
        Ok(self.guard(lock_id, LockKind::Writer))
    }

    /// Run `f` while holding a reader lease, releasing it on every exit path.
    pub async fn with_reader_lock<T, F, Fut>(
        &self,
        lease: Option<Duration>,
        cancel: &CancellationToken,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let guard = self.reader_lock(lease, cancel).await?;
        scoped(guard, f).await
    }

    /// Run `f` while holding the writer lease, releasing it on every exit path.
    pub async fn with_writer_lock<T, F, Fut>(
        &self,
        lease: Option<Duration>,
        cancel: &CancellationToken,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let guard = self.writer_lock(lease, cancel).await?;
        scoped(guard, f).await
    }

    async fn queue_and_wait(
        &self,
        lock_id: &str,
        lease: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.enqueue_writer(lock_id).await?;
        let mut sub = self.subscribe().await?;
        let mut retried_now = false;
        loop {
            if cancel.is_cancelled() {
                return Err(CoordError::Cancelled);
            }
            let now = Utc::now();
            let timeout = match sub.change().entity.as_ref() {
                Some(doc) if !doc.is_available_for_writing(lock_id, now) => {
                    if !doc.is_queued(lock_id) {
                        // Our slot was force-released; rejoin at the back.
                        tracing::debug!(resource_id = %self.id, lock_id, "Writer re-queued");
                        self.enqueue_writer(lock_id).await?;
                    }
                    self.wait_timeout(doc.writer_wait_deadline(), now)
                }
                _ => Duration::ZERO,
            };
            self.pause(&mut *sub, timeout, &mut retried_now, cancel)
                .await?;
            if self.try_acquire_writer(lock_id, lease).await? {
                return Ok(());
            }
        }
    }

    /// Wait between attempts. A zero timeout means the snapshot suggests we
    /// can go now, so retry immediately once; a second zero in a row means
    /// the snapshot is stale or a dead lease sits at the head, so fall back
    /// to the poll interval.
    async fn pause(
        &self,
        sub: &mut dyn Subscription<LockDocument>,
        timeout: Duration,
        retried_now: &mut bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let timeout = if timeout.is_zero() {
            if !*retried_now {
                *retried_now = true;
                return Ok(());
            }
            random_poll_interval(self.config.poll_interval)
        } else {
            timeout
        };
        *retried_now = false;

        tokio::select! {
            _ = cancel.cancelled() => Err(CoordError::Cancelled),
            result = sub.wait_for_change(Some(timeout)) => result,
        }
    }

    /// Time until the holders should have expired, capped by the jittered
    /// poll interval. Zero when the deadline has already passed.
    fn wait_timeout(&self, deadline: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Duration {
        let poll = random_poll_interval(self.config.poll_interval);
        match deadline {
            Some(deadline) => (deadline - now)
                .to_std()
                .unwrap_or(Duration::ZERO)
                .min(poll),
            None => poll,
        }
    }

    async fn try_acquire_reader(&self, lock_id: &str, lease: Option<Duration>) -> Result<bool> {
        let now = Utc::now();
        let granted = Lease {
            lock_id: lock_id.to_string(),
            host_id: self.host_id.clone(),
            expires_at: expiry(now, lease),
        };
        let result = self
            .locks
            .update(
                &|d: &LockDocument| d.id == self.id && d.is_available_for_reading(now),
                &|d: &mut LockDocument| {
                    d.prune_expired_readers(now);
                    d.reader_locks.push(granted.clone());
                },
                UpdateOptions::upsert(LockDocument::new(self.id.clone())),
            )
            .await;
        acquired(result)
    }

    async fn try_acquire_writer(&self, lock_id: &str, lease: Option<Duration>) -> Result<bool> {
        let now = Utc::now();
        let granted = Lease {
            lock_id: lock_id.to_string(),
            host_id: self.host_id.clone(),
            expires_at: expiry(now, lease),
        };
        let result = self
            .locks
            .update(
                &|d: &LockDocument| d.id == self.id && d.is_available_for_writing(lock_id, now),
                &|d: &mut LockDocument| {
                    d.writer_lock = Some(granted.clone());
                    d.writer_queue.retain(|w| w.lock_id != lock_id);
                    d.prune_expired_readers(now);
                },
                UpdateOptions::upsert(LockDocument::new(self.id.clone())),
            )
            .await;
        acquired(result)
    }

    async fn enqueue_writer(&self, lock_id: &str) -> Result<()> {
        let entry = QueuedWriter {
            lock_id: lock_id.to_string(),
            host_id: self.host_id.clone(),
        };
        self.locks
            .update(
                &|d: &LockDocument| d.id == self.id,
                &|d: &mut LockDocument| {
                    if !d.is_queued(lock_id) {
                        d.writer_queue.push(entry.clone());
                    }
                },
                UpdateOptions::upsert(LockDocument::new(self.id.clone())),
            )
            .await?;
        Ok(())
    }

    async fn dequeue_writer(&self, lock_id: &str) -> Result<()> {
        self.locks
            .update(
                &|d: &LockDocument| d.id == self.id && d.is_queued(lock_id),
                &|d: &mut LockDocument| d.writer_queue.retain(|w| w.lock_id != lock_id),
                UpdateOptions::default(),
            )
            .await?;
        Ok(())
    }

    async fn subscribe(&self) -> Result<Box<dyn Subscription<LockDocument>>> {
        let id = self.id.clone();
        let filter: SharedFilter<LockDocument> = Arc::new(move |d: &LockDocument| d.id == id);
        self.locks.subscribe(filter).await
    }

    fn guard(&self, lock_id: String, kind: LockKind) -> LockGuard {
        LockGuard::new(self.locks.clone(), self.id.clone(), lock_id, kind)
    }
}

fn expiry(now: DateTime<Utc>, lease: Option<Duration>) -> Option<DateTime<Utc>> {
    lease
        .and_then(|l| chrono::Duration::from_std(l).ok())
        .map(|l| now + l)
}

/// A duplicate key from an upsert means another host created the document
/// between our filter check and insert: we lost the race, nothing more.
fn acquired(result: Result<Option<LockDocument>>) -> Result<bool> {
    match result {
        Ok(doc) => Ok(doc.is_some()),
        Err(CoordError::DuplicateKey(_)) => Ok(false),
        Err(e) => Err(e),
    }
}

async fn scoped<T, F, Fut>(guard: LockGuard, f: F) -> Result<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let result = f().await;
    let resource_id = guard.resource_id().to_string();
    let released = guard.release().await;
    if let (Err(_), Err(e)) = (&result, &released) {
        tracing::warn!(resource_id = %resource_id, error = %e, "Failed to release lock after error");
    }
    let value = result?;
    released?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryRepository;

    fn lock(repo: &MemoryRepository<LockDocument>, host: &str) -> DistributedLock {
        DistributedLock::new(
            "engine1",
            host,
            Arc::new(repo.clone()),
            LockConfig::default(),
        )
    }

    #[tokio::test]
    async fn writer_lock_sets_writer_and_release_clears_it() {
        let repo = MemoryRepository::new();
        let lock = lock(&repo, "h1");
        let cancel = CancellationToken::new();

        let guard = lock.writer_lock(None, &cancel).await.unwrap();
        let doc = repo
            .get(&|d: &LockDocument| d.id == "engine1")
            .await
            .unwrap()
            .unwrap();
        let writer = doc.writer_lock.unwrap();
        assert_eq!(writer.lock_id, guard.lock_id());
        assert_eq!(writer.host_id, "h1");
        assert!(writer.expires_at.is_none());

        guard.release().await.unwrap();
        let doc = repo
            .get(&|d: &LockDocument| d.id == "engine1")
            .await
            .unwrap()
            .unwrap();
        assert!(doc.writer_lock.is_none());
    }

    #[tokio::test]
    async fn readers_share_the_lock() {
        let repo = MemoryRepository::new();
        let lock = lock(&repo, "h1");
        let cancel = CancellationToken::new();

        let r1 = lock.reader_lock(None, &cancel).await.unwrap();
        let r2 = lock.reader_lock(None, &cancel).await.unwrap();
        let doc = repo
            .get(&|d: &LockDocument| d.id == "engine1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc.reader_locks.len(), 2);

        r1.release().await.unwrap();
        r2.release().await.unwrap();
    }

    #[tokio::test]
    async fn lease_sets_expiry() {
        let repo = MemoryRepository::new();
        let lock = lock(&repo, "h1");
        let cancel = CancellationToken::new();

        let before = Utc::now();
        let _guard = lock
            .reader_lock(Some(Duration::from_secs(30)), &cancel)
            .await
            .unwrap();
        let doc = repo
            .get(&|d: &LockDocument| d.id == "engine1")
            .await
            .unwrap()
            .unwrap();
        let expires_at = doc.reader_locks[0].expires_at.unwrap();
        assert!(expires_at >= before + chrono::Duration::seconds(30));
    }

    #[tokio::test]
    async fn already_cancelled_token_fails_fast() {
        let repo = MemoryRepository::new();
        let lock = lock(&repo, "h1");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = lock.writer_lock(None, &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(repo.is_empty().await);
    }

    #[test]
    fn duplicate_key_is_a_lost_race() {
        assert!(!acquired(Err(CoordError::DuplicateKey("engine1".into()))).unwrap());
        assert!(acquired(Err(CoordError::Store("down".into()))).is_err());
    }
}

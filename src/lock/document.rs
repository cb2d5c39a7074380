use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::Entity;

/// A granted lock: who holds it and until when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub lock_id: String,
    pub host_id: String,
    /// `None` means the lease never expires.
    pub expires_at: Option<DateTime<Utc>>,
}

impl Lease {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at > now,
            None => true,
        }
    }
}

/// A writer waiting its turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedWriter {
    pub lock_id: String,
    pub host_id: String,
}

/// Shared state of one reader-writer lock, one document per coordination key.
///
/// # Invariants
///
/// - A live `writer_lock` and a live entry in `reader_locks` never coexist.
/// - A reader is only granted while `writer_queue` is empty (writer-preferring).
/// - Expired leases are logically absent; acquisition ignores them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockDocument {
    pub id: String,
    pub writer_lock: Option<Lease>,
    pub reader_locks: Vec<Lease>,
    pub writer_queue: Vec<QueuedWriter>,
}

impl Entity for LockDocument {
    fn id(&self) -> &str {
        &self.id
    }
}

impl LockDocument {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            writer_lock: None,
            reader_locks: Vec::new(),
            writer_queue: Vec::new(),
        }
    }

    pub fn has_live_writer(&self, now: DateTime<Utc>) -> bool {
        self.writer_lock.as_ref().is_some_and(|l| l.is_live(now))
    }

    pub fn has_live_readers(&self, now: DateTime<Utc>) -> bool {
        self.reader_locks.iter().any(|l| l.is_live(now))
    }

    pub fn is_available_for_reading(&self, now: DateTime<Utc>) -> bool {
        !self.has_live_writer(now) && self.writer_queue.is_empty()
    }

    pub fn is_available_for_writing(&self, lock_id: &str, now: DateTime<Utc>) -> bool {
        !self.has_live_writer(now)
            && !self.has_live_readers(now)
            && self
                .writer_queue
                .first()
                .map_or(true, |head| head.lock_id == lock_id)
    }

    pub fn is_queued(&self, lock_id: &str) -> bool {
        self.writer_queue.iter().any(|w| w.lock_id == lock_id)
    }

    /// How long a blocked writer should wait before retrying on its own:
    /// every current holder has to be gone, so this is the latest expiry
    /// among the leases that have one.
    pub fn writer_wait_deadline(&self) -> Option<DateTime<Utc>> {
        self.reader_locks
            .iter()
            .chain(self.writer_lock.iter())
            .filter_map(|l| l.expires_at)
            .max()
    }

    /// Expiry of the current writer, the only holder that can block a reader
    /// once the queue is empty.
    pub fn reader_wait_deadline(&self) -> Option<DateTime<Utc>> {
        self.writer_lock.as_ref().and_then(|l| l.expires_at)
    }

    pub(crate) fn prune_expired_readers(&mut self, now: DateTime<Utc>) {
        self.reader_locks.retain(|l| l.is_live(now));
    }

    /// Drop every lease and queue slot held by `host_id`. Returns whether
    /// anything changed.
    pub fn release_host(&mut self, host_id: &str) -> bool {
        let mut changed = false;
        if self
            .writer_lock
            .as_ref()
            .is_some_and(|l| l.host_id == host_id)
        {
            self.writer_lock = None;
            changed = true;
        }
        let readers = self.reader_locks.len();
        self.reader_locks.retain(|l| l.host_id != host_id);
        let queued = self.writer_queue.len();
        self.writer_queue.retain(|w| w.host_id != host_id);
        changed || readers != self.reader_locks.len() || queued != self.writer_queue.len()
    }

    pub fn is_held_by_host(&self, host_id: &str) -> bool {
        self.writer_lock
            .as_ref()
            .is_some_and(|l| l.host_id == host_id)
            || self.reader_locks.iter().any(|l| l.host_id == host_id)
            || self.writer_queue.iter().any(|w| w.host_id == host_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn lease(lock_id: &str, expires_at: Option<DateTime<Utc>>) -> Lease {
        Lease {
            lock_id: lock_id.to_string(),
            host_id: "h1".to_string(),
            expires_at,
        }
    }

    #[test]
    fn empty_document_is_available() {
        let now = Utc::now();
        let doc = LockDocument::new("engine1");
        assert!(doc.is_available_for_reading(now));
        assert!(doc.is_available_for_writing("any", now));
    }

    #[test]
    fn expired_writer_is_ignored() {
        let now = Utc::now();
        let mut doc = LockDocument::new("engine1");
        doc.writer_lock = Some(lease("w", Some(now - Duration::seconds(1))));
        assert!(!doc.has_live_writer(now));
        assert!(doc.is_available_for_reading(now));
        assert!(doc.is_available_for_writing("other", now));
    }

    #[test]
    fn live_reader_blocks_writer_but_not_reader() {
        let now = Utc::now();
        let mut doc = LockDocument::new("engine1");
        doc.reader_locks
            .push(lease("r", Some(now + Duration::seconds(30))));
        assert!(doc.is_available_for_reading(now));
        assert!(!doc.is_available_for_writing("w", now));
    }

    #[test]
    fn queued_writer_blocks_readers_and_other_writers() {
        let now = Utc::now();
        let mut doc = LockDocument::new("engine1");
        doc.writer_queue.push(QueuedWriter {
            lock_id: "a".to_string(),
            host_id: "h1".to_string(),
        });
        assert!(!doc.is_available_for_reading(now));
        assert!(doc.is_available_for_writing("a", now));
        assert!(!doc.is_available_for_writing("b", now));
    }

    #[test]
    fn writer_wait_deadline_is_latest_expiry() {
        let now = Utc::now();
        let mut doc = LockDocument::new("engine1");
        assert_eq!(doc.writer_wait_deadline(), None);

        let early = now + Duration::seconds(5);
        let late = now + Duration::seconds(20);
        doc.reader_locks.push(lease("r1", Some(early)));
        doc.reader_locks.push(lease("r2", Some(late)));
        assert_eq!(doc.writer_wait_deadline(), Some(late));

        // Holders without expiry do not contribute a deadline.
        doc.writer_lock = Some(lease("w", None));
        assert_eq!(doc.writer_wait_deadline(), Some(late));
    }

    #[test]
    fn release_host_only_touches_that_host() {
        let mut doc = LockDocument::new("engine1");
        doc.writer_lock = Some(lease("w", None));
        doc.reader_locks.push(Lease {
            lock_id: "r".to_string(),
            host_id: "h2".to_string(),
            expires_at: None,
        });
        doc.writer_queue.push(QueuedWriter {
            lock_id: "q".to_string(),
            host_id: "h1".to_string(),
        });

        assert!(doc.is_held_by_host("h1"));
        assert!(doc.release_host("h1"));
        assert!(doc.writer_lock.is_none());
        assert!(doc.writer_queue.is_empty());
        assert_eq!(doc.reader_locks.len(), 1);
        assert!(!doc.release_host("h1"));
    }
}

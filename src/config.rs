use std::path::PathBuf;
use std::time::Duration;

use uuid::Uuid;

/// Configuration for distributed lock acquisition.
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Lease applied when a caller does not pass one. `None` means locks
    /// never expire on their own.
    pub default_lease: Option<Duration>,
    /// Upper bound on a single wait for a change notification. Keeps waiters
    /// converging even when a notification is missed.
    pub poll_interval: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_lease: None,
            poll_interval: Duration::from_secs(5),
        }
    }
}

/// Configuration for the message outbox.
#[derive(Debug, Clone)]
pub struct OutboxConfig {
    /// How long the delivery loop waits for a change before polling anyway.
    pub poll_timeout: Duration,
    /// Retryable failures older than this are treated as permanent.
    pub message_expiration: Duration,
    /// Content larger than this many bytes is written to blob storage
    /// instead of being kept inline on the message document.
    pub max_document_size: usize,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(10),
            message_expiration: Duration::from_secs(48 * 60 * 60),
            max_document_size: 1024 * 1024,
        }
    }
}

/// Concurrency limits for the in-process job queue.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub cpu_concurrency: usize,
    pub gpu_concurrency: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            cpu_concurrency: 4,
            gpu_concurrency: 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Identity stamped on every lease this process takes. Must be unique per
    /// process incarnation's host so crash recovery only clears its own leases.
    pub host_id: String,
    pub locks: LockConfig,
    pub outbox: OutboxConfig,
    pub workers: WorkerConfig,
    /// Root directory for oversized outbox payloads. In-memory blobs when unset.
    pub blob_dir: Option<PathBuf>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            host_id: Uuid::new_v4().to_string(),
            locks: LockConfig::default(),
            outbox: OutboxConfig::default(),
            workers: WorkerConfig::default(),
            blob_dir: None,
        }
    }
}

impl HostConfig {
    pub fn new(host_id: impl Into<String>) -> Self {
        Self {
            host_id: host_id.into(),
            ..Default::default()
        }
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.locks.default_lease = Some(lease);
        self
    }

    pub fn with_blob_dir(mut self, dir: PathBuf) -> Self {
        self.blob_dir = Some(dir);
        self
    }

    pub fn with_message_expiration(mut self, expiration: Duration) -> Self {
        self.outbox.message_expiration = expiration;
        self
    }

    pub fn with_workers(mut self, cpu_concurrency: usize, gpu_concurrency: usize) -> Self {
        self.workers = WorkerConfig {
            cpu_concurrency: cpu_concurrency.max(1),
            gpu_concurrency: gpu_concurrency.max(1),
        };
        self
    }
}

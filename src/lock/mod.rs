//! Distributed reader-writer locks backed by a [`Repository`](crate::store::Repository).
//!
//! Each lock is one [`LockDocument`] holding the current writer lease, the
//! reader leases and a FIFO queue of waiting writers. Acquisition is a single
//! conditional update; a caller that loses waits on a subscription to the
//! document and retries.
//!
//! # Components
//!
//! - [`LockFactory`]: creates, deletes and recovers locks for one host
//! - [`DistributedLock`]: reader and writer acquisition
//! - [`LockGuard`]: a held lease, released explicitly or on drop

pub mod distributed;
pub mod document;
pub mod factory;
pub mod guard;
pub mod timer;

pub use distributed::DistributedLock;
pub use document::{Lease, LockDocument, QueuedWriter};
pub use factory::LockFactory;
pub use guard::{LockGuard, LockKind};

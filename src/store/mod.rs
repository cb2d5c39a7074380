//! Conditional document store abstraction.
//!
//! Every piece of cross-host state lives in a [`Repository`]: lock documents,
//! engines with their current build, and outbox messages. The contract is
//! deliberately small:
//!
//! - **Atomic find-and-modify**: [`Repository::update`] applies a mutation to
//!   the first document matching a filter as one atomic step.
//! - **Upsert with duplicate-key signalling**: when nothing matches and an
//!   upsert seed is supplied, the seed is inserted. If a document with the
//!   seed's id already exists (it just didn't match the filter) the call fails
//!   with [`CoordError::DuplicateKey`](crate::error::CoordError::DuplicateKey).
//! - **Subscriptions**: [`Repository::subscribe`] returns a handle whose
//!   [`Subscription::wait_for_change`] wakes when any document matching the
//!   filter is inserted, modified or removed, bounded by a timeout.
//!
//! [`MemoryRepository`] is the in-process implementation used by tests and
//! the host binary.

pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

pub use memory::MemoryRepository;

/// A document stored in a [`Repository`], addressed by a unique id.
pub trait Entity: Clone + PartialEq + Send + Sync + 'static {
    fn id(&self) -> &str;
}

/// Borrowed document predicate. The bound is spelled out as higher-ranked so
/// a filter accepts borrows that live shorter than the call, such as entries
/// behind a store's read guard.
pub type Filter<'f, T> = dyn for<'a> Fn(&'a T) -> bool + Send + Sync + 'f;

/// Borrowed in-place document update.
pub type Mutation<'f, T> = dyn for<'a> Fn(&'a mut T) + Send + Sync + 'f;

/// Filter owned by a long-lived subscription.
pub type SharedFilter<T> = Arc<dyn for<'a> Fn(&'a T) -> bool + Send + Sync>;

/// Options for [`Repository::update`].
#[derive(Debug, Clone)]
pub struct UpdateOptions<T> {
    /// Document inserted (after the mutation is applied) when nothing matches.
    pub upsert: Option<T>,
    /// Return the document as it was before the mutation.
    pub return_original: bool,
}

impl<T> Default for UpdateOptions<T> {
    fn default() -> Self {
        Self {
            upsert: None,
            return_original: false,
        }
    }
}

impl<T> UpdateOptions<T> {
    pub fn upsert(seed: T) -> Self {
        Self {
            upsert: Some(seed),
            return_original: false,
        }
    }

    pub fn return_original() -> Self {
        Self {
            upsert: None,
            return_original: true,
        }
    }
}

/// Latest observed state of a subscribed document.
#[derive(Debug, Clone)]
pub struct Change<T> {
    pub entity: Option<T>,
}

#[async_trait]
pub trait Subscription<T: Entity>: Send {
    /// The document as of the last observed change (or subscription time).
    /// With a filter matching several documents this is the one with the
    /// lowest id.
    fn change(&self) -> &Change<T>;

    /// Wait until a matching document changes or `timeout` elapses.
    /// `None` waits without bound. Returns `Ok` on timeout.
    async fn wait_for_change(&mut self, timeout: Option<Duration>) -> Result<()>;
}

#[async_trait]
pub trait Repository<T: Entity>: Send + Sync {
    async fn get(&self, filter: &Filter<'_, T>) -> Result<Option<T>>;

    async fn get_all(&self, filter: &Filter<'_, T>) -> Result<Vec<T>>;

    async fn exists(&self, filter: &Filter<'_, T>) -> Result<bool> {
        Ok(self.get(filter).await?.is_some())
    }

    /// Insert a new document. Fails with `DuplicateKey` if the id is taken.
    async fn insert(&self, entity: T) -> Result<()>;

    /// Atomically mutate the first document matching `filter`.
    ///
    /// Returns the updated document (or the original, per `options`), or
    /// `None` when nothing matched and no upsert seed was given.
    async fn update(
        &self,
        filter: &Filter<'_, T>,
        mutation: &Mutation<'_, T>,
        options: UpdateOptions<T>,
    ) -> Result<Option<T>>;

    /// Mutate every matching document. Returns the number touched.
    async fn update_all(
        &self,
        filter: &Filter<'_, T>,
        mutation: &Mutation<'_, T>,
    ) -> Result<usize>;

    async fn delete(&self, filter: &Filter<'_, T>) -> Result<Option<T>>;

    async fn delete_all(&self, filter: &Filter<'_, T>) -> Result<usize>;

    async fn subscribe(&self, filter: SharedFilter<T>) -> Result<Box<dyn Subscription<T>>>;
}

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, RwLock};
use tokio::time::Instant;

use crate::error::{CoordError, Result};
use crate::store::{
    Change, Entity, Filter, Mutation, Repository, SharedFilter, Subscription, UpdateOptions,
};

struct Inner<T> {
    entities: RwLock<HashMap<String, T>>,
    /// Bumped on every mutation; subscribers re-evaluate their filter on wake.
    version: watch::Sender<u64>,
}

impl<T: Entity> Inner<T> {
    async fn find(&self, filter: &Filter<'_, T>) -> Option<T> {
        self.entities
            .read()
            .await
            .values()
            .find(|e| filter(e))
            .cloned()
    }

    /// Every matching document, ordered by id.
    async fn snapshot(&self, filter: &Filter<'_, T>) -> Vec<T> {
        let mut matching: Vec<T> = self
            .entities
            .read()
            .await
            .values()
            .filter(|e| filter(e))
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.id().cmp(b.id()));
        matching
    }

    fn notify(&self) {
        self.version.send_modify(|v| *v += 1);
    }
}

/// In-memory [`Repository`] with the same atomicity guarantees as a
/// document database's find-and-modify: every operation runs under one
/// write guard, so a filter check and its mutation can never interleave with
/// another writer.
pub struct MemoryRepository<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for MemoryRepository<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Entity> Default for MemoryRepository<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Entity> MemoryRepository<T> {
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                entities: RwLock::new(HashMap::new()),
                version,
            }),
        }
    }

    /// Number of stored documents
    pub async fn len(&self) -> usize {
        self.inner.entities.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.entities.read().await.is_empty()
    }
}

#[async_trait]
impl<T: Entity> Repository<T> for MemoryRepository<T> {
    async fn get(&self, filter: &Filter<'_, T>) -> Result<Option<T>> {
        Ok(self.inner.find(filter).await)
    }

    async fn get_all(&self, filter: &Filter<'_, T>) -> Result<Vec<T>> {
        Ok(self
            .inner
            .entities
            .read()
            .await
            .values()
            .filter(|e| filter(e))
            .cloned()
            .collect())
    }

    async fn insert(&self, entity: T) -> Result<()> {
        let mut entities = self.inner.entities.write().await;
        if entities.contains_key(entity.id()) {
            return Err(CoordError::DuplicateKey(entity.id().to_string()));
        }
        entities.insert(entity.id().to_string(), entity);
        drop(entities);
        self.inner.notify();
        Ok(())
    }

    async fn update(
        &self,
        filter: &Filter<'_, T>,
        mutation: &Mutation<'_, T>,
        options: UpdateOptions<T>,
    ) -> Result<Option<T>> {
        let mut entities = self.inner.entities.write().await;

        let key = entities
            .iter()
            .find(|(_, e)| filter(e))
            .map(|(k, _)| k.clone());
        let mut matched = None;
        if let Some(key) = key {
            if let Some(entity) = entities.get_mut(&key) {
                let original = entity.clone();
                mutation(entity);
                matched = Some(if options.return_original {
                    original
                } else {
                    entity.clone()
                });
            }
        }
        if let Some(result) = matched {
            drop(entities);
            self.inner.notify();
            return Ok(Some(result));
        }

        let Some(mut seed) = options.upsert else {
            return Ok(None);
        };
        if entities.contains_key(seed.id()) {
            // The document exists but did not match: a concurrent writer won.
            return Err(CoordError::DuplicateKey(seed.id().to_string()));
        }
        mutation(&mut seed);
        let result = if options.return_original {
            None
        } else {
            Some(seed.clone())
        };
        entities.insert(seed.id().to_string(), seed);
        drop(entities);
        self.inner.notify();
        Ok(result)
    }

    async fn update_all(
        &self,
        filter: &Filter<'_, T>,
        mutation: &Mutation<'_, T>,
    ) -> Result<usize> {
        let mut entities = self.inner.entities.write().await;
        let mut count = 0;
        for entity in entities.values_mut().filter(|e| filter(e)) {
            mutation(entity);
            count += 1;
        }
        drop(entities);
        if count > 0 {
            self.inner.notify();
        }
        Ok(count)
    }

    async fn delete(&self, filter: &Filter<'_, T>) -> Result<Option<T>> {
        let mut entities = self.inner.entities.write().await;
        let key = entities
            .iter()
            .find(|(_, e)| filter(e))
            .map(|(k, _)| k.clone());
        let removed = key.and_then(|k| entities.remove(&k));
        drop(entities);
        if removed.is_some() {
            self.inner.notify();
        }
        Ok(removed)
    }

    async fn delete_all(&self, filter: &Filter<'_, T>) -> Result<usize> {
        let mut entities = self.inner.entities.write().await;
        let before = entities.len();
        entities.retain(|_, e| !filter(e));
        let removed = before - entities.len();
        drop(entities);
        if removed > 0 {
            self.inner.notify();
        }
        Ok(removed)
    }

    async fn subscribe(&self, filter: SharedFilter<T>) -> Result<Box<dyn Subscription<T>>> {
        // Subscribe before reading so a change racing the snapshot still wakes us.
        let rx = self.inner.version.subscribe();
        let matching = self.inner.snapshot(&*filter).await;
        Ok(Box::new(MemorySubscription {
            inner: self.inner.clone(),
            filter,
            rx,
            change: Change {
                entity: matching.first().cloned(),
            },
            matching,
        }))
    }
}

struct MemorySubscription<T> {
    inner: Arc<Inner<T>>,
    filter: SharedFilter<T>,
    rx: watch::Receiver<u64>,
    change: Change<T>,
    matching: Vec<T>,
}

#[async_trait]
impl<T: Entity> Subscription<T> for MemorySubscription<T> {
    fn change(&self) -> &Change<T> {
        &self.change
    }

    async fn wait_for_change(&mut self, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let changed = match deadline {
                Some(deadline) => {
                    match tokio::time::timeout_at(deadline, self.rx.changed()).await {
                        Ok(changed) => changed,
                        Err(_) => return Ok(()),
                    }
                }
                None => self.rx.changed().await,
            };
            if changed.is_err() {
                return Err(CoordError::Store("change notifications closed".to_string()));
            }

            // Other documents changing also bump the version; only wake the
            // caller when a document we track actually differs.
            let matching = self.inner.snapshot(&*self.filter).await;
            if matching != self.matching {
                self.change = Change {
                    entity: matching.first().cloned(),
                };
                self.matching = matching;
                return Ok(());
            }
        }
    }
}

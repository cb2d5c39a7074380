use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::blob::BlobStore;
use crate::config::OutboxConfig;
use crate::error::{CoordError, Result};
use crate::outbox::model::{blob_path, OutboxCounter, OutboxMessage};
use crate::store::{Repository, UpdateOptions};

const MAX_INDEX_ATTEMPTS: usize = 3;

/// Write side of the outbox: persists messages for later delivery.
#[derive(Clone)]
pub struct Outbox {
    messages: Arc<dyn Repository<OutboxMessage>>,
    counters: Arc<dyn Repository<OutboxCounter>>,
    blobs: Arc<dyn BlobStore>,
    config: OutboxConfig,
}

impl Outbox {
    pub fn new(
        messages: Arc<dyn Repository<OutboxMessage>>,
        counters: Arc<dyn Repository<OutboxCounter>>,
        blobs: Arc<dyn BlobStore>,
        config: OutboxConfig,
    ) -> Self {
        Self {
            messages,
            counters,
            blobs,
            config,
        }
    }

    /// Persist a message and return its id.
    ///
    /// The message gets the next index of its group. Content larger than
    /// `max_document_size` bytes is written to the blob store instead of the
    /// message document.
    pub async fn enqueue_message(
        &self,
        outbox_name: &str,
        method: &str,
        group_id: &str,
        content: Option<String>,
    ) -> Result<String> {
        let index = self.next_index(outbox_name, group_id).await?;
        let id = Uuid::new_v4().to_string();

        let (content, content_in_blob) = match content {
            Some(content) if content.len() > self.config.max_document_size => {
                self.blobs
                    .write(&blob_path(&id), content.into_bytes())
                    .await?;
                (None, true)
            }
            content => (content, false),
        };

        let message = OutboxMessage {
            id: id.clone(),
            outbox_name: outbox_name.to_string(),
            method: method.to_string(),
            group_id: group_id.to_string(),
            index,
            content,
            content_in_blob,
            attempts: 0,
            created_at: Utc::now(),
        };
        if let Err(e) = self.messages.insert(message).await {
            if content_in_blob {
                if let Err(cleanup) = self.blobs.delete(&blob_path(&id)).await {
                    tracing::warn!(message_id = %id, error = %cleanup, "Failed to delete orphaned outbox content");
                }
            }
            return Err(e);
        }

        tracing::debug!(
            message_id = %id,
            outbox = outbox_name,
            method,
            group_id,
            index,
            content_in_blob,
            "Outbox message enqueued"
        );
        Ok(id)
    }

    async fn next_index(&self, outbox_name: &str, group_id: &str) -> Result<u64> {
        let key = OutboxCounter::key(outbox_name, group_id);
        for _ in 0..MAX_INDEX_ATTEMPTS {
            let result = self
                .counters
                .update(
                    &|c: &OutboxCounter| c.id == key,
                    &|c: &mut OutboxCounter| c.current_index += 1,
                    UpdateOptions::upsert(OutboxCounter::new(outbox_name, group_id)),
                )
                .await;
            match result {
                Ok(Some(counter)) => return Ok(counter.current_index - 1),
                Ok(None) => {
                    return Err(CoordError::Internal(format!(
                        "outbox counter {} was not returned",
                        key
                    )))
                }
                // Another host created the counter first.
                Err(CoordError::DuplicateKey(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(CoordError::Store(format!(
            "could not allocate an index for outbox group {}",
            key
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;
    use crate::store::MemoryRepository;

    fn outbox(max_document_size: usize) -> (Outbox, MemoryRepository<OutboxMessage>, MemoryBlobStore) {
        let messages = MemoryRepository::new();
        let blobs = MemoryBlobStore::new();
        let config = OutboxConfig {
            max_document_size,
            ..OutboxConfig::default()
        };
        let outbox = Outbox::new(
            Arc::new(messages.clone()),
            Arc::new(MemoryRepository::<OutboxCounter>::new()),
            Arc::new(blobs.clone()),
            config,
        );
        (outbox, messages, blobs)
    }

    #[tokio::test]
    async fn indices_are_allocated_per_group() {
        let (outbox, messages, _) = outbox(1024);
        for group in ["g1", "g1", "g2", "g1"] {
            outbox
                .enqueue_message("platform", "BuildStarted", group, None)
                .await
                .unwrap();
        }

        let mut g1: Vec<u64> = messages
            .get_all(&|m: &OutboxMessage| m.group_id == "g1")
            .await
            .unwrap()
            .iter()
            .map(|m| m.index)
            .collect();
        g1.sort();
        assert_eq!(g1, vec![0, 1, 2]);

        let g2 = messages
            .get_all(&|m: &OutboxMessage| m.group_id == "g2")
            .await
            .unwrap();
        assert_eq!(g2.len(), 1);
        assert_eq!(g2[0].index, 0);
    }

    #[tokio::test]
    async fn oversized_content_goes_to_blob_store() {
        let (outbox, messages, blobs) = outbox(8);
        let big = "x".repeat(9);
        let id = outbox
            .enqueue_message("platform", "InsertResults", "e1", Some(big.clone()))
            .await
            .unwrap();

        let message = messages
            .get(&|m: &OutboxMessage| m.id == id)
            .await
            .unwrap()
            .unwrap();
        assert!(message.content_in_blob);
        assert!(message.content.is_none());
        assert_eq!(blobs.read(&message.blob_path()).await.unwrap(), big.into_bytes());

        let small = outbox
            .enqueue_message("platform", "InsertResults", "e1", Some("12345678".into()))
            .await
            .unwrap();
        let message = messages
            .get(&|m: &OutboxMessage| m.id == small)
            .await
            .unwrap()
            .unwrap();
        assert!(!message.content_in_blob);
        assert_eq!(message.content.as_deref(), Some("12345678"));
    }
}

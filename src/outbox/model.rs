use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::Entity;

/// A pending delivery. Messages of one `(outbox_name, group_id)` pair are
/// delivered strictly in `index` order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub id: String,
    pub outbox_name: String,
    pub method: String,
    pub group_id: String,
    pub index: u64,
    /// Inline payload. `None` when the payload lives in the blob store.
    pub content: Option<String>,
    pub content_in_blob: bool,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
}

impl Entity for OutboxMessage {
    fn id(&self) -> &str {
        &self.id
    }
}

impl OutboxMessage {
    pub fn blob_path(&self) -> String {
        blob_path(&self.id)
    }

    pub fn group_key(&self) -> (&str, &str) {
        (&self.outbox_name, &self.group_id)
    }
}

pub fn blob_path(message_id: &str) -> String {
    format!("outbox/{}.json", message_id)
}

/// Next-index allocator for one message group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxCounter {
    pub id: String,
    pub current_index: u64,
}

impl Entity for OutboxCounter {
    fn id(&self) -> &str {
        &self.id
    }
}

impl OutboxCounter {
    pub fn new(outbox_name: &str, group_id: &str) -> Self {
        Self {
            id: Self::key(outbox_name, group_id),
            current_index: 0,
        }
    }

    pub fn key(outbox_name: &str, group_id: &str) -> String {
        format!("{}:{}", outbox_name, group_id)
    }
}

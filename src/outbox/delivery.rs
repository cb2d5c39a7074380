use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tonic::Code;

use crate::blob::BlobStore;
use crate::config::OutboxConfig;
use crate::error::{CoordError, Result};
use crate::outbox::model::OutboxMessage;
use crate::outbox::OutboxMessageHandler;
use crate::store::{Repository, SharedFilter, UpdateOptions};

/// How a failed delivery is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// The endpoint is unreachable or refuses us. Nothing else will get
    /// through either, so the whole pass ends.
    Connectivity,
    /// Transient; the message is retried on a later pass until it expires.
    Retryable,
    /// Retrying will not help; the message is dropped.
    Permanent,
}

impl FailureClass {
    pub fn from_code(code: Code) -> Self {
        match code {
            Code::Unavailable | Code::Unauthenticated | Code::PermissionDenied | Code::Cancelled => {
                FailureClass::Connectivity
            }
            Code::Aborted
            | Code::DeadlineExceeded
            | Code::Internal
            | Code::ResourceExhausted
            | Code::Unknown => FailureClass::Retryable,
            _ => FailureClass::Permanent,
        }
    }
}

/// Result of attempting one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Sent,
    /// Dropped; later messages in the group may proceed.
    Dropped,
    /// Dropped, and the rest of the group waits for the next pass.
    DroppedAndHalted,
    /// Kept for retry; the rest of the group waits.
    Blocked,
    /// Stop the whole pass.
    Abort,
}

/// Counts from one [`OutboxDeliveryService::process_messages`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub sent: usize,
    pub dropped: usize,
    pub retried: usize,
    pub aborted: bool,
}

/// Read side of the outbox: drains messages group by group through the
/// handler registered for each outbox name.
pub struct OutboxDeliveryService {
    messages: Arc<dyn Repository<OutboxMessage>>,
    blobs: Arc<dyn BlobStore>,
    handlers: HashMap<String, Arc<dyn OutboxMessageHandler>>,
    config: OutboxConfig,
}

impl OutboxDeliveryService {
    pub fn new(
        messages: Arc<dyn Repository<OutboxMessage>>,
        blobs: Arc<dyn BlobStore>,
        config: OutboxConfig,
    ) -> Self {
        Self {
            messages,
            blobs,
            handlers: HashMap::new(),
            config,
        }
    }

    pub fn with_handler(mut self, handler: Arc<dyn OutboxMessageHandler>) -> Self {
        self.register(handler);
        self
    }

    pub fn register(&mut self, handler: Arc<dyn OutboxMessageHandler>) {
        self.handlers.insert(handler.name().to_string(), handler);
    }

    /// Deliver until `shutdown` fires, making a pass whenever the message
    /// collection changes or `poll_timeout` elapses.
    pub async fn run(&self, shutdown: CancellationToken) {
        let all: SharedFilter<OutboxMessage> = Arc::new(|_: &OutboxMessage| true);
        let mut sub = match self.messages.subscribe(all.clone()).await {
            Ok(sub) => sub,
            Err(e) => {
                tracing::error!(error = %e, "Outbox delivery could not subscribe to messages");
                return;
            }
        };

        tracing::info!(handlers = self.handlers.len(), "Outbox delivery started");
        loop {
            let backoff = match self.process_messages().await {
                Ok(report) => report.retried > 0 || report.aborted,
                Err(e) => {
                    tracing::error!(error = %e, "Outbox delivery pass failed");
                    true
                }
            };
            if backoff {
                // The pass's own attempt counts would wake us at once; start
                // from a fresh snapshot so a blocked group waits for the poll.
                match self.messages.subscribe(all.clone()).await {
                    Ok(fresh) => sub = fresh,
                    Err(e) => tracing::warn!(error = %e, "Outbox delivery could not resubscribe"),
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                result = sub.wait_for_change(Some(self.config.poll_timeout)) => {
                    if let Err(e) = result {
                        tracing::warn!(error = %e, "Outbox change notification failed");
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = tokio::time::sleep(self.config.poll_timeout) => {}
                        }
                    }
                }
            }
        }
        tracing::info!("Outbox delivery stopped");
    }

    /// One delivery pass over every stored message.
    pub async fn process_messages(&self) -> Result<DeliveryReport> {
        let messages = self.messages.get_all(&|_: &OutboxMessage| true).await?;
        let mut report = DeliveryReport::default();
        if messages.is_empty() {
            return Ok(report);
        }

        let mut groups: BTreeMap<(String, String), Vec<OutboxMessage>> = BTreeMap::new();
        for message in messages {
            groups
                .entry((message.outbox_name.clone(), message.group_id.clone()))
                .or_default()
                .push(message);
        }

        'groups: for ((outbox_name, group_id), mut group) in groups {
            group.sort_by_key(|m| m.index);
            for message in &group {
                match self.deliver(message).await? {
                    Delivery::Sent => report.sent += 1,
                    Delivery::Dropped => report.dropped += 1,
                    Delivery::DroppedAndHalted => {
                        report.dropped += 1;
                        continue 'groups;
                    }
                    Delivery::Blocked => {
                        report.retried += 1;
                        tracing::debug!(outbox = %outbox_name, group_id = %group_id, "Outbox group blocked until next pass");
                        continue 'groups;
                    }
                    Delivery::Abort => {
                        report.aborted = true;
                        break 'groups;
                    }
                }
            }
        }
        Ok(report)
    }

    async fn deliver(&self, message: &OutboxMessage) -> Result<Delivery> {
        let attempt = self.send(message).await;
        let error = match attempt {
            Ok(()) => {
                self.complete(message).await?;
                return Ok(Delivery::Sent);
            }
            Err(e) => e,
        };

        let status = match error {
            CoordError::Rpc(status) => status,
            other => {
                // Not an endpoint response: bad payload, missing blob, no
                // handler. Retrying cannot fix it.
                tracing::error!(
                    message_id = %message.id,
                    method = %message.method,
                    group_id = %message.group_id,
                    error = %other,
                    "Outbox message could not be delivered; dropping it"
                );
                self.complete(message).await?;
                return Ok(Delivery::DroppedAndHalted);
            }
        };

        match FailureClass::from_code(status.code()) {
            FailureClass::Connectivity => {
                tracing::warn!(
                    message_id = %message.id,
                    code = ?status.code(),
                    error = %status.message(),
                    "Platform unreachable; ending delivery pass"
                );
                Ok(Delivery::Abort)
            }
            FailureClass::Retryable if !self.is_expired(message) => {
                self.messages
                    .update(
                        &|m: &OutboxMessage| m.id == message.id,
                        &|m: &mut OutboxMessage| m.attempts += 1,
                        UpdateOptions::default(),
                    )
                    .await?;
                tracing::info!(
                    message_id = %message.id,
                    method = %message.method,
                    attempts = message.attempts + 1,
                    code = ?status.code(),
                    "Outbox message will be retried"
                );
                Ok(Delivery::Blocked)
            }
            class => {
                tracing::error!(
                    message_id = %message.id,
                    method = %message.method,
                    group_id = %message.group_id,
                    expired = class == FailureClass::Retryable,
                    code = ?status.code(),
                    error = %status.message(),
                    "Outbox message failed permanently; dropping it"
                );
                self.complete(message).await?;
                Ok(Delivery::Dropped)
            }
        }
    }

    async fn send(&self, message: &OutboxMessage) -> Result<()> {
        let handler = self.handlers.get(&message.outbox_name).ok_or_else(|| {
            CoordError::Internal(format!("no outbox handler for {}", message.outbox_name))
        })?;
        let content = if message.content_in_blob {
            let bytes = self.blobs.read(&message.blob_path()).await?;
            Some(String::from_utf8(bytes).map_err(|e| CoordError::Internal(e.to_string()))?)
        } else {
            message.content.clone()
        };
        handler.send_message(message, content.as_deref()).await
    }

    /// Remove a message that will not be attempted again, then its blob.
    async fn complete(&self, message: &OutboxMessage) -> Result<()> {
        self.messages
            .delete(&|m: &OutboxMessage| m.id == message.id)
            .await?;
        if let Some(handler) = self.handlers.get(&message.outbox_name) {
            if let Err(e) = handler.cleanup_message(message).await {
                tracing::warn!(message_id = %message.id, error = %e, "Outbox handler cleanup failed");
            }
        }
        if message.content_in_blob {
            if let Err(e) = self.blobs.delete(&message.blob_path()).await {
                tracing::warn!(message_id = %message.id, error = %e, "Failed to delete outbox content");
            }
        }
        Ok(())
    }

    fn is_expired(&self, message: &OutboxMessage) -> bool {
        let age = Utc::now() - message.created_at;
        age.to_std()
            .map(|age| age > self.config.message_expiration)
            .unwrap_or(false)
    }
}

//! Ordered, at-least-once message outbox.
//!
//! Producers call [`Outbox::enqueue_message`], which persists a message with
//! the next index of its `(outbox_name, group_id)` group. The
//! [`OutboxDeliveryService`] drains messages in index order per group through
//! the [`OutboxMessageHandler`] registered under the message's outbox name.
//!
//! Failures are classified by gRPC status code (see [`FailureClass`]): an
//! unreachable endpoint ends the pass, transient errors hold the group back
//! until the message expires, anything else drops the message.

pub mod delivery;
pub mod model;
pub mod service;

use async_trait::async_trait;

use crate::error::Result;

pub use delivery::{DeliveryReport, FailureClass, OutboxDeliveryService};
pub use model::{OutboxCounter, OutboxMessage};
pub use service::Outbox;

/// Sends the messages of one named outbox to their destination.
#[async_trait]
pub trait OutboxMessageHandler: Send + Sync {
    /// Outbox name this handler serves.
    fn name(&self) -> &str;

    /// Deliver one message. `content` is the payload, already loaded from the
    /// blob store when it did not fit inline. Endpoint failures must surface
    /// as [`CoordError::Rpc`](crate::error::CoordError::Rpc) so they can be
    /// classified.
    async fn send_message(&self, message: &OutboxMessage, content: Option<&str>) -> Result<()>;

    /// Called once a message is removed from the outbox.
    async fn cleanup_message(&self, _message: &OutboxMessage) -> Result<()> {
        Ok(())
    }
}

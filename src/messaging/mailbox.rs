//! The mailbox abstraction shared by orchestrators and workers.

use std::time::Duration;

use async_trait::async_trait;

use super::errors::MessagingResult;
use super::message::{EnqueueOutcome, MessageId, SignalMessage};

/// Durable, at-least-once, destination-addressed messaging.
///
/// A received message is hidden for `visibility` and comes back if it is not
/// acked in time, so consumers must treat repeats as no-ops.
#[async_trait]
pub trait SignalMailbox: Send + Sync + 'static {
    async fn send(
        &self,
        destination: &str,
        topic: &str,
        payload: serde_json::Value,
    ) -> MessagingResult<MessageId>;

    /// Send unless a message with the same `(destination, dedup_key)` has not
    /// been acked yet
    async fn send_deduplicated(
        &self,
        destination: &str,
        topic: &str,
        payload: serde_json::Value,
        dedup_key: &str,
    ) -> MessagingResult<EnqueueOutcome>;

    /// Next visible message for `destination` on any of `topics`, waiting up
    /// to `timeout`. `None` when nothing arrived in time.
    async fn receive(
        &self,
        destination: &str,
        topics: &[&str],
        timeout: Duration,
        visibility: Duration,
    ) -> MessagingResult<Option<SignalMessage>>;

    /// Remove a processed message. `false` if it was already gone.
    async fn ack(&self, id: MessageId) -> MessagingResult<bool>;

    /// Make an in-flight message visible again immediately
    async fn release(&self, id: MessageId) -> MessagingResult<bool>;

    /// Keep an in-flight message hidden for another `visibility` from now.
    /// Returns `false` if the message is gone.
    async fn extend_visibility(&self, id: MessageId, visibility: Duration) -> MessagingResult<bool>;

    /// Messages not yet acked for `destination`
    async fn pending(&self, destination: &str) -> MessagingResult<u64>;
}

//! # In-Memory Signal Mailbox
//!
//! Process-local mailbox for tests and single-process deployments.
//!
//! - **Visibility timeout**: received messages are hidden, then re-visible
//! - **Deduplication**: one unacked message per `(destination, dedup_key)`
//! - **Wake-ups**: `send` and `release` notify waiting receivers

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::errors::{MessagingError, MessagingResult};
use super::mailbox::SignalMailbox;
use super::message::{EnqueueOutcome, MessageId, SignalMessage};

#[derive(Debug, Clone)]
struct StoredMessage {
    destination: String,
    topic: String,
    payload: serde_json::Value,
    dedup_key: Option<String>,
    delivery_count: u32,
    sent_at: DateTime<Utc>,
    visible_at: Instant,
}

#[derive(Debug, Default)]
struct MailboxState {
    next_id: MessageId,
    messages: BTreeMap<MessageId, StoredMessage>,
    total_sent: u64,
    total_acked: u64,
}

#[derive(Debug)]
pub struct InMemoryMailbox {
    state: Mutex<MailboxState>,
    arrivals: Notify,
    poll_interval: Duration,
}

impl Default for InMemoryMailbox {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryMailbox {
    pub fn new() -> Self {
        Self::with_poll_interval(Duration::from_millis(100))
    }

    /// `poll_interval` bounds how late a message whose visibility lapsed is noticed
    pub fn with_poll_interval(poll_interval: Duration) -> Self {
        Self {
            state: Mutex::new(MailboxState {
                next_id: 1,
                ..MailboxState::default()
            }),
            arrivals: Notify::new(),
            poll_interval: poll_interval.max(Duration::from_millis(1)),
        }
    }

    /// Total messages stored, across destinations (for testing)
    pub fn len(&self) -> usize {
        self.state.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `(sent, acked)` totals (for testing)
    pub fn totals(&self) -> (u64, u64) {
        let state = self.state.lock();
        (state.total_sent, state.total_acked)
    }

    fn insert(
        &self,
        destination: &str,
        topic: &str,
        payload: serde_json::Value,
        dedup_key: Option<&str>,
    ) -> MessagingResult<EnqueueOutcome> {
        if destination.is_empty() {
            return Err(MessagingError::invalid_destination(destination, "must not be empty"));
        }

        let mut state = self.state.lock();

        if let Some(key) = dedup_key {
            let existing = state.messages.iter().find(|(_, m)| {
                m.destination == destination && m.dedup_key.as_deref() == Some(key)
            });
            if let Some((id, _)) = existing {
                return Ok(EnqueueOutcome::Duplicate(*id));
            }
        }

        let id = state.next_id;
        state.next_id += 1;
        state.total_sent += 1;
        state.messages.insert(
            id,
            StoredMessage {
                destination: destination.to_string(),
                topic: topic.to_string(),
                payload,
                dedup_key: dedup_key.map(str::to_string),
                delivery_count: 0,
                sent_at: Utc::now(),
                visible_at: Instant::now(),
            },
        );
        drop(state);

        self.arrivals.notify_waiters();
        Ok(EnqueueOutcome::Enqueued(id))
    }

    fn try_claim(
        &self,
        destination: &str,
        topics: &[&str],
        visibility: Duration,
    ) -> Option<SignalMessage> {
        let now = Instant::now();
        let mut state = self.state.lock();
        let (id, message) = state.messages.iter_mut().find(|(_, m)| {
            m.destination == destination
                && m.visible_at <= now
                && topics.iter().any(|topic| *topic == m.topic)
        })?;

        message.visible_at = now + visibility;
        message.delivery_count += 1;

        Some(SignalMessage {
            id: *id,
            destination: message.destination.clone(),
            topic: message.topic.clone(),
            payload: message.payload.clone(),
            dedup_key: message.dedup_key.clone(),
            delivery_count: message.delivery_count,
            sent_at: message.sent_at,
        })
    }
}

#[async_trait]
impl SignalMailbox for InMemoryMailbox {
    async fn send(
        &self,
        destination: &str,
        topic: &str,
        payload: serde_json::Value,
    ) -> MessagingResult<MessageId> {
        Ok(self.insert(destination, topic, payload, None)?.message_id())
    }

    async fn send_deduplicated(
        &self,
        destination: &str,
        topic: &str,
        payload: serde_json::Value,
        dedup_key: &str,
    ) -> MessagingResult<EnqueueOutcome> {
        self.insert(destination, topic, payload, Some(dedup_key))
    }

    async fn receive(
        &self,
        destination: &str,
        topics: &[&str],
        timeout: Duration,
        visibility: Duration,
    ) -> MessagingResult<Option<SignalMessage>> {
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.arrivals.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(message) = self.try_claim(destination, topics, visibility) {
                return Ok(Some(message));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            let wait = self.poll_interval.min(deadline - now);
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    async fn ack(&self, id: MessageId) -> MessagingResult<bool> {
        let mut state = self.state.lock();
        let removed = state.messages.remove(&id).is_some();
        if removed {
            state.total_acked += 1;
        }
        Ok(removed)
    }

    async fn release(&self, id: MessageId) -> MessagingResult<bool> {
        let released = {
            let mut state = self.state.lock();
            match state.messages.get_mut(&id) {
                Some(message) => {
                    message.visible_at = Instant::now();
                    true
                }
                None => false,
            }
        };
        if released {
            self.arrivals.notify_waiters();
        }
        Ok(released)
    }

    async fn extend_visibility(&self, id: MessageId, visibility: Duration) -> MessagingResult<bool> {
        let mut state = self.state.lock();
        match state.messages.get_mut(&id) {
            Some(message) => {
                message.visible_at = Instant::now() + visibility;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn pending(&self, destination: &str) -> MessagingResult<u64> {
        Ok(self
            .state
            .lock()
            .messages
            .values()
            .filter(|m| m.destination == destination)
            .count() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    const VISIBILITY: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn test_send_receive_ack() {
        let mailbox = InMemoryMailbox::new();
        let id = mailbox.send("scan-1", "batch_complete", json!({"batch_id": 1})).await.unwrap();

        let message = mailbox
            .receive("scan-1", &["batch_complete"], Duration::ZERO, VISIBILITY)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.id, id);
        assert_eq!(message.delivery_count, 1);
        assert_eq!(message.payload["batch_id"], 1);

        assert!(mailbox.ack(id).await.unwrap());
        assert!(!mailbox.ack(id).await.unwrap());
        assert_eq!(mailbox.pending("scan-1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_receive_filters_by_destination_and_topic() {
        let mailbox = InMemoryMailbox::new();
        mailbox.send("scan-1", "all_transmitted", json!({})).await.unwrap();
        mailbox.send("scan-2", "batch_complete", json!({})).await.unwrap();

        assert!(mailbox
            .receive("scan-1", &["batch_complete"], Duration::ZERO, VISIBILITY)
            .await
            .unwrap()
            .is_none());

        let message = mailbox
            .receive("scan-1", &["batch_complete", "all_transmitted"], Duration::ZERO, VISIBILITY)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.topic, "all_transmitted");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacked_message_is_redelivered_after_visibility() {
        let mailbox = InMemoryMailbox::new();
        mailbox.send("scan-1", "batch_complete", json!({})).await.unwrap();

        let first = mailbox
            .receive("scan-1", &["batch_complete"], Duration::ZERO, VISIBILITY)
            .await
            .unwrap()
            .unwrap();
        assert!(mailbox
            .receive("scan-1", &["batch_complete"], Duration::from_secs(5), VISIBILITY)
            .await
            .unwrap()
            .is_none());

        let again = mailbox
            .receive("scan-1", &["batch_complete"], Duration::from_secs(60), VISIBILITY)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.id, first.id);
        assert!(again.is_redelivery());
    }

    #[tokio::test]
    async fn test_release_makes_message_visible() {
        let mailbox = InMemoryMailbox::new();
        let id = mailbox.send("scan-1", "batch_complete", json!({})).await.unwrap();
        mailbox
            .receive("scan-1", &["batch_complete"], Duration::ZERO, VISIBILITY)
            .await
            .unwrap();

        assert!(mailbox.release(id).await.unwrap());
        let message = mailbox
            .receive("scan-1", &["batch_complete"], Duration::ZERO, VISIBILITY)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.delivery_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_extended_message_stays_hidden() {
        let mailbox = InMemoryMailbox::new();
        let id = mailbox.send("workflow_queue", "workflow_request", json!({})).await.unwrap();
        mailbox
            .receive("workflow_queue", &["workflow_request"], Duration::ZERO, VISIBILITY)
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(mailbox.extend_visibility(id, VISIBILITY).await.unwrap());
        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(mailbox
            .receive("workflow_queue", &["workflow_request"], Duration::ZERO, VISIBILITY)
            .await
            .unwrap()
            .is_none());

        mailbox.ack(id).await.unwrap();
        assert!(!mailbox.extend_visibility(id, VISIBILITY).await.unwrap());
    }

    #[tokio::test]
    async fn test_dedup_until_acked() {
        let mailbox = InMemoryMailbox::new();
        let first = mailbox
            .send_deduplicated("workflow_queue", "workflow_request", json!({}), "job-1")
            .await
            .unwrap();
        let second = mailbox
            .send_deduplicated("workflow_queue", "workflow_request", json!({}), "job-1")
            .await
            .unwrap();

        assert!(!first.is_duplicate());
        assert_eq!(second, EnqueueOutcome::Duplicate(first.message_id()));

        mailbox.ack(first.message_id()).await.unwrap();
        let third = mailbox
            .send_deduplicated("workflow_queue", "workflow_request", json!({}), "job-1")
            .await
            .unwrap();
        assert!(!third.is_duplicate());
    }

    #[tokio::test]
    async fn test_waiting_receiver_is_woken_by_send() {
        let mailbox = Arc::new(InMemoryMailbox::with_poll_interval(Duration::from_secs(60)));
        let receiver = {
            let mailbox = Arc::clone(&mailbox);
            tokio::spawn(async move {
                mailbox
                    .receive("scan-1", &["batch_complete"], Duration::from_secs(30), VISIBILITY)
                    .await
            })
        };

        tokio::task::yield_now().await;
        mailbox.send("scan-1", "batch_complete", json!({"n": 1})).await.unwrap();

        let message = receiver.await.unwrap().unwrap().unwrap();
        assert_eq!(message.payload["n"], 1);
    }

    #[tokio::test]
    async fn test_empty_destination_is_rejected() {
        let mailbox = InMemoryMailbox::new();
        assert!(matches!(
            mailbox.send("", "batch_complete", json!({})).await,
            Err(MessagingError::InvalidDestination { .. })
        ));
    }
}

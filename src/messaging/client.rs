//! # Signal Client
//!
//! Typed facade over a [`SignalMailbox`]: send-by-id, receive-by-topic and
//! deduplicated workflow launch.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, error};
use uuid::Uuid;

use super::errors::MessagingResult;
use super::mailbox::SignalMailbox;
use super::message::{EnqueueOutcome, MessageId, SignalMessage};
use super::signals::{ScanSignal, Signal, WorkflowRequest};
use crate::config::SignalingConfig;
use crate::constants::{destinations, topics};

/// A decoded signal plus the handle needed to ack it
#[derive(Debug, Clone, PartialEq)]
pub struct Received<T> {
    pub message_id: MessageId,
    pub delivery_count: u32,
    pub signal: T,
}

#[derive(Clone)]
pub struct SignalClient {
    mailbox: Arc<dyn SignalMailbox>,
    visibility: Duration,
}

impl std::fmt::Debug for SignalClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalClient")
            .field("visibility", &self.visibility)
            .finish()
    }
}

impl SignalClient {
    pub fn new(mailbox: Arc<dyn SignalMailbox>, config: &SignalingConfig) -> Self {
        Self {
            mailbox,
            visibility: config.visibility_timeout(),
        }
    }

    pub fn mailbox(&self) -> &Arc<dyn SignalMailbox> {
        &self.mailbox
    }

    /// Durably deliver `signal` to the workflow `destination`
    pub async fn send<S: Signal>(&self, destination: &str, signal: &S) -> MessagingResult<MessageId> {
        let payload = serde_json::to_value(signal)?;
        let id = self.mailbox.send(destination, S::TOPIC, payload).await?;
        debug!(destination = destination, topic = S::TOPIC, message_id = id, "Signal sent");
        Ok(id)
    }

    /// Raw receive on `topics` for `destination`
    pub async fn receive(
        &self,
        destination: &str,
        topics: &[&str],
        timeout: Duration,
    ) -> MessagingResult<Option<SignalMessage>> {
        self.mailbox
            .receive(destination, topics, timeout, self.visibility)
            .await
    }

    /// Next completion signal addressed to a scan.
    ///
    /// Undecodable messages are logged and acked so they cannot block the
    /// scan; waiting continues for the rest of `timeout`.
    pub async fn receive_scan_signal(
        &self,
        scan_id: Uuid,
        timeout: Duration,
    ) -> MessagingResult<Option<Received<ScanSignal>>> {
        let destination = scan_id.to_string();
        let deadline = Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Some(message) = self
                .receive(&destination, &ScanSignal::TOPICS, remaining)
                .await?
            else {
                return Ok(None);
            };

            match ScanSignal::from_message(&message) {
                Ok(signal) => {
                    return Ok(Some(Received {
                        message_id: message.id,
                        delivery_count: message.delivery_count,
                        signal,
                    }))
                }
                Err(err) => {
                    error!(
                        scan_id = %scan_id,
                        message_id = message.id,
                        topic = %message.topic,
                        error = %err,
                        "Discarding undecodable scan signal"
                    );
                    self.mailbox.ack(message.id).await?;
                }
            }
        }
    }

    /// Queue a scan workflow. The job id is the dedup key, so a job that is
    /// already queued or running is not launched twice.
    pub async fn enqueue_workflow(&self, job_id: Uuid) -> MessagingResult<EnqueueOutcome> {
        let request = WorkflowRequest {
            job_id,
            requested_at: Utc::now(),
        };
        let outcome = self
            .mailbox
            .send_deduplicated(
                destinations::WORKFLOW_QUEUE,
                WorkflowRequest::TOPIC,
                serde_json::to_value(request)?,
                &job_id.to_string(),
            )
            .await?;
        debug!(job_id = %job_id, duplicate = outcome.is_duplicate(), "Workflow enqueue");
        Ok(outcome)
    }

    /// Claim the next workflow request. Ack it once the workflow has finished.
    pub async fn claim_workflow(
        &self,
        timeout: Duration,
    ) -> MessagingResult<Option<Received<WorkflowRequest>>> {
        let Some(message) = self
            .receive(destinations::WORKFLOW_QUEUE, &[topics::WORKFLOW_REQUEST], timeout)
            .await?
        else {
            return Ok(None);
        };

        match message.decode::<WorkflowRequest>() {
            Ok(signal) => Ok(Some(Received {
                message_id: message.id,
                delivery_count: message.delivery_count,
                signal,
            })),
            Err(err) => {
                error!(message_id = message.id, error = %err, "Discarding undecodable workflow request");
                self.mailbox.ack(message.id).await?;
                Ok(None)
            }
        }
    }

    pub async fn ack(&self, id: MessageId) -> MessagingResult<bool> {
        self.mailbox.ack(id).await
    }

    pub async fn release(&self, id: MessageId) -> MessagingResult<bool> {
        self.mailbox.release(id).await
    }

    /// Renew the claim on a message that is still being worked on
    pub async fn extend(&self, id: MessageId) -> MessagingResult<bool> {
        self.mailbox.extend_visibility(id, self.visibility).await
    }

    pub fn visibility(&self) -> Duration {
        self.visibility
    }
}

//! # PostgreSQL Signal Mailbox
//!
//! Durable mailbox on the `verity_signals` table. Messages survive restarts
//! of both sender and receiver; claiming uses `FOR UPDATE SKIP LOCKED` so
//! concurrent receivers never take the same visible message.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tokio::time::Instant;
use tracing::debug;

use super::errors::{MessagingError, MessagingResult};
use super::mailbox::SignalMailbox;
use super::message::{EnqueueOutcome, MessageId, SignalMessage};

#[derive(Debug, Clone)]
pub struct PostgresMailbox {
    pool: PgPool,
    poll_interval: Duration,
}

impl PostgresMailbox {
    pub fn new(pool: PgPool, poll_interval: Duration) -> Self {
        Self {
            pool,
            poll_interval: poll_interval.max(Duration::from_millis(10)),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn try_claim(
        &self,
        destination: &str,
        topics: &[&str],
        visibility: Duration,
    ) -> MessagingResult<Option<SignalMessage>> {
        let topics: Vec<String> = topics.iter().map(|t| t.to_string()).collect();

        let row = sqlx::query(
            "UPDATE verity_signals \
             SET visible_at = now() + make_interval(secs => $3), \
                 delivery_count = delivery_count + 1 \
             WHERE id = ( \
                 SELECT id FROM verity_signals \
                 WHERE destination = $1 AND topic = ANY($2) AND visible_at <= now() \
                 ORDER BY id \
                 FOR UPDATE SKIP LOCKED \
                 LIMIT 1 \
             ) \
             RETURNING id, destination, topic, payload, dedup_key, delivery_count, sent_at",
        )
        .bind(destination)
        .bind(&topics)
        .bind(visibility.as_secs_f64())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| MessagingError::database_query("receive", e))?;

        row.map(|row| -> Result<SignalMessage, sqlx::Error> {
            let delivery_count: i32 = row.try_get("delivery_count")?;
            let sent_at: DateTime<Utc> = row.try_get("sent_at")?;
            Ok(SignalMessage {
                id: row.try_get("id")?,
                destination: row.try_get("destination")?,
                topic: row.try_get("topic")?,
                payload: row.try_get("payload")?,
                dedup_key: row.try_get("dedup_key")?,
                delivery_count: delivery_count.max(0) as u32,
                sent_at,
            })
        })
        .transpose()
        .map_err(|e| MessagingError::database_query("receive", e))
    }
}

#[async_trait]
impl SignalMailbox for PostgresMailbox {
    async fn send(
        &self,
        destination: &str,
        topic: &str,
        payload: serde_json::Value,
    ) -> MessagingResult<MessageId> {
        if destination.is_empty() {
            return Err(MessagingError::invalid_destination(destination, "must not be empty"));
        }

        let id: i64 = sqlx::query_scalar(
            "INSERT INTO verity_signals (destination, topic, payload) VALUES ($1, $2, $3) RETURNING id",
        )
        .bind(destination)
        .bind(topic)
        .bind(&payload)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| MessagingError::database_query("send", e))?;

        debug!(destination = destination, topic = topic, message_id = id, "Signal sent");
        Ok(id)
    }

    async fn send_deduplicated(
        &self,
        destination: &str,
        topic: &str,
        payload: serde_json::Value,
        dedup_key: &str,
    ) -> MessagingResult<EnqueueOutcome> {
        if destination.is_empty() {
            return Err(MessagingError::invalid_destination(destination, "must not be empty"));
        }

        let inserted: Option<i64> = sqlx::query_scalar(
            "INSERT INTO verity_signals (destination, topic, payload, dedup_key) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (destination, dedup_key) WHERE dedup_key IS NOT NULL DO NOTHING \
             RETURNING id",
        )
        .bind(destination)
        .bind(topic)
        .bind(&payload)
        .bind(dedup_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| MessagingError::database_query("send_deduplicated", e))?;

        if let Some(id) = inserted {
            return Ok(EnqueueOutcome::Enqueued(id));
        }

        let existing: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM verity_signals WHERE destination = $1 AND dedup_key = $2",
        )
        .bind(destination)
        .bind(dedup_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| MessagingError::database_query("send_deduplicated", e))?;

        match existing {
            Some(id) => Ok(EnqueueOutcome::Duplicate(id)),
            // acked between the two statements; try once more
            None => {
                let id: i64 = sqlx::query_scalar(
                    "INSERT INTO verity_signals (destination, topic, payload, dedup_key) \
                     VALUES ($1, $2, $3, $4) RETURNING id",
                )
                .bind(destination)
                .bind(topic)
                .bind(&payload)
                .bind(dedup_key)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| MessagingError::database_query("send_deduplicated", e))?;
                Ok(EnqueueOutcome::Enqueued(id))
            }
        }
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
            if let Some(message) = self.try_claim(destination, topics, visibility).await? {
                return Ok(Some(message));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn ack(&self, id: MessageId) -> MessagingResult<bool> {
        let result = sqlx::query("DELETE FROM verity_signals WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| MessagingError::database_query("ack", e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn release(&self, id: MessageId) -> MessagingResult<bool> {
        let result = sqlx::query("UPDATE verity_signals SET visible_at = now() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| MessagingError::database_query("release", e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn extend_visibility(&self, id: MessageId, visibility: Duration) -> MessagingResult<bool> {
        let result = sqlx::query(
            "UPDATE verity_signals SET visible_at = now() + make_interval(secs => $2) WHERE id = $1",
        )
        .bind(id)
        .bind(visibility.as_secs_f64())
        .execute(&self.pool)
        .await
        .map_err(|e| MessagingError::database_query("extend_visibility", e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn pending(&self, destination: &str) -> MessagingResult<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM verity_signals WHERE destination = $1")
                .bind(destination)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| MessagingError::database_query("pending", e))?;
        Ok(count.max(0) as u64)
    }
}

//! Durable message broker layered over the store.
//!
//! Guarantees:
//! - at-least-once delivery (consumers are idempotent)
//! - visibility lease: a claimed message is hidden until ack or lease expiry;
//!   `attempts` increments at claim time
//! - delayed delivery: never visible before `available_at`
//! - FIFO within a queue by `(available_at, message_id)` for a single
//!   consumer
//! - dead-lettering: at the per-queue attempt cap, `nack` converts the
//!   message into a permanent error record and removes it from the live set

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sqlx::SqlitePool;
use std::collections::HashMap;
use tracing::warn;

pub use tdk_db::queue::QueueDepth;

/// Queue names used by the pipeline.
pub mod names {
    pub const TRANSCRIPT_CHECK: &str = "transcript_check";
    pub const ANALYSIS_REQUEST: &str = "analysis_request";
    pub const GROUP_RESEARCH_REQUEST: &str = "group_research_request";
    pub const SCHEDULER_TICK: &str = "scheduler_tick";
    /// Logging label for the email lane. The lane itself is the
    /// `email_outbox` table, persisted per recipient so the UI can inspect
    /// delivery state.
    pub const EMAIL_SEND: &str = "email_send";
}

/// Per-queue delivery policy.
#[derive(Debug, Clone, Copy)]
pub struct QueuePolicy {
    /// Visibility lease applied at claim.
    pub lease: Duration,
    /// Delivery attempts before a nack dead-letters the message.
    pub max_attempts: i64,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        QueuePolicy {
            lease: Duration::minutes(5),
            max_attempts: 6,
        }
    }
}

/// One claimed message. `attempts` already includes this delivery.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message_id: i64,
    pub queue_name: String,
    pub attempts: i64,
    pub payload: Value,
}

impl Delivery {
    /// Decode the payload into its typed form. A decode failure is a poison
    /// payload — callers dead-letter it rather than retrying.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone())
            .with_context(|| format!("queue {} payload decode failed", self.queue_name))
    }
}

/// Outcome of a nack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    /// Requeued, visible again at the returned time.
    Requeued(DateTime<Utc>),
    /// Attempt cap reached; moved to `queue_dead_letters`.
    DeadLettered,
}

#[derive(Clone)]
pub struct QueueBroker {
    pool: SqlitePool,
    policies: HashMap<String, QueuePolicy>,
}

impl QueueBroker {
    pub fn new(pool: SqlitePool) -> Self {
        QueueBroker {
            pool,
            policies: HashMap::new(),
        }
    }

    /// Override the policy for one queue.
    pub fn with_policy(mut self, queue: &str, policy: QueuePolicy) -> Self {
        self.policies.insert(queue.to_string(), policy);
        self
    }

    pub fn policy(&self, queue: &str) -> QueuePolicy {
        self.policies.get(queue).copied().unwrap_or_default()
    }

    /// Publish a message, visible after `delay`.
    pub async fn publish<T: Serialize>(
        &self,
        queue: &str,
        payload: &T,
        delay: Duration,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let value = serde_json::to_value(payload).context("payload serialise failed")?;
        tdk_db::queue::insert_message(&self.pool, queue, &value, now + delay, now).await
    }

    /// Claim up to `batch` visible messages under the queue's lease.
    pub async fn claim(
        &self,
        queue: &str,
        batch: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<Delivery>> {
        let policy = self.policy(queue);
        let rows =
            tdk_db::queue::claim_messages(&self.pool, queue, batch, now, policy.lease).await?;
        Ok(rows
            .into_iter()
            .map(|r| Delivery {
                message_id: r.message_id,
                queue_name: r.queue_name,
                attempts: r.attempts,
                payload: r.payload,
            })
            .collect())
    }

    /// Complete a message. A second ack after lease expiry is a no-op.
    pub async fn ack(&self, message_id: i64) -> Result<()> {
        tdk_db::queue::delete_message(&self.pool, message_id).await?;
        Ok(())
    }

    /// Fail a delivery: requeue with `backoff`, or dead-letter once the
    /// queue's attempt cap is consumed.
    pub async fn nack(
        &self,
        delivery: &Delivery,
        backoff: Duration,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<NackOutcome> {
        let policy = self.policy(&delivery.queue_name);
        if delivery.attempts >= policy.max_attempts {
            warn!(
                queue = %delivery.queue_name,
                message_id = delivery.message_id,
                attempts = delivery.attempts,
                error,
                "attempts exhausted; dead-lettering"
            );
            tdk_db::queue::dead_letter_message(&self.pool, delivery.message_id, Some(error), now)
                .await?;
            return Ok(NackOutcome::DeadLettered);
        }

        let retry_at = now + backoff;
        tdk_db::queue::reschedule_message(&self.pool, delivery.message_id, retry_at).await?;
        Ok(NackOutcome::Requeued(retry_at))
    }

    /// Dead-letter a delivery immediately, bypassing the attempt cap. Used
    /// for poison payloads that can never decode.
    pub async fn dead_letter(
        &self,
        delivery: &Delivery,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        warn!(
            queue = %delivery.queue_name,
            message_id = delivery.message_id,
            error,
            "dead-lettering poison message"
        );
        tdk_db::queue::dead_letter_message(&self.pool, delivery.message_id, Some(error), now)
            .await?;
        Ok(())
    }

    /// Push the lease forward for long-running work.
    pub async fn extend(&self, message_id: i64, lease: Duration, now: DateTime<Utc>) -> Result<()> {
        tdk_db::queue::extend_lease(&self.pool, message_id, now + lease).await?;
        Ok(())
    }

    pub async fn depth(&self, queue: &str, now: DateTime<Utc>) -> Result<QueueDepth> {
        tdk_db::queue::queue_depth(&self.pool, queue, now).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

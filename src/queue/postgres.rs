use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use tokio::time::Instant;
use uuid::Uuid;

use super::{QueueError, QueueMessage, QueueTransport};

const DEFAULT_POLL_STEP: Duration = Duration::from_millis(200);

#[derive(sqlx::FromRow)]
struct ClaimedRow {
    id: Uuid,
    body: String,
    receipt_handle: Uuid,
    receive_count: i32,
}

/// Durable queue backed by the `event_queue` table.
///
/// A receive stamps each claimed row with a fresh receipt handle and pushes
/// its `visible_at` forward by the visibility timeout. Rows reappear once that
/// passes, so a consumer that dies mid-batch loses nothing.
#[derive(Clone)]
pub struct PgQueue {
    pool: PgPool,
    poll_step: Duration,
}

impl PgQueue {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            poll_step: DEFAULT_POLL_STEP,
        }
    }

    /// How often an empty long poll re-checks the table.
    pub fn with_poll_step(mut self, poll_step: Duration) -> Self {
        self.poll_step = poll_step;
        self
    }

    async fn claim(
        &self,
        max_messages: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        let rows = sqlx::query_as::<_, ClaimedRow>(
            "UPDATE event_queue
             SET receipt_handle = gen_random_uuid(),
                 receive_count = receive_count + 1,
                 visible_at = now() + make_interval(secs => $2::double precision)
             WHERE id IN (
                 SELECT id FROM event_queue
                 WHERE visible_at <= now()
                 ORDER BY enqueued_at ASC
                 LIMIT $1
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING id, body, receipt_handle, receive_count",
        )
        .bind(max_messages as i64)
        .bind(visibility_timeout.as_secs_f64())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| QueueMessage {
                message_id: row.id.to_string(),
                body: row.body,
                receipt_handle: row.receipt_handle.to_string(),
                receive_count: row.receive_count,
            })
            .collect())
    }
}

fn parse_receipt(handle: &str) -> Result<Uuid, QueueError> {
    Uuid::parse_str(handle).map_err(|_| QueueError::InvalidReceipt(handle.to_string()))
}

#[async_trait]
impl QueueTransport for PgQueue {
    async fn send(&self, body: String) -> Result<String, QueueError> {
        let id = Uuid::now_v7();
        sqlx::query("INSERT INTO event_queue (id, body) VALUES ($1, $2)")
            .bind(id)
            .bind(body)
            .execute(&self.pool)
            .await?;
        Ok(id.to_string())
    }

    async fn receive(
        &self,
        max_messages: usize,
        wait: Duration,
        visibility_timeout: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        let deadline = Instant::now() + wait;

        loop {
            let batch = self.claim(max_messages, visibility_timeout).await?;
            let now = Instant::now();
            if !batch.is_empty() || now >= deadline {
                return Ok(batch);
            }
            tokio::time::sleep(self.poll_step.min(deadline - now)).await;
        }
    }

    async fn delete(&self, receipt_handle: &str) -> Result<(), QueueError> {
        let receipt = parse_receipt(receipt_handle)?;
        sqlx::query("DELETE FROM event_queue WHERE receipt_handle = $1")
            .bind(receipt)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_batch(&self, receipt_handles: &[String]) -> Result<(), QueueError> {
        let receipts = receipt_handles
            .iter()
            .map(|h| parse_receipt(h))
            .collect::<Result<Vec<_>, _>>()?;

        sqlx::query("DELETE FROM event_queue WHERE receipt_handle = ANY($1)")
            .bind(receipts)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn dead_letter(&self, message: &QueueMessage, reason: &str) -> Result<(), QueueError> {
        let message_id = Uuid::parse_str(&message.message_id)
            .map_err(|e| QueueError::Transport(format!("invalid message id: {e}")))?;

        sqlx::query(
            "INSERT INTO event_dead_letters (id, message_id, body, receive_count, reason)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(Uuid::now_v7())
        .bind(message_id)
        .bind(&message.body)
        .bind(message.receive_count)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

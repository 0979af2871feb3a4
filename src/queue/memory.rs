use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use uuid::Uuid;

use super::{QueueError, QueueMessage, QueueTransport};

struct Entry {
    id: Uuid,
    body: String,
    receipt: Option<Uuid>,
    receive_count: i32,
    visible_at: Instant,
}

/// Dead letters kept in memory; the oldest are dropped past this.
const DEAD_LETTER_CAP: usize = 1000;

#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub message_id: String,
    pub body: String,
    pub reason: String,
}

#[derive(Default)]
struct State {
    entries: Vec<Entry>,
    dead_letters: VecDeque<DeadLetter>,
}

impl State {
    /// Hand out up to `max` visible entries in arrival order. Also returns the
    /// earliest instant a still-hidden entry becomes visible again.
    fn claim(&mut self, max: usize, visibility: Duration) -> (Vec<QueueMessage>, Option<Instant>) {
        let now = Instant::now();
        let mut batch = Vec::new();
        let mut next_visible: Option<Instant> = None;

        for entry in &mut self.entries {
            if entry.visible_at > now {
                next_visible = Some(next_visible.map_or(entry.visible_at, |t| t.min(entry.visible_at)));
                continue;
            }
            if batch.len() >= max {
                continue;
            }

            let receipt = Uuid::now_v7();
            entry.receipt = Some(receipt);
            entry.receive_count += 1;
            entry.visible_at = now + visibility;

            batch.push(QueueMessage {
                message_id: entry.id.to_string(),
                body: entry.body.clone(),
                receipt_handle: receipt.to_string(),
                receive_count: entry.receive_count,
            });
        }

        (batch, next_visible)
    }

    fn remove(&mut self, receipt: Uuid) {
        self.entries.retain(|e| e.receipt != Some(receipt));
    }
}

/// Process-local queue with the same visibility semantics as [`super::PgQueue`].
/// Nothing survives a restart.
#[derive(Default)]
pub struct MemoryQueue {
    state: Mutex<State>,
    notify: Notify,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages currently held, visible or not.
    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Take every dead letter held so far, oldest first.
    pub async fn drain_dead_letters(&self) -> Vec<DeadLetter> {
        self.state.lock().await.dead_letters.drain(..).collect()
    }
}

fn parse_receipt(handle: &str) -> Result<Uuid, QueueError> {
    Uuid::parse_str(handle).map_err(|_| QueueError::InvalidReceipt(handle.to_string()))
}

#[async_trait]
impl QueueTransport for MemoryQueue {
    async fn send(&self, body: String) -> Result<String, QueueError> {
        let id = Uuid::now_v7();
        self.state.lock().await.entries.push(Entry {
            id,
            body,
            receipt: None,
            receive_count: 0,
            visible_at: Instant::now(),
        });
        self.notify.notify_waiters();
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
            // Register before looking so a send between the check and the
            // wait still wakes us.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (batch, next_visible) = self
                .state
                .lock()
                .await
                .claim(max_messages, visibility_timeout);

            if !batch.is_empty() || Instant::now() >= deadline {
                return Ok(batch);
            }

            let wake_at = next_visible.map_or(deadline, |t| t.min(deadline));
            let _ = tokio::time::timeout_at(wake_at, notified).await;
        }
    }

    async fn delete(&self, receipt_handle: &str) -> Result<(), QueueError> {
        let receipt = parse_receipt(receipt_handle)?;
        self.state.lock().await.remove(receipt);
        Ok(())
    }

    async fn delete_batch(&self, receipt_handles: &[String]) -> Result<(), QueueError> {
        let receipts = receipt_handles
            .iter()
            .map(|h| parse_receipt(h))
            .collect::<Result<Vec<_>, _>>()?;

        let mut state = self.state.lock().await;
        for receipt in receipts {
            state.remove(receipt);
        }
        Ok(())
    }

    async fn dead_letter(&self, message: &QueueMessage, reason: &str) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        if state.dead_letters.len() >= DEAD_LETTER_CAP {
            if let Some(dropped) = state.dead_letters.pop_front() {
                tracing::warn!(message_id = %dropped.message_id, "[queue] dead letter evicted");
            }
        }
        state.dead_letters.push_back(DeadLetter {
            message_id: message.message_id.clone(),
            body: message.body.clone(),
            reason: reason.to_string(),
        });
        Ok(())
    }
}

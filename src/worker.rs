use std::sync::Arc;

use sqlx::{PgConnection, PgPool};
use tokio::sync::watch;

use crate::alerts::StatsWorker;
use crate::config::WorkerConfig;
use crate::db::StoreError;
use crate::fanout::{FanoutError, PubSub, tenant_channel};
use crate::queue::{AlertEvent, QueueClient, QueueError, QueueEvent, QueueMessage};
use crate::state::SharedState;

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("malformed message body: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Fanout(#[from] FanoutError),
}

/// Start the event consumer on a dedicated Tokio runtime.
/// This runs on a separate OS thread and blocks until shutdown is signaled.
pub fn spawn(state: SharedState, shutdown: watch::Receiver<bool>) -> std::thread::JoinHandle<()> {
    let consumer = Consumer::from_state(&state);

    std::thread::Builder::new()
        .name("event-consumer".into())
        .spawn(move || {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(1)
                .thread_name("event-worker")
                .enable_all()
                .build()
                .expect("Failed to build worker runtime");

            runtime.block_on(consumer.run(shutdown));
        })
        .expect("Failed to spawn event consumer thread")
}

/// Receives queue messages in batches and routes each one by event type.
#[derive(Clone)]
pub struct Consumer {
    pool: PgPool,
    queue: QueueClient,
    pubsub: Arc<dyn PubSub>,
    stats: StatsWorker,
    config: WorkerConfig,
}

impl Consumer {
    pub fn new(
        pool: PgPool,
        queue: QueueClient,
        pubsub: Arc<dyn PubSub>,
        stats: StatsWorker,
        config: WorkerConfig,
    ) -> Self {
        Self {
            pool,
            queue,
            pubsub,
            stats,
            config,
        }
    }

    pub fn from_state(state: &SharedState) -> Self {
        Self::new(
            state.pool.clone(),
            state.queue.clone(),
            state.pubsub.clone(),
            StatsWorker::new(&state.config.alerts, state.queue.clone()),
            state.config.worker.clone(),
        )
    }

    /// Loop until `shutdown` flips. An idle receive is abandoned on shutdown;
    /// a batch already received is always finished first.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("[worker] event consumer started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let received = tokio::select! {
                _ = shutdown.changed() => break,
                received = self.receive() => received,
            };

            match received {
                Ok(messages) if !messages.is_empty() => {
                    self.process_batch(messages).await;
                    continue;
                }
                Ok(_) => {}
                Err(e) => tracing::error!("[worker] receive failed: {e}"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = shutdown.changed() => {}
            }
        }

        tracing::info!("[worker] event consumer stopped");
    }

    async fn receive(&self) -> Result<Vec<QueueMessage>, QueueError> {
        self.queue
            .receive(
                self.config.max_messages,
                self.config.wait,
                self.config.visibility_timeout,
            )
            .await
    }

    /// One receive plus processing of whatever came back. Returns the number of
    /// messages handled.
    pub async fn poll_once(&self) -> Result<usize, QueueError> {
        let messages = self.receive().await?;
        let count = messages.len();
        if count > 0 {
            self.process_batch(messages).await;
        }
        Ok(count)
    }

    /// Handle every message on one pooled connection. A message is deleted
    /// once handled, successfully or not; failures are dead-lettered first
    /// when enabled. If no connection is available the batch is left alone
    /// and comes back after the visibility timeout.
    pub async fn process_batch(&self, messages: Vec<QueueMessage>) {
        let mut conn = match self.pool.acquire().await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::error!(batch = messages.len(), "[worker] no connection for batch: {e}");
                return;
            }
        };

        for message in &messages {
            if let Err(e) = self.handle(&mut conn, message).await {
                tracing::error!(
                    message_id = %message.message_id,
                    receive_count = message.receive_count,
                    "[worker] message failed: {e}"
                );
                if self.config.dead_letter {
                    if let Err(e) = self.queue.dead_letter(message, &e.to_string()).await {
                        tracing::error!(message_id = %message.message_id, "[worker] dead-letter failed: {e}");
                    }
                }
            }

            if let Err(e) = self.queue.delete(&message.receipt_handle).await {
                tracing::warn!(message_id = %message.message_id, "[worker] delete failed: {e}");
            }
        }
    }

    pub async fn handle(&self, conn: &mut PgConnection, message: &QueueMessage) -> Result<(), HandlerError> {
        match QueueEvent::parse(&message.body)? {
            QueueEvent::LogsCreated(event) => {
                self.stats.process(conn, &event).await?;
            }
            QueueEvent::LogsAlert(alert) => {
                self.relay_alert(&alert).await?;
            }
            QueueEvent::Unknown(kind) => {
                tracing::warn!(message_id = %message.message_id, ?kind, "[worker] no handler for event type, dropping");
            }
        }
        Ok(())
    }

    /// Push an alert to the tenant's live sockets on every instance.
    async fn relay_alert(&self, alert: &AlertEvent) -> Result<(), HandlerError> {
        let text = serde_json::to_string(&alert.message())?;
        self.pubsub
            .publish(&tenant_channel(alert.tenant_id), text)
            .await?;
        tracing::debug!(tenant_id = %alert.tenant_id, severity = %alert.severity, "[worker] alert relayed to live channel");
        Ok(())
    }
}

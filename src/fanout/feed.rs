use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use sqlx::PgPool;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use super::{ConnectionRegistry, LiveMessage, LiveSink, PubSub, tenant_channel};
use crate::config::LiveConfig;
use crate::crypto::FieldCipher;
use crate::db::StoreError;
use crate::db::audit_logs::{self, LogQuery};
use crate::models::AuditLogView;

/// Id of the newest record already pushed to a tenant's sockets. Ids are
/// UUID v7, so they sort in insertion order regardless of the record's
/// own timestamp.
type Cursor = Uuid;

/// Runs one task per tenant with live connections. Each task polls the store
/// for new records and relays the tenant's pub/sub channel to its sockets,
/// then exits once the tenant's last connection is gone.
pub struct LiveFeed {
    pool: PgPool,
    cipher: Arc<FieldCipher>,
    registry: Arc<ConnectionRegistry>,
    pubsub: Arc<dyn PubSub>,
    config: LiveConfig,
    tasks: DashMap<Uuid, JoinHandle<()>>,
}

impl LiveFeed {
    pub fn new(
        pool: PgPool,
        cipher: Arc<FieldCipher>,
        registry: Arc<ConnectionRegistry>,
        pubsub: Arc<dyn PubSub>,
        config: LiveConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            cipher,
            registry,
            pubsub,
            config,
            tasks: DashMap::new(),
        })
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Send the latest page to `sink`, register it, and make sure the
    /// tenant's feed task is running. Returns the connection id.
    pub async fn attach(self: &Arc<Self>, tenant_id: Uuid, user_id: Uuid, sink: Arc<dyn LiveSink>) -> Uuid {
        let cursor = match self.latest(tenant_id).await {
            Ok(snapshot) => {
                for log in &snapshot {
                    if let Err(e) = push_view(sink.as_ref(), log) {
                        tracing::debug!(%tenant_id, "initial live snapshot cut short: {e}");
                        break;
                    }
                }
                resume_point(&snapshot)
            }
            Err(e) => {
                tracing::warn!(%tenant_id, "live snapshot failed: {e}");
                Uuid::now_v7()
            }
        };

        let connection_id = self.registry.connect(tenant_id, user_id, sink);
        // A new task resumes right after the snapshot this socket just got.
        self.ensure_task(tenant_id, cursor);
        connection_id
    }

    pub fn detach(&self, tenant_id: Uuid, connection_id: Uuid) {
        self.registry.disconnect(tenant_id, connection_id);
    }

    /// Whether a feed task is currently running for `tenant_id`.
    pub fn is_running(&self, tenant_id: Uuid) -> bool {
        self.tasks
            .get(&tenant_id)
            .is_some_and(|handle| !handle.is_finished())
    }

    fn ensure_task(self: &Arc<Self>, tenant_id: Uuid, cursor: Cursor) {
        match self.tasks.entry(tenant_id) {
            Entry::Occupied(mut entry) => {
                if entry.get().is_finished() {
                    entry.insert(self.spawn_task(tenant_id, cursor));
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(self.spawn_task(tenant_id, cursor));
            }
        }
    }

    fn spawn_task(self: &Arc<Self>, tenant_id: Uuid, cursor: Cursor) -> JoinHandle<()> {
        let feed = Arc::clone(self);
        tokio::spawn(async move { feed.run_tenant(tenant_id, cursor).await })
    }

    /// Decide under the task entry lock, so a connection registered before
    /// `ensure_task` runs either keeps this task alive or gets a fresh one.
    fn retire_if_idle(&self, tenant_id: Uuid) -> bool {
        match self.tasks.entry(tenant_id) {
            Entry::Occupied(entry) if self.registry.connection_count(tenant_id) == 0 => {
                entry.remove();
                true
            }
            _ => false,
        }
    }

    async fn run_tenant(self: Arc<Self>, tenant_id: Uuid, mut cursor: Cursor) {
        let channel = tenant_channel(tenant_id);
        let mut subscription = self.pubsub.subscribe(&channel);

        let mut tick = tokio::time::interval(self.config.poll_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(%tenant_id, "live feed started");

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if self.retire_if_idle(tenant_id) {
                        break;
                    }
                    self.push_new(tenant_id, &mut cursor).await;
                }
                received = subscription.recv() => match received {
                    Ok(message) => {
                        self.registry.broadcast(tenant_id, &message);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(%tenant_id, skipped, "live feed fell behind its channel");
                    }
                    Err(RecvError::Closed) => {
                        subscription = self.pubsub.subscribe(&channel);
                    }
                },
            }
        }

        tracing::info!(%tenant_id, "live feed stopped");
    }

    /// Latest page for the tenant, newest first.
    async fn latest(&self, tenant_id: Uuid) -> Result<Vec<AuditLogView>, StoreError> {
        let params = LogQuery::for_tenant(tenant_id).page(Some(0), Some(self.config.page_size));
        audit_logs::query(&self.pool, &self.cipher, &params).await
    }

    /// Push everything inserted after `cursor`. The store is read forward one
    /// page at a time until nothing newer remains; the whole cycle then goes
    /// out newest timestamp first.
    async fn push_new(&self, tenant_id: Uuid, cursor: &mut Cursor) {
        let mut fresh = Vec::new();
        loop {
            let params = LogQuery::for_tenant(tenant_id)
                .after(*cursor)
                .page(Some(0), Some(self.config.page_size));
            let page = match audit_logs::query(&self.pool, &self.cipher, &params).await {
                Ok(page) => page,
                Err(e) => {
                    tracing::warn!(%tenant_id, "live feed poll failed: {e}");
                    break;
                }
            };

            let Some(last) = page.last() else {
                break;
            };
            *cursor = last.id;

            let full = page.len() as i64 >= self.config.page_size;
            fresh.extend(page);
            if !full {
                break;
            }
        }

        fresh.sort_by(|a, b| (b.timestamp, b.id).cmp(&(a.timestamp, a.id)));
        for log in &fresh {
            let frame = LiveMessage::LogView { log };
            match frame.to_text() {
                Ok(text) => {
                    self.registry.broadcast(tenant_id, &text);
                }
                Err(e) => tracing::error!(log_id = %log.id, "failed to encode live view: {e}"),
            }
        }
    }
}

fn push_view(sink: &dyn LiveSink, log: &AuditLogView) -> Result<(), super::FanoutError> {
    let frame = LiveMessage::LogView { log };
    sink.push(&frame.to_text()?)
}

/// Highest id in the snapshot, or nil when the tenant has no records yet.
fn resume_point(snapshot: &[AuditLogView]) -> Cursor {
    snapshot.iter().map(|log| log.id).max().unwrap_or_else(Uuid::nil)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ActionType, Severity};
    use chrono::{DateTime, Duration, Utc};

    fn view(at: DateTime<Utc>) -> AuditLogView {
        AuditLogView {
            id: Uuid::now_v7(),
            tenant_id: Uuid::nil(),
            user_id: Uuid::nil(),
            session_id: None,
            action_type: ActionType::Create,
            resource_type: "doc".to_string(),
            resource_id: None,
            severity: Severity::Info,
            ip_address: None,
            user_agent: None,
            before_state: None,
            after_state: None,
            meta_data: None,
            timestamp: at,
        }
    }

    #[test]
    fn resume_point_is_highest_id() {
        let now = Utc::now();
        let older = view(now - Duration::seconds(10));
        let newer = view(now);
        // Backdated record inserted last: its id still wins.
        let backdated = view(now - Duration::days(30));

        let snapshot = vec![newer, older, backdated.clone()];
        assert_eq!(resume_point(&snapshot), backdated.id);
    }

    #[test]
    fn empty_snapshot_resumes_from_the_start() {
        assert_eq!(resume_point(&[]), Uuid::nil());
    }

    #[test]
    fn log_view_frame_is_tagged() {
        let log = view(Utc::now());
        let frame = LiveMessage::LogView { log: &log };
        let text = frame.to_text().unwrap();
        assert!(text.starts_with(r#"{"type":"log.view""#));
    }
}

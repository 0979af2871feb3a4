use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

use super::FanoutError;

/// The outbound side of one live connection. Pushes never block: a sink
/// that is closed or full reports an error and gets pruned.
pub trait LiveSink: Send + Sync {
    fn push(&self, message: &str) -> Result<(), FanoutError>;
}

impl LiveSink for mpsc::Sender<String> {
    fn push(&self, message: &str) -> Result<(), FanoutError> {
        self.try_send(message.to_string()).map_err(|e| match e {
            TrySendError::Full(_) => FanoutError::SlowConsumer,
            TrySendError::Closed(_) => FanoutError::Closed,
        })
    }
}

struct Connection {
    id: Uuid,
    user_id: Uuid,
    sink: Arc<dyn LiveSink>,
}

/// Tenant id -> live connections. Tenants with no connections have no entry.
#[derive(Default)]
pub struct ConnectionRegistry {
    channels: DashMap<Uuid, Vec<Connection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a sink for `tenant_id` and return its connection id.
    pub fn connect(&self, tenant_id: Uuid, user_id: Uuid, sink: Arc<dyn LiveSink>) -> Uuid {
        let id = Uuid::now_v7();
        self.channels
            .entry(tenant_id)
            .or_default()
            .push(Connection { id, user_id, sink });

        tracing::debug!(%tenant_id, connection_id = %id, "live connection registered");
        id
    }

    /// Remove a connection. Returns false when it was not registered.
    pub fn disconnect(&self, tenant_id: Uuid, connection_id: Uuid) -> bool {
        let removed = match self.channels.get_mut(&tenant_id) {
            Some(mut conns) => {
                let before = conns.len();
                conns.retain(|c| c.id != connection_id);
                conns.len() != before
            }
            None => false,
        };

        self.channels.remove_if(&tenant_id, |_, conns| conns.is_empty());
        if removed {
            tracing::debug!(%tenant_id, %connection_id, "live connection removed");
        }
        removed
    }

    /// Push `message` to every connection of `tenant_id` and return how many
    /// accepted it. Sinks that fail are dropped in the same pass, under the
    /// entry lock, so no later broadcast can reach them.
    pub fn broadcast(&self, tenant_id: Uuid, message: &str) -> usize {
        let mut delivered = 0;

        if let Some(mut conns) = self.channels.get_mut(&tenant_id) {
            conns.retain(|conn| match conn.sink.push(message) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(e) => {
                    tracing::warn!(
                        %tenant_id,
                        connection_id = %conn.id,
                        user_id = %conn.user_id,
                        "dropping live connection: {e}"
                    );
                    false
                }
            });
        }

        self.channels.remove_if(&tenant_id, |_, conns| conns.is_empty());
        delivered
    }

    pub fn connection_count(&self, tenant_id: Uuid) -> usize {
        self.channels.get(&tenant_id).map_or(0, |conns| conns.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records every push; fails every push once `broken` is set.
    #[derive(Default)]
    struct RecordingSink {
        received: Mutex<Vec<String>>,
        broken: bool,
    }

    impl LiveSink for RecordingSink {
        fn push(&self, message: &str) -> Result<(), FanoutError> {
            if self.broken {
                return Err(FanoutError::Closed);
            }
            self.received.lock().unwrap().push(message.to_string());
            Ok(())
        }
    }

    impl RecordingSink {
        fn broken() -> Self {
            Self {
                broken: true,
                ..Self::default()
            }
        }

        fn count(&self) -> usize {
            self.received.lock().unwrap().len()
        }
    }

    #[test]
    fn broadcast_skips_failed_socket_and_prunes_only_it() {
        let registry = ConnectionRegistry::new();
        let tenant = Uuid::now_v7();
        let healthy = Arc::new(RecordingSink::default());
        let failing = Arc::new(RecordingSink::broken());

        registry.connect(tenant, Uuid::now_v7(), failing.clone());
        registry.connect(tenant, Uuid::now_v7(), healthy.clone());

        assert_eq!(registry.broadcast(tenant, "first"), 1);
        assert_eq!(healthy.count(), 1);
        assert_eq!(registry.connection_count(tenant), 1);

        assert_eq!(registry.broadcast(tenant, "second"), 1);
        assert_eq!(healthy.count(), 2);
    }

    #[test]
    fn disconnect_removes_empty_tenant_entry() {
        let registry = ConnectionRegistry::new();
        let tenant = Uuid::now_v7();
        let a = registry.connect(tenant, Uuid::now_v7(), Arc::new(RecordingSink::default()));
        let b = registry.connect(tenant, Uuid::now_v7(), Arc::new(RecordingSink::default()));

        assert!(registry.disconnect(tenant, a));
        assert!(registry.channels.contains_key(&tenant));
        assert!(registry.disconnect(tenant, b));
        assert!(!registry.channels.contains_key(&tenant));
        assert!(!registry.disconnect(tenant, b));
    }

    #[test]
    fn broadcast_that_prunes_everyone_removes_tenant() {
        let registry = ConnectionRegistry::new();
        let tenant = Uuid::now_v7();
        registry.connect(tenant, Uuid::now_v7(), Arc::new(RecordingSink::broken()));

        assert_eq!(registry.broadcast(tenant, "x"), 0);
        assert!(!registry.channels.contains_key(&tenant));
    }

    #[test]
    fn broadcast_is_tenant_scoped() {
        let registry = ConnectionRegistry::new();
        let (t1, t2) = (Uuid::now_v7(), Uuid::now_v7());
        let s1 = Arc::new(RecordingSink::default());
        let s2 = Arc::new(RecordingSink::default());
        registry.connect(t1, Uuid::now_v7(), s1.clone());
        registry.connect(t2, Uuid::now_v7(), s2.clone());

        registry.broadcast(t1, "only-t1");
        assert_eq!(s1.count(), 1);
        assert_eq!(s2.count(), 0);
    }

    #[tokio::test]
    async fn channel_sink_reports_closed_and_full() {
        let (tx, rx) = mpsc::channel::<String>(1);
        tx.push("a").unwrap();
        assert!(matches!(tx.push("b"), Err(FanoutError::SlowConsumer)));
        drop(rx);
        assert!(matches!(tx.push("c"), Err(FanoutError::Closed)));
    }
}

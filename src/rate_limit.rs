use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Length of one write budget window.
pub const WINDOW_SECS: u64 = 60;

/// Per-tenant write rate limiter using a fixed window.
#[derive(Default)]
pub struct TenantRateLimiter {
    /// tenant_id -> (count, window_start)
    entries: DashMap<Uuid, (u32, Instant)>,
}

impl TenantRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Charge `cost` requests to the tenant. Returns Ok(()) or Err with
    /// retry-after seconds.
    pub fn check(&self, tenant_id: Uuid, cost: u32, limit: u32, window_secs: u64) -> Result<(), u64> {
        let window = Duration::from_secs(window_secs);
        let now = Instant::now();

        let mut entry = self.entries.entry(tenant_id).or_insert((0, now));
        let (count, start) = entry.value_mut();

        if now.duration_since(*start) > window {
            *count = 0;
            *start = now;
        }

        if count.saturating_add(cost) > limit {
            let elapsed = now.duration_since(*start).as_secs();
            return Err(window_secs.saturating_sub(elapsed));
        }

        *count += cost;
        Ok(())
    }

    /// Remove stale entries older than the given duration.
    pub fn cleanup(&self, max_age: Duration) {
        let now = Instant::now();
        self.entries.retain(|_, (_, start)| now.duration_since(*start) < max_age);
    }

    /// Run `cleanup` every `every`, dropping windows older than `max_age`.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration, max_age: Duration) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            loop {
                tick.tick().await;
                limiter.cleanup(max_age);
            }
        })
    }
}

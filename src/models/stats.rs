use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Named counters computed from the store at read time. Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub stats: BTreeMap<String, i64>,
}

impl StatsSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, count: i64) {
        self.stats.insert(name.into(), count);
    }

    /// Count for `name`, zero when the counter is absent.
    pub fn get(&self, name: &str) -> i64 {
        self.stats.get(name).copied().unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, i64)> {
        self.stats.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

//! Governor registry
//!
//! Id-keyed records for every active governor. Parent links are ids, never
//! handles, which keeps the supervision graph acyclic by construction and
//! free of ownership cycles.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use super::state::GovernorState;
use super::{GovernorMetrics, VsmLevel};

/// One governor's registry record.
#[derive(Debug, Clone, Serialize)]
pub struct GovernorRecord {
    pub id: String,
    pub level: VsmLevel,
    /// Parent governor id; `None` only for System 5.
    pub parent: Option<String>,
    pub state: GovernorState,
    pub metrics: GovernorMetrics,
    pub last_probe: Option<DateTime<Utc>>,
}

/// Shared, concurrent registry. Cheap to clone.
#[derive(Clone, Default)]
pub struct GovernorRegistry {
    inner: Arc<RwLock<HashMap<String, GovernorRecord>>>,
}

impl GovernorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a governor. Rejects duplicate ids and parent chains that
    /// would form a cycle.
    pub async fn register(
        &self,
        id: &str,
        level: VsmLevel,
        parent: Option<&str>,
    ) -> Result<(), String> {
        let mut map = self.inner.write().await;
        if map.contains_key(id) {
            return Err(format!("governor id {} already registered", id));
        }
        if let Some(parent_id) = parent {
            if parent_id == id {
                return Err(format!("governor {} cannot parent itself", id));
            }
            // Walk upward; the chain is short (at most five levels).
            let mut cursor = parent_id.to_string();
            loop {
                match map.get(&cursor) {
                    Some(record) => match &record.parent {
                        Some(next) if next == id => {
                            return Err(format!(
                                "registering {} under {} would create a cycle",
                                id, parent_id
                            ));
                        }
                        Some(next) => cursor = next.clone(),
                        None => break,
                    },
                    None => break,
                }
            }
        }
        map.insert(
            id.to_string(),
            GovernorRecord {
                id: id.to_string(),
                level,
                parent: parent.map(str::to_string),
                state: GovernorState::Uninitialized,
                metrics: GovernorMetrics::default(),
                last_probe: None,
            },
        );
        Ok(())
    }

    /// Record a state transition.
    pub async fn set_state(&self, id: &str, state: GovernorState) {
        if let Some(record) = self.inner.write().await.get_mut(id) {
            record.state = state;
        }
    }

    /// Record a completed probe.
    pub async fn touch_probe(&self, id: &str) {
        if let Some(record) = self.inner.write().await.get_mut(id) {
            record.last_probe = Some(Utc::now());
        }
    }

    /// Replace the metrics snapshot.
    pub async fn set_metrics(&self, id: &str, metrics: GovernorMetrics) {
        if let Some(record) = self.inner.write().await.get_mut(id) {
            record.metrics = metrics;
        }
    }

    pub async fn get(&self, id: &str) -> Option<GovernorRecord> {
        self.inner.read().await.get(id).cloned()
    }

    /// Children of a governor, by parent id.
    pub async fn children_of(&self, parent_id: &str) -> Vec<GovernorRecord> {
        self.inner
            .read()
            .await
            .values()
            .filter(|r| r.parent.as_deref() == Some(parent_id))
            .cloned()
            .collect()
    }

    /// Snapshot of every record, ordered by VSM level then id.
    pub async fn snapshot(&self) -> Vec<GovernorRecord> {
        let mut records: Vec<GovernorRecord> =
            self.inner.read().await.values().cloned().collect();
        records.sort_by(|a, b| a.level.cmp(&b.level).then(a.id.cmp(&b.id)));
        records
    }

    pub async fn remove(&self, id: &str) {
        self.inner.write().await.remove(id);
    }
}

//! Agent Cards and the agent registry
//!
//! Every remote client presents an Agent Card: a capability-declaring
//! credential validated on registration. The registry exclusively owns the
//! card records; heartbeats keep entries alive and two consecutive misses
//! evict.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::a2a::netguard;
use crate::audit::{AuditLog, EventCategory, SecurityEvent, Severity};
use crate::governor::bus::{BusEvent, EventBus};

/// Cards older than this at registration are rejected (anti-replay).
const MAX_CARD_AGE_MINUTES: i64 = 5;
/// Tolerated forward clock skew on `lastSeen`.
const MAX_CLOCK_SKEW_MINUTES: i64 = 1;

/// Capability category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityCategory {
    Serial,
    Network,
    Governance,
    Monitoring,
    Custom,
}

/// One declared capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCapability {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub category: CapabilityCategory,
    /// JSON schema for the capability input, opaque to the core.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
    /// JSON schema for the capability output, opaque to the core.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
}

/// Endpoint protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointProtocol {
    Https,
    Wss,
}

/// One endpoint an agent is reachable at.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEndpoint {
    pub url: String,
    pub protocol: EndpointProtocol,
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication: Option<String>,
}

/// The credential presented by every remote client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCard {
    pub agent_id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub version: String,
    #[serde(default)]
    pub capabilities: Vec<AgentCapability>,
    pub endpoints: Vec<AgentEndpoint>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    pub last_seen: DateTime<Utc>,
}

/// Reasons a card is refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CardError {
    NotV4Uuid,
    NoEndpoints,
    NonPrivateEndpoint(String),
    Stale,
    FutureDated,
    EmptyVersion,
}

impl CardError {
    pub fn label(&self) -> &'static str {
        match self {
            CardError::NotV4Uuid => "agent_id_not_uuid_v4",
            CardError::NoEndpoints => "no_endpoints",
            CardError::NonPrivateEndpoint(_) => "endpoint_not_private",
            CardError::Stale => "last_seen_stale",
            CardError::FutureDated => "last_seen_future",
            CardError::EmptyVersion => "empty_version",
        }
    }
}

impl AgentCard {
    /// Full admission check: UUID version, endpoint addressing, freshness.
    pub fn validate(&self, now: DateTime<Utc>) -> Result<(), CardError> {
        if self.agent_id.get_version_num() != 4 {
            return Err(CardError::NotV4Uuid);
        }
        if self.version.trim().is_empty() {
            return Err(CardError::EmptyVersion);
        }
        if self.endpoints.is_empty() {
            return Err(CardError::NoEndpoints);
        }
        for endpoint in &self.endpoints {
            if !netguard::url_host_is_private(&endpoint.url) {
                return Err(CardError::NonPrivateEndpoint(endpoint.url.clone()));
            }
        }
        let age = now.signed_duration_since(self.last_seen);
        if age > ChronoDuration::minutes(MAX_CARD_AGE_MINUTES) {
            return Err(CardError::Stale);
        }
        if age < -ChronoDuration::minutes(MAX_CLOCK_SKEW_MINUTES) {
            return Err(CardError::FutureDated);
        }
        Ok(())
    }

    pub fn has_capability(&self, capability_id: &str) -> bool {
        self.capabilities.iter().any(|c| c.id == capability_id)
    }

    pub fn capability_ids(&self) -> Vec<String> {
        self.capabilities.iter().map(|c| c.id.clone()).collect()
    }
}

/// Registry entry with liveness bookkeeping.
#[derive(Debug, Clone)]
pub struct AgentEntry {
    pub card: AgentCard,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub missed_heartbeats: u32,
    pub active: bool,
}

/// Discovery filters for `agent.discover`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DiscoverFilter {
    /// Require this capability id.
    pub capability: Option<String>,
    /// Require these metadata key/value pairs, exact match.
    pub metadata: HashMap<String, Value>,
}

/// Concurrent card registry. Reads vastly outnumber writes.
#[derive(Clone)]
pub struct AgentRegistry {
    agents: Arc<RwLock<HashMap<Uuid, AgentEntry>>>,
    bus: EventBus,
    audit: Arc<AuditLog>,
}

impl AgentRegistry {
    pub fn new(bus: EventBus, audit: Arc<AuditLog>) -> Self {
        Self {
            agents: Arc::new(RwLock::new(HashMap::new())),
            bus,
            audit,
        }
    }

    /// Admit or refresh a card. Re-registration replaces the card.
    pub async fn register(&self, card: AgentCard) -> Result<(), CardError> {
        card.validate(Utc::now())?;
        let id = card.agent_id;
        let mut agents = self.agents.write().await;
        let now = Utc::now();
        agents.insert(
            id,
            AgentEntry {
                card,
                registered_at: now,
                last_heartbeat: now,
                missed_heartbeats: 0,
                active: true,
            },
        );
        info!(agent = %id, "agent registered");
        Ok(())
    }

    pub async fn unregister(&self, id: &Uuid) -> bool {
        self.agents.write().await.remove(id).is_some()
    }

    /// Record a heartbeat; returns false for unknown agents.
    pub async fn heartbeat(&self, id: &Uuid) -> bool {
        let mut agents = self.agents.write().await;
        match agents.get_mut(id) {
            Some(entry) => {
                entry.last_heartbeat = Utc::now();
                entry.missed_heartbeats = 0;
                entry.active = true;
                true
            }
            None => false,
        }
    }

    pub async fn get(&self, id: &Uuid) -> Option<AgentEntry> {
        self.agents.read().await.get(id).cloned()
    }

    /// Registered, active cards.
    pub async fn list(&self) -> Vec<AgentCard> {
        let mut cards: Vec<AgentCard> = self
            .agents
            .read()
            .await
            .values()
            .filter(|e| e.active)
            .map(|e| e.card.clone())
            .collect();
        cards.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        cards
    }

    /// Explicit, server-mediated discovery (no multicast, no mDNS).
    pub async fn discover(&self, filter: &DiscoverFilter) -> Vec<AgentCard> {
        self.list()
            .await
            .into_iter()
            .filter(|card| {
                if let Some(cap) = &filter.capability {
                    if !card.has_capability(cap) {
                        return false;
                    }
                }
                filter
                    .metadata
                    .iter()
                    .all(|(k, v)| card.metadata.get(k) == Some(v))
            })
            .collect()
    }

    /// Liveness sweep: one miss marks inactive, a second evicts. Returns
    /// the evicted agent ids so the caller can revoke their tokens.
    pub async fn sweep(&self, timeout: std::time::Duration) -> Vec<Uuid> {
        let timeout = ChronoDuration::from_std(timeout).unwrap_or(ChronoDuration::seconds(120));
        let now = Utc::now();
        let mut evicted = Vec::new();
        let mut agents = self.agents.write().await;

        agents.retain(|id, entry| {
            let overdue = now.signed_duration_since(entry.last_heartbeat) > timeout;
            if !overdue {
                return true;
            }
            entry.missed_heartbeats += 1;
            // Restart the clock so the next miss is scored one timeout later.
            entry.last_heartbeat = now;
            if entry.missed_heartbeats == 1 {
                warn!(agent = %id, "heartbeat missed; marking inactive");
                entry.active = false;
                true
            } else {
                evicted.push(*id);
                false
            }
        });
        drop(agents);

        for id in &evicted {
            info!(agent = %id, "agent evicted after missed heartbeats");
            self.audit.append(
                SecurityEvent::new(
                    Severity::Notice,
                    EventCategory::Authentication,
                    "agent.evicted",
                    20,
                )
                .with_agent(*id),
            );
            self.bus.publish(BusEvent::AgentEvicted {
                agent_id: *id,
                reason: "missed heartbeats".to_string(),
                timestamp: Utc::now(),
            });
        }
        evicted
    }

    pub async fn len(&self) -> usize {
        self.agents.read().await.len()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::card;
    use super::*;

    fn registry() -> (AgentRegistry, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let audit = Arc::new(AuditLog::open(dir.path()).unwrap());
        (AgentRegistry::new(EventBus::new(), audit), dir)
    }

    #[test]
    fn test_card_validation() {
        let now = Utc::now();
        assert!(card(&["port.list"]).validate(now).is_ok());

        let mut stale = card(&[]);
        stale.last_seen = now - ChronoDuration::minutes(6);
        assert_eq!(stale.validate(now), Err(CardError::Stale));

        let mut public = card(&[]);
        public.endpoints[0].url = "https://8.8.8.8/a2a".to_string();
        assert!(matches!(
            public.validate(now),
            Err(CardError::NonPrivateEndpoint(_))
        ));

        let mut hostname = card(&[]);
        hostname.endpoints[0].url = "https://agent.internal/a2a".to_string();
        assert!(matches!(
            hostname.validate(now),
            Err(CardError::NonPrivateEndpoint(_))
        ));

        let mut v1 = card(&[]);
        v1.agent_id = Uuid::from_u128(42); // not version 4
        assert_eq!(v1.validate(now), Err(CardError::NotV4Uuid));

        let mut empty = card(&[]);
        empty.endpoints.clear();
        assert_eq!(empty.validate(now), Err(CardError::NoEndpoints));
    }

    #[tokio::test]
    async fn test_register_and_discover() {
        let (registry, _dir) = registry();
        let serial = card(&["port.list", "port.write"]);
        let monitor = card(&["governor.status"]);
        registry.register(serial.clone()).await.unwrap();
        registry.register(monitor.clone()).await.unwrap();

        assert_eq!(registry.list().await.len(), 2);

        let found = registry
            .discover(&DiscoverFilter {
                capability: Some("port.write".to_string()),
                metadata: HashMap::new(),
            })
            .await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].agent_id, serial.agent_id);
    }

    #[tokio::test]
    async fn test_discover_metadata_filter() {
        let (registry, _dir) = registry();
        let mut tagged = card(&[]);
        tagged
            .metadata
            .insert("site".to_string(), Value::from("lab"));
        registry.register(tagged.clone()).await.unwrap();
        registry.register(card(&[])).await.unwrap();

        let mut filter = DiscoverFilter::default();
        filter.metadata.insert("site".to_string(), Value::from("lab"));
        let found = registry.discover(&filter).await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].agent_id, tagged.agent_id);
    }

    #[tokio::test]
    async fn test_sweep_two_strikes() {
        let (registry, _dir) = registry();
        let c = card(&[]);
        let id = c.agent_id;
        registry.register(c).await.unwrap();

        // Backdate the heartbeat past the timeout.
        {
            let mut agents = registry.agents.write().await;
            agents.get_mut(&id).unwrap().last_heartbeat =
                Utc::now() - ChronoDuration::seconds(10);
        }
        let evicted = registry.sweep(std::time::Duration::from_secs(1)).await;
        assert!(evicted.is_empty());
        assert!(!registry.get(&id).await.unwrap().active);

        // Second miss evicts.
        {
            let mut agents = registry.agents.write().await;
            agents.get_mut(&id).unwrap().last_heartbeat =
                Utc::now() - ChronoDuration::seconds(10);
        }
        let evicted = registry.sweep(std::time::Duration::from_secs(1)).await;
        assert_eq!(evicted, vec![id]);
        assert!(registry.get(&id).await.is_none());

        // A heartbeat in between resets the count.
        let c2 = card(&[]);
        let id2 = c2.agent_id;
        registry.register(c2).await.unwrap();
        assert!(registry.heartbeat(&id2).await);
        let evicted = registry.sweep(std::time::Duration::from_secs(60)).await;
        assert!(evicted.is_empty());
    }

    #[tokio::test]
    async fn test_card_json_field_names() {
        let c = card(&["port.list"]);
        let json = serde_json::to_value(&c).unwrap();
        assert!(json.get("agentId").is_some());
        assert!(json.get("lastSeen").is_some());
        assert!(json.get("agent_id").is_none());
    }
}

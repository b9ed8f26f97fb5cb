//! Network bridge and A2A protocol engine
//!
//! JSON-RPC 2.0 over HTTPS, restricted to RFC-1918 address space, with
//! Agent Card authentication, capability-scoped authorization, two-tier
//! rate limiting, and a WebSocket notification stream.

pub mod agents;
pub mod methods;
pub mod netguard;
pub mod ratelimit;
pub mod rpc;
pub mod sanitize;
pub mod server;
pub mod tokens;
pub mod ws;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{broadcast, Mutex, RwLock};
use uuid::Uuid;

use crate::audit::AuditLog;
use crate::config::CoreConfig;
use crate::governor::bus::EventBus;
use crate::governor::patterns::SharedPatterns;
use crate::governor::registry::GovernorRegistry;
use crate::manager::PortManager;
use crate::meta::repair::RepairReport;
use crate::serial::types::ReadEvent;

pub use agents::{AgentCard, AgentRegistry};
pub use rpc::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RpcFailure};
pub use tokens::TokenManager;

/// Capacity of the outbound notification channel.
const NOTIFICATION_CAPACITY: usize = 512;

/// Per-(agent, port) read cursors for the long-polled `port.read` method.
///
/// Each reader consumes independently from its subscription point; a cursor
/// is parked here between calls.
#[derive(Default)]
pub struct ReadSessions {
    cursors: Mutex<HashMap<(Uuid, String), broadcast::Receiver<ReadEvent>>>,
}

impl ReadSessions {
    pub async fn take(&self, agent: Uuid, port: &str) -> Option<broadcast::Receiver<ReadEvent>> {
        self.cursors.lock().await.remove(&(agent, port.to_string()))
    }

    pub async fn park(&self, agent: Uuid, port: &str, rx: broadcast::Receiver<ReadEvent>) {
        self.cursors
            .lock()
            .await
            .insert((agent, port.to_string()), rx);
    }

    pub async fn drop_agent(&self, agent: &Uuid) {
        self.cursors.lock().await.retain(|(a, _), _| a != agent);
    }
}

/// Everything the dispatcher and transport share.
pub struct A2aContext {
    pub config: CoreConfig,
    pub manager: Arc<PortManager>,
    pub agents: AgentRegistry,
    pub tokens: TokenManager,
    pub limiter: ratelimit::RateLimiter,
    pub governors: GovernorRegistry,
    pub patterns: SharedPatterns,
    pub audit: Arc<AuditLog>,
    pub bus: EventBus,
    /// Fan-out for server->client notifications.
    pub notifications: broadcast::Sender<JsonRpcNotification>,
    pub read_sessions: ReadSessions,
    /// Most recent self-repair report, for `governor.status`.
    pub latest_repair: RwLock<Option<RepairReport>>,
    pub started_at: Instant,
}

impl A2aContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: CoreConfig,
        manager: Arc<PortManager>,
        agents: AgentRegistry,
        tokens: TokenManager,
        limiter: ratelimit::RateLimiter,
        governors: GovernorRegistry,
        patterns: SharedPatterns,
        audit: Arc<AuditLog>,
        bus: EventBus,
    ) -> Arc<Self> {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Arc::new(Self {
            config,
            manager,
            agents,
            tokens,
            limiter,
            governors,
            patterns,
            audit,
            bus,
            notifications,
            read_sessions: ReadSessions::default(),
            latest_repair: RwLock::new(None),
            started_at: Instant::now(),
        })
    }

    /// Publish a server->client notification. No subscribers is fine.
    pub fn notify(&self, notification: JsonRpcNotification) {
        let _ = self.notifications.send(notification);
    }
}

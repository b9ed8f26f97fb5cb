//! Internal event bus
//!
//! Multiple-producer, multiple-consumer broadcast with bounded per-subscriber
//! queues. Slow subscribers drop messages (logged) rather than back-pressure
//! publishers. Messages from one publisher are observed in publication order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::governor::state::GovernorState;
use crate::serial::types::{BufferMode, PortStatus};

const DEFAULT_BUS_CAPACITY: usize = 1024;

/// Downward directive issued by Systems 3..5.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "directive", rename_all = "snake_case")]
pub enum Directive {
    SwitchBufferMode { port_id: String, mode: BufferMode },
    RestartPort { port_id: String },
    QuarantineAgent { agent_id: uuid::Uuid },
    RotateLogs,
}

/// Typed message on the internal bus.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusEvent {
    PortStatusChanged {
        port_id: String,
        status: PortStatus,
        timestamp: DateTime<Utc>,
    },
    GovernorStateChanged {
        governor_id: String,
        state: GovernorState,
        timestamp: DateTime<Utc>,
    },
    /// A child failed validation or exhausted local policy; parents react.
    Escalation {
        governor_id: String,
        level: u8,
        error: String,
        timestamp: DateTime<Utc>,
    },
    Directive {
        target: String,
        #[serde(flatten)]
        directive: Directive,
        timestamp: DateTime<Utc>,
    },
    AgentEvicted {
        agent_id: uuid::Uuid,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    Heartbeat {
        component: String,
        timestamp: DateTime<Utc>,
    },
    MetricsSnapshot {
        component: String,
        metrics: serde_json::Value,
        timestamp: DateTime<Utc>,
    },
    RepairCompleted {
        healthy: bool,
        fixed: Vec<String>,
        timestamp: DateTime<Utc>,
    },
}

/// Broadcast bus handle. Cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BusEvent>,
    closed: Arc<AtomicBool>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUS_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Publish an event. Returns the number of subscribers that will see it.
    ///
    /// Publishing on a closed bus is a no-op; shutdown races are expected.
    pub fn publish(&self, event: BusEvent) -> usize {
        if self.closed.load(Ordering::Acquire) {
            return 0;
        }
        match self.tx.send(event) {
            Ok(n) => n,
            Err(_) => 0,
        }
    }

    /// Subscribe from this point forward.
    pub fn subscribe(&self) -> BusSubscription {
        BusSubscription {
            rx: self.tx.subscribe(),
            dropped: 0,
        }
    }

    /// Close the bus; subsequent publishes are dropped.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// One subscriber's view of the bus.
pub struct BusSubscription {
    rx: broadcast::Receiver<BusEvent>,
    dropped: u64,
}

impl BusSubscription {
    /// Receive the next event.
    ///
    /// Lagging does not end the subscription: dropped messages are counted
    /// and logged, and reception continues with the oldest retained event.
    /// Returns `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<BusEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.dropped += n;
                    warn!(dropped = n, total = self.dropped, "slow bus subscriber dropped events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("bus closed");
                    return None;
                }
            }
        }
    }

    /// Non-blocking receive; `None` when empty or closed.
    pub fn try_recv(&mut self) -> Option<BusEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    self.dropped += n;
                    warn!(dropped = n, "slow bus subscriber dropped events");
                }
                Err(_) => return None,
            }
        }
    }

    /// Total messages this subscriber has missed.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

//! Audit and security event stream
//!
//! Append-only JSON-lines security log with explicit init/flush/teardown,
//! size-based rotation, and an alert side channel for high-risk events.
//! This sink is deliberately separate from `tracing`: tracing output is
//! operator diagnostics, the audit log is the tamper-evident record.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{error, warn};
use uuid::Uuid;

/// Rotate the active log once it exceeds this size.
const MAX_LOG_BYTES: u64 = 100 * 1024 * 1024;
/// Risk score at or above which events are mirrored to the alert channel.
const ALERT_RISK_THRESHOLD: u8 = 80;
const ALERT_CHANNEL_CAPACITY: usize = 256;

/// Cisco-style severity, 0 (emergency) through 7 (debug).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Emergency,
    Alert,
    Critical,
    Error,
    Warning,
    Notice,
    Informational,
    Debug,
}

impl Severity {
    /// Numeric code per RFC 5424 / Cisco convention.
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Security event category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    Authentication,
    Authorization,
    Network,
    InputValidation,
    RateLimiting,
    Recovery,
}

/// Append-only security event record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityEvent {
    /// Wall-clock timestamp.
    pub timestamp: DateTime<Utc>,
    /// Milliseconds since process start; survives wall-clock steps.
    pub monotonic_ms: u64,
    pub severity: Severity,
    pub category: EventCategory,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Dotted event name, e.g. `network.rfc1918_violation`.
    pub event: String,
    pub details: serde_json::Value,
    /// Risk score 0..=100.
    pub risk: u8,
}

impl SecurityEvent {
    pub fn new(
        severity: Severity,
        category: EventCategory,
        event: impl Into<String>,
        risk: u8,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            monotonic_ms: 0,
            severity,
            category,
            agent_id: None,
            source: None,
            event: event.into(),
            details: serde_json::Value::Null,
            risk: risk.min(100),
        }
    }

    pub fn with_agent(mut self, agent_id: Uuid) -> Self {
        self.agent_id = Some(agent_id);
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

struct AuditInner {
    file: File,
    written: u64,
}

/// Append-only audit log sink.
///
/// Writes are serialized behind a mutex; the critical section is one line
/// append. Rotation renames the active file with a timestamp suffix and
/// starts a fresh one.
pub struct AuditLog {
    path: PathBuf,
    inner: Mutex<AuditInner>,
    alert_tx: broadcast::Sender<SecurityEvent>,
    epoch: Instant,
}

impl AuditLog {
    /// Open (or create) `audit.log` under the given log directory.
    pub fn open(log_dir: &Path) -> anyhow::Result<Self> {
        fs::create_dir_all(log_dir)?;
        let path = log_dir.join("audit.log");
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata().map(|m| m.len()).unwrap_or(0);
        let (alert_tx, _) = broadcast::channel(ALERT_CHANNEL_CAPACITY);
        Ok(Self {
            path,
            inner: Mutex::new(AuditInner { file, written }),
            alert_tx,
            epoch: Instant::now(),
        })
    }

    /// Append one event. Never panics; failures are logged and dropped.
    pub fn append(&self, mut event: SecurityEvent) {
        event.monotonic_ms = self.epoch.elapsed().as_millis() as u64;

        if event.risk >= ALERT_RISK_THRESHOLD {
            // No receivers is fine; the log line below is the durable record.
            let _ = self.alert_tx.send(event.clone());
        }

        let line = match serde_json::to_string(&event) {
            Ok(l) => l,
            Err(e) => {
                error!("failed to serialize audit event: {}", e);
                return;
            }
        };

        let mut inner = match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if inner.written > MAX_LOG_BYTES {
            if let Err(e) = self.rotate_locked(&mut inner) {
                warn!("audit log rotation failed: {}", e);
            }
        }
        if let Err(e) = writeln!(inner.file, "{}", line) {
            error!("failed to append audit event: {}", e);
            return;
        }
        inner.written += line.len() as u64 + 1;
    }

    /// Subscribe to the alert side channel (risk >= 80).
    pub fn subscribe_alerts(&self) -> broadcast::Receiver<SecurityEvent> {
        self.alert_tx.subscribe()
    }

    /// Flush buffered writes to disk. Called on shutdown.
    pub fn flush(&self) {
        let mut inner = match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = inner.file.flush() {
            warn!("audit log flush failed: {}", e);
        }
    }

    /// Force a rotation regardless of size (used by the log-rotation repair).
    pub fn rotate(&self) -> anyhow::Result<()> {
        let mut inner = match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        self.rotate_locked(&mut inner)
    }

    fn rotate_locked(&self, inner: &mut AuditInner) -> anyhow::Result<()> {
        inner.file.flush()?;
        let stamp = Utc::now().format("%Y%m%dT%H%M%S");
        let archived = self.path.with_file_name(format!("audit-{}.log", stamp));
        fs::rename(&self.path, &archived)?;
        inner.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        inner.written = 0;
        Ok(())
    }

    /// Path of the active log file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

//! Serial port controller
//!
//! One controller exclusively owns one physical link. All external access
//! routes through it: the read pump publishes chunks on a broadcast
//! channel, writes are FIFO-serialized, and status transitions are
//! serialized behind a single transition lock so at most one state-changing
//! operation is in flight per port.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::audit::{AuditLog, EventCategory, SecurityEvent, Severity};
use crate::error::PortError;
use crate::governor::bus::{BusEvent, EventBus};
use crate::governor::patterns::SharedPatterns;
use crate::serial::buffer::{Chunker, ChunkStats, ModeHandle};
use crate::serial::link::{LinkOpener, SerialLink};
use crate::serial::rs485::{self, EnablePin, PinProvider, MAX_COLLISION_ATTEMPTS};
use crate::serial::types::{
    BufferMode, LineSettings, PartialSettings, PortMetrics, PortStatus, PortSummary, PortType,
    ReadEvent, Rs485Profile,
};

/// Read pump poll granularity.
const PUMP_READ_TIMEOUT: Duration = Duration::from_millis(10);
/// Chunk fan-out capacity per subscriber.
const CHUNK_CHANNEL_CAPACITY: usize = 256;
/// Wire activity within this window counts as a busy multidrop bus.
const WIRE_ACTIVE_WINDOW_MS: i64 = 5;
/// Default write deadline; callers may pass a tighter one.
pub const DEFAULT_WRITE_DEADLINE: Duration = Duration::from_secs(30);

/// Immutable description of a configured port.
#[derive(Debug, Clone)]
pub struct PortSpec {
    pub id: String,
    pub path: String,
    pub port_type: PortType,
    pub settings: LineSettings,
    pub rs485: Option<Rs485Profile>,
    pub buffer_capacity: usize,
    pub line_timeout: Duration,
    /// Platform baud ceiling.
    pub max_baud: u32,
}

impl PortSpec {
    /// Enforce the rs485-profile-iff-rs485-type invariant.
    pub fn validate(&self) -> Result<(), PortError> {
        self.settings.validate(self.max_baud)?;
        match (self.port_type, &self.rs485) {
            (PortType::Rs485, None) => Err(PortError::InvalidSettings(
                "rs485 port requires an rs485 profile".into(),
            )),
            (t, Some(_)) if t != PortType::Rs485 => Err(PortError::InvalidSettings(format!(
                "rs485 profile not valid for {:?} port",
                t
            ))),
            _ => Ok(()),
        }
    }
}

/// External collaborators injected into a controller.
#[derive(Clone)]
pub struct PortDeps {
    pub opener: Arc<dyn LinkOpener>,
    pub pins: Arc<dyn PinProvider>,
    pub bus: EventBus,
    pub audit: Arc<AuditLog>,
    pub patterns: SharedPatterns,
}

/// Lock-free rolling counters shared with the pump thread.
#[derive(Default)]
struct Counters {
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    errors: AtomicU64,
    /// Unix millis of the last byte in either direction.
    last_activity_ms: AtomicI64,
}

struct Shared {
    status: PortStatus,
    settings: LineSettings,
    last_error: Option<String>,
    opened_at: Option<Instant>,
    opened_wallclock: Option<chrono::DateTime<Utc>>,
}

/// Fault raised by the pump thread.
enum PumpFault {
    Io(std::io::Error),
}

pub struct SerialPortController {
    spec: PortSpec,
    shared: RwLock<Shared>,
    /// Serializes every state-changing operation.
    transition: Mutex<()>,
    /// FIFO order for writes.
    write_serial: Mutex<()>,
    counters: Arc<Counters>,
    link: Arc<StdMutex<Option<Box<dyn SerialLink>>>>,
    pin: Arc<StdMutex<Option<Box<dyn EnablePin>>>>,
    chunk_tx: broadcast::Sender<ReadEvent>,
    mode: ModeHandle,
    stats: Arc<StdMutex<ChunkStats>>,
    /// Bumped to retire the current pump thread.
    pump_gen: Arc<AtomicU64>,
    fault_tx: mpsc::UnboundedSender<PumpFault>,
    deps: PortDeps,
    /// Instants of recent successful recoveries, for escalation.
    recovery_history: StdMutex<Vec<Instant>>,
}

impl SerialPortController {
    /// Build a controller and start its fault listener.
    pub fn new(spec: PortSpec, deps: PortDeps) -> Result<Arc<Self>, PortError> {
        spec.validate()?;
        let (chunk_tx, _) = broadcast::channel(CHUNK_CHANNEL_CAPACITY);
        let (fault_tx, fault_rx) = mpsc::unbounded_channel();
        let initial_mode = match spec.port_type {
            PortType::Rs485 => BufferMode::Raw,
            _ => BufferMode::Stream,
        };
        let settings = spec.settings;
        let controller = Arc::new(Self {
            spec,
            shared: RwLock::new(Shared {
                status: PortStatus::Closed,
                settings,
                last_error: None,
                opened_at: None,
                opened_wallclock: None,
            }),
            transition: Mutex::new(()),
            write_serial: Mutex::new(()),
            counters: Arc::new(Counters::default()),
            link: Arc::new(StdMutex::new(None)),
            pin: Arc::new(StdMutex::new(None)),
            chunk_tx,
            mode: ModeHandle::new(initial_mode),
            stats: Arc::new(StdMutex::new(ChunkStats::default())),
            pump_gen: Arc::new(AtomicU64::new(0)),
            fault_tx,
            deps,
            recovery_history: StdMutex::new(Vec::new()),
        });
        Self::spawn_fault_listener(Arc::downgrade(&controller), fault_rx);
        Ok(controller)
    }

    pub fn id(&self) -> &str {
        &self.spec.id
    }

    pub fn path(&self) -> &str {
        &self.spec.path
    }

    pub fn port_type(&self) -> PortType {
        self.spec.port_type
    }

    /// Shared stats window for the buffer-mode governor.
    pub fn chunk_stats(&self) -> Arc<StdMutex<ChunkStats>> {
        Arc::clone(&self.stats)
    }

    /// Shared mode handle for the buffer-mode governor.
    pub fn mode_handle(&self) -> ModeHandle {
        self.mode.clone()
    }

    pub async fn status(&self) -> PortStatus {
        self.shared.read().await.status
    }

    pub async fn settings(&self) -> LineSettings {
        self.shared.read().await.settings
    }

    pub fn buffer_mode(&self) -> BufferMode {
        self.mode.get()
    }

    /// Open the device and start pumping.
    pub async fn open(&self) -> Result<(), PortError> {
        let _t = self.transition.lock().await;
        let status = self.shared.read().await.status;
        if !status.can_transition(PortStatus::Opening) {
            return Err(PortError::WrongState(status_name(status)));
        }
        self.set_status(PortStatus::Opening).await;

        let settings = self.shared.read().await.settings;
        let opener = Arc::clone(&self.deps.opener);
        let path = self.spec.path.clone();
        let opened = tokio::task::spawn_blocking(move || {
            opener.open(&path, &settings, PUMP_READ_TIMEOUT)
        })
        .await
        .map_err(|e| PortError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;

        let link = match opened {
            Ok(link) => link,
            Err(e) => {
                self.shared.write().await.last_error = Some(e.to_string());
                self.set_status(PortStatus::Closed).await;
                return Err(e);
            }
        };

        if let Some(profile) = &self.spec.rs485 {
            match self.deps.pins.acquire(profile.enable_pin) {
                Ok(pin) => *lock(&self.pin) = Some(pin),
                Err(e) => {
                    self.set_status(PortStatus::Closed).await;
                    return Err(PortError::InvalidSettings(format!(
                        "rs485 enable pin {} unavailable: {}",
                        profile.enable_pin, e
                    )));
                }
            }
        }

        *lock(&self.link) = Some(link);
        {
            let mut shared = self.shared.write().await;
            shared.opened_at = Some(Instant::now());
            shared.opened_wallclock = Some(Utc::now());
            shared.last_error = None;
        }
        self.spawn_pump();
        self.set_status(PortStatus::Operational).await;

        // Remember working settings for recovery.
        self.deps.patterns.set_fact(
            &format!("{}.last_good_settings", self.spec.id),
            serde_json::to_value(settings).unwrap_or(serde_json::Value::Null),
        );
        info!(port = %self.spec.id, path = %self.spec.path, "port opened");
        Ok(())
    }

    /// Drain output and release the device.
    pub async fn close(&self) -> Result<(), PortError> {
        let _t = self.transition.lock().await;
        let status = self.shared.read().await.status;
        if status == PortStatus::Closed {
            return Err(PortError::AlreadyClosed);
        }
        self.shutdown_link().await;
        self.set_status(PortStatus::Closed).await;
        info!(port = %self.spec.id, "port closed");
        Ok(())
    }

    /// Append bytes to the output. For rs485 ports the write runs as a
    /// half-duplex turnaround transaction with multidrop collision
    /// avoidance. Returns the number of bytes accepted.
    pub async fn write(&self, bytes: &[u8], deadline: Duration) -> Result<usize, PortError> {
        let _w = self.write_serial.lock().await;
        let status = self.shared.read().await.status;
        if !status.is_active() {
            return Err(PortError::WrongState(status_name(status)));
        }
        let result = tokio::time::timeout(deadline, self.write_inner(bytes)).await;
        match result {
            Ok(inner) => inner,
            Err(_) => {
                // Deadline expired: flush what was partially queued.
                let link = Arc::clone(&self.link);
                let _ = tokio::task::spawn_blocking(move || {
                    if let Some(link) = lock(&link).as_mut() {
                        let _ = link.drain();
                    }
                })
                .await;
                Err(PortError::Timeout(deadline))
            }
        }
    }

    async fn write_inner(&self, bytes: &[u8]) -> Result<usize, PortError> {
        if let Some(profile) = self.spec.rs485 {
            self.write_rs485(bytes, &profile).await
        } else {
            let link = Arc::clone(&self.link);
            let data = bytes.to_vec();
            tokio::task::spawn_blocking(move || {
                let mut guard = lock(&link);
                let link = guard.as_mut().ok_or(PortError::AlreadyClosed)?;
                link.write_all(&data)?;
                Ok::<(), PortError>(())
            })
            .await
            .map_err(|e| PortError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))??;
            self.note_written(bytes.len());
            Ok(bytes.len())
        }
    }

    async fn write_rs485(&self, bytes: &[u8], profile: &Rs485Profile) -> Result<usize, PortError> {
        let mut attempts = 0u32;
        loop {
            // Multidrop collision avoidance: back off while the wire is hot.
            if profile.multidrop_address != 0 && self.wire_recently_active() {
                attempts += 1;
                if attempts >= MAX_COLLISION_ATTEMPTS {
                    self.deps.audit.append(
                        SecurityEvent::new(
                            Severity::Warning,
                            EventCategory::Recovery,
                            "serial.bus_contention",
                            30,
                        )
                        .with_details(serde_json::json!({
                            "port": self.spec.id,
                            "attempts": attempts,
                        })),
                    );
                    return Err(PortError::BusContention {
                        port: self.spec.id.clone(),
                        attempts,
                    });
                }
                tokio::time::sleep(rs485::collision_backoff(profile)).await;
                continue;
            }

            let link = Arc::clone(&self.link);
            let pin = Arc::clone(&self.pin);
            let data = bytes.to_vec();
            let profile = *profile;
            tokio::task::spawn_blocking(move || {
                let mut link_guard = lock(&link);
                let link = link_guard.as_mut().ok_or(PortError::AlreadyClosed)?;
                let mut pin_guard = lock(&pin);
                let pin = pin_guard.as_mut().ok_or_else(|| {
                    PortError::InvalidSettings("rs485 enable pin not acquired".into())
                })?;
                rs485::transmit(link.as_mut(), pin.as_mut(), &profile, &data)?;
                Ok::<(), PortError>(())
            })
            .await
            .map_err(|e| PortError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))??;

            self.note_written(bytes.len());
            return Ok(bytes.len());
        }
    }

    /// Subscribe to the chunk stream from this point forward. The sequence
    /// is finite: a `Closed` marker follows the final chunk of a session.
    pub fn subscribe(&self) -> broadcast::Receiver<ReadEvent> {
        self.chunk_tx.subscribe()
    }

    /// Atomically apply a partial settings update.
    pub async fn configure(&self, partial: &PartialSettings) -> Result<(), PortError> {
        let _t = self.transition.lock().await;
        let current = self.shared.read().await.settings;
        let merged = current.merged(partial, self.spec.max_baud)?;

        let has_link = lock(&self.link).is_some();
        if has_link {
            let link = Arc::clone(&self.link);
            tokio::task::spawn_blocking(move || {
                let mut guard = lock(&link);
                match guard.as_mut() {
                    Some(link) => link.reconfigure(&merged),
                    None => Ok(()),
                }
            })
            .await
            .map_err(|e| PortError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
            .map_err(|e| PortError::InvalidSettings(e.to_string()))?;
        }

        self.shared.write().await.settings = merged;
        self.deps.patterns.set_fact(
            &format!("{}.last_good_settings", self.spec.id),
            serde_json::to_value(merged).unwrap_or(serde_json::Value::Null),
        );
        debug!(port = %self.spec.id, "settings reconfigured");
        Ok(())
    }

    /// Rolling metrics snapshot.
    pub async fn metrics(&self) -> PortMetrics {
        let shared = self.shared.read().await;
        let last_ms = self.counters.last_activity_ms.load(Ordering::Relaxed);
        PortMetrics {
            bytes_in: self.counters.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.counters.bytes_out.load(Ordering::Relaxed),
            error_count: self.counters.errors.load(Ordering::Relaxed),
            last_activity: (last_ms > 0)
                .then(|| chrono::DateTime::from_timestamp_millis(last_ms))
                .flatten(),
            opened_at: shared.opened_wallclock,
            uptime_secs: shared
                .opened_at
                .map(|t| t.elapsed().as_secs())
                .unwrap_or(0),
        }
    }

    pub async fn summary(&self) -> PortSummary {
        PortSummary {
            id: self.spec.id.clone(),
            path: self.spec.path.clone(),
            port_type: self.spec.port_type,
            status: self.status().await,
            buffer_mode: self.mode.get(),
            metrics: self.metrics().await,
        }
    }

    /// Administrative: park the port.
    pub async fn enter_standby(&self) -> Result<(), PortError> {
        let _t = self.transition.lock().await;
        let status = self.shared.read().await.status;
        if !status.can_transition(PortStatus::Standby) {
            return Err(PortError::WrongState(status_name(status)));
        }
        self.shutdown_link().await;
        self.set_status(PortStatus::Standby).await;
        Ok(())
    }

    /// Administrative: take the port down for manual intervention.
    pub async fn enter_maintenance(&self) -> Result<(), PortError> {
        let _t = self.transition.lock().await;
        let status = self.shared.read().await.status;
        if !status.can_transition(PortStatus::Maintenance) {
            return Err(PortError::WrongState(status_name(status)));
        }
        self.shutdown_link().await;
        self.set_status(PortStatus::Maintenance).await;
        Ok(())
    }

    /// The audit sink this controller reports into.
    pub fn audit(&self) -> Arc<AuditLog> {
        Arc::clone(&self.deps.audit)
    }

    /// The bus this controller publishes on.
    pub fn bus(&self) -> EventBus {
        self.deps.bus.clone()
    }

    /// Record instants of successful recoveries; the recovery governor
    /// escalates when they cluster.
    pub fn note_recovery(&self) {
        lock_ref(&self.recovery_history).push(Instant::now());
    }

    /// Persist which recovery step worked, as a learned pattern.
    pub(crate) fn record_recovery_pattern(&self, step: &str) {
        self.deps
            .patterns
            .observe(&format!("{}.recovery", self.spec.id), 1.0);
        self.deps.patterns.set_fact(
            &format!("{}.last_recovery_step", self.spec.id),
            serde_json::Value::String(step.to_string()),
        );
    }

    /// Successful recoveries within the trailing window.
    pub fn recoveries_within(&self, window: Duration) -> usize {
        let now = Instant::now();
        let mut history = lock_ref(&self.recovery_history);
        history.retain(|t| now.duration_since(*t) <= window);
        history.len()
    }

    /// Flag a degraded-but-working condition.
    pub async fn raise_warning(&self, reason: &str) {
        let _t = self.transition.lock().await;
        let status = self.shared.read().await.status;
        if status == PortStatus::Operational {
            self.shared.write().await.last_error = Some(reason.to_string());
            self.set_status(PortStatus::Warning).await;
        }
    }

    /// Clear a warning once traffic looks healthy again.
    pub async fn clear_warning(&self) {
        let _t = self.transition.lock().await;
        if self.shared.read().await.status == PortStatus::Warning {
            self.set_status(PortStatus::Operational).await;
        }
    }

    /// Drop into `Error` from an active state; recovery picks it up.
    pub(crate) async fn mark_error(&self, reason: &str) {
        let _t = self.transition.lock().await;
        let status = self.shared.read().await.status;
        if status.can_transition(PortStatus::Error) {
            self.shared.write().await.last_error = Some(reason.to_string());
            self.counters.errors.fetch_add(1, Ordering::Relaxed);
            self.set_status(PortStatus::Error).await;
        }
    }

    /// Used by the recovery ladder; requires the transition lock NOT held.
    pub(crate) async fn force_close_for_recovery(&self) {
        let _t = self.transition.lock().await;
        self.shutdown_link().await;
        self.set_status(PortStatus::Closed).await;
    }

    /// Flush OS buffers in place (recovery step a).
    pub(crate) async fn flush_buffers(&self) -> Result<(), PortError> {
        let link = Arc::clone(&self.link);
        tokio::task::spawn_blocking(move || {
            let mut guard = lock(&link);
            let link = guard.as_mut().ok_or(PortError::AlreadyClosed)?;
            link.clear().map_err(PortError::Io)
        })
        .await
        .map_err(|e| PortError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
    }

    /// In-place return to operational after a successful buffer flush.
    pub(crate) async fn resume_after_flush(&self) -> Result<(), PortError> {
        let _t = self.transition.lock().await;
        let status = self.shared.read().await.status;
        if status != PortStatus::Error {
            return Err(PortError::WrongState(status_name(status)));
        }
        if lock(&self.link).is_none() {
            return Err(PortError::AlreadyClosed);
        }
        self.set_status(PortStatus::Operational).await;
        Ok(())
    }

    /// Last-known-good settings learned from previous successful opens.
    pub(crate) fn last_good_settings(&self) -> Option<LineSettings> {
        self.deps
            .patterns
            .fact(&format!("{}.last_good_settings", self.spec.id))
            .and_then(|v| serde_json::from_value(v).ok())
    }

    /// Replace settings wholesale (recovery step c).
    pub(crate) async fn restore_settings(&self, settings: LineSettings) {
        self.shared.write().await.settings = settings;
    }

    // ---- internals ----

    fn note_written(&self, n: usize) {
        self.counters.bytes_out.fetch_add(n as u64, Ordering::Relaxed);
        self.counters
            .last_activity_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    fn wire_recently_active(&self) -> bool {
        let last = self.counters.last_activity_ms.load(Ordering::Relaxed);
        last > 0 && Utc::now().timestamp_millis() - last <= WIRE_ACTIVE_WINDOW_MS
    }

    /// Stop the pump and release the device. Caller holds the transition
    /// lock.
    async fn shutdown_link(&self) {
        self.pump_gen.fetch_add(1, Ordering::SeqCst);
        let link = Arc::clone(&self.link);
        let _ = tokio::task::spawn_blocking(move || {
            let mut guard = lock(&link);
            if let Some(link) = guard.as_mut() {
                let _ = link.drain();
            }
            *guard = None;
        })
        .await;
        *lock(&self.pin) = None;
        let _ = self.chunk_tx.send(ReadEvent::Closed);
    }

    /// Status write + bus notification. Caller holds the transition lock.
    async fn set_status(&self, next: PortStatus) {
        {
            let mut shared = self.shared.write().await;
            debug_assert!(shared.status == next || shared.status.can_transition(next));
            shared.status = next;
            if next == PortStatus::Closed {
                shared.opened_at = None;
            }
        }
        self.deps.bus.publish(BusEvent::PortStatusChanged {
            port_id: self.spec.id.clone(),
            status: next,
            timestamp: Utc::now(),
        });
    }

    fn spawn_pump(&self) {
        let gen = self.pump_gen.fetch_add(1, Ordering::SeqCst) + 1;
        let pump_gen = Arc::clone(&self.pump_gen);
        let link = Arc::clone(&self.link);
        let counters = Arc::clone(&self.counters);
        let chunk_tx = self.chunk_tx.clone();
        let mode = self.mode.clone();
        let stats = Arc::clone(&self.stats);
        let fault_tx = self.fault_tx.clone();
        let mut chunker = Chunker::new(
            self.mode.get(),
            self.spec.buffer_capacity,
            self.spec.line_timeout,
        );
        let port_id = self.spec.id.clone();

        tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; 4096];
            debug!(port = %port_id, "read pump started");
            loop {
                if pump_gen.load(Ordering::SeqCst) != gen {
                    break;
                }
                // Track governor-driven mode switches.
                if let Some(flushed) = chunker.set_mode(mode.get()) {
                    emit(&chunk_tx, flushed);
                }
                let read = {
                    let mut guard = lock(&link);
                    match guard.as_mut() {
                        Some(l) => l.read_chunk(&mut buf),
                        None => break,
                    }
                };
                let now = Instant::now();
                match read {
                    Ok(0) => {
                        if let Some(flushed) = chunker.poll(now) {
                            emit(&chunk_tx, flushed);
                        }
                    }
                    Ok(n) => {
                        counters.bytes_in.fetch_add(n as u64, Ordering::Relaxed);
                        counters
                            .last_activity_ms
                            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
                        // Mode selection watches the raw OS reads, before
                        // any chunker reshapes them.
                        lock_ref(&stats).observe(now, n, buf[n - 1] == 0x0A);
                        for chunk in chunker.push(&buf[..n], now) {
                            emit(&chunk_tx, chunk);
                        }
                        if let Some(flushed) = chunker.poll(now) {
                            emit(&chunk_tx, flushed);
                        }
                    }
                    Err(e) => {
                        counters.errors.fetch_add(1, Ordering::Relaxed);
                        warn!(port = %port_id, "read pump fault: {}", e);
                        let _ = fault_tx.send(PumpFault::Io(e));
                        break;
                    }
                }
            }
            if let Some(tail) = chunker.take_pending() {
                emit(&chunk_tx, tail);
            }
            debug!(port = %port_id, "read pump exited");
        });
    }

    fn spawn_fault_listener(
        weak: Weak<SerialPortController>,
        mut fault_rx: mpsc::UnboundedReceiver<PumpFault>,
    ) {
        tokio::spawn(async move {
            while let Some(PumpFault::Io(e)) = fault_rx.recv().await {
                let Some(controller) = weak.upgrade() else {
                    break;
                };
                controller.mark_error(&e.to_string()).await;
                crate::serial::recovery::run_ladder(&controller).await;
            }
        });
    }
}

fn emit(chunk_tx: &broadcast::Sender<ReadEvent>, chunk: Vec<u8>) {
    // No subscribers is fine; the send only fans out.
    let _ = chunk_tx.send(ReadEvent::Data(chunk));
}

fn status_name(status: PortStatus) -> &'static str {
    match status {
        PortStatus::Closed => "closed",
        PortStatus::Opening => "opening",
        PortStatus::Operational => "operational",
        PortStatus::Warning => "warning",
        PortStatus::Error => "error",
        PortStatus::Standby => "standby",
        PortStatus::Maintenance => "maintenance",
    }
}

fn lock<T>(m: &Arc<StdMutex<T>>) -> std::sync::MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn lock_ref<T>(m: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
pub mod testing {
    //! In-memory link and opener for hardware-free tests.

    use super::*;
    use std::collections::VecDeque;
    use std::io;

    /// Script shared between a test and its mock links.
    #[derive(Clone, Default)]
    pub struct LinkScript {
        pub incoming: Arc<StdMutex<VecDeque<Vec<u8>>>>,
        pub written: Arc<StdMutex<Vec<u8>>>,
        /// When set, the next read fails with this error kind.
        pub fail_reads: Arc<std::sync::atomic::AtomicBool>,
        /// When set, clearing OS buffers fails.
        pub fail_clear: Arc<std::sync::atomic::AtomicBool>,
        /// When set, opening fails with PortBusy.
        pub busy: Arc<std::sync::atomic::AtomicBool>,
        pub open_count: Arc<AtomicU64>,
    }

    impl LinkScript {
        pub fn feed(&self, data: &[u8]) {
            lock_ref(&self.incoming).push_back(data.to_vec());
        }

        pub fn written(&self) -> Vec<u8> {
            lock_ref(&self.written).clone()
        }
    }

    pub struct MockLink {
        script: LinkScript,
    }

    impl SerialLink for MockLink {
        fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.script.fail_reads.load(Ordering::SeqCst) {
                return Err(io::Error::new(io::ErrorKind::Other, "injected fault"));
            }
            match lock_ref(&self.script.incoming).pop_front() {
                Some(data) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    Ok(n)
                }
                None => {
                    std::thread::sleep(Duration::from_millis(1));
                    Ok(0)
                }
            }
        }

        fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
            lock_ref(&self.script.written).extend_from_slice(data);
            Ok(())
        }

        fn drain(&mut self) -> io::Result<()> {
            Ok(())
        }

        fn clear(&mut self) -> io::Result<()> {
            if self.script.fail_clear.load(Ordering::SeqCst) {
                return Err(io::Error::new(io::ErrorKind::Other, "clear refused"));
            }
            Ok(())
        }

        fn reconfigure(&mut self, _settings: &LineSettings) -> io::Result<()> {
            Ok(())
        }
    }

    pub struct MockOpener {
        pub script: LinkScript,
    }

    impl LinkOpener for MockOpener {
        fn open(
            &self,
            path: &str,
            _settings: &LineSettings,
            _read_timeout: Duration,
        ) -> Result<Box<dyn SerialLink>, PortError> {
            self.script.open_count.fetch_add(1, Ordering::SeqCst);
            if self.script.busy.load(Ordering::SeqCst) {
                return Err(PortError::PortBusy(path.to_string()));
            }
            Ok(Box::new(MockLink {
                script: self.script.clone(),
            }))
        }
    }

    pub struct MockPinProvider {
        pub trace: crate::serial::rs485::testing::PinTrace,
    }

    impl PinProvider for MockPinProvider {
        fn acquire(&self, _pin: u32) -> io::Result<Box<dyn EnablePin>> {
            Ok(Box::new(crate::serial::rs485::testing::MockPin {
                trace: self.trace.clone(),
            }))
        }
    }

    /// Standard test fixture: controller + script + deps.
    pub fn fixture(port_type: PortType, rs485: Option<Rs485Profile>) -> TestRig {
        let script = LinkScript::default();
        let trace = crate::serial::rs485::testing::PinTrace::default();
        let dir = tempfile::tempdir().unwrap();
        let deps = PortDeps {
            opener: Arc::new(MockOpener {
                script: script.clone(),
            }),
            pins: Arc::new(MockPinProvider {
                trace: trace.clone(),
            }),
            bus: EventBus::new(),
            audit: Arc::new(AuditLog::open(dir.path()).unwrap()),
            patterns: SharedPatterns::in_memory(),
        };
        let spec = PortSpec {
            id: "test-port".into(),
            path: "/dev/ttyUSB0".into(),
            port_type,
            settings: LineSettings::default(),
            rs485,
            buffer_capacity: 4096,
            line_timeout: Duration::from_millis(50),
            max_baud: 3_000_000,
        };
        let controller = SerialPortController::new(spec, deps).unwrap();
        TestRig {
            controller,
            script,
            trace,
            _dir: dir,
        }
    }

    pub struct TestRig {
        pub controller: Arc<SerialPortController>,
        pub script: LinkScript,
        pub trace: crate::serial::rs485::testing::PinTrace,
        _dir: tempfile::TempDir,
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{self, fixture};
    use super::*;

    #[tokio::test]
    async fn test_open_write_close_lifecycle() {
        let rig = fixture(PortType::Rs232, None);
        let c = &rig.controller;

        assert_eq!(c.status().await, PortStatus::Closed);
        c.open().await.unwrap();
        assert_eq!(c.status().await, PortStatus::Operational);

        let n = c.write(b"hello", DEFAULT_WRITE_DEADLINE).await.unwrap();
        assert_eq!(n, 5);
        assert_eq!(rig.script.written(), b"hello".to_vec());

        c.close().await.unwrap();
        assert_eq!(c.status().await, PortStatus::Closed);
        assert!(matches!(c.close().await, Err(PortError::AlreadyClosed)));
    }

    #[tokio::test]
    async fn test_open_busy_device() {
        let rig = fixture(PortType::Rs232, None);
        rig.script.busy.store(true, Ordering::SeqCst);
        assert!(matches!(
            rig.controller.open().await,
            Err(PortError::PortBusy(_))
        ));
        // Failure rolls back to closed.
        assert_eq!(rig.controller.status().await, PortStatus::Closed);
    }

    #[tokio::test]
    async fn test_read_stream_delivers_chunks() {
        let rig = fixture(PortType::Rs232, None);
        let c = &rig.controller;
        c.open().await.unwrap();
        let mut rx = c.subscribe();

        rig.script.feed(b"abc");
        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            ReadEvent::Data(data) => assert_eq!(data, b"abc".to_vec()),
            ReadEvent::Closed => panic!("unexpected close"),
        }

        c.close().await.unwrap();
        // The finite sequence terminates with a Closed marker.
        loop {
            match tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
            {
                Ok(ReadEvent::Closed) => break,
                Ok(ReadEvent::Data(_)) => continue,
                Err(e) => panic!("stream ended without close marker: {}", e),
            }
        }
    }

    #[tokio::test]
    async fn test_write_requires_active_status() {
        let rig = fixture(PortType::Rs232, None);
        let err = rig
            .controller
            .write(b"x", DEFAULT_WRITE_DEADLINE)
            .await
            .unwrap_err();
        assert!(matches!(err, PortError::WrongState("closed")));
    }

    #[tokio::test]
    async fn test_configure_atomic() {
        let rig = fixture(PortType::Rs232, None);
        let c = &rig.controller;
        c.open().await.unwrap();

        let bad = PartialSettings {
            baud_rate: Some(19_200),
            data_bits: Some(12),
            ..Default::default()
        };
        assert!(c.configure(&bad).await.is_err());
        // Nothing applied.
        assert_eq!(c.settings().await.baud_rate, 9600);

        let good = PartialSettings {
            baud_rate: Some(19_200),
            ..Default::default()
        };
        c.configure(&good).await.unwrap();
        assert_eq!(c.settings().await.baud_rate, 19_200);
    }

    #[tokio::test]
    async fn test_rs485_write_runs_turnaround() {
        let profile = Rs485Profile {
            enable_pin: 17,
            turnaround_delay_us: 1000,
            termination_enabled: false,
            multidrop_address: 0,
        };
        let rig = fixture(PortType::Rs485, Some(profile));
        let c = &rig.controller;
        c.open().await.unwrap();

        let frame = [0x01, 0x03, 0x00, 0x00, 0x00, 0x01];
        c.write(&frame, DEFAULT_WRITE_DEADLINE).await.unwrap();

        assert_eq!(rig.script.written(), frame.to_vec());
        assert_eq!(rig.trace.levels(), vec![true, false]);
        let held = rig.trace.last_high_duration().unwrap();
        assert!(held >= Duration::from_micros(1000), "DE held {:?}", held);
    }

    #[tokio::test]
    async fn test_rs485_profile_invariant() {
        let spec_err = fixture(PortType::Rs232, None); // baseline rig is fine
        drop(spec_err);

        // rs485 without profile is rejected at construction.
        let script = testing::LinkScript::default();
        let dir = tempfile::tempdir().unwrap();
        let deps = PortDeps {
            opener: Arc::new(testing::MockOpener { script }),
            pins: Arc::new(testing::MockPinProvider {
                trace: Default::default(),
            }),
            bus: EventBus::new(),
            audit: Arc::new(AuditLog::open(dir.path()).unwrap()),
            patterns: SharedPatterns::in_memory(),
        };
        let spec = PortSpec {
            id: "bad".into(),
            path: "/dev/ttyUSB1".into(),
            port_type: PortType::Rs485,
            settings: LineSettings::default(),
            rs485: None,
            buffer_capacity: 4096,
            line_timeout: Duration::from_millis(50),
            max_baud: 3_000_000,
        };
        assert!(SerialPortController::new(spec, deps).is_err());
    }

    #[tokio::test]
    async fn test_multidrop_contention_surfaces() {
        let profile = Rs485Profile {
            enable_pin: 17,
            turnaround_delay_us: 10,
            termination_enabled: false,
            multidrop_address: 5,
        };
        let rig = fixture(PortType::Rs485, Some(profile));
        let c = &rig.controller;
        c.open().await.unwrap();

        // Keep the wire hot from another station.
        let script = rig.script.clone();
        let feeder = tokio::spawn(async move {
            for _ in 0..200 {
                script.feed(b"\x05noise");
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        });

        // Wait until the pump has actually observed traffic.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let result = c.write(b"\x05frame", Duration::from_secs(5)).await;
        feeder.abort();

        match result {
            Err(PortError::BusContention { attempts, .. }) => {
                assert_eq!(attempts, MAX_COLLISION_ATTEMPTS)
            }
            other => panic!("expected bus contention, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_status_machine_under_interleaving() {
        let rig = fixture(PortType::Rs232, None);
        let c = Arc::clone(&rig.controller);

        let mut tasks = Vec::new();
        for i in 0..4 {
            let c = Arc::clone(&c);
            tasks.push(tokio::spawn(async move {
                for _ in 0..10 {
                    match i % 4 {
                        0 => {
                            let _ = c.open().await;
                        }
                        1 => {
                            let _ = c.close().await;
                        }
                        2 => {
                            let _ = c.write(b"x", Duration::from_millis(100)).await;
                        }
                        _ => {
                            let _ = c
                                .configure(&PartialSettings {
                                    baud_rate: Some(19_200),
                                    ..Default::default()
                                })
                                .await;
                        }
                    }
                    tokio::task::yield_now().await;
                }
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }

        // Whatever the interleaving, the port ends in an enumerated state.
        let status = c.status().await;
        assert!(matches!(
            status,
            PortStatus::Closed | PortStatus::Opening | PortStatus::Operational
        ));
    }
}

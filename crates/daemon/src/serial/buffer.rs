//! Adaptive buffering
//!
//! Three chunking strategies (line / stream / raw) plus the Buffer-Mode
//! sub-governor that watches chunk shape over a rolling window and switches
//! strategy. The chunker itself runs inside the blocking read pump; the
//! governor observes through shared stats and steers through a mode handle.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tracing::info;

use crate::governor::bus::{BusEvent, Directive, EventBus};
use crate::governor::{
    Assessment, Governor, Observation, PatternStore, ResponseOutcome, VsmLevel,
};
use crate::serial::types::BufferMode;

const NEWLINE: u8 = 0x0A;
/// Rolling observation window for mode selection.
const STATS_WINDOW: Duration = Duration::from_secs(30);
/// Minimum chunks in the window before a switch is considered.
const MIN_SAMPLES: usize = 10;
/// Newline ratio above which line mode is preferred.
const LINE_RATIO: f64 = 0.8;
/// Interarrival below this with large chunks prefers raw mode.
const RAW_INTERARRIVAL_MS: f64 = 2.0;
const RAW_MIN_CHUNK: f64 = 1024.0;

/// Splits the incoming byte stream into upstream chunks per the active mode.
pub struct Chunker {
    mode: BufferMode,
    pending: Vec<u8>,
    ring_capacity: usize,
    line_timeout: Duration,
    stream_timeout: Duration,
    pending_since: Option<Instant>,
}

impl Chunker {
    pub fn new(mode: BufferMode, ring_capacity: usize, line_timeout: Duration) -> Self {
        Self {
            mode,
            pending: Vec::new(),
            ring_capacity: ring_capacity.max(64),
            line_timeout,
            stream_timeout: Duration::from_millis(10),
            pending_since: None,
        }
    }

    pub fn mode(&self) -> BufferMode {
        self.mode
    }

    /// Switch modes, flushing anything pending under the old mode.
    pub fn set_mode(&mut self, mode: BufferMode) -> Option<Vec<u8>> {
        if self.mode == mode {
            return None;
        }
        self.mode = mode;
        self.take_pending()
    }

    /// Feed bytes read from the OS; returns zero or more complete chunks.
    pub fn push(&mut self, data: &[u8], now: Instant) -> Vec<Vec<u8>> {
        match self.mode {
            BufferMode::Raw => {
                // Zero-copy passthrough; anything pending from a previous
                // mode goes first.
                let mut out = Vec::new();
                if let Some(pending) = self.take_pending() {
                    out.push(pending);
                }
                if !data.is_empty() {
                    out.push(data.to_vec());
                }
                out
            }
            BufferMode::Line => {
                let mut out = Vec::new();
                for &byte in data {
                    self.pending.push(byte);
                    if byte == NEWLINE {
                        out.push(std::mem::take(&mut self.pending));
                        self.pending_since = None;
                    }
                }
                if !self.pending.is_empty() && self.pending_since.is_none() {
                    self.pending_since = Some(now);
                }
                out
            }
            BufferMode::Stream => {
                self.pending.extend_from_slice(data);
                if self.pending_since.is_none() && !self.pending.is_empty() {
                    self.pending_since = Some(now);
                }
                let mut out = Vec::new();
                while self.pending.len() >= self.ring_capacity / 2 {
                    let rest = self.pending.split_off(self.ring_capacity / 2);
                    out.push(std::mem::replace(&mut self.pending, rest));
                }
                if self.pending.is_empty() {
                    self.pending_since = None;
                }
                out
            }
        }
    }

    /// Emit pending bytes whose mode timeout has elapsed.
    pub fn poll(&mut self, now: Instant) -> Option<Vec<u8>> {
        let timeout = match self.mode {
            BufferMode::Line => self.line_timeout,
            BufferMode::Stream => self.stream_timeout,
            BufferMode::Raw => return None,
        };
        match self.pending_since {
            Some(since) if now.duration_since(since) >= timeout => self.take_pending(),
            _ => None,
        }
    }

    /// Flush everything pending, e.g. on close.
    pub fn take_pending(&mut self) -> Option<Vec<u8>> {
        self.pending_since = None;
        if self.pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending))
        }
    }
}

/// Rolling window of emitted-chunk shapes.
#[derive(Default)]
pub struct ChunkStats {
    window: VecDeque<(Instant, usize, bool)>,
}

impl ChunkStats {
    pub fn observe(&mut self, now: Instant, len: usize, ends_newline: bool) {
        self.window.push_back((now, len, ends_newline));
        self.prune(now);
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&(t, _, _)) = self.window.front() {
            if now.duration_since(t) > STATS_WINDOW {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn count(&self) -> usize {
        self.window.len()
    }

    pub fn newline_ratio(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let newline = self.window.iter().filter(|(_, _, nl)| *nl).count();
        newline as f64 / self.window.len() as f64
    }

    pub fn mean_chunk_len(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let total: usize = self.window.iter().map(|(_, len, _)| len).sum();
        total as f64 / self.window.len() as f64
    }

    /// Mean gap between consecutive chunks, in milliseconds.
    pub fn mean_interarrival_ms(&self) -> f64 {
        if self.window.len() < 2 {
            return f64::INFINITY;
        }
        let first = self.window.front().unwrap().0;
        let last = self.window.back().unwrap().0;
        let span = last.duration_since(first).as_secs_f64() * 1000.0;
        span / (self.window.len() - 1) as f64
    }
}

/// Shared mode selector between the pump and the governor.
#[derive(Clone)]
pub struct ModeHandle {
    mode: Arc<AtomicU8>,
}

impl ModeHandle {
    pub fn new(mode: BufferMode) -> Self {
        Self {
            mode: Arc::new(AtomicU8::new(encode(mode))),
        }
    }

    pub fn get(&self) -> BufferMode {
        decode(self.mode.load(Ordering::Acquire))
    }

    pub fn set(&self, mode: BufferMode) {
        self.mode.store(encode(mode), Ordering::Release);
    }
}

fn encode(mode: BufferMode) -> u8 {
    match mode {
        BufferMode::Line => 0,
        BufferMode::Stream => 1,
        BufferMode::Raw => 2,
    }
}

fn decode(v: u8) -> BufferMode {
    match v {
        0 => BufferMode::Line,
        2 => BufferMode::Raw,
        _ => BufferMode::Stream,
    }
}

/// Pick a mode for the observed traffic shape. Ties keep the current mode.
pub fn recommend(
    count: usize,
    newline_ratio: f64,
    interarrival_ms: f64,
    mean_chunk_len: f64,
    current: BufferMode,
) -> BufferMode {
    if count < MIN_SAMPLES {
        return current;
    }
    if newline_ratio > LINE_RATIO {
        return BufferMode::Line;
    }
    if interarrival_ms < RAW_INTERARRIVAL_MS && mean_chunk_len >= RAW_MIN_CHUNK {
        return BufferMode::Raw;
    }
    BufferMode::Stream
}

/// System 1 sub-governor steering a port's buffer mode.
pub struct BufferModeGovernor {
    id: String,
    port_id: String,
    stats: Arc<Mutex<ChunkStats>>,
    mode: ModeHandle,
    bus: EventBus,
    recommended: BufferMode,
}

impl BufferModeGovernor {
    pub fn new(
        port_id: &str,
        stats: Arc<Mutex<ChunkStats>>,
        mode: ModeHandle,
        bus: EventBus,
    ) -> Self {
        let recommended = mode.get();
        Self {
            id: format!("{}.buffer-mode", port_id),
            port_id: port_id.to_string(),
            stats,
            mode,
            bus,
            recommended,
        }
    }

    fn pattern_key(&self) -> String {
        format!("{}.newline_ratio", self.port_id)
    }
}

#[async_trait]
impl Governor for BufferModeGovernor {
    fn id(&self) -> &str {
        &self.id
    }

    fn level(&self) -> VsmLevel {
        VsmLevel::Operational
    }

    async fn probe(&mut self) -> anyhow::Result<Observation> {
        let stats = self.stats.lock().unwrap_or_else(|p| p.into_inner());
        Ok(Observation::now()
            .with("count", stats.count() as f64)
            .with("newline_ratio", stats.newline_ratio())
            .with("interarrival_ms", stats.mean_interarrival_ms())
            .with("mean_chunk_len", stats.mean_chunk_len()))
    }

    fn sense(&mut self, observation: &Observation, _patterns: &PatternStore) -> Assessment {
        let current = self.mode.get();
        self.recommended = recommend(
            observation.reading("count").unwrap_or(0.0) as usize,
            observation.reading("newline_ratio").unwrap_or(0.0),
            observation.reading("interarrival_ms").unwrap_or(f64::INFINITY),
            observation.reading("mean_chunk_len").unwrap_or(0.0),
            current,
        );
        if self.recommended == current {
            Assessment::Nominal
        } else {
            Assessment::Drifting
        }
    }

    async fn respond(&mut self, assessment: Assessment) -> anyhow::Result<ResponseOutcome> {
        if assessment == Assessment::Nominal {
            return Ok(ResponseOutcome::none());
        }
        let from = self.mode.get();
        self.mode.set(self.recommended);
        info!(
            port = %self.port_id,
            ?from,
            to = ?self.recommended,
            "buffer mode switched"
        );
        self.bus.publish(BusEvent::Directive {
            target: self.port_id.clone(),
            directive: Directive::SwitchBufferMode {
                port_id: self.port_id.clone(),
                mode: self.recommended,
            },
            timestamp: Utc::now(),
        });
        Ok(ResponseOutcome::acted("switch-buffer-mode"))
    }

    fn learn(&mut self, observation: &Observation, patterns: &mut PatternStore) {
        if let Some(ratio) = observation.reading("newline_ratio") {
            patterns.observe(&self.pattern_key(), Utc::now().timestamp_millis(), ratio);
        }
    }

    async fn validate(&mut self, outcome: &ResponseOutcome) -> anyhow::Result<bool> {
        if !outcome.acted {
            return Ok(true);
        }
        Ok(self.mode.get() == self.recommended)
    }
}

//! Learned-pattern store and its crash-safe persistence
//!
//! Governors learn by appending weighted observations under string keys.
//! Learning is bounded: at most `max_per_key` samples per key, with
//! exponential decay applied to prior weights on every new observation.
//!
//! Persistence (`PatternDb`) is a single JSON snapshot plus an append-only
//! journal. Writes go to the journal; `checkpoint()` compacts the journal
//! into a fresh snapshot written atomically (temp file + rename). On open,
//! the snapshot is loaded and the journal replayed, so a crash between
//! journal append and checkpoint loses nothing.

use std::collections::{HashMap, VecDeque};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const DEFAULT_MAX_PER_KEY: usize = 64;
const DEFAULT_DECAY: f64 = 0.95;

/// One weighted observation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PatternSample {
    /// Unix timestamp in milliseconds.
    pub ts: i64,
    pub value: f64,
    pub weight: f64,
}

/// Bounded, decaying observation store plus an opaque fact bag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternStore {
    series: HashMap<String, VecDeque<PatternSample>>,
    /// Non-numeric learned state, e.g. last-known-good settings.
    facts: HashMap<String, serde_json::Value>,
    max_per_key: usize,
    decay: f64,
}

impl Default for PatternStore {
    fn default() -> Self {
        Self {
            series: HashMap::new(),
            facts: HashMap::new(),
            max_per_key: DEFAULT_MAX_PER_KEY,
            decay: DEFAULT_DECAY,
        }
    }
}

impl PatternStore {
    pub fn new(max_per_key: usize, decay: f64) -> Self {
        Self {
            max_per_key: max_per_key.max(1),
            decay: decay.clamp(0.0, 1.0),
            ..Self::default()
        }
    }

    /// Record one observation under `key`, decaying prior weights.
    pub fn observe(&mut self, key: &str, ts: i64, value: f64) {
        let samples = self.series.entry(key.to_string()).or_default();
        for s in samples.iter_mut() {
            s.weight *= self.decay;
        }
        samples.push_back(PatternSample {
            ts,
            value,
            weight: 1.0,
        });
        while samples.len() > self.max_per_key {
            samples.pop_front();
        }
    }

    /// Weighted mean of the observations under `key`.
    pub fn baseline(&self, key: &str) -> Option<f64> {
        let samples = self.series.get(key)?;
        let total_weight: f64 = samples.iter().map(|s| s.weight).sum();
        if total_weight <= f64::EPSILON {
            return None;
        }
        let weighted: f64 = samples.iter().map(|s| s.value * s.weight).sum();
        Some(weighted / total_weight)
    }

    /// Number of samples stored under `key`.
    pub fn sample_count(&self, key: &str) -> usize {
        self.series.get(key).map(|s| s.len()).unwrap_or(0)
    }

    /// Store an opaque learned fact.
    pub fn set_fact(&mut self, key: &str, value: serde_json::Value) {
        self.facts.insert(key.to_string(), value);
    }

    /// Fetch an opaque learned fact.
    pub fn fact(&self, key: &str) -> Option<&serde_json::Value> {
        self.facts.get(key)
    }

    /// Keys with at least one sample.
    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.series.keys()
    }
}

/// Journal operation; one JSON line per applied mutation.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum JournalOp {
    Observe { key: String, ts: i64, value: f64 },
    SetFact { key: String, value: serde_json::Value },
}

/// Single-file, crash-safe persistence for a [`PatternStore`].
pub struct PatternDb {
    snapshot_path: PathBuf,
    journal_path: PathBuf,
    journal: File,
    /// Journal entries since the last checkpoint.
    pending: usize,
}

/// Compact the journal after this many appended entries.
const CHECKPOINT_EVERY: usize = 256;

impl PatternDb {
    /// Open `patterns.db` (+ `patterns.db.journal`) under the data dir,
    /// replaying any journal left by a previous run.
    ///
    /// A zero-byte snapshot is treated as corrupt and rebuilt empty.
    pub fn open(data_dir: &Path) -> anyhow::Result<(Self, PatternStore)> {
        fs::create_dir_all(data_dir)?;
        let snapshot_path = data_dir.join("patterns.db");
        let journal_path = data_dir.join("patterns.db.journal");

        let mut store = match fs::read(&snapshot_path) {
            Ok(bytes) if bytes.is_empty() => {
                warn!("patterns.db is zero bytes; rebuilding");
                PatternStore::default()
            }
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!("patterns.db unreadable ({}); rebuilding", e);
                PatternStore::default()
            }),
            Err(_) => PatternStore::default(),
        };

        let mut replayed = 0usize;
        if let Ok(file) = File::open(&journal_path) {
            for line in BufReader::new(file).lines() {
                let line = match line {
                    Ok(l) if !l.trim().is_empty() => l,
                    _ => continue,
                };
                match serde_json::from_str::<JournalOp>(&line) {
                    Ok(JournalOp::Observe { key, ts, value }) => {
                        store.observe(&key, ts, value);
                        replayed += 1;
                    }
                    Ok(JournalOp::SetFact { key, value }) => {
                        store.set_fact(&key, value);
                        replayed += 1;
                    }
                    // A torn final line after a crash is expected; stop there.
                    Err(_) => break,
                }
            }
        }
        if replayed > 0 {
            debug!(replayed, "replayed pattern journal");
        }

        let journal = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&journal_path)?;
        let mut db = Self {
            snapshot_path,
            journal_path,
            journal,
            pending: replayed,
        };
        if replayed > 0 {
            db.checkpoint(&store)?;
        }
        Ok((db, store))
    }

    /// Journal one observation (already applied to the in-memory store).
    pub fn record_observe(
        &mut self,
        store: &PatternStore,
        key: &str,
        ts: i64,
        value: f64,
    ) -> anyhow::Result<()> {
        self.append(
            store,
            &JournalOp::Observe {
                key: key.to_string(),
                ts,
                value,
            },
        )
    }

    /// Journal one fact write (already applied to the in-memory store).
    pub fn record_fact(
        &mut self,
        store: &PatternStore,
        key: &str,
        value: serde_json::Value,
    ) -> anyhow::Result<()> {
        self.append(
            store,
            &JournalOp::SetFact {
                key: key.to_string(),
                value,
            },
        )
    }

    fn append(&mut self, store: &PatternStore, op: &JournalOp) -> anyhow::Result<()> {
        let line = serde_json::to_string(op)?;
        writeln!(self.journal, "{}", line)?;
        self.pending += 1;
        if self.pending >= CHECKPOINT_EVERY {
            self.checkpoint(store)?;
        }
        Ok(())
    }

    /// Write a fresh snapshot atomically and truncate the journal.
    pub fn checkpoint(&mut self, store: &PatternStore) -> anyhow::Result<()> {
        self.journal.flush()?;
        let tmp = self.snapshot_path.with_extension("db.tmp");
        fs::write(&tmp, serde_json::to_vec(store)?)?;
        fs::rename(&tmp, &self.snapshot_path)?;
        self.journal = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.journal_path)?;
        self.pending = 0;
        Ok(())
    }

    pub fn snapshot_path(&self) -> &Path {
        &self.snapshot_path
    }
}

/// Process-wide handle to the learned-pattern store.
///
/// Cheap to clone; all governors share one store, namespacing their keys
/// (`<governor-id>.<metric>`). Fact writes are journaled immediately;
/// bulk learning is captured by periodic checkpoints.
#[derive(Clone)]
pub struct SharedPatterns {
    inner: std::sync::Arc<std::sync::Mutex<PatternState>>,
}

struct PatternState {
    store: PatternStore,
    db: Option<PatternDb>,
}

impl SharedPatterns {
    /// Volatile store with no persistence; used by tests.
    pub fn in_memory() -> Self {
        Self {
            inner: std::sync::Arc::new(std::sync::Mutex::new(PatternState {
                store: PatternStore::default(),
                db: None,
            })),
        }
    }

    /// Open the persisted store under the data directory.
    pub fn open(data_dir: &Path) -> anyhow::Result<Self> {
        let (db, store) = PatternDb::open(data_dir)?;
        Ok(Self {
            inner: std::sync::Arc::new(std::sync::Mutex::new(PatternState {
                store,
                db: Some(db),
            })),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PatternState> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Record an observation, journaling it.
    pub fn observe(&self, key: &str, value: f64) {
        let ts = chrono::Utc::now().timestamp_millis();
        let mut state = self.lock();
        let PatternState { store, db } = &mut *state;
        store.observe(key, ts, value);
        if let Some(db) = db {
            if let Err(e) = db.record_observe(store, key, ts, value) {
                warn!("pattern journal append failed: {}", e);
            }
        }
    }

    /// Store a learned fact, journaling it.
    pub fn set_fact(&self, key: &str, value: serde_json::Value) {
        let mut state = self.lock();
        let PatternState { store, db } = &mut *state;
        store.set_fact(key, value.clone());
        if let Some(db) = db {
            if let Err(e) = db.record_fact(store, key, value) {
                warn!("pattern journal append failed: {}", e);
            }
        }
    }

    pub fn baseline(&self, key: &str) -> Option<f64> {
        self.lock().store.baseline(key)
    }

    pub fn fact(&self, key: &str) -> Option<serde_json::Value> {
        self.lock().store.fact(key).cloned()
    }

    /// Run a closure against the store (read-only view).
    pub fn with_store<R>(&self, f: impl FnOnce(&PatternStore) -> R) -> R {
        f(&self.lock().store)
    }

    /// Run a closure against the store mutably. Changes made here are
    /// captured by the next checkpoint rather than the journal.
    pub fn with_store_mut<R>(&self, f: impl FnOnce(&mut PatternStore) -> R) -> R {
        f(&mut self.lock().store)
    }

    /// Compact the journal into a fresh snapshot.
    pub fn checkpoint(&self) {
        let mut state = self.lock();
        let PatternState { store, db } = &mut *state;
        if let Some(db) = db {
            if let Err(e) = db.checkpoint(store) {
                warn!("pattern checkpoint failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observe_bounded() {
        let mut store = PatternStore::new(4, 0.9);
        for i in 0..10 {
            store.observe("chunks", i, i as f64);
        }
        assert_eq!(store.sample_count("chunks"), 4);
    }

    #[test]
    fn test_baseline_weights_recent() {
        let mut store = PatternStore::new(16, 0.5);
        store.observe("rate", 0, 100.0);
        store.observe("rate", 1, 0.0);
        // The newer sample carries full weight, the older half.
        let baseline = store.baseline("rate").unwrap();
        assert!(baseline < 50.0, "baseline {} should lean recent", baseline);
    }

    #[test]
    fn test_baseline_missing_key() {
        let store = PatternStore::default();
        assert!(store.baseline("nope").is_none());
    }

    #[test]
    fn test_facts_round_trip() {
        let mut store = PatternStore::default();
        store.set_fact("last_good", serde_json::json!({"baud": 9600}));
        assert_eq!(
            store.fact("last_good").unwrap()["baud"],
            serde_json::json!(9600)
        );
    }

    #[test]
    fn test_db_replays_journal() {
        let dir = tempfile::tempdir().unwrap();

        {
            let (mut db, mut store) = PatternDb::open(dir.path()).unwrap();
            store.observe("k", 1, 4.0);
            db.record_observe(&store, "k", 1, 4.0).unwrap();
            store.set_fact("f", serde_json::json!("v"));
            db.record_fact(&store, "f", serde_json::json!("v")).unwrap();
            // Dropped without checkpoint: journal only.
        }

        let (_db, store) = PatternDb::open(dir.path()).unwrap();
        assert_eq!(store.sample_count("k"), 1);
        assert_eq!(store.fact("f"), Some(&serde_json::json!("v")));
    }

    #[test]
    fn test_db_rebuilds_zero_byte_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("patterns.db"), b"").unwrap();

        let (_db, store) = PatternDb::open(dir.path()).unwrap();
        assert_eq!(store.sample_count("anything"), 0);
    }

    #[test]
    fn test_db_survives_torn_journal_line() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (mut db, mut store) = PatternDb::open(dir.path()).unwrap();
            store.observe("k", 1, 1.0);
            db.record_observe(&store, "k", 1, 1.0).unwrap();
        }
        // Simulate a crash mid-append.
        let journal = dir.path().join("patterns.db.journal");
        let mut contents = fs::read(&journal).unwrap();
        contents.extend_from_slice(b"{\"op\":\"observe\",\"key\":\"k\"");
        fs::write(&journal, contents).unwrap();

        let (_db, store) = PatternDb::open(dir.path()).unwrap();
        assert_eq!(store.sample_count("k"), 1);
    }
}

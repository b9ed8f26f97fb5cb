//! Two-tier rate limiting
//!
//! A global sliding window over all requests plus per-agent windows with a
//! concurrency cap. Repeat offenders are quarantined. Resource-tier
//! refusals are sampled 1:100 into the audit log to keep floods from
//! flooding the log too.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::warn;
use uuid::Uuid;

use crate::audit::{AuditLog, EventCategory, SecurityEvent, Severity};
use crate::config::RateLimitConfig;

const WINDOW: Duration = Duration::from_secs(60);
/// Log one in this many rate-limit refusals.
const LOG_SAMPLE: u64 = 100;

/// Refusal detail returned to the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateRefusal {
    pub retry_after_secs: u64,
    pub quarantined: bool,
}

/// Sliding window of request instants.
struct SlidingWindow {
    events: VecDeque<Instant>,
    limit: u32,
    burst: u32,
}

impl SlidingWindow {
    fn new(limit: u32, burst: u32) -> Self {
        Self {
            events: VecDeque::new(),
            limit,
            burst,
        }
    }

    /// Admit or refuse a request at `now`.
    fn allow(&mut self, now: Instant) -> Result<(), u64> {
        while let Some(&front) = self.events.front() {
            if now.duration_since(front) >= WINDOW {
                self.events.pop_front();
            } else {
                break;
            }
        }
        let cap = self.limit as usize + self.burst as usize;
        if self.events.len() < cap {
            self.events.push_back(now);
            Ok(())
        } else {
            let retry = self
                .events
                .front()
                .map(|&f| WINDOW.saturating_sub(now.duration_since(f)))
                .unwrap_or(WINDOW);
            Err(retry.as_secs().max(1))
        }
    }
}

struct AgentState {
    window: SlidingWindow,
    concurrent: u32,
    exceedances: VecDeque<Instant>,
    quarantined_until: Option<Instant>,
}

struct Inner {
    global: SlidingWindow,
    agents: HashMap<Uuid, AgentState>,
}

/// The bridge-wide limiter. Cheap to clone.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Mutex<Inner>>,
    config: RateLimitConfig,
    audit: Arc<AuditLog>,
    refusals: Arc<AtomicU64>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, audit: Arc<AuditLog>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                global: SlidingWindow::new(
                    config.global_requests_per_minute,
                    config.global_burst,
                ),
                agents: HashMap::new(),
            })),
            config,
            audit,
            refusals: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Check a request. On success the returned guard holds one concurrency
    /// slot for the agent until dropped.
    pub fn check(&self, agent: Option<Uuid>) -> Result<RateGuard, RateRefusal> {
        self.check_at(agent, Instant::now())
    }

    fn check_at(&self, agent: Option<Uuid>, now: Instant) -> Result<RateGuard, RateRefusal> {
        let mut inner = lock(&self.inner);

        if let Err(retry) = inner.global.allow(now) {
            drop(inner);
            self.note_refusal(None, retry, false);
            return Err(RateRefusal {
                retry_after_secs: retry,
                quarantined: false,
            });
        }

        let Some(agent_id) = agent else {
            return Ok(RateGuard {
                limiter: None,
                agent: None,
            });
        };

        let config = &self.config;
        let state = inner.agents.entry(agent_id).or_insert_with(|| AgentState {
            window: SlidingWindow::new(
                config.agent_requests_per_minute,
                config.agent_burst,
            ),
            concurrent: 0,
            exceedances: VecDeque::new(),
            quarantined_until: None,
        });

        if let Some(until) = state.quarantined_until {
            if now < until {
                let retry = until.duration_since(now).as_secs().max(1);
                drop(inner);
                self.note_refusal(Some(agent_id), retry, true);
                return Err(RateRefusal {
                    retry_after_secs: retry,
                    quarantined: true,
                });
            }
            state.quarantined_until = None;
            state.exceedances.clear();
        }

        if state.concurrent >= config.max_concurrent_per_agent {
            drop(inner);
            self.note_refusal(Some(agent_id), 1, false);
            return Err(RateRefusal {
                retry_after_secs: 1,
                quarantined: false,
            });
        }

        match state.window.allow(now) {
            Ok(()) => {
                state.concurrent += 1;
                Ok(RateGuard {
                    limiter: Some(self.clone()),
                    agent: Some(agent_id),
                })
            }
            Err(retry) => {
                // Score the exceedance; three inside the window quarantine.
                let exceedance_window =
                    Duration::from_secs(self.config.exceedance_window_secs);
                state.exceedances.push_back(now);
                while let Some(&front) = state.exceedances.front() {
                    if now.duration_since(front) > exceedance_window {
                        state.exceedances.pop_front();
                    } else {
                        break;
                    }
                }
                let quarantined =
                    state.exceedances.len() as u32 >= self.config.exceedances_before_quarantine;
                if quarantined {
                    state.quarantined_until =
                        Some(now + Duration::from_secs(self.config.quarantine_secs));
                    warn!(agent = %agent_id, "agent quarantined for repeated rate-limit abuse");
                    self.audit.append(
                        SecurityEvent::new(
                            Severity::Warning,
                            EventCategory::RateLimiting,
                            "ratelimit.quarantine",
                            70,
                        )
                        .with_agent(agent_id),
                    );
                }
                drop(inner);
                self.note_refusal(Some(agent_id), retry, quarantined);
                Err(RateRefusal {
                    retry_after_secs: retry,
                    quarantined,
                })
            }
        }
    }

    fn release(&self, agent: &Uuid) {
        let mut inner = lock(&self.inner);
        if let Some(state) = inner.agents.get_mut(agent) {
            state.concurrent = state.concurrent.saturating_sub(1);
        }
    }

    /// Sampled logging of refusals (1:100).
    fn note_refusal(&self, agent: Option<Uuid>, retry: u64, quarantined: bool) {
        let n = self.refusals.fetch_add(1, Ordering::Relaxed);
        if n % LOG_SAMPLE != 0 && !quarantined {
            return;
        }
        let mut event = SecurityEvent::new(
            Severity::Notice,
            EventCategory::RateLimiting,
            "ratelimit.exceeded",
            25,
        )
        .with_details(serde_json::json!({
            "retryAfter": retry,
            "sampled": LOG_SAMPLE,
        }));
        if let Some(agent) = agent {
            event = event.with_agent(agent);
        }
        self.audit.append(event);
    }
}

fn lock(inner: &Arc<Mutex<Inner>>) -> std::sync::MutexGuard<'_, Inner> {
    match inner.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Holds one concurrency slot; dropped when the request finishes.
pub struct RateGuard {
    limiter: Option<RateLimiter>,
    agent: Option<Uuid>,
}

impl Drop for RateGuard {
    fn drop(&mut self) {
        if let (Some(limiter), Some(agent)) = (self.limiter.take(), self.agent.take()) {
            limiter.release(&agent);
        }
    }
}

impl std::fmt::Debug for RateGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateGuard").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(per_minute: u32, burst: u32) -> (RateLimiter, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let audit = Arc::new(AuditLog::open(dir.path()).unwrap());
        let config = RateLimitConfig {
            agent_requests_per_minute: per_minute,
            agent_burst: burst,
            max_concurrent_per_agent: 100,
            ..RateLimitConfig::default()
        };
        (RateLimiter::new(config, audit), dir)
    }

    #[test]
    fn test_burst_math_exact() {
        // Per-agent limit 10/min with burst 2: exactly 12 of 15 succeed.
        let (limiter, _dir) = limiter(10, 2);
        let agent = Uuid::new_v4();
        let now = Instant::now();

        let mut accepted = 0;
        let mut refused = Vec::new();
        for i in 0..15 {
            let at = now + Duration::from_millis(i * 10);
            match limiter.check_at(Some(agent), at) {
                Ok(guard) => {
                    accepted += 1;
                    drop(guard);
                }
                Err(refusal) => refused.push(refusal),
            }
        }
        assert_eq!(accepted, 12);
        assert_eq!(refused.len(), 3);
        for refusal in refused {
            assert!((1..=60).contains(&refusal.retry_after_secs));
        }
    }

    #[test]
    fn test_window_slides() {
        let (limiter, _dir) = limiter(2, 0);
        let agent = Uuid::new_v4();
        let now = Instant::now();

        assert!(limiter.check_at(Some(agent), now).is_ok());
        assert!(limiter.check_at(Some(agent), now).is_ok());
        assert!(limiter.check_at(Some(agent), now).is_err());
        // After the window passes, capacity returns.
        let later = now + Duration::from_secs(61);
        assert!(limiter.check_at(Some(agent), later).is_ok());
    }

    #[test]
    fn test_concurrency_cap() {
        let dir = tempfile::tempdir().unwrap();
        let audit = Arc::new(AuditLog::open(dir.path()).unwrap());
        let config = RateLimitConfig {
            max_concurrent_per_agent: 2,
            ..RateLimitConfig::default()
        };
        let limiter = RateLimiter::new(config, audit);
        let agent = Uuid::new_v4();

        let g1 = limiter.check(Some(agent)).unwrap();
        let _g2 = limiter.check(Some(agent)).unwrap();
        assert!(limiter.check(Some(agent)).is_err());

        drop(g1);
        assert!(limiter.check(Some(agent)).is_ok());
    }

    #[test]
    fn test_quarantine_after_repeat_offenses() {
        let dir = tempfile::tempdir().unwrap();
        let audit = Arc::new(AuditLog::open(dir.path()).unwrap());
        let config = RateLimitConfig {
            agent_requests_per_minute: 1,
            agent_burst: 0,
            exceedances_before_quarantine: 3,
            quarantine_secs: 3600,
            max_concurrent_per_agent: 100,
            ..RateLimitConfig::default()
        };
        let limiter = RateLimiter::new(config, audit);
        let agent = Uuid::new_v4();
        let now = Instant::now();

        limiter.check_at(Some(agent), now).unwrap();
        // Three refusals trip the quarantine.
        for i in 0..3 {
            let refusal = limiter
                .check_at(Some(agent), now + Duration::from_millis(i))
                .unwrap_err();
            if i == 2 {
                assert!(refusal.quarantined);
            }
        }
        // Quarantined even after the rate window would have recovered.
        let later = now + Duration::from_secs(120);
        let refusal = limiter.check_at(Some(agent), later).unwrap_err();
        assert!(refusal.quarantined);
        assert!(refusal.retry_after_secs > 60);

        // Quarantine lifts after its duration.
        let after = now + Duration::from_secs(3601);
        assert!(limiter.check_at(Some(agent), after).is_ok());
    }

    #[test]
    fn test_global_tier_independent() {
        let dir = tempfile::tempdir().unwrap();
        let audit = Arc::new(AuditLog::open(dir.path()).unwrap());
        let config = RateLimitConfig {
            global_requests_per_minute: 3,
            global_burst: 0,
            ..RateLimitConfig::default()
        };
        let limiter = RateLimiter::new(config, audit);
        let now = Instant::now();

        // Anonymous (pre-auth) requests count against the global tier only.
        assert!(limiter.check_at(None, now).is_ok());
        assert!(limiter.check_at(None, now).is_ok());
        assert!(limiter.check_at(None, now).is_ok());
        assert!(limiter.check_at(None, now).is_err());
    }
}

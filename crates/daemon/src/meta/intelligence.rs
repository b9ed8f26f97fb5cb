//! Intelligence governor (System 4)
//!
//! Watches the environment: aggregates port metrics, compares the error
//! rate against the learned baseline, and escalates drift upward. It holds
//! the manager by handle and its parent only by id, like every governor.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use crate::governor::bus::{BusEvent, EventBus};
use crate::governor::{
    Assessment, Governor, Observation, PatternStore, ResponseOutcome, VsmLevel,
};
use crate::manager::PortManager;

const BASELINE_KEY: &str = "intelligence.error_delta";
/// Error delta this many times the baseline is drift; twice that is
/// critical.
const DRIFT_FACTOR: f64 = 1.5;
const CRITICAL_FACTOR: f64 = 3.0;
/// Floor so an idle system's tiny baselines do not scream at one error.
const MIN_SIGNIFICANT_DELTA: f64 = 3.0;

pub struct IntelligenceGovernor {
    id: String,
    manager: Arc<PortManager>,
    bus: EventBus,
    last_total_errors: Option<u64>,
}

impl IntelligenceGovernor {
    pub fn new(manager: Arc<PortManager>, bus: EventBus) -> Self {
        Self {
            id: "intelligence".to_string(),
            manager,
            bus,
            last_total_errors: None,
        }
    }
}

#[async_trait]
impl Governor for IntelligenceGovernor {
    fn id(&self) -> &str {
        &self.id
    }

    fn level(&self) -> VsmLevel {
        VsmLevel::Intelligence
    }

    async fn probe(&mut self) -> anyhow::Result<Observation> {
        let mut total_errors = 0u64;
        let mut total_in = 0u64;
        let mut total_out = 0u64;
        let controllers = self.manager.controllers().await;
        for controller in &controllers {
            let metrics = controller.metrics().await;
            total_errors += metrics.error_count;
            total_in += metrics.bytes_in;
            total_out += metrics.bytes_out;
        }

        let delta = match self.last_total_errors {
            Some(last) => total_errors.saturating_sub(last) as f64,
            None => 0.0,
        };
        self.last_total_errors = Some(total_errors);

        Ok(Observation::now()
            .with("ports", controllers.len() as f64)
            .with("total_errors", total_errors as f64)
            .with("error_delta", delta)
            .with("bytes_in", total_in as f64)
            .with("bytes_out", total_out as f64))
    }

    fn sense(&mut self, observation: &Observation, patterns: &PatternStore) -> Assessment {
        let delta = observation.reading("error_delta").unwrap_or(0.0);
        let baseline = patterns.baseline(BASELINE_KEY).unwrap_or(0.0);

        if delta < MIN_SIGNIFICANT_DELTA {
            Assessment::Nominal
        } else if baseline <= f64::EPSILON {
            // Errors appearing on a clean baseline are already drift.
            Assessment::Drifting
        } else if delta >= baseline * CRITICAL_FACTOR {
            Assessment::Critical
        } else if delta >= baseline * DRIFT_FACTOR {
            Assessment::Drifting
        } else {
            Assessment::Nominal
        }
    }

    async fn respond(&mut self, assessment: Assessment) -> anyhow::Result<ResponseOutcome> {
        match assessment {
            Assessment::Nominal => Ok(ResponseOutcome::none()),
            Assessment::Drifting => {
                // Surface the drift; System 5 decides whether to act.
                self.bus.publish(BusEvent::MetricsSnapshot {
                    component: self.id.clone(),
                    metrics: serde_json::json!({ "drift": true }),
                    timestamp: Utc::now(),
                });
                Ok(ResponseOutcome::acted("publish-drift-snapshot"))
            }
            Assessment::Critical => {
                self.bus.publish(BusEvent::Escalation {
                    governor_id: self.id.clone(),
                    level: self.level().number(),
                    error: "error rate far above learned baseline".to_string(),
                    timestamp: Utc::now(),
                });
                Ok(ResponseOutcome::acted("escalate-error-surge"))
            }
        }
    }

    fn learn(&mut self, observation: &Observation, patterns: &mut PatternStore) {
        if let Some(delta) = observation.reading("error_delta") {
            patterns.observe(BASELINE_KEY, Utc::now().timestamp_millis(), delta);
        }
    }

    async fn validate(&mut self, _outcome: &ResponseOutcome) -> anyhow::Result<bool> {
        // The published signal is the effect; nothing further to confirm.
        Ok(true)
    }
}

//! Meta governor (System 5)
//!
//! The root of the supervision graph. It subscribes to escalations from
//! every level and answers with downward directives: restart a port,
//! quarantine an agent, rotate logs. Children never hold a handle to it;
//! everything arrives over the bus.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use crate::audit::{AuditLog, EventCategory, SecurityEvent, Severity};
use crate::governor::bus::{BusEvent, BusSubscription, Directive, EventBus};
use crate::governor::{
    Assessment, Governor, Observation, PatternStore, ResponseOutcome, VsmLevel,
};

/// Escalations per cycle beyond which the system is in real trouble.
const CRITICAL_ESCALATIONS: usize = 3;

struct PendingEscalation {
    governor_id: String,
    error: String,
}

pub struct MetaGovernor {
    id: String,
    bus: EventBus,
    audit: Arc<AuditLog>,
    escalations: BusSubscription,
    pending: Vec<PendingEscalation>,
}

impl MetaGovernor {
    pub fn new(bus: EventBus, audit: Arc<AuditLog>) -> Self {
        let escalations = bus.subscribe();
        Self {
            id: "meta".to_string(),
            bus,
            audit,
            escalations,
            pending: Vec::new(),
        }
    }

    /// Directive for one escalation, by origin naming convention:
    /// `<port>.<sub-governor>` ids come from System 1 port governors.
    fn directive_for(escalation: &PendingEscalation) -> Option<(String, Directive)> {
        let origin = &escalation.governor_id;
        if let Some((port_id, _)) = origin.split_once('.') {
            return Some((
                origin.clone(),
                Directive::RestartPort {
                    port_id: port_id.to_string(),
                },
            ));
        }
        if origin == "intelligence" {
            // An environment-level error surge: rotate logs so the evidence
            // window stays intact for the operator.
            return Some((origin.clone(), Directive::RotateLogs));
        }
        None
    }
}

#[async_trait]
impl Governor for MetaGovernor {
    fn id(&self) -> &str {
        &self.id
    }

    fn level(&self) -> VsmLevel {
        VsmLevel::Meta
    }

    async fn probe(&mut self) -> anyhow::Result<Observation> {
        // Drain escalations accumulated since the last cycle.
        while let Some(event) = self.escalations.try_recv() {
            if let BusEvent::Escalation {
                governor_id, error, ..
            } = event
            {
                if governor_id != self.id {
                    self.pending.push(PendingEscalation { governor_id, error });
                }
            }
        }
        Ok(Observation::now().with("escalations", self.pending.len() as f64))
    }

    fn sense(&mut self, observation: &Observation, _patterns: &PatternStore) -> Assessment {
        match observation.reading("escalations").unwrap_or(0.0) as usize {
            0 => Assessment::Nominal,
            n if n < CRITICAL_ESCALATIONS => Assessment::Drifting,
            _ => Assessment::Critical,
        }
    }

    async fn respond(&mut self, assessment: Assessment) -> anyhow::Result<ResponseOutcome> {
        if self.pending.is_empty() {
            return Ok(ResponseOutcome::none());
        }
        for escalation in self.pending.drain(..) {
            tracing::info!(
                from = %escalation.governor_id,
                error = %escalation.error,
                "handling escalation"
            );
            if let Some((target, directive)) = Self::directive_for(&escalation) {
                self.bus.publish(BusEvent::Directive {
                    target,
                    directive,
                    timestamp: Utc::now(),
                });
            }
        }
        if assessment == Assessment::Critical {
            self.audit.append(
                SecurityEvent::new(
                    Severity::Critical,
                    EventCategory::Recovery,
                    "meta.escalation_storm",
                    65,
                )
                .with_details(serde_json::json!({ "governor": self.id })),
            );
        }
        Ok(ResponseOutcome::acted("issue-directives"))
    }

    fn learn(&mut self, observation: &Observation, patterns: &mut PatternStore) {
        if let Some(count) = observation.reading("escalations") {
            patterns.observe("meta.escalations", Utc::now().timestamp_millis(), count);
        }
    }

    async fn validate(&mut self, outcome: &ResponseOutcome) -> anyhow::Result<bool> {
        // Directives issued and queue drained is the expected effect.
        Ok(!outcome.acted || self.pending.is_empty())
    }
}

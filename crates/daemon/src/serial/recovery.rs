//! Fault recovery for serial ports
//!
//! When a port drops into `Error` the ladder runs, in order: flush the OS
//! buffers in place, close and reopen with identical settings, reopen with
//! the last-known-good settings from the learned store, and finally park
//! the port in `Standby` and notify upward. Each step runs under its own
//! deadline. The companion `RecoveryGovernor` watches recovery frequency
//! and escalates when recoveries cluster.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

use crate::audit::{EventCategory, SecurityEvent, Severity};
use crate::governor::bus::BusEvent;
use crate::governor::{
    Assessment, Governor, Observation, PatternStore, ResponseOutcome, VsmLevel,
};
use crate::serial::controller::SerialPortController;
use crate::serial::types::PortStatus;

/// Per-step deadline.
const STEP_DEADLINE: Duration = Duration::from_secs(2);
/// Recoveries inside this window escalate severity.
const ESCALATION_WINDOW: Duration = Duration::from_secs(600);
const ESCALATION_COUNT: usize = 3;

/// How a recovery run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// Back to operational; the label names the step that worked.
    Recovered(&'static str),
    /// Ladder exhausted; port parked in standby.
    Standby,
}

/// Run the recovery ladder for a port currently in `Error`.
pub async fn run_ladder(controller: &Arc<SerialPortController>) -> RecoveryOutcome {
    let port = controller.id().to_string();

    // Step a: flush OS buffers and resume in place.
    let flushed = tokio::time::timeout(STEP_DEADLINE, controller.flush_buffers()).await;
    if matches!(flushed, Ok(Ok(()))) && controller.resume_after_flush().await.is_ok() {
        info!(port = %port, "recovered by buffer flush");
        finish(controller, "flush").await;
        return RecoveryOutcome::Recovered("flush");
    }

    // Step b: close and reopen with identical settings.
    controller.force_close_for_recovery().await;
    let reopened = tokio::time::timeout(STEP_DEADLINE, controller.open()).await;
    if matches!(reopened, Ok(Ok(()))) {
        info!(port = %port, "recovered by reopen");
        finish(controller, "reopen").await;
        return RecoveryOutcome::Recovered("reopen");
    }

    // Step c: reopen with last-known-good settings.
    if let Some(settings) = controller.last_good_settings() {
        controller.restore_settings(settings).await;
        let reopened = tokio::time::timeout(STEP_DEADLINE, controller.open()).await;
        if matches!(reopened, Ok(Ok(()))) {
            info!(port = %port, "recovered with last-known-good settings");
            finish(controller, "last-known-good").await;
            return RecoveryOutcome::Recovered("last-known-good");
        }
    }

    // Step d: park and notify the parent.
    warn!(port = %port, "recovery ladder exhausted; entering standby");
    if controller.status().await != PortStatus::Standby {
        let _ = controller.enter_standby().await;
    }
    controller.audit().append(
        SecurityEvent::new(
            Severity::Warning,
            EventCategory::Recovery,
            "serial.recovery_failed",
            50,
        )
        .with_details(serde_json::json!({ "port": port })),
    );
    RecoveryOutcome::Standby
}

/// Record a successful recovery as a learned pattern.
async fn finish(controller: &Arc<SerialPortController>, step: &'static str) {
    controller.note_recovery();
    controller.record_recovery_pattern(step);
}

/// System 1 sub-governor watching recovery churn for one port.
///
/// Repeated recoveries inside a ten-minute window mean the underlying fault
/// is not actually fixed; the governor raises the port to `Warning` and
/// escalates on the bus.
pub struct RecoveryGovernor {
    id: String,
    controller: Arc<SerialPortController>,
    clustered: bool,
}

impl RecoveryGovernor {
    pub fn new(controller: Arc<SerialPortController>) -> Self {
        Self {
            id: format!("{}.recovery", controller.id()),
            controller,
            clustered: false,
        }
    }
}

#[async_trait]
impl Governor for RecoveryGovernor {
    fn id(&self) -> &str {
        &self.id
    }

    fn level(&self) -> VsmLevel {
        VsmLevel::Operational
    }

    async fn probe(&mut self) -> anyhow::Result<Observation> {
        Ok(Observation::now().with(
            "recent_recoveries",
            self.controller.recoveries_within(ESCALATION_WINDOW) as f64,
        ))
    }

    fn sense(&mut self, observation: &Observation, _patterns: &PatternStore) -> Assessment {
        let recent = observation.reading("recent_recoveries").unwrap_or(0.0) as usize;
        self.clustered = recent >= ESCALATION_COUNT;
        match recent {
            0 => Assessment::Nominal,
            n if n < ESCALATION_COUNT => Assessment::Drifting,
            _ => Assessment::Critical,
        }
    }

    async fn respond(&mut self, assessment: Assessment) -> anyhow::Result<ResponseOutcome> {
        if assessment != Assessment::Critical {
            return Ok(ResponseOutcome::none());
        }
        self.controller
            .raise_warning("repeated recoveries within ten minutes")
            .await;
        self.controller.audit().append(
            SecurityEvent::new(
                Severity::Error,
                EventCategory::Recovery,
                "serial.recovery_storm",
                60,
            )
            .with_details(serde_json::json!({ "port": self.controller.id() })),
        );
        self.controller.bus().publish(BusEvent::Escalation {
            governor_id: self.id.clone(),
            level: 1,
            error: "recovery storm".into(),
            timestamp: Utc::now(),
        });
        Ok(ResponseOutcome::acted("escalate-recovery-storm"))
    }

    fn learn(&mut self, observation: &Observation, patterns: &mut PatternStore) {
        if let Some(recent) = observation.reading("recent_recoveries") {
            patterns.observe(
                &format!("{}.recoveries", self.controller.id()),
                Utc::now().timestamp_millis(),
                recent,
            );
        }
    }

    async fn validate(&mut self, outcome: &ResponseOutcome) -> anyhow::Result<bool> {
        if !outcome.acted {
            return Ok(true);
        }
        // The warning flag is the expected effect.
        Ok(self.controller.status().await == PortStatus::Warning || !self.clustered)
    }
}

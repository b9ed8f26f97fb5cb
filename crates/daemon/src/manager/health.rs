//! Health supervision (System 3)
//!
//! The management governor probes every registered port on its PSRLV
//! interval. A port flagged unhealthy three consecutive times is restarted;
//! a port that fails restart is parked in standby.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

use crate::governor::{
    Assessment, Governor, Observation, PatternStore, ResponseOutcome, VsmLevel,
};
use crate::serial::types::PortStatus;

use super::PortManager;

/// Consecutive unhealthy probes before a restart.
const UNHEALTHY_THRESHOLD: u32 = 3;

pub struct ManagementGovernor {
    id: String,
    manager: Arc<PortManager>,
    /// Consecutive unhealthy counts per port id.
    unhealthy: HashMap<String, u32>,
    /// Ports due for a restart, decided in sense, acted on in respond.
    restart_due: Vec<String>,
}

impl ManagementGovernor {
    pub fn new(manager: Arc<PortManager>) -> Self {
        Self {
            id: "port-health".to_string(),
            manager,
            unhealthy: HashMap::new(),
            restart_due: Vec::new(),
        }
    }

    fn port_is_healthy(status: PortStatus) -> bool {
        !matches!(status, PortStatus::Error)
    }
}

#[async_trait]
impl Governor for ManagementGovernor {
    fn id(&self) -> &str {
        &self.id
    }

    fn level(&self) -> VsmLevel {
        VsmLevel::Management
    }

    async fn probe(&mut self) -> anyhow::Result<Observation> {
        let controllers = self.manager.controllers().await;
        let mut unhealthy_now = 0usize;
        let mut seen = Vec::with_capacity(controllers.len());

        for controller in &controllers {
            let id = controller.id().to_string();
            let status = controller.status().await;
            seen.push(id.clone());
            if Self::port_is_healthy(status) {
                self.unhealthy.remove(&id);
            } else {
                let count = self.unhealthy.entry(id).or_insert(0);
                *count += 1;
                unhealthy_now += 1;
            }
        }
        // Forget unregistered ports.
        self.unhealthy.retain(|id, _| seen.contains(id));

        Ok(Observation::now()
            .with("ports", controllers.len() as f64)
            .with("unhealthy", unhealthy_now as f64)
            .with(
                "over_threshold",
                self.unhealthy
                    .values()
                    .filter(|&&c| c >= UNHEALTHY_THRESHOLD)
                    .count() as f64,
            ))
    }

    fn sense(&mut self, observation: &Observation, _patterns: &PatternStore) -> Assessment {
        self.restart_due = self
            .unhealthy
            .iter()
            .filter(|(_, &c)| c >= UNHEALTHY_THRESHOLD)
            .map(|(id, _)| id.clone())
            .collect();

        if !self.restart_due.is_empty() {
            Assessment::Critical
        } else if observation.reading("unhealthy").unwrap_or(0.0) > 0.0 {
            Assessment::Drifting
        } else {
            Assessment::Nominal
        }
    }

    async fn respond(&mut self, assessment: Assessment) -> anyhow::Result<ResponseOutcome> {
        if assessment != Assessment::Critical {
            return Ok(ResponseOutcome::none());
        }
        for port_id in self.restart_due.clone() {
            let Ok(controller) = self.manager.get(&port_id).await else {
                continue;
            };
            info!(port = %port_id, "restarting unhealthy port");
            controller.force_close_for_recovery().await;
            match controller.open().await {
                Ok(()) => {
                    self.unhealthy.remove(&port_id);
                }
                Err(e) => {
                    warn!(port = %port_id, "restart failed, parking: {}", e);
                    let _ = controller.enter_standby().await;
                    self.unhealthy.remove(&port_id);
                }
            }
        }
        Ok(ResponseOutcome::acted("restart-unhealthy-ports"))
    }

    fn learn(&mut self, observation: &Observation, patterns: &mut PatternStore) {
        if let Some(unhealthy) = observation.reading("unhealthy") {
            patterns.observe(
                "port-health.unhealthy",
                Utc::now().timestamp_millis(),
                unhealthy,
            );
        }
    }

    async fn validate(&mut self, outcome: &ResponseOutcome) -> anyhow::Result<bool> {
        if !outcome.acted {
            return Ok(true);
        }
        // Every restarted port should be out of error now (operational or
        // parked in standby).
        for controller in self.manager.controllers().await {
            if controller.status().await == PortStatus::Error {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

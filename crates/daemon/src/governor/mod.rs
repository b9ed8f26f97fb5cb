//! Governor framework
//!
//! Every adaptive component in the core is a governor: a unit that runs the
//! Probe-Sense-Respond-Learn-Validate cycle at one of the five VSM levels.
//! The framework supplies the lifecycle state machine, the cycle driver, the
//! event bus, the learned-pattern store, and the id-keyed registry that
//! parents use instead of owning references.

pub mod bus;
pub mod driver;
pub mod patterns;
pub mod registry;
pub mod state;

pub use bus::{BusEvent, BusSubscription, Directive, EventBus};
pub use driver::{DriverConfig, GovernorHandle};
pub use patterns::{PatternDb, PatternStore};
pub use registry::{GovernorRecord, GovernorRegistry};
pub use state::GovernorState;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The five recursive levels of the viable system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VsmLevel {
    /// System 1: direct operations (a serial port, a buffer mode).
    Operational,
    /// System 2: coordination between operational units.
    Coordination,
    /// System 3: resource management and supervision.
    Management,
    /// System 4: environment scanning and adaptation.
    Intelligence,
    /// System 5: identity and policy.
    Meta,
}

impl VsmLevel {
    pub fn number(self) -> u8 {
        match self {
            VsmLevel::Operational => 1,
            VsmLevel::Coordination => 2,
            VsmLevel::Management => 3,
            VsmLevel::Intelligence => 4,
            VsmLevel::Meta => 5,
        }
    }

    /// Probe interval for this level: the base interval doubled per level
    /// above System 1.
    pub fn probe_interval(self, base: Duration) -> Duration {
        base * 2u32.pow(self.number() as u32 - 1)
    }
}

/// Measurements collected by one probe.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Observation {
    pub taken_at: Option<DateTime<Utc>>,
    pub readings: HashMap<String, f64>,
}

impl Observation {
    pub fn now() -> Self {
        Self {
            taken_at: Some(Utc::now()),
            readings: HashMap::new(),
        }
    }

    pub fn with(mut self, key: &str, value: f64) -> Self {
        self.readings.insert(key.to_string(), value);
        self
    }

    pub fn reading(&self, key: &str) -> Option<f64> {
        self.readings.get(key).copied()
    }
}

/// Classification produced by the sense phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Assessment {
    Nominal,
    Drifting,
    Critical,
}

/// What the respond phase did; validated afterwards.
#[derive(Debug, Clone, Serialize)]
pub struct ResponseOutcome {
    /// Enumerated action label; actions must be idempotent.
    pub action: &'static str,
    /// Whether any action was actually taken this cycle.
    pub acted: bool,
}

impl ResponseOutcome {
    pub fn none() -> Self {
        Self {
            action: "none",
            acted: false,
        }
    }

    pub fn acted(action: &'static str) -> Self {
        Self {
            action,
            acted: true,
        }
    }
}

/// Driver-maintained metrics snapshot for one governor.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct GovernorMetrics {
    pub cycles: u64,
    pub failures: u64,
    pub consecutive_failures: u32,
    pub recoveries: u64,
    pub escalations: u64,
    pub last_assessment: Option<Assessment>,
}

/// The capability set every governor implements.
///
/// Implementations hold whatever handles they need (a controller, the port
/// manager, the agent registry) but never a parent governor: escalation
/// travels over the bus, and parents look children up by id.
#[async_trait]
pub trait Governor: Send {
    /// Stable identifier, unique within the registry.
    fn id(&self) -> &str;

    fn level(&self) -> VsmLevel;

    /// One-time setup; also invoked on recovery from `Error`.
    async fn init(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Collect current measurements. Non-blocking, side-effect free beyond
    /// the governor's own counters.
    async fn probe(&mut self) -> anyhow::Result<Observation>;

    /// Compare measurements against the learned baseline.
    fn sense(&mut self, observation: &Observation, patterns: &PatternStore) -> Assessment;

    /// Take an action proportional to the assessment. Must be idempotent.
    async fn respond(&mut self, assessment: Assessment) -> anyhow::Result<ResponseOutcome>;

    /// Fold the observation into the pattern store.
    fn learn(&mut self, observation: &Observation, patterns: &mut PatternStore);

    /// Confirm the response produced the expected effect. Returning `false`
    /// escalates to the parent via the bus.
    async fn validate(&mut self, outcome: &ResponseOutcome) -> anyhow::Result<bool>;

    /// Cleanup when the driver stops.
    async fn stop(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_interval_doubles_per_level() {
        let base = Duration::from_secs(5);
        assert_eq!(VsmLevel::Operational.probe_interval(base), base);
        assert_eq!(
            VsmLevel::Coordination.probe_interval(base),
            Duration::from_secs(10)
        );
        assert_eq!(VsmLevel::Meta.probe_interval(base), Duration::from_secs(80));
    }

    #[test]
    fn test_observation_readings() {
        let obs = Observation::now().with("rate", 4.5).with("errors", 0.0);
        assert_eq!(obs.reading("rate"), Some(4.5));
        assert_eq!(obs.reading("missing"), None);
    }

    #[test]
    fn test_level_numbers() {
        assert_eq!(VsmLevel::Operational.number(), 1);
        assert_eq!(VsmLevel::Meta.number(), 5);
    }
}

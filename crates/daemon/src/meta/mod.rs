//! Intelligence and meta governance (Systems 4 and 5)
//!
//! Drift detection over aggregated metrics, policy directives, and the
//! scheduled self-repair diagnostics.

pub mod intelligence;
pub mod policy;
pub mod repair;

pub use intelligence::IntelligenceGovernor;
pub use policy::MetaGovernor;
pub use repair::{persist_report, run_diagnostics, RepairContext, RepairReport};

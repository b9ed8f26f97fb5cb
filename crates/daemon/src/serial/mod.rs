//! Serial port subsystem
//!
//! One `SerialPortController` per physical link, hosting the buffer-mode
//! and recovery sub-governors. The OS boundary is the `SerialLink` trait;
//! RS-485 direction control goes through `EnablePin`.

pub mod buffer;
pub mod controller;
pub mod link;
pub mod recovery;
pub mod rs485;
pub mod types;

pub use buffer::{BufferModeGovernor, ModeHandle};
pub use controller::{PortDeps, PortSpec, SerialPortController, DEFAULT_WRITE_DEADLINE};
pub use link::{LinkOpener, SerialLink, SystemOpener};
pub use recovery::{run_ladder, RecoveryGovernor, RecoveryOutcome};
pub use rs485::{EnablePin, PinProvider, SysfsPinProvider};
pub use types::{
    BufferMode, FlowControl, LineSettings, Parity, PartialSettings, PortMetrics, PortStatus,
    PortSummary, PortType, ReadEvent, Rs485Profile,
};

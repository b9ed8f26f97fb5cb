//! Serial port domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{PortDefaults, Rs485Config};
use crate::error::PortError;

/// Physical link flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PortType {
    Rs232,
    Rs485,
    UsbSerial,
    Ttl,
}

/// Parity scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    None,
    Even,
    Odd,
    Mark,
    Space,
}

/// Flow control scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowControl {
    None,
    Hardware,
    Software,
}

/// Complete line settings for a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineSettings {
    pub baud_rate: u32,
    /// 5..=8
    pub data_bits: u8,
    /// 1 or 2
    pub stop_bits: u8,
    pub parity: Parity,
    pub flow_control: FlowControl,
}

impl Default for LineSettings {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            data_bits: 8,
            stop_bits: 1,
            parity: Parity::None,
            flow_control: FlowControl::None,
        }
    }
}

impl LineSettings {
    /// Build from the config defaults record.
    pub fn from_defaults(defaults: &PortDefaults) -> Result<Self, PortError> {
        let settings = Self {
            baud_rate: defaults.baud_rate,
            data_bits: defaults.data_bits,
            stop_bits: defaults.stop_bits,
            parity: parse_parity(&defaults.parity)?,
            flow_control: parse_flow_control(&defaults.flow_control)?,
        };
        settings.validate(u32::MAX)?;
        Ok(settings)
    }

    /// Validate against the universal ranges and the platform baud ceiling.
    pub fn validate(&self, max_baud: u32) -> Result<(), PortError> {
        if self.baud_rate == 0 || self.baud_rate > max_baud {
            return Err(PortError::InvalidSettings(format!(
                "baud rate {} out of range (max {})",
                self.baud_rate, max_baud
            )));
        }
        if !(5..=8).contains(&self.data_bits) {
            return Err(PortError::InvalidSettings(format!(
                "data bits {} not in 5..=8",
                self.data_bits
            )));
        }
        if !(1..=2).contains(&self.stop_bits) {
            return Err(PortError::InvalidSettings(format!(
                "stop bits {} not in 1..=2",
                self.stop_bits
            )));
        }
        Ok(())
    }

    /// Apply a partial update, validating the merged result. Either every
    /// field applies or none.
    pub fn merged(&self, partial: &PartialSettings, max_baud: u32) -> Result<Self, PortError> {
        let merged = Self {
            baud_rate: partial.baud_rate.unwrap_or(self.baud_rate),
            data_bits: partial.data_bits.unwrap_or(self.data_bits),
            stop_bits: partial.stop_bits.unwrap_or(self.stop_bits),
            parity: partial.parity.unwrap_or(self.parity),
            flow_control: partial.flow_control.unwrap_or(self.flow_control),
        };
        merged.validate(max_baud)?;
        Ok(merged)
    }

    /// Nominal microseconds on the wire for `n` bytes at these settings.
    pub fn frame_duration_us(&self, n: usize) -> u64 {
        // start bit + data bits + optional parity bit + stop bits
        let bits_per_byte =
            1 + self.data_bits as u64 + u64::from(self.parity != Parity::None) + self.stop_bits as u64;
        (n as u64 * bits_per_byte * 1_000_000) / self.baud_rate as u64
    }
}

pub(crate) fn parse_parity(s: &str) -> Result<Parity, PortError> {
    match s {
        "none" => Ok(Parity::None),
        "even" => Ok(Parity::Even),
        "odd" => Ok(Parity::Odd),
        "mark" => Ok(Parity::Mark),
        "space" => Ok(Parity::Space),
        other => Err(PortError::InvalidSettings(format!(
            "unknown parity {:?}",
            other
        ))),
    }
}

pub(crate) fn parse_flow_control(s: &str) -> Result<FlowControl, PortError> {
    match s {
        "none" => Ok(FlowControl::None),
        "hardware" => Ok(FlowControl::Hardware),
        "software" => Ok(FlowControl::Software),
        other => Err(PortError::InvalidSettings(format!(
            "unknown flow control {:?}",
            other
        ))),
    }
}

/// Partial line settings for atomic `configure`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PartialSettings {
    pub baud_rate: Option<u32>,
    pub data_bits: Option<u8>,
    pub stop_bits: Option<u8>,
    pub parity: Option<Parity>,
    pub flow_control: Option<FlowControl>,
}

/// RS-485 half-duplex profile. Present if and only if the port type is
/// rs485.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rs485Profile {
    /// GPIO pin id driving the transceiver enable (DE) line.
    pub enable_pin: u32,
    pub turnaround_delay_us: u64,
    pub termination_enabled: bool,
    /// Station address 0..=247; 0 means point-to-point.
    pub multidrop_address: u8,
}

impl Rs485Profile {
    pub fn from_config(cfg: &Rs485Config) -> Result<Self, PortError> {
        if cfg.multidrop_address > 247 {
            return Err(PortError::InvalidSettings(format!(
                "multidrop address {} not in 0..=247",
                cfg.multidrop_address
            )));
        }
        Ok(Self {
            enable_pin: cfg.rts_pin,
            turnaround_delay_us: cfg.turnaround_delay_us.max(1),
            termination_enabled: cfg.termination_enabled,
            multidrop_address: cfg.multidrop_address,
        })
    }
}

/// Upstream chunking strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BufferMode {
    /// Emit on newline or per-port timeout.
    Line,
    /// Ring buffer; emit at half-full or short timeout.
    Stream,
    /// Zero-copy passthrough of every OS read.
    Raw,
}

/// Port lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortStatus {
    Closed,
    Opening,
    Operational,
    Warning,
    Error,
    /// Administrative or recovery parking state.
    Standby,
    /// Administrative state for manual intervention.
    Maintenance,
}

impl PortStatus {
    /// Whether a transition from `self` to `next` is legal.
    pub fn can_transition(self, next: PortStatus) -> bool {
        use PortStatus::*;
        if self == next {
            return false;
        }
        match (self, next) {
            (Closed, Opening) => true,
            (Opening, Operational) => true,
            (Opening, Error) => true,
            (Opening, Closed) => true,
            (Operational, Warning) => true,
            (Operational, Error) => true,
            (Operational, Closed) => true,
            (Operational, Standby) => true,
            (Operational, Maintenance) => true,
            (Warning, Operational) => true,
            (Warning, Error) => true,
            (Warning, Closed) => true,
            (Error, Closed) => true,
            (Error, Standby) => true,
            // In-place recovery: a successful buffer flush resumes the
            // port without releasing the device.
            (Error, Operational) => true,
            // Administrative parking of a released port (recovery step d).
            (Closed, Standby) => true,
            (Standby, Opening) => true,
            (Standby, Closed) => true,
            (Standby, Maintenance) => true,
            (Maintenance, Standby) => true,
            (Maintenance, Closed) => true,
            _ => false,
        }
    }

    /// Whether reads and writes may flow.
    pub fn is_active(self) -> bool {
        matches!(self, PortStatus::Operational | PortStatus::Warning)
    }
}

/// Rolling per-port metrics.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PortMetrics {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub error_count: u64,
    pub last_activity: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
    pub uptime_secs: u64,
}

/// Summary row returned by `port.list`.
#[derive(Debug, Clone, Serialize)]
pub struct PortSummary {
    pub id: String,
    pub path: String,
    #[serde(rename = "type")]
    pub port_type: PortType,
    pub status: PortStatus,
    pub buffer_mode: BufferMode,
    pub metrics: PortMetrics,
}

/// One element of the read stream.
#[derive(Debug, Clone)]
pub enum ReadEvent {
    /// A chunk emitted by the active buffer mode.
    Data(Vec<u8>),
    /// The port closed; the sequence is finished.
    Closed,
}

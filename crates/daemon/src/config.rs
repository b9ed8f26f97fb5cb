//! Core configuration contract
//!
//! The front-end config loader parses whatever on-disk format it likes and
//! hands the core a fully typed record. The core re-checks only the
//! invariants it cannot operate without: the RFC-1918 bind gate and the
//! allowed-CIDR list.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::a2a::netguard;
use crate::error::StartupError;

/// Top-level configuration record consumed by the core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub network: NetworkConfig,
    pub security: SecurityConfig,
    pub ports: PortsConfig,
    /// Per-governor tuning keyed by governor name.
    pub governors: HashMap<String, GovernorTuning>,
    pub paths: PathsConfig,
}

impl CoreConfig {
    /// Validate the invariants the core refuses to run without.
    ///
    /// Returns the parsed bind address on success so startup does not parse
    /// the host string twice.
    pub fn validate(&self) -> Result<SocketAddr, StartupError> {
        let ip = netguard::validate_bind_host(&self.network.host)?;
        for cidr in &self.security.allowed_cidrs {
            if !netguard::cidr_is_private(cidr) {
                return Err(StartupError::NonPrivateCidr(cidr.clone()));
            }
        }
        if let Some(tls) = &self.network.tls {
            if tls.cert_path.as_os_str().is_empty() || tls.key_path.as_os_str().is_empty() {
                return Err(StartupError::Tls(
                    "certificate and key paths must both be set".into(),
                ));
            }
        }
        Ok(SocketAddr::new(ip, self.network.port))
    }

    /// Tuning for a named governor, falling back to defaults.
    pub fn governor_tuning(&self, name: &str) -> GovernorTuning {
        self.governors.get(name).cloned().unwrap_or_default()
    }
}

/// Network bridge settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Bind host; must be inside RFC-1918 or loopback space.
    pub host: String,
    pub port: u16,
    pub max_connections: usize,
    /// Seconds an agent may go without a heartbeat before a miss is scored.
    pub agent_timeout_secs: u64,
    /// TLS material; required unless `security.level` is `debug`.
    pub tls: Option<TlsConfig>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3500,
            max_connections: 10,
            agent_timeout_secs: 120,
            tls: None,
        }
    }
}

/// Paths to PEM-encoded TLS material.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// Security posture.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub level: SecurityLevel,
    pub token_expiry_minutes: u64,
    pub rate_limit: RateLimitConfig,
    /// Additional admissible CIDRs; each must itself be private.
    pub allowed_cidrs: Vec<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            level: SecurityLevel::Balanced,
            token_expiry_minutes: 60,
            rate_limit: RateLimitConfig::default(),
            allowed_cidrs: Vec::new(),
        }
    }
}

/// Overall security level; `debug` permits plaintext HTTP on loopback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityLevel {
    Paranoid,
    Balanced,
    Permissive,
    Debug,
}

/// Two-tier rate limiter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub global_requests_per_minute: u32,
    pub global_burst: u32,
    pub agent_requests_per_minute: u32,
    pub agent_burst: u32,
    pub max_concurrent_per_agent: u32,
    /// Exceedances inside this window count toward quarantine.
    pub exceedance_window_secs: u64,
    pub exceedances_before_quarantine: u32,
    pub quarantine_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            global_requests_per_minute: 1000,
            global_burst: 100,
            agent_requests_per_minute: 100,
            agent_burst: 20,
            max_concurrent_per_agent: 5,
            exceedance_window_secs: 600,
            exceedances_before_quarantine: 3,
            quarantine_secs: 3600,
        }
    }
}

/// Serial port defaults plus per-port overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PortsConfig {
    pub default: PortDefaults,
    /// Keyed by logical port id.
    pub specific: HashMap<String, PortOverride>,
}

/// Line defaults applied to every port unless overridden.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortDefaults {
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: String,
    pub flow_control: String,
    /// Ring capacity for stream buffer mode, bytes.
    pub buffer_size: usize,
    /// Per-port emit timeout for line buffer mode.
    pub timeout_ms: u64,
}

impl Default for PortDefaults {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            data_bits: 8,
            stop_bits: 1,
            parity: "none".to_string(),
            flow_control: "none".to_string(),
            buffer_size: 4096,
            timeout_ms: 50,
        }
    }
}

/// Per-port override record. Ports carrying both `path` and `port_type`
/// are registered at startup; the rest only shape later registrations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PortOverride {
    /// Device node, e.g. `/dev/ttyUSB0`.
    pub path: Option<String>,
    /// One of `rs232`, `rs485`, `usb-serial`, `ttl`.
    pub port_type: Option<String>,
    pub baud_rate: Option<u32>,
    pub data_bits: Option<u8>,
    pub stop_bits: Option<u8>,
    pub parity: Option<String>,
    pub flow_control: Option<String>,
    pub buffer_size: Option<usize>,
    pub timeout_ms: Option<u64>,
    pub rs485: Option<Rs485Config>,
}

/// RS-485 half-duplex settings for a port.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Rs485Config {
    pub enabled: bool,
    /// GPIO pin id driving the transceiver enable (DE) line.
    pub rts_pin: u32,
    pub turnaround_delay_us: u64,
    pub termination_enabled: bool,
    /// Multidrop station address; 0 means point-to-point.
    pub multidrop_address: u8,
}

impl Default for Rs485Config {
    fn default() -> Self {
        Self {
            enabled: false,
            rts_pin: 0,
            turnaround_delay_us: 1,
            termination_enabled: false,
            multidrop_address: 0,
        }
    }
}

/// PSRLV cycle tuning for one governor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorTuning {
    pub probe_interval_ms: u64,
    /// Consecutive cycle failures before the governor enters error state.
    pub error_threshold: u32,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
}

impl Default for GovernorTuning {
    fn default() -> Self {
        Self {
            probe_interval_ms: 5000,
            error_threshold: 3,
            retry_attempts: 3,
            retry_delay_ms: 1000,
        }
    }
}

/// The three directories the core writes into.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub config_dir: PathBuf,
    pub data_dir: PathBuf,
    pub log_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            config_dir: PathBuf::from("/etc/cyreal"),
            data_dir: PathBuf::from("/var/lib/cyreal"),
            log_dir: PathBuf::from("/var/log/cyreal"),
        }
    }
}

/// Convenience for handlers that need the parsed bind IP after startup.
pub fn parsed_host(config: &CoreConfig) -> Option<IpAddr> {
    config.network.host.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_bind_loopback() {
        let cfg = CoreConfig::default();
        let addr = cfg.validate().expect("default config must validate");
        assert_eq!(addr.port(), 3500);
        assert!(addr.ip().is_loopback());
    }

    #[test]
    fn test_public_bind_rejected() {
        let mut cfg = CoreConfig::default();
        cfg.network.host = "8.8.8.8".to_string();
        let err = cfg.validate().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("8.8.8.8"));
        assert!(msg.contains("RFC-1918"));
    }

    #[test]
    fn test_non_private_cidr_rejected() {
        let mut cfg = CoreConfig::default();
        cfg.security.allowed_cidrs = vec!["203.0.113.0/24".to_string()];
        assert!(matches!(
            cfg.validate(),
            Err(StartupError::NonPrivateCidr(_))
        ));
    }

    #[test]
    fn test_governor_tuning_fallback() {
        let cfg = CoreConfig::default();
        let tuning = cfg.governor_tuning("buffer-mode");
        assert_eq!(tuning.probe_interval_ms, 5000);
        assert_eq!(tuning.error_threshold, 3);
    }
}

//! Error taxonomy for the core
//!
//! Library surfaces return typed errors; supervisory tasks and the binary
//! wrap them in `anyhow` with context.

use std::net::IpAddr;
use std::time::Duration;

use thiserror::Error;

/// Errors raised by a serial port controller.
#[derive(Debug, Error)]
pub enum PortError {
    /// The OS reports the device node is held by another process.
    #[error("device {0} is busy (held by another process)")]
    PortBusy(String),

    /// The running identity may not open the device node.
    #[error("permission denied opening {0}")]
    PermissionDenied(String),

    /// The device node does not exist.
    #[error("device {0} not found")]
    NotFound(String),

    /// Line settings rejected by validation or by the platform.
    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    /// `close()` on a port that is already closed.
    #[error("port already closed")]
    AlreadyClosed,

    /// Multidrop write gave up after repeated collisions.
    #[error("bus contention on {port} after {attempts} collision backoffs")]
    BusContention { port: String, attempts: u32 },

    /// Cooperative deadline expired; partial output was flushed.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Requested operation is not legal in the port's current status.
    #[error("port is {0}; operation not permitted")]
    WrongState(&'static str),

    /// Transient or unexpected I/O failure on the link.
    #[error("serial I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the port manager.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// A port with this logical id is already registered.
    #[error("port id {0} already registered")]
    DuplicateId(String),

    /// The physical path is malformed or outside the device namespace.
    #[error("invalid device path {0}")]
    InvalidPath(String),

    /// Conflict resolution decided against the request.
    #[error("port {id} in use by {owner}")]
    PortInUse { id: String, owner: String },

    /// No port registered under this id.
    #[error("no port registered with id {0}")]
    UnknownPort(String),

    #[error(transparent)]
    Port(#[from] PortError),
}

/// Fatal configuration errors; the process refuses to start.
#[derive(Debug, Error)]
pub enum StartupError {
    /// Bind address outside the RFC-1918 / loopback ranges.
    #[error("bind address {0} rejected: RFC-1918 private ranges only")]
    NonPrivateBind(IpAddr),

    /// Bind host string did not parse as an IP address.
    #[error("bind host {0:?} is not a valid IP address")]
    UnparsableBind(String),

    /// An allowed CIDR in the security config is not private.
    #[error("allowed CIDR {0:?} rejected: RFC-1918 private ranges only")]
    NonPrivateCidr(String),

    /// TLS material missing or unreadable.
    #[error("TLS configuration error: {0}")]
    Tls(String),
}

//! Serial link abstraction
//!
//! The controller talks to the OS through the `SerialLink` trait so the
//! state machine, buffering, and RS-485 logic are testable without
//! hardware. The system implementation wraps the `serialport` crate;
//! blocking calls are confined to `spawn_blocking` by the controller.

use std::io;
use std::time::Duration;

use serialport::{ClearBuffer, SerialPort};
use tracing::debug;

use crate::error::PortError;
use crate::serial::types::{FlowControl, LineSettings, Parity};

/// A bidirectional byte link with explicit drain semantics.
///
/// `read_chunk` blocks at most the configured read timeout and returns
/// `Ok(0)` when nothing arrived. `drain` returns once the UART reports the
/// output register empty, which RS-485 turnaround depends on.
pub trait SerialLink: Send {
    fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;
    fn drain(&mut self) -> io::Result<()>;
    fn clear(&mut self) -> io::Result<()>;
    fn reconfigure(&mut self, settings: &LineSettings) -> io::Result<()>;
}

/// Opens links for a physical path. The production opener talks to the OS;
/// tests substitute an in-memory implementation.
pub trait LinkOpener: Send + Sync {
    fn open(
        &self,
        path: &str,
        settings: &LineSettings,
        read_timeout: Duration,
    ) -> Result<Box<dyn SerialLink>, PortError>;
}

/// Production opener backed by the OS serial stack.
pub struct SystemOpener;

impl LinkOpener for SystemOpener {
    fn open(
        &self,
        path: &str,
        settings: &LineSettings,
        read_timeout: Duration,
    ) -> Result<Box<dyn SerialLink>, PortError> {
        let builder = serialport::new(path, settings.baud_rate)
            .data_bits(to_data_bits(settings.data_bits)?)
            .stop_bits(to_stop_bits(settings.stop_bits)?)
            .parity(to_parity(settings.parity))
            .flow_control(to_flow_control(settings.flow_control))
            .timeout(read_timeout);

        match builder.open() {
            Ok(port) => {
                debug!(path, baud = settings.baud_rate, "opened serial device");
                Ok(Box::new(SystemLink { port }))
            }
            Err(e) => Err(map_open_error(path, e)),
        }
    }
}

struct SystemLink {
    port: Box<dyn SerialPort>,
}

impl SerialLink for SystemLink {
    fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            // Read timeout is the idle case, not an error.
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        io::Write::write_all(&mut self.port, data)
    }

    fn drain(&mut self) -> io::Result<()> {
        io::Write::flush(&mut self.port)
    }

    fn clear(&mut self) -> io::Result<()> {
        self.port
            .clear(ClearBuffer::All)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }

    fn reconfigure(&mut self, settings: &LineSettings) -> io::Result<()> {
        let invalid = |e: PortError| io::Error::new(io::ErrorKind::InvalidInput, e.to_string());
        self.port.set_baud_rate(settings.baud_rate).map_err(to_io)?;
        self.port
            .set_data_bits(to_data_bits(settings.data_bits).map_err(invalid)?)
            .map_err(to_io)?;
        self.port
            .set_stop_bits(to_stop_bits(settings.stop_bits).map_err(invalid)?)
            .map_err(to_io)?;
        self.port.set_parity(to_parity(settings.parity)).map_err(to_io)?;
        self.port
            .set_flow_control(to_flow_control(settings.flow_control))
            .map_err(to_io)?;
        Ok(())
    }
}

fn to_io(e: serialport::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e)
}

fn to_data_bits(bits: u8) -> Result<serialport::DataBits, PortError> {
    match bits {
        5 => Ok(serialport::DataBits::Five),
        6 => Ok(serialport::DataBits::Six),
        7 => Ok(serialport::DataBits::Seven),
        8 => Ok(serialport::DataBits::Eight),
        other => Err(PortError::InvalidSettings(format!(
            "data bits {} not in 5..=8",
            other
        ))),
    }
}

fn to_stop_bits(bits: u8) -> Result<serialport::StopBits, PortError> {
    match bits {
        1 => Ok(serialport::StopBits::One),
        2 => Ok(serialport::StopBits::Two),
        other => Err(PortError::InvalidSettings(format!(
            "stop bits {} not in 1..=2",
            other
        ))),
    }
}

fn to_parity(parity: Parity) -> serialport::Parity {
    match parity {
        Parity::None => serialport::Parity::None,
        Parity::Even => serialport::Parity::Even,
        Parity::Odd => serialport::Parity::Odd,
        // The portable serial API has no mark/space; they are emulated by
        // the closest supported scheme at the OS layer.
        Parity::Mark => serialport::Parity::Odd,
        Parity::Space => serialport::Parity::Even,
    }
}

fn to_flow_control(flow: FlowControl) -> serialport::FlowControl {
    match flow {
        FlowControl::None => serialport::FlowControl::None,
        FlowControl::Hardware => serialport::FlowControl::Hardware,
        FlowControl::Software => serialport::FlowControl::Software,
    }
}

/// Map an OS open failure onto the port error taxonomy.
fn map_open_error(path: &str, e: serialport::Error) -> PortError {
    use serialport::ErrorKind;
    match e.kind() {
        ErrorKind::NoDevice => PortError::NotFound(path.to_string()),
        ErrorKind::InvalidInput => PortError::InvalidSettings(e.to_string()),
        ErrorKind::Io(io::ErrorKind::PermissionDenied) => {
            PortError::PermissionDenied(path.to_string())
        }
        ErrorKind::Io(io::ErrorKind::NotFound) => PortError::NotFound(path.to_string()),
        ErrorKind::Io(_) if e.to_string().to_lowercase().contains("busy") => {
            PortError::PortBusy(path.to_string())
        }
        _ => PortError::Io(io::Error::new(io::ErrorKind::Other, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_bits_mapping() {
        assert!(to_data_bits(8).is_ok());
        assert!(to_data_bits(4).is_err());
        assert!(to_data_bits(9).is_err());
    }

    #[test]
    fn test_open_error_mapping() {
        let e = serialport::Error::new(serialport::ErrorKind::NoDevice, "gone");
        assert!(matches!(
            map_open_error("/dev/ttyUSB9", e),
            PortError::NotFound(_)
        ));

        let e = serialport::Error::new(
            serialport::ErrorKind::Io(io::ErrorKind::PermissionDenied),
            "denied",
        );
        assert!(matches!(
            map_open_error("/dev/ttyUSB0", e),
            PortError::PermissionDenied(_)
        ));

        let e = serialport::Error::new(
            serialport::ErrorKind::Io(io::ErrorKind::Other),
            "Device or resource busy",
        );
        assert!(matches!(
            map_open_error("/dev/ttyUSB0", e),
            PortError::PortBusy(_)
        ));
    }
}

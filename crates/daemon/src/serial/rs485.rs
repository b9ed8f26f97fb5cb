//! RS-485 half-duplex direction control
//!
//! The transceiver enable (DE) line is driven through the `EnablePin`
//! trait: sysfs GPIO in production, an instrumented mock in tests. The
//! turnaround transaction runs inside the blocking write path; timing uses
//! `std::thread::sleep` for microsecond granularity.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::serial::link::SerialLink;
use crate::serial::types::Rs485Profile;

/// Maximum multidrop write attempts before surfacing bus contention.
pub const MAX_COLLISION_ATTEMPTS: u32 = 3;

/// Direction-control line for a half-duplex transceiver.
pub trait EnablePin: Send {
    /// Drive DE high (transmit).
    fn set_high(&mut self) -> io::Result<()>;
    /// Drive DE low (listen).
    fn set_low(&mut self) -> io::Result<()>;
}

/// Creates enable pins; production uses sysfs, tests inject mocks.
pub trait PinProvider: Send + Sync {
    fn acquire(&self, pin: u32) -> io::Result<Box<dyn EnablePin>>;
}

/// Sysfs GPIO provider (`/sys/class/gpio`).
pub struct SysfsPinProvider;

impl PinProvider for SysfsPinProvider {
    fn acquire(&self, pin: u32) -> io::Result<Box<dyn EnablePin>> {
        Ok(Box::new(SysfsPin::export(pin)?))
    }
}

/// One exported sysfs GPIO line, configured as an output.
pub struct SysfsPin {
    value_path: PathBuf,
}

impl SysfsPin {
    pub fn export(pin: u32) -> io::Result<Self> {
        let base = PathBuf::from("/sys/class/gpio");
        let pin_dir = base.join(format!("gpio{}", pin));
        if !pin_dir.exists() {
            // Export is idempotent-ish: EBUSY from a prior export is fine.
            if let Err(e) = fs::write(base.join("export"), pin.to_string()) {
                if !pin_dir.exists() {
                    return Err(e);
                }
            }
        }
        fs::write(pin_dir.join("direction"), "out")?;
        debug!(pin, "exported GPIO enable pin");
        Ok(Self {
            value_path: pin_dir.join("value"),
        })
    }
}

impl EnablePin for SysfsPin {
    fn set_high(&mut self) -> io::Result<()> {
        fs::write(&self.value_path, "1")
    }

    fn set_low(&mut self) -> io::Result<()> {
        fs::write(&self.value_path, "0")
    }
}

/// Execute one half-duplex write transaction:
/// assert DE, wait the turnaround delay, write, drain the UART, deassert.
///
/// DE is deasserted on the error paths too; a stuck-high enable line jams
/// the whole bus.
pub fn transmit(
    link: &mut dyn SerialLink,
    pin: &mut dyn EnablePin,
    profile: &Rs485Profile,
    frame: &[u8],
) -> io::Result<()> {
    pin.set_high()?;
    std::thread::sleep(Duration::from_micros(profile.turnaround_delay_us));

    let result = link.write_all(frame).and_then(|_| link.drain());

    let lowered = pin.set_low();
    result?;
    lowered
}

/// Random multidrop backoff in [turnaround, 4 x turnaround].
pub fn collision_backoff(profile: &Rs485Profile) -> Duration {
    let t = profile.turnaround_delay_us.max(1);
    let us = rand::thread_rng().gen_range(t..=t * 4);
    Duration::from_micros(us)
}

#[cfg(test)]
pub mod testing {
    //! Instrumented pin for turnaround assertions.

    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Instant;

    /// Records every edge with a timestamp.
    #[derive(Clone, Default)]
    pub struct PinTrace {
        pub edges: Arc<Mutex<Vec<(Instant, bool)>>>,
    }

    impl PinTrace {
        pub fn levels(&self) -> Vec<bool> {
            self.edges.lock().unwrap().iter().map(|&(_, l)| l).collect()
        }

        /// Duration DE was held high during the most recent transaction.
        pub fn last_high_duration(&self) -> Option<Duration> {
            let edges = self.edges.lock().unwrap();
            let mut rise = None;
            let mut result = None;
            for &(t, level) in edges.iter() {
                if level {
                    rise = Some(t);
                } else if let Some(r) = rise.take() {
                    result = Some(t.duration_since(r));
                }
            }
            result
        }
    }

    pub struct MockPin {
        pub trace: PinTrace,
    }

    impl EnablePin for MockPin {
        fn set_high(&mut self) -> io::Result<()> {
            self.trace.edges.lock().unwrap().push((Instant::now(), true));
            Ok(())
        }

        fn set_low(&mut self) -> io::Result<()> {
            self.trace.edges.lock().unwrap().push((Instant::now(), false));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{MockPin, PinTrace};
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Instant;

    /// In-memory link that records writes and drain timing.
    struct RecordingLink {
        written: Arc<Mutex<Vec<u8>>>,
        drain_delay: Duration,
        drained_at: Arc<Mutex<Option<Instant>>>,
    }

    impl SerialLink for RecordingLink {
        fn read_chunk(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Ok(0)
        }

        fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
            self.written.lock().unwrap().extend_from_slice(data);
            Ok(())
        }

        fn drain(&mut self) -> io::Result<()> {
            std::thread::sleep(self.drain_delay);
            *self.drained_at.lock().unwrap() = Some(Instant::now());
            Ok(())
        }

        fn clear(&mut self) -> io::Result<()> {
            Ok(())
        }

        fn reconfigure(
            &mut self,
            _settings: &crate::serial::types::LineSettings,
        ) -> io::Result<()> {
            Ok(())
        }
    }

    fn profile(turnaround_us: u64) -> Rs485Profile {
        Rs485Profile {
            enable_pin: 17,
            turnaround_delay_us: turnaround_us,
            termination_enabled: false,
            multidrop_address: 0,
        }
    }

    #[test]
    fn test_turnaround_sequence() {
        let trace = PinTrace::default();
        let mut pin = MockPin {
            trace: trace.clone(),
        };
        let written = Arc::new(Mutex::new(Vec::new()));
        let mut link = RecordingLink {
            written: Arc::clone(&written),
            drain_delay: Duration::from_millis(5),
            drained_at: Arc::new(Mutex::new(None)),
        };

        let frame = [0x01, 0x03, 0x00, 0x00, 0x00, 0x01];
        transmit(&mut link, &mut pin, &profile(1000), &frame).unwrap();

        assert_eq!(*written.lock().unwrap(), frame.to_vec());
        // Exactly one rise then one fall.
        assert_eq!(trace.levels(), vec![true, false]);
        // DE held through turnaround delay plus drain.
        let held = trace.last_high_duration().unwrap();
        assert!(
            held >= Duration::from_micros(1000) + Duration::from_millis(5),
            "DE held {:?}",
            held
        );
    }

    #[test]
    fn test_de_lowered_on_write_failure() {
        struct FailingLink;
        impl SerialLink for FailingLink {
            fn read_chunk(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
                Ok(0)
            }
            fn write_all(&mut self, _data: &[u8]) -> io::Result<()> {
                Err(io::Error::new(io::ErrorKind::Other, "uart fault"))
            }
            fn drain(&mut self) -> io::Result<()> {
                Ok(())
            }
            fn clear(&mut self) -> io::Result<()> {
                Ok(())
            }
            fn reconfigure(
                &mut self,
                _settings: &crate::serial::types::LineSettings,
            ) -> io::Result<()> {
                Ok(())
            }
        }

        let trace = PinTrace::default();
        let mut pin = MockPin {
            trace: trace.clone(),
        };
        let result = transmit(&mut FailingLink, &mut pin, &profile(1), &[0xFF]);
        assert!(result.is_err());
        assert_eq!(trace.levels(), vec![true, false]);
    }

    #[test]
    fn test_backoff_within_bounds() {
        let p = profile(100);
        for _ in 0..100 {
            let d = collision_backoff(&p);
            assert!(d >= Duration::from_micros(100));
            assert!(d <= Duration::from_micros(400));
        }
    }
}

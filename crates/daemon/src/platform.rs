//! Platform adapter
//!
//! Detects host capabilities once at startup and exposes them as an
//! immutable record. Detection is best-effort: unknown hardware yields the
//! generic record, never an error.

use std::fs;
use std::path::Path;

use serde::Serialize;
use tracing::debug;

/// Profile returned by the external device-fingerprint database.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceProfile {
    pub vendor: String,
    pub product: String,
    /// Driver hints, e.g. a known-good maximum baud.
    pub max_baud: Option<u32>,
}

/// Optional lookup into the external fingerprint database. Absent lookups
/// mean "unknown device" and are never an error.
pub type DeviceLookup = std::sync::Arc<dyn Fn(u16, u16) -> Option<DeviceProfile> + Send + Sync>;

/// Read-only capability record produced by [`detect`].
#[derive(Debug, Clone, Serialize)]
pub struct PlatformCapability {
    /// Human-readable platform name.
    pub name: String,
    /// Architecture tag (`x86_64`, `aarch64`, ...).
    pub arch: String,
    /// Special-feature tags, e.g. `gpio`, `high-speed-serial`.
    pub features: Vec<String>,
    /// Highest baud rate the platform is known to support.
    pub max_baud: u32,
    /// Whether GPIO-driven half-duplex direction control is available.
    pub half_duplex_pin_control: bool,
    /// GPIO chip identifier when one was found.
    pub gpio_chip: Option<String>,
}

impl PlatformCapability {
    /// Generic fallback record with all optional features absent.
    pub fn generic() -> Self {
        Self {
            name: "generic".to_string(),
            arch: std::env::consts::ARCH.to_string(),
            features: vec!["high-speed-serial".to_string()],
            max_baud: 3_000_000,
            half_duplex_pin_control: false,
            gpio_chip: None,
        }
    }

    /// Whether the platform carries a given feature tag.
    pub fn has(&self, feature_tag: &str) -> bool {
        self.features.iter().any(|f| f == feature_tag)
    }
}

/// Detect the host platform.
///
/// Reads well-known OS locations only; no side effects.
pub fn detect() -> PlatformCapability {
    detect_at(Path::new("/"))
}

/// Detection against an alternate root, used by tests.
pub(crate) fn detect_at(root: &Path) -> PlatformCapability {
    let model = fs::read_to_string(root.join("proc/device-tree/model"))
        .unwrap_or_default()
        .trim_end_matches('\0')
        .trim()
        .to_string();
    let gpio_chip = find_gpio_chip(&root.join("sys/class/gpio"));

    let mut cap = if model.contains("BeagleBone") {
        PlatformCapability {
            name: model.clone(),
            arch: std::env::consts::ARCH.to_string(),
            features: vec!["gpio".to_string(), "pru".to_string()],
            max_baud: 921_600,
            half_duplex_pin_control: true,
            gpio_chip: None,
        }
    } else if model.contains("Raspberry Pi") {
        PlatformCapability {
            name: model.clone(),
            arch: std::env::consts::ARCH.to_string(),
            features: vec!["gpio".to_string()],
            max_baud: 921_600,
            half_duplex_pin_control: true,
            gpio_chip: None,
        }
    } else {
        PlatformCapability::generic()
    };

    if gpio_chip.is_some() {
        cap.gpio_chip = gpio_chip;
        if !cap.has("gpio") {
            cap.features.push("gpio".to_string());
        }
        cap.half_duplex_pin_control = true;
    }

    debug!(
        platform = %cap.name,
        gpio = cap.half_duplex_pin_control,
        max_baud = cap.max_baud,
        "platform detected"
    );
    cap
}

/// First gpiochip entry under the sysfs GPIO class, if any.
fn find_gpio_chip(gpio_class: &Path) -> Option<String> {
    let entries = fs::read_dir(gpio_class).ok()?;
    let mut chips: Vec<String> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| n.starts_with("gpiochip"))
        .collect();
    chips.sort();
    chips.into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generic_has_no_gpio() {
        let cap = PlatformCapability::generic();
        assert!(!cap.has("gpio"));
        assert!(cap.has("high-speed-serial"));
        assert!(!cap.half_duplex_pin_control);
    }

    #[test]
    fn test_detect_never_fails() {
        // Detection against an empty root falls back to the generic record.
        let dir = tempfile::tempdir().unwrap();
        let cap = detect_at(dir.path());
        assert_eq!(cap.name, "generic");
        assert!(cap.gpio_chip.is_none());
    }

    #[test]
    fn test_detect_beaglebone_model() {
        let dir = tempfile::tempdir().unwrap();
        let dt = dir.path().join("proc/device-tree");
        std::fs::create_dir_all(&dt).unwrap();
        std::fs::write(dt.join("model"), "TI AM335x BeagleBone Black\0").unwrap();

        let cap = detect_at(dir.path());
        assert!(cap.name.contains("BeagleBone"));
        assert!(cap.has("pru"));
        assert!(cap.half_duplex_pin_control);
    }

    #[test]
    fn test_detect_gpio_chip() {
        let dir = tempfile::tempdir().unwrap();
        let gpio = dir.path().join("sys/class/gpio/gpiochip0");
        std::fs::create_dir_all(&gpio).unwrap();

        let cap = detect_at(dir.path());
        assert_eq!(cap.gpio_chip.as_deref(), Some("gpiochip0"));
        assert!(cap.has("gpio"));
    }
}

//! Port manager and coordinators
//!
//! Registers named ports, arbitrates conflicting access, and routes traffic
//! between network clients and controllers. The manager exclusively owns
//! the port records; everything else refers to ports by id.

pub mod health;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, RwLock};
use tracing::{info, warn};

use crate::config::PortsConfig;
use crate::error::{ManagerError, PortError};
use crate::serial::controller::{PortDeps, PortSpec, SerialPortController};
use crate::serial::types::{
    LineSettings, PartialSettings, PortMetrics, PortSummary, PortType, ReadEvent, Rs485Profile,
};

pub use health::ManagementGovernor;

/// A write claim goes stale after this much idle time.
const CLAIM_TTL: Duration = Duration::from_secs(30);

/// How contested port access is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictPolicy {
    /// Higher registration/request priority wins.
    #[default]
    Priority,
    /// Writers take fair turns.
    RoundRobin,
    /// The least-busy claimant wins.
    LoadBalance,
}

/// Options attached to a registration or routed request.
#[derive(Debug, Clone, Default)]
pub struct RegisterOptions {
    pub priority: i32,
    pub owner: Option<String>,
}

/// Handle returned by `register`.
#[derive(Clone)]
pub struct PortHandle {
    pub id: String,
    pub controller: Arc<SerialPortController>,
}

impl std::fmt::Debug for PortHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortHandle").field("id", &self.id).finish_non_exhaustive()
    }
}

struct ActiveClaim {
    owner: String,
    priority: i32,
    last_used: Instant,
}

struct PortEntry {
    controller: Arc<SerialPortController>,
    priority: i32,
    owner: String,
    claim: Option<ActiveClaim>,
    /// Bytes routed per claimant, for the load-balance policy.
    routed: HashMap<String, u64>,
}

/// Exclusive owner of all serial port records.
pub struct PortManager {
    ports: RwLock<HashMap<String, PortEntry>>,
    policy: ConflictPolicy,
    deps: PortDeps,
    ports_config: PortsConfig,
    max_baud: u32,
    /// External fingerprint database; absent lookups mean unknown device.
    fingerprints: Option<crate::platform::DeviceLookup>,
}

impl PortManager {
    pub fn new(
        deps: PortDeps,
        ports_config: PortsConfig,
        max_baud: u32,
        policy: ConflictPolicy,
    ) -> Self {
        Self {
            ports: RwLock::new(HashMap::new()),
            policy,
            deps,
            ports_config,
            max_baud,
            fingerprints: None,
        }
    }

    /// Attach the optional device-fingerprint lookup.
    pub fn with_fingerprints(mut self, lookup: crate::platform::DeviceLookup) -> Self {
        self.fingerprints = Some(lookup);
        self
    }

    /// Consult the fingerprint database for a USB-serial adapter. Unknown
    /// devices are fine; a known profile is logged for the operator.
    pub fn identify_device(&self, vendor_id: u16, product_id: u16) -> Option<crate::platform::DeviceProfile> {
        let profile = self.fingerprints.as_ref().and_then(|f| f(vendor_id, product_id));
        if let Some(profile) = &profile {
            info!(
                vendor = %profile.vendor,
                product = %profile.product,
                "device identified via fingerprint database"
            );
        }
        profile
    }

    /// Register a port under a stable logical id.
    pub async fn register(
        &self,
        id: &str,
        physical_path: &str,
        port_type: PortType,
    ) -> Result<PortHandle, ManagerError> {
        self.register_with(id, physical_path, port_type, RegisterOptions::default())
            .await
    }

    /// Register with an explicit priority/owner.
    pub async fn register_with(
        &self,
        id: &str,
        physical_path: &str,
        port_type: PortType,
        options: RegisterOptions,
    ) -> Result<PortHandle, ManagerError> {
        validate_path(physical_path)?;
        let spec = self.build_spec(id, physical_path, port_type)?;

        let mut ports = self.ports.write().await;
        if ports.contains_key(id) {
            return Err(ManagerError::DuplicateId(id.to_string()));
        }

        // The same device node may only back one port; under the priority
        // policy a higher-priority registration evicts the incumbent.
        let contested = ports
            .iter()
            .find(|(_, e)| e.controller.path() == physical_path)
            .map(|(k, e)| (k.clone(), e.priority, e.owner.clone()));
        if let Some((existing_id, existing_priority, existing_owner)) = contested {
            let evict = self.policy == ConflictPolicy::Priority
                && options.priority > existing_priority;
            if !evict {
                return Err(ManagerError::PortInUse {
                    id: existing_id,
                    owner: existing_owner,
                });
            }
            let incumbent = ports.remove(&existing_id).expect("present");
            drop_entry(&existing_id, incumbent).await;
            info!(
                port = %existing_id,
                winner = %id,
                "registration evicted by higher priority"
            );
        }

        let controller = SerialPortController::new(spec, self.deps.clone())?;
        let owner = options.owner.unwrap_or_else(|| id.to_string());
        ports.insert(
            id.to_string(),
            PortEntry {
                controller: Arc::clone(&controller),
                priority: options.priority,
                owner,
                claim: None,
                routed: HashMap::new(),
            },
        );
        info!(port = %id, path = %physical_path, "port registered");
        Ok(PortHandle {
            id: id.to_string(),
            controller,
        })
    }

    /// Remove a port, closing it first.
    pub async fn unregister(&self, id: &str) -> Result<(), ManagerError> {
        let entry = self
            .ports
            .write()
            .await
            .remove(id)
            .ok_or_else(|| ManagerError::UnknownPort(id.to_string()))?;
        drop_entry(id, entry).await;
        Ok(())
    }

    /// Summaries of every registered port.
    pub async fn list(&self) -> Vec<PortSummary> {
        let ports = self.ports.read().await;
        let mut summaries = Vec::with_capacity(ports.len());
        for entry in ports.values() {
            summaries.push(entry.controller.summary().await);
        }
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }

    /// Route bytes to a port on behalf of a claimant, applying the conflict
    /// policy when another claimant currently holds the port.
    pub async fn route(
        &self,
        id: &str,
        bytes: &[u8],
        claimant: &str,
        priority: i32,
    ) -> Result<usize, ManagerError> {
        let controller = {
            let mut ports = self.ports.write().await;
            let entry = ports
                .get_mut(id)
                .ok_or_else(|| ManagerError::UnknownPort(id.to_string()))?;
            self.arbitrate(id, entry, claimant, priority)?;
            entry
                .routed
                .entry(claimant.to_string())
                .and_modify(|n| *n += bytes.len() as u64)
                .or_insert(bytes.len() as u64);
            Arc::clone(&entry.controller)
        };
        let written = controller
            .write(bytes, crate::serial::DEFAULT_WRITE_DEADLINE)
            .await?;
        Ok(written)
    }

    /// Subscribe to a port's chunk stream.
    pub async fn subscribe(&self, id: &str) -> Result<broadcast::Receiver<ReadEvent>, ManagerError> {
        let ports = self.ports.read().await;
        let entry = ports
            .get(id)
            .ok_or_else(|| ManagerError::UnknownPort(id.to_string()))?;
        Ok(entry.controller.subscribe())
    }

    /// Controller lookup for the bridge and governors.
    pub async fn get(&self, id: &str) -> Result<Arc<SerialPortController>, ManagerError> {
        let ports = self.ports.read().await;
        ports
            .get(id)
            .map(|e| Arc::clone(&e.controller))
            .ok_or_else(|| ManagerError::UnknownPort(id.to_string()))
    }

    /// All controllers, for health supervision.
    pub async fn controllers(&self) -> Vec<Arc<SerialPortController>> {
        self.ports
            .read()
            .await
            .values()
            .map(|e| Arc::clone(&e.controller))
            .collect()
    }

    pub async fn open(&self, id: &str) -> Result<(), ManagerError> {
        Ok(self.get(id).await?.open().await?)
    }

    pub async fn close(&self, id: &str) -> Result<(), ManagerError> {
        Ok(self.get(id).await?.close().await?)
    }

    pub async fn configure(
        &self,
        id: &str,
        partial: &PartialSettings,
    ) -> Result<(), ManagerError> {
        Ok(self.get(id).await?.configure(partial).await?)
    }

    pub async fn metrics(&self, id: &str) -> Result<PortMetrics, ManagerError> {
        Ok(self.get(id).await?.metrics().await)
    }

    /// Close every port; used during graceful shutdown.
    pub async fn drain_all(&self) {
        for controller in self.controllers().await {
            if let Err(e) = controller.close().await {
                match e {
                    PortError::AlreadyClosed => {}
                    other => warn!(port = %controller.id(), "drain failed: {}", other),
                }
            }
        }
    }

    /// Decide whether `claimant` may use the port right now.
    fn arbitrate(
        &self,
        id: &str,
        entry: &mut PortEntry,
        claimant: &str,
        priority: i32,
    ) -> Result<(), ManagerError> {
        let now = Instant::now();
        let stale = entry
            .claim
            .as_ref()
            .map(|c| now.duration_since(c.last_used) > CLAIM_TTL)
            .unwrap_or(true);

        if stale {
            entry.claim = Some(ActiveClaim {
                owner: claimant.to_string(),
                priority,
                last_used: now,
            });
            return Ok(());
        }

        let current = entry.claim.as_mut().expect("claim present");
        if current.owner == claimant {
            current.last_used = now;
            current.priority = priority;
            return Ok(());
        }

        let winner = match self.policy {
            ConflictPolicy::Priority => priority > current.priority,
            // Fair share: writers alternate, so a different claimant simply
            // takes the next turn.
            ConflictPolicy::RoundRobin => true,
            ConflictPolicy::LoadBalance => {
                let mine = entry.routed.get(claimant).copied().unwrap_or(0);
                let theirs = entry.routed.get(&current.owner).copied().unwrap_or(0);
                mine <= theirs
            }
        };

        if winner {
            *current = ActiveClaim {
                owner: claimant.to_string(),
                priority,
                last_used: now,
            };
            Ok(())
        } else {
            Err(ManagerError::PortInUse {
                id: id.to_string(),
                owner: current.owner.clone(),
            })
        }
    }

    fn build_spec(
        &self,
        id: &str,
        path: &str,
        port_type: PortType,
    ) -> Result<PortSpec, PortError> {
        let defaults = &self.ports_config.default;
        let overrides = self.ports_config.specific.get(id);

        let mut settings = LineSettings::from_defaults(defaults)?;
        let mut buffer_capacity = defaults.buffer_size;
        let mut line_timeout = Duration::from_millis(defaults.timeout_ms);
        let mut rs485 = None;

        if let Some(o) = overrides {
            let partial = PartialSettings {
                baud_rate: o.baud_rate,
                data_bits: o.data_bits,
                stop_bits: o.stop_bits,
                parity: o
                    .parity
                    .as_deref()
                    .map(crate::serial::types::parse_parity)
                    .transpose()?,
                flow_control: o
                    .flow_control
                    .as_deref()
                    .map(crate::serial::types::parse_flow_control)
                    .transpose()?,
            };
            settings = settings.merged(&partial, self.max_baud)?;
            if let Some(size) = o.buffer_size {
                buffer_capacity = size;
            }
            if let Some(ms) = o.timeout_ms {
                line_timeout = Duration::from_millis(ms);
            }
            if let Some(cfg) = &o.rs485 {
                if cfg.enabled {
                    rs485 = Some(Rs485Profile::from_config(cfg)?);
                }
            }
        }

        // An rs485-typed port with no configured profile gets a minimal one
        // so the type invariant holds; pin 0 is rejected at open time when
        // the platform lacks pin control.
        if port_type == PortType::Rs485 && rs485.is_none() {
            rs485 = Some(Rs485Profile {
                enable_pin: 0,
                turnaround_delay_us: 1,
                termination_enabled: false,
                multidrop_address: 0,
            });
        }

        settings.validate(self.max_baud)?;
        Ok(PortSpec {
            id: id.to_string(),
            path: path.to_string(),
            port_type,
            settings,
            rs485,
            buffer_capacity,
            line_timeout,
            max_baud: self.max_baud,
        })
    }
}

async fn drop_entry(id: &str, entry: PortEntry) {
    match entry.controller.close().await {
        Ok(()) | Err(PortError::AlreadyClosed) => {}
        Err(e) => warn!(port = %id, "close during unregister failed: {}", e),
    }
}

fn validate_path(path: &str) -> Result<(), ManagerError> {
    let ok = path.starts_with('/')
        && !path.contains("..")
        && !path.contains(char::is_whitespace)
        && path.len() > 1;
    if ok {
        Ok(())
    } else {
        Err(ManagerError::InvalidPath(path.to_string()))
    }
}

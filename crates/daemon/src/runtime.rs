//! Root context assembly and lifecycle
//!
//! One `CoreRuntime` is built at startup and passed by reference; there is
//! no global state beyond the audit sink it owns. The runtime wires the
//! subsystems together, spawns the governor hierarchy and housekeeping
//! tasks, serves the bridge, and executes the graceful shutdown sequence.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::a2a::agents::AgentRegistry;
use crate::a2a::ratelimit::RateLimiter;
use crate::a2a::rpc::JsonRpcNotification;
use crate::a2a::{server, A2aContext, TokenManager};
use crate::audit::AuditLog;
use crate::config::CoreConfig;
use crate::governor::bus::{BusEvent, Directive, EventBus};
use crate::governor::driver::{self, DriverConfig, DriverContext, GovernorHandle};
use crate::governor::patterns::SharedPatterns;
use crate::governor::registry::GovernorRegistry;
use crate::governor::{Governor, VsmLevel};
use crate::manager::{ConflictPolicy, ManagementGovernor, PortManager};
use crate::meta::repair::{self, RepairContext};
use crate::meta::{IntelligenceGovernor, MetaGovernor};
use crate::platform::{self, PlatformCapability};
use crate::serial::buffer::BufferModeGovernor;
use crate::serial::controller::PortDeps;
use crate::serial::recovery::RecoveryGovernor;
use crate::serial::types::PortType;
use crate::serial::{SysfsPinProvider, SystemOpener};

/// Diagnostics cadence.
const REPAIR_INTERVAL: Duration = Duration::from_secs(600);
/// Heartbeat cadence on the bus and notification stream.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// Pattern store checkpoint cadence.
const CHECKPOINT_INTERVAL: Duration = Duration::from_secs(60);
/// Grace period for in-flight requests during shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct CoreRuntime {
    pub config: CoreConfig,
    pub platform: PlatformCapability,
    pub ctx: Arc<A2aContext>,
    bind_addr: std::net::SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    governor_handles: Vec<GovernorHandle>,
    listening: Arc<AtomicBool>,
    repair_ctx: RepairContext,
}

impl std::fmt::Debug for CoreRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreRuntime").finish_non_exhaustive()
    }
}

impl CoreRuntime {
    /// Build the whole core. Fails fast on configuration errors, including
    /// the RFC-1918 bind gate.
    pub async fn build(config: CoreConfig) -> anyhow::Result<Self> {
        let bind_addr = config.validate()?;
        let platform = platform::detect();

        let audit = Arc::new(AuditLog::open(&config.paths.log_dir)?);
        let patterns = SharedPatterns::open(&config.paths.data_dir)?;
        let bus = EventBus::new();
        let governors = GovernorRegistry::new();

        let deps = PortDeps {
            opener: Arc::new(SystemOpener),
            pins: Arc::new(SysfsPinProvider),
            bus: bus.clone(),
            audit: Arc::clone(&audit),
            patterns: patterns.clone(),
        };
        let manager = Arc::new(PortManager::new(
            deps,
            config.ports.clone(),
            platform.max_baud,
            ConflictPolicy::Priority,
        ));

        let agents = AgentRegistry::new(bus.clone(), Arc::clone(&audit));
        let tokens = TokenManager::new(config.security.token_expiry_minutes);
        let limiter = RateLimiter::new(config.security.rate_limit.clone(), Arc::clone(&audit));

        let listening = Arc::new(AtomicBool::new(false));
        let mut repair_ctx = RepairContext::new(&config, Arc::clone(&listening));

        let ctx = A2aContext::new(
            config.clone(),
            Arc::clone(&manager),
            agents,
            tokens,
            limiter,
            governors.clone(),
            patterns.clone(),
            Arc::clone(&audit),
            bus.clone(),
        );

        let (shutdown_tx, _) = watch::channel(false);
        let mut runtime = Self {
            config,
            platform,
            ctx,
            bind_addr,
            shutdown_tx,
            governor_handles: Vec::new(),
            listening,
            repair_ctx: repair_ctx.clone(),
        };

        runtime.register_configured_ports().await;
        repair_ctx.expected_ports = runtime.configured_port_paths().await;
        runtime.repair_ctx = repair_ctx;
        runtime.spawn_governors().await;
        runtime.spawn_housekeeping();
        Ok(runtime)
    }

    /// Register every port the configuration fully describes.
    async fn register_configured_ports(&self) {
        for (id, over) in &self.config.ports.specific {
            let (Some(path), Some(type_name)) = (&over.path, &over.port_type) else {
                continue;
            };
            let port_type = match type_name.as_str() {
                "rs232" => PortType::Rs232,
                "rs485" => PortType::Rs485,
                "usb-serial" => PortType::UsbSerial,
                "ttl" => PortType::Ttl,
                other => {
                    warn!(port = %id, "unknown port type {:?}; skipping", other);
                    continue;
                }
            };
            if let Err(e) = self.ctx.manager.register(id, path, port_type).await {
                warn!(port = %id, "registration from config failed: {}", e);
            }
        }
    }

    async fn configured_port_paths(&self) -> Vec<(String, String)> {
        self.ctx
            .manager
            .controllers()
            .await
            .iter()
            .map(|c| (c.id().to_string(), c.path().to_string()))
            .collect()
    }

    /// Spawn the governor hierarchy bottom-up: per-port sub-governors under
    /// System 3, System 3 under System 4, System 4 under System 5.
    async fn spawn_governors(&mut self) {
        let ctx = self.ctx.clone();

        self.spawn_governor(
            Box::new(MetaGovernor::new(ctx.bus.clone(), Arc::clone(&ctx.audit))),
            None,
            "meta",
            VsmLevel::Meta,
        );
        self.spawn_governor(
            Box::new(IntelligenceGovernor::new(
                Arc::clone(&ctx.manager),
                ctx.bus.clone(),
            )),
            Some("meta".to_string()),
            "intelligence",
            VsmLevel::Intelligence,
        );
        self.spawn_governor(
            Box::new(ManagementGovernor::new(Arc::clone(&ctx.manager))),
            Some("intelligence".to_string()),
            "port-health",
            VsmLevel::Management,
        );

        for controller in ctx.manager.controllers().await {
            let buffer = BufferModeGovernor::new(
                controller.id(),
                controller.chunk_stats(),
                controller.mode_handle(),
                ctx.bus.clone(),
            );
            self.spawn_governor(
                Box::new(buffer),
                Some("port-health".to_string()),
                "buffer-mode",
                VsmLevel::Operational,
            );
            let recovery = RecoveryGovernor::new(Arc::clone(&controller));
            self.spawn_governor(
                Box::new(recovery),
                Some("port-health".to_string()),
                "recovery",
                VsmLevel::Operational,
            );
        }
    }

    fn spawn_governor(
        &mut self,
        governor: Box<dyn Governor>,
        parent: Option<String>,
        tuning_name: &str,
        level: VsmLevel,
    ) {
        let tuning = self.config.governor_tuning(tuning_name);
        let driver_config = DriverConfig::from_tuning(&tuning, level);
        let driver_ctx = DriverContext {
            bus: self.ctx.bus.clone(),
            registry: self.ctx.governors.clone(),
            patterns: self.ctx.patterns.clone(),
            audit: Arc::clone(&self.ctx.audit),
            shutdown: self.shutdown_tx.subscribe(),
        };
        self.governor_handles
            .push(driver::spawn(governor, parent, driver_config, driver_ctx));
    }

    /// Background tasks: bus-to-notification fan-out, directive execution,
    /// heartbeat, agent sweeper, diagnostics schedule, pattern checkpoints.
    fn spawn_housekeeping(&self) {
        self.spawn_notifier();
        self.spawn_directive_executor();
        self.spawn_heartbeat();
        self.spawn_agent_sweeper();
        self.spawn_repair_schedule();
        self.spawn_pattern_checkpointer();
    }

    fn spawn_notifier(&self) {
        let ctx = Arc::clone(&self.ctx);
        let mut sub = self.ctx.bus.subscribe();
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() { break; }
                    }
                    event = sub.recv() => {
                        let Some(event) = event else { break };
                        if let Some(notification) = notification_for(&event) {
                            ctx.notify(notification);
                        }
                    }
                }
            }
        });
    }

    fn spawn_directive_executor(&self) {
        let ctx = Arc::clone(&self.ctx);
        let mut sub = self.ctx.bus.subscribe();
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() { break; }
                    }
                    event = sub.recv() => {
                        let Some(event) = event else { break };
                        if let BusEvent::Directive { directive, .. } = event {
                            execute_directive(&ctx, directive).await;
                        }
                    }
                }
            }
        });
    }

    fn spawn_heartbeat(&self) {
        let ctx = Arc::clone(&self.ctx);
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() { break; }
                    }
                    _ = interval.tick() => {
                        ctx.bus.publish(BusEvent::Heartbeat {
                            component: "core".to_string(),
                            timestamp: Utc::now(),
                        });
                    }
                }
            }
        });
    }

    fn spawn_agent_sweeper(&self) {
        let ctx = Arc::clone(&self.ctx);
        let timeout = Duration::from_secs(self.config.network.agent_timeout_secs);
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(timeout / 2);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() { break; }
                    }
                    _ = interval.tick() => {
                        let evicted = ctx.agents.sweep(timeout).await;
                        for agent_id in evicted {
                            ctx.tokens.revoke_agent(&agent_id).await;
                            ctx.read_sessions.drop_agent(&agent_id).await;
                        }
                        ctx.tokens.purge().await;
                    }
                }
            }
        });
    }

    fn spawn_repair_schedule(&self) {
        let ctx = Arc::clone(&self.ctx);
        let repair_ctx = self.repair_ctx.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            // The boot pass runs from `run()` once the listener is up; the
            // schedule starts one interval later.
            let mut interval =
                tokio::time::interval_at(tokio::time::Instant::now() + REPAIR_INTERVAL, REPAIR_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() { break; }
                    }
                    _ = interval.tick() => {
                        run_repair_pass(&ctx, &repair_ctx).await;
                    }
                }
            }
        });
    }

    fn spawn_pattern_checkpointer(&self) {
        let patterns = self.ctx.patterns.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(CHECKPOINT_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() { break; }
                    }
                    _ = interval.tick() => {
                        let patterns = patterns.clone();
                        let _ = tokio::task::spawn_blocking(move || patterns.checkpoint()).await;
                    }
                }
            }
        });
    }

    /// Serve the bridge until a termination signal, then run the shutdown
    /// sequence.
    pub async fn run(self) -> anyhow::Result<()> {
        info!(
            platform = %self.platform.name,
            addr = %self.bind_addr,
            "cyreald core starting"
        );

        let server_ctx = Arc::clone(&self.ctx);
        let server_shutdown = self.shutdown_tx.subscribe();
        let addr = self.bind_addr;
        self.listening.store(true, Ordering::Release);
        let server_task = tokio::spawn(async move {
            if let Err(e) = server::serve(server_ctx, addr, server_shutdown).await {
                error!("bridge server exited: {}", e);
            }
        });

        // Boot-time diagnostics, now that the listener is expected up.
        run_repair_pass(&self.ctx, &self.repair_ctx).await;

        tokio::signal::ctrl_c().await.ok();
        info!("termination signal received; shutting down");
        self.shutdown().await;
        let _ = server_task.await;
        Ok(())
    }

    /// The ordered shutdown sequence: stop accepting, notify agents, grace
    /// period, drain ports, flush audit.
    pub async fn shutdown(&self) {
        self.listening.store(false, Ordering::Release);

        // Stop accepting new connections first: this flips the server's
        // graceful-shutdown handle (and retires the housekeeping tasks).
        let _ = self.shutdown_tx.send(true);

        // Tell connected agents while their existing streams drain.
        for card in self.ctx.agents.list().await {
            self.ctx.notify(JsonRpcNotification::new(
                "agent.evicted",
                serde_json::json!({
                    "agentId": card.agent_id,
                    "reason": "shutdown",
                }),
            ));
        }

        // Grace period for in-flight requests before ports are drained.
        tokio::time::sleep(SHUTDOWN_GRACE).await;

        self.ctx.manager.drain_all().await;
        self.ctx.patterns.checkpoint();
        self.ctx.bus.close();
        self.ctx.audit.flush();
        info!("shutdown complete");
    }
}

/// Map bus events onto the wire notifications agents subscribe to.
fn notification_for(event: &BusEvent) -> Option<JsonRpcNotification> {
    match event {
        BusEvent::PortStatusChanged {
            port_id,
            status,
            timestamp,
        } => Some(JsonRpcNotification::new(
            "port.statusChanged",
            serde_json::json!({
                "portId": port_id,
                "status": status,
                "ts": timestamp.timestamp_millis(),
            }),
        )),
        BusEvent::AgentEvicted {
            agent_id,
            reason,
            timestamp,
        } => Some(JsonRpcNotification::new(
            "agent.evicted",
            serde_json::json!({
                "agentId": agent_id,
                "reason": reason,
                "ts": timestamp.timestamp_millis(),
            }),
        )),
        BusEvent::Heartbeat {
            component,
            timestamp,
        } => Some(JsonRpcNotification::new(
            "core.heartbeat",
            serde_json::json!({
                "component": component,
                "ts": timestamp.timestamp_millis(),
            }),
        )),
        BusEvent::RepairCompleted {
            healthy,
            fixed,
            timestamp,
        } => Some(JsonRpcNotification::new(
            "core.repairCompleted",
            serde_json::json!({
                "healthy": healthy,
                "fixed": fixed,
                "ts": timestamp.timestamp_millis(),
            }),
        )),
        _ => None,
    }
}

/// Execute a downward directive.
async fn execute_directive(ctx: &A2aContext, directive: Directive) {
    match directive {
        Directive::RestartPort { port_id } => {
            if let Ok(controller) = ctx.manager.get(&port_id).await {
                controller.force_close_for_recovery().await;
                if let Err(e) = controller.open().await {
                    warn!(port = %port_id, "directive restart failed: {}", e);
                    let _ = controller.enter_standby().await;
                }
            }
        }
        Directive::SwitchBufferMode { port_id, mode } => {
            if let Ok(controller) = ctx.manager.get(&port_id).await {
                controller.mode_handle().set(mode);
            }
        }
        Directive::QuarantineAgent { agent_id } => {
            ctx.tokens.revoke_agent(&agent_id).await;
            ctx.agents.unregister(&agent_id).await;
        }
        Directive::RotateLogs => {
            if let Err(e) = ctx.audit.rotate() {
                warn!("directive log rotation failed: {}", e);
            }
        }
    }
}

/// One scheduled diagnostics pass.
async fn run_repair_pass(ctx: &Arc<A2aContext>, repair_ctx: &RepairContext) {
    let blocking_ctx = repair_ctx.clone();
    let report = match tokio::task::spawn_blocking(move || {
        let report = repair::run_diagnostics(&blocking_ctx);
        let _ = repair::persist_report(&blocking_ctx.data_dir, &report);
        report
    })
    .await
    {
        Ok(report) => report,
        Err(e) => {
            error!("diagnostics task failed: {}", e);
            return;
        }
    };

    if repair::service_down(&report) {
        // The supervisor relaunches us; a dead listener cannot self-heal.
        error!("bridge listener is down; exiting for supervisor restart");
        std::process::exit(1);
    }

    ctx.bus.publish(BusEvent::RepairCompleted {
        healthy: report.healthy,
        fixed: report.fixed.clone(),
        timestamp: Utc::now(),
    });
    *ctx.latest_repair.write().await = Some(report);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SecurityLevel;

    fn test_config(dir: &std::path::Path) -> CoreConfig {
        let mut config = CoreConfig::default();
        config.network.host = "127.0.0.1".to_string();
        config.network.port = 0;
        config.security.level = SecurityLevel::Debug;
        config.paths.config_dir = dir.join("config");
        config.paths.data_dir = dir.join("data");
        config.paths.log_dir = dir.join("log");
        config
    }

    #[tokio::test]
    async fn test_build_wires_governor_hierarchy() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = CoreRuntime::build(test_config(dir.path())).await.unwrap();

        // Give the drivers a moment to register.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let snapshot = runtime.ctx.governors.snapshot().await;
        let ids: Vec<&str> = snapshot.iter().map(|r| r.id.as_str()).collect();
        assert!(ids.contains(&"meta"));
        assert!(ids.contains(&"intelligence"));
        assert!(ids.contains(&"port-health"));

        let intelligence = runtime.ctx.governors.get("intelligence").await.unwrap();
        assert_eq!(intelligence.parent.as_deref(), Some("meta"));
        let health = runtime.ctx.governors.get("port-health").await.unwrap();
        assert_eq!(health.parent.as_deref(), Some("intelligence"));
    }

    #[tokio::test]
    async fn test_public_bind_refused_at_build() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.network.host = "8.8.8.8".to_string();

        let err = CoreRuntime::build(config).await.unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("RFC-1918"));
        assert!(msg.contains("8.8.8.8"));
    }

    #[tokio::test]
    async fn test_repair_pass_updates_latest() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = CoreRuntime::build(test_config(dir.path())).await.unwrap();
        runtime.listening.store(true, Ordering::Release);

        run_repair_pass(&runtime.ctx, &runtime.repair_ctx).await;
        let latest = runtime.ctx.latest_repair.read().await;
        let report = latest.as_ref().expect("report stored");
        assert!(report.healthy);
    }
}

//! A2A method table and dispatcher
//!
//! Every method declares whether it needs authentication and which
//! capability id the caller's card must carry. Dispatch happens after the
//! transport layer has already enforced message size, input validation,
//! and rate limits.

use std::collections::HashSet;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;
use uuid::Uuid;

use crate::a2a::agents::{AgentCard, DiscoverFilter};
use crate::a2a::netguard;
use crate::a2a::rpc::{self, RpcFailure};
use crate::a2a::tokens::TokenRecord;
use crate::a2a::A2aContext;
use crate::audit::{EventCategory, SecurityEvent, Severity};
use crate::error::{ManagerError, PortError};
use crate::serial::types::{PartialSettings, PortType, ReadEvent};

/// One entry in the canonical method namespace.
pub struct MethodDef {
    pub name: &'static str,
    pub requires_auth: bool,
    /// Capability id the caller's card must declare.
    pub required_capability: Option<&'static str>,
}

/// The canonical method set.
pub const METHODS: &[MethodDef] = &[
    MethodDef { name: "agent.register", requires_auth: false, required_capability: None },
    MethodDef { name: "agent.unregister", requires_auth: true, required_capability: None },
    MethodDef { name: "agent.heartbeat", requires_auth: true, required_capability: None },
    MethodDef { name: "agent.list", requires_auth: true, required_capability: None },
    MethodDef { name: "agent.discover", requires_auth: true, required_capability: None },
    MethodDef { name: "port.list", requires_auth: true, required_capability: Some("port.list") },
    MethodDef { name: "port.open", requires_auth: true, required_capability: Some("port.open") },
    MethodDef { name: "port.close", requires_auth: true, required_capability: Some("port.close") },
    MethodDef { name: "port.write", requires_auth: true, required_capability: Some("port.write") },
    MethodDef { name: "port.read", requires_auth: true, required_capability: Some("port.read") },
    MethodDef { name: "port.configure", requires_auth: true, required_capability: Some("port.configure") },
    MethodDef { name: "governor.status", requires_auth: true, required_capability: Some("governor.status") },
    MethodDef { name: "governor.analyze", requires_auth: true, required_capability: Some("governor.analyze") },
    MethodDef { name: "security.validateAddress", requires_auth: true, required_capability: None },
    MethodDef { name: "security.validateCard", requires_auth: true, required_capability: None },
];

pub fn lookup(method: &str) -> Option<&'static MethodDef> {
    METHODS.iter().find(|m| m.name == method)
}

/// Authorization gate: the card must declare the method's capability.
pub fn authorize(def: &MethodDef, caller: Option<&TokenRecord>) -> Result<(), RpcFailure> {
    let Some(required) = def.required_capability else {
        return Ok(());
    };
    match caller {
        Some(token) if token.permissions.contains(required) => Ok(()),
        Some(_) => Err(RpcFailure::authorization()),
        None => Err(RpcFailure::authentication()),
    }
}

/// Dispatch a validated, authenticated, authorized call.
pub async fn dispatch(
    ctx: &A2aContext,
    method: &str,
    params: Option<Value>,
    caller: Option<&TokenRecord>,
) -> Result<Value, RpcFailure> {
    debug!(method, "dispatching");
    match method {
        "agent.register" => agent_register(ctx, params).await,
        "agent.unregister" => agent_unregister(ctx, caller).await,
        "agent.heartbeat" => agent_heartbeat(ctx, caller).await,
        "agent.list" => agent_list(ctx).await,
        "agent.discover" => agent_discover(ctx, params).await,
        "port.list" => port_list(ctx).await,
        "port.open" => port_open(ctx, params).await,
        "port.close" => port_close(ctx, params).await,
        "port.write" => port_write(ctx, params, caller).await,
        "port.read" => port_read(ctx, params, caller).await,
        "port.configure" => port_configure(ctx, params).await,
        "governor.status" => governor_status(ctx).await,
        "governor.analyze" => governor_analyze(ctx, params).await,
        "security.validateAddress" => security_validate_address(params),
        "security.validateCard" => security_validate_card(params),
        other => Err(RpcFailure::method_not_found(other)),
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(params: Option<Value>) -> Result<T, RpcFailure> {
    // Absent params deserialize like an empty object so optional-field
    // param structs work without a params member.
    let value = match params {
        Some(Value::Null) | None => Value::Object(serde_json::Map::new()),
        Some(v) => v,
    };
    serde_json::from_value(value).map_err(|e| RpcFailure::invalid_params(format!("params: {}", e)))
}

fn require_caller(caller: Option<&TokenRecord>) -> Result<&TokenRecord, RpcFailure> {
    caller.ok_or_else(RpcFailure::authentication)
}

// ---- agent.* ----

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterParams {
    agent_card: AgentCard,
}

async fn agent_register(ctx: &A2aContext, params: Option<Value>) -> Result<Value, RpcFailure> {
    let RegisterParams { agent_card } = parse_params(params)?;
    let agent_id = agent_card.agent_id;
    let permissions: HashSet<String> = agent_card.capability_ids().into_iter().collect();

    if let Err(e) = ctx.agents.register(agent_card).await {
        ctx.audit.append(
            SecurityEvent::new(
                Severity::Warning,
                EventCategory::Authentication,
                "agent.register_refused",
                60,
            )
            .with_agent(agent_id)
            .with_details(json!({ "reason": e.label() })),
        );
        return Err(RpcFailure::invalid_params(format!(
            "agent card rejected: {}",
            e.label()
        )));
    }

    let token = ctx.tokens.issue(agent_id, permissions).await;
    ctx.audit.append(
        SecurityEvent::new(
            Severity::Informational,
            EventCategory::Authentication,
            "agent.registered",
            5,
        )
        .with_agent(agent_id),
    );
    Ok(json!({
        "agentId": agent_id,
        "token": token.token,
        "expiresAt": token.expires_at.to_rfc3339(),
    }))
}

async fn agent_unregister(
    ctx: &A2aContext,
    caller: Option<&TokenRecord>,
) -> Result<Value, RpcFailure> {
    let token = require_caller(caller)?;
    if !ctx.agents.unregister(&token.agent_id).await {
        return Err(RpcFailure::agent_not_found());
    }
    ctx.tokens.revoke_agent(&token.agent_id).await;
    ctx.read_sessions.drop_agent(&token.agent_id).await;
    Ok(json!({ "ok": true }))
}

async fn agent_heartbeat(
    ctx: &A2aContext,
    caller: Option<&TokenRecord>,
) -> Result<Value, RpcFailure> {
    let token = require_caller(caller)?;
    if !ctx.agents.heartbeat(&token.agent_id).await {
        return Err(RpcFailure::agent_not_found());
    }
    Ok(json!({
        "ok": true,
        "timeoutSecs": ctx.config.network.agent_timeout_secs,
    }))
}

async fn agent_list(ctx: &A2aContext) -> Result<Value, RpcFailure> {
    let agents = ctx.agents.list().await;
    Ok(json!({ "agents": agents }))
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct DiscoverParams {
    filter: DiscoverFilter,
}

async fn agent_discover(ctx: &A2aContext, params: Option<Value>) -> Result<Value, RpcFailure> {
    let DiscoverParams { filter } = parse_params(params)?;
    let agents = ctx.agents.discover(&filter).await;
    Ok(json!({ "agents": agents }))
}

// ---- port.* ----

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PortIdParams {
    port_id: String,
}

async fn port_list(ctx: &A2aContext) -> Result<Value, RpcFailure> {
    let ports = ctx.manager.list().await;
    Ok(json!({ "ports": ports }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PortOpenParams {
    port_id: String,
    /// Register-on-open for ports not yet known to the manager.
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    port_type: Option<PortType>,
}

async fn port_open(ctx: &A2aContext, params: Option<Value>) -> Result<Value, RpcFailure> {
    let p: PortOpenParams = parse_params(params)?;
    if ctx.manager.get(&p.port_id).await.is_err() {
        let (Some(path), Some(port_type)) = (p.path.clone(), p.port_type) else {
            return Err(RpcFailure::invalid_params("unknown port id"));
        };
        ctx.manager
            .register(&p.port_id, &path, port_type)
            .await
            .map_err(map_manager_error)?;
    }
    ctx.manager
        .open(&p.port_id)
        .await
        .map_err(map_manager_error)?;
    let summary = ctx
        .manager
        .get(&p.port_id)
        .await
        .map_err(map_manager_error)?
        .summary()
        .await;
    Ok(serde_json::to_value(summary).map_err(|_| RpcFailure::internal())?)
}

async fn port_close(ctx: &A2aContext, params: Option<Value>) -> Result<Value, RpcFailure> {
    let p: PortIdParams = parse_params(params)?;
    ctx.manager
        .close(&p.port_id)
        .await
        .map_err(map_manager_error)?;
    Ok(json!({ "ok": true }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PortWriteParams {
    port_id: String,
    /// Raw bytes as a JSON array.
    #[serde(default)]
    bytes: Option<Vec<u8>>,
    /// Or UTF-8 text.
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    priority: Option<i32>,
}

async fn port_write(
    ctx: &A2aContext,
    params: Option<Value>,
    caller: Option<&TokenRecord>,
) -> Result<Value, RpcFailure> {
    let token = require_caller(caller)?;
    let p: PortWriteParams = parse_params(params)?;
    let payload = match (p.bytes, p.text) {
        (Some(bytes), None) => bytes,
        (None, Some(text)) => text.into_bytes(),
        _ => {
            return Err(RpcFailure::invalid_params(
                "exactly one of bytes or text is required",
            ))
        }
    };
    if payload.is_empty() {
        return Err(RpcFailure::invalid_params("empty payload"));
    }
    let accepted = ctx
        .manager
        .route(
            &p.port_id,
            &payload,
            &token.agent_id.to_string(),
            p.priority.unwrap_or(0),
        )
        .await
        .map_err(map_manager_error)?;
    Ok(json!({ "accepted": accepted }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PortReadParams {
    port_id: String,
    #[serde(default)]
    timeout_ms: Option<u64>,
    #[serde(default)]
    max_chunks: Option<usize>,
}

async fn port_read(
    ctx: &A2aContext,
    params: Option<Value>,
    caller: Option<&TokenRecord>,
) -> Result<Value, RpcFailure> {
    let token = require_caller(caller)?;
    let p: PortReadParams = parse_params(params)?;
    let timeout = Duration::from_millis(p.timeout_ms.unwrap_or(100).min(5_000));
    let max_chunks = p.max_chunks.unwrap_or(16).clamp(1, 256);

    // Resume this agent's cursor, or subscribe from now.
    let mut rx = match ctx.read_sessions.take(token.agent_id, &p.port_id).await {
        Some(rx) => rx,
        None => ctx
            .manager
            .subscribe(&p.port_id)
            .await
            .map_err(map_manager_error)?,
    };

    let mut chunks = Vec::new();
    let mut closed = false;
    let deadline = tokio::time::Instant::now() + timeout;
    while chunks.len() < max_chunks {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Ok(ReadEvent::Data(data))) => {
                chunks.push(json!({
                    "hex": hex(&data),
                    "len": data.len(),
                }));
            }
            Ok(Ok(ReadEvent::Closed)) => {
                closed = true;
                break;
            }
            Ok(Err(tokio::sync::broadcast::error::RecvError::Lagged(_))) => continue,
            Ok(Err(_)) | Err(_) => break,
        }
    }

    if !closed {
        ctx.read_sessions.park(token.agent_id, &p.port_id, rx).await;
    }
    Ok(json!({ "chunks": chunks, "closed": closed }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PortConfigureParams {
    port_id: String,
    settings: PartialSettings,
}

async fn port_configure(ctx: &A2aContext, params: Option<Value>) -> Result<Value, RpcFailure> {
    let p: PortConfigureParams = parse_params(params)?;
    ctx.manager
        .configure(&p.port_id, &p.settings)
        .await
        .map_err(map_manager_error)?;
    Ok(json!({ "ok": true }))
}

// ---- governor.* ----

async fn governor_status(ctx: &A2aContext) -> Result<Value, RpcFailure> {
    let governors = ctx.governors.snapshot().await;
    let repair = ctx.latest_repair.read().await.clone();
    Ok(json!({
        "governors": governors,
        "uptimeSecs": ctx.started_at.elapsed().as_secs(),
        "lastRepair": repair,
    }))
}

#[derive(Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
struct AnalyzeParams {
    governor_id: Option<String>,
}

async fn governor_analyze(ctx: &A2aContext, params: Option<Value>) -> Result<Value, RpcFailure> {
    let p: AnalyzeParams = parse_params(params)?;
    let baselines = ctx.patterns.with_store(|store| {
        let mut out = serde_json::Map::new();
        for key in store.keys() {
            if let Some(prefix) = &p.governor_id {
                if !key.starts_with(prefix.as_str()) {
                    continue;
                }
            }
            if let Some(baseline) = store.baseline(key) {
                out.insert(
                    key.clone(),
                    json!({
                        "baseline": baseline,
                        "samples": store.sample_count(key),
                    }),
                );
            }
        }
        out
    });
    Ok(json!({ "baselines": Value::Object(baselines) }))
}

// ---- security.* ----

#[derive(Deserialize)]
struct ValidateAddressParams {
    address: String,
}

fn security_validate_address(params: Option<Value>) -> Result<Value, RpcFailure> {
    let p: ValidateAddressParams = parse_params(params)?;
    let parsed: Option<std::net::IpAddr> = p.address.parse().ok();
    Ok(json!({
        "address": p.address,
        "valid": parsed.is_some(),
        "private": parsed.map(|ip| netguard::is_private(&ip)).unwrap_or(false),
    }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ValidateCardParams {
    agent_card: AgentCard,
}

fn security_validate_card(params: Option<Value>) -> Result<Value, RpcFailure> {
    let p: ValidateCardParams = parse_params(params)?;
    match p.agent_card.validate(Utc::now()) {
        Ok(()) => Ok(json!({ "valid": true, "errors": [] })),
        Err(e) => Ok(json!({ "valid": false, "errors": [e.label()] })),
    }
}

// ---- error mapping ----

fn map_manager_error(e: ManagerError) -> RpcFailure {
    match e {
        ManagerError::DuplicateId(_) => RpcFailure::invalid_params("duplicate port id"),
        ManagerError::InvalidPath(_) => RpcFailure::invalid_params("invalid device path"),
        ManagerError::UnknownPort(_) => RpcFailure::invalid_params("unknown port id"),
        ManagerError::PortInUse { owner, .. } => {
            RpcFailure::service_unavailable().with_data(json!({ "owner": owner }))
        }
        ManagerError::Port(p) => map_port_error(p),
    }
}

fn map_port_error(e: PortError) -> RpcFailure {
    match e {
        PortError::InvalidSettings(msg) => RpcFailure::invalid_params(msg),
        PortError::AlreadyClosed => RpcFailure::invalid_params("port already closed"),
        PortError::NotFound(_) => RpcFailure::invalid_params("device not found"),
        PortError::PermissionDenied(_) => RpcFailure::service_unavailable(),
        PortError::PortBusy(_) | PortError::BusContention { .. } => {
            RpcFailure::service_unavailable()
        }
        PortError::Timeout(_) => {
            RpcFailure::new(rpc::SERVICE_UNAVAILABLE, "operation timed out")
        }
        PortError::WrongState(state) => {
            RpcFailure::invalid_params(format!("port is {}", state))
        }
        PortError::Io(_) => RpcFailure::internal(),
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_table_complete() {
        for name in [
            "agent.register",
            "agent.unregister",
            "agent.heartbeat",
            "agent.list",
            "agent.discover",
            "port.list",
            "port.open",
            "port.close",
            "port.write",
            "port.read",
            "port.configure",
            "governor.status",
            "governor.analyze",
            "security.validateAddress",
            "security.validateCard",
        ] {
            assert!(lookup(name).is_some(), "missing method {}", name);
        }
        assert!(lookup("port.format").is_none());
    }

    #[test]
    fn test_only_register_skips_auth() {
        for def in METHODS {
            if def.name == "agent.register" {
                assert!(!def.requires_auth);
            } else {
                assert!(def.requires_auth, "{} must require auth", def.name);
            }
        }
    }

    #[test]
    fn test_authorize_requires_declared_capability() {
        let def = lookup("port.write").unwrap();
        let mut permissions = HashSet::new();
        permissions.insert("port.list".to_string());
        let token = TokenRecord {
            token: "t".into(),
            agent_id: Uuid::new_v4(),
            permissions,
            issued_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::minutes(5),
            revoked: false,
        };
        let err = authorize(def, Some(&token)).unwrap_err();
        assert_eq!(err.code, rpc::AUTHORIZATION_ERROR);

        let def = lookup("port.list").unwrap();
        assert!(authorize(def, Some(&token)).is_ok());

        // Methods without a capability requirement pass any caller.
        let def = lookup("agent.heartbeat").unwrap();
        assert!(authorize(def, Some(&token)).is_ok());
    }
}

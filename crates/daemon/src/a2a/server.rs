//! HTTPS transport for the A2A engine
//!
//! One POST endpoint carries every JSON-RPC call; a WebSocket endpoint
//! streams server->client notifications. The RFC-1918 gate runs at bind
//! time (refuse to start) and per connection (close and log). CORS echoes
//! an origin only when its host is itself private; wildcards never.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, DefaultBodyLimit, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::Value;
use tokio::sync::watch;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::a2a::rpc::{
    JsonRpcRequest, JsonRpcResponse, RpcFailure, MAX_MESSAGE_BYTES, RFC1918_VIOLATION,
};
use crate::a2a::tokens::TokenRecord;
use crate::a2a::{methods, netguard, sanitize, ws, A2aContext};
use crate::audit::{EventCategory, SecurityEvent, Severity};
use crate::config::SecurityLevel;
use crate::error::StartupError;

/// Build the bridge router.
pub fn router(ctx: Arc<A2aContext>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(|origin, _| {
            origin
                .to_str()
                .map(netguard::origin_is_private)
                .unwrap_or(false)
        }))
        .allow_methods([Method::POST, Method::OPTIONS])
        .allow_headers([
            axum::http::header::AUTHORIZATION,
            axum::http::header::CONTENT_TYPE,
            axum::http::HeaderName::from_static("x-agent-id"),
        ]);

    Router::new()
        .route("/a2a", post(rpc_handler))
        .route("/a2a/ws", get(ws::events_handler))
        .layer(DefaultBodyLimit::max(MAX_MESSAGE_BYTES))
        .layer(cors)
        .with_state(ctx)
}

/// Serve the bridge until the shutdown signal flips.
///
/// TLS is mandatory outside `security.level = debug`; a missing TLS config
/// at any other level refuses to start.
pub async fn serve(
    ctx: Arc<A2aContext>,
    addr: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let app = router(Arc::clone(&ctx)).into_make_service_with_connect_info::<SocketAddr>();

    match (&ctx.config.network.tls, ctx.config.security.level) {
        (Some(tls), _) => {
            let rustls = axum_server::tls_rustls::RustlsConfig::from_pem_file(
                &tls.cert_path,
                &tls.key_path,
            )
            .await
            .map_err(|e| StartupError::Tls(e.to_string()))?;
            info!(%addr, "A2A bridge listening (TLS)");
            let handle = axum_server::Handle::new();
            let shutdown_handle = handle.clone();
            tokio::spawn(async move {
                while shutdown.changed().await.is_ok() {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                shutdown_handle
                    .graceful_shutdown(Some(std::time::Duration::from_secs(5)));
            });
            axum_server::bind_rustls(addr, rustls)
                .handle(handle)
                .serve(app)
                .await?;
        }
        (None, SecurityLevel::Debug) => {
            warn!(%addr, "A2A bridge listening in PLAINTEXT debug mode");
            let listener = tokio::net::TcpListener::bind(addr).await?;
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    while shutdown.changed().await.is_ok() {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                })
                .await?;
        }
        (None, _) => {
            return Err(StartupError::Tls(
                "TLS certificate and key are required outside debug mode".into(),
            )
            .into());
        }
    }
    Ok(())
}

/// The single JSON-RPC endpoint.
async fn rpc_handler(
    State(ctx): State<Arc<A2aContext>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    // Hard gate: non-private peers are cut off with no JSON body at all.
    if !netguard::is_private(&peer.ip()) {
        ctx.audit.append(
            SecurityEvent::new(
                Severity::Warning,
                EventCategory::Network,
                "network.rfc1918_violation",
                75,
            )
            .with_source(peer.to_string())
            .with_details(serde_json::json!({ "code": RFC1918_VIOLATION })),
        );
        return StatusCode::FORBIDDEN.into_response();
    }

    let response = handle_rpc(&ctx, peer, &headers, &body).await;
    Json(response).into_response()
}

async fn handle_rpc(
    ctx: &A2aContext,
    peer: SocketAddr,
    headers: &HeaderMap,
    body: &Bytes,
) -> JsonRpcResponse {
    if body.len() > MAX_MESSAGE_BYTES {
        return JsonRpcResponse::err(Value::Null, RpcFailure::parse_error());
    }

    let request: JsonRpcRequest = match serde_json::from_slice(body) {
        Ok(r) => r,
        Err(_) => return JsonRpcResponse::err(Value::Null, RpcFailure::parse_error()),
    };
    let id = request.id.clone().unwrap_or(Value::Null);

    if let Err(failure) = request.check_shape() {
        return JsonRpcResponse::err(id, failure);
    }
    let method = request.method.as_deref().unwrap_or_default().to_string();

    // Input validation before anything touches the params.
    if let Some(params) = &request.params {
        if let Some(violation) = sanitize::scan(params) {
            let risk = if violation.kind.is_injection() { 90 } else { 40 };
            ctx.audit.append(
                SecurityEvent::new(
                    Severity::Warning,
                    EventCategory::InputValidation,
                    format!("input.{}", violation.kind.label()),
                    risk,
                )
                .with_source(peer.to_string())
                .with_details(serde_json::json!({
                    "method": method,
                    "path": violation.path,
                })),
            );
            return JsonRpcResponse::err(id, RpcFailure::invalid_params("input validation failed"));
        }
    }

    let Some(def) = methods::lookup(&method) else {
        return JsonRpcResponse::err(id, RpcFailure::method_not_found(&method));
    };

    // Authentication.
    let caller: Option<TokenRecord> = if def.requires_auth {
        match authenticate(ctx, headers).await {
            Ok(token) => Some(token),
            Err(failure) => {
                ctx.audit.append(
                    SecurityEvent::new(
                        Severity::Warning,
                        EventCategory::Authentication,
                        "auth.failed",
                        60,
                    )
                    .with_source(peer.to_string())
                    .with_details(serde_json::json!({ "method": method })),
                );
                return JsonRpcResponse::err(id, failure);
            }
        }
    } else {
        None
    };

    // Rate limiting: global tier for anonymous calls, both tiers otherwise.
    let _guard = match ctx.limiter.check(caller.as_ref().map(|t| t.agent_id)) {
        Ok(guard) => guard,
        Err(refusal) => {
            return JsonRpcResponse::err(
                id,
                RpcFailure::rate_limited(refusal.retry_after_secs),
            );
        }
    };

    // Authorization.
    if let Err(failure) = methods::authorize(def, caller.as_ref()) {
        ctx.audit.append(
            SecurityEvent::new(
                Severity::Warning,
                EventCategory::Authorization,
                "authz.denied",
                55,
            )
            .with_source(peer.to_string())
            .with_details(serde_json::json!({ "method": method })),
        );
        return JsonRpcResponse::err(id, failure);
    }

    match methods::dispatch(ctx, &method, request.params, caller.as_ref()).await {
        Ok(result) => JsonRpcResponse::ok(id, result),
        Err(failure) => {
            if failure.code == crate::a2a::rpc::INTERNAL_ERROR {
                error!(method = %method, "internal error during dispatch");
            }
            JsonRpcResponse::err(id, failure)
        }
    }
}

/// Validate `Authorization: Bearer` + `X-Agent-ID` headers.
async fn authenticate(ctx: &A2aContext, headers: &HeaderMap) -> Result<TokenRecord, RpcFailure> {
    let bearer = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(RpcFailure::authentication)?;
    let agent_id: Uuid = headers
        .get("x-agent-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .ok_or_else(RpcFailure::authentication)?;

    ctx.tokens
        .validate(bearer, &agent_id)
        .await
        .map_err(|_| RpcFailure::authentication())
}


#[cfg(test)]
mod tests {
    use super::testing::bridge;
    use super::*;
    use crate::a2a::agents::testing::card;
    use crate::config::CoreConfig;

    async fn call(
        ctx: &Arc<A2aContext>,
        peer: &str,
        auth: Option<(&str, &Uuid)>,
        body: Value,
    ) -> JsonRpcResponse {
        let mut headers = HeaderMap::new();
        if let Some((token, agent)) = auth {
            headers.insert(
                axum::http::header::AUTHORIZATION,
                format!("Bearer {}", token).parse().unwrap(),
            );
            headers.insert("x-agent-id", agent.to_string().parse().unwrap());
        }
        let bytes = Bytes::from(serde_json::to_vec(&body).unwrap());
        handle_rpc(ctx, peer.parse().unwrap(), &headers, &bytes).await
    }

    fn rpc(id: &str, method: &str, params: Value) -> Value {
        serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        })
    }

    #[tokio::test]
    async fn test_register_then_port_list() {
        let rig = bridge(CoreConfig::default());
        let c = card(&["port.list"]);
        let agent_id = c.agent_id;

        let response = call(
            &rig.ctx,
            "192.168.1.20:9000",
            None,
            rpc("1", "agent.register", serde_json::json!({ "agentCard": c })),
        )
        .await;
        let result = response.result.expect("register result");
        let token = result["token"].as_str().unwrap().to_string();
        assert!(!token.is_empty());
        assert!(result["expiresAt"].as_str().is_some());

        let response = call(
            &rig.ctx,
            "192.168.1.20:9000",
            Some((&token, &agent_id)),
            rpc("2", "port.list", Value::Null),
        )
        .await;
        assert!(response.error.is_none());
        assert_eq!(response.result.unwrap()["ports"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_unauthenticated_call_refused() {
        let rig = bridge(CoreConfig::default());
        let response = call(
            &rig.ctx,
            "127.0.0.1:4000",
            None,
            rpc("1", "port.list", Value::Null),
        )
        .await;
        assert_eq!(response.error.unwrap().code, -32001);
    }

    #[tokio::test]
    async fn test_authorization_scoping_no_side_effects() {
        let rig = bridge(CoreConfig::default());
        // The card declares only port.list; port.open must be refused.
        let c = card(&["port.list"]);
        let agent_id = c.agent_id;
        let response = call(
            &rig.ctx,
            "10.0.0.5:1000",
            None,
            rpc("1", "agent.register", serde_json::json!({ "agentCard": c })),
        )
        .await;
        let token = response.result.unwrap()["token"]
            .as_str()
            .unwrap()
            .to_string();

        let response = call(
            &rig.ctx,
            "10.0.0.5:1000",
            Some((&token, &agent_id)),
            rpc(
                "2",
                "port.open",
                serde_json::json!({
                    "portId": "p1",
                    "path": "/dev/ttyUSB0",
                    "portType": "rs232",
                }),
            ),
        )
        .await;
        assert_eq!(response.error.unwrap().code, -32002);
        // No port was registered as a side effect.
        assert!(rig.ctx.manager.get("p1").await.is_err());
        assert_eq!(rig.script.open_count.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_malformed_and_oversized() {
        let rig = bridge(CoreConfig::default());
        let headers = HeaderMap::new();
        let peer: SocketAddr = "127.0.0.1:1".parse().unwrap();

        let bad = Bytes::from_static(b"{not json");
        let response = handle_rpc(&rig.ctx, peer, &headers, &bad).await;
        assert_eq!(response.error.unwrap().code, -32700);

        let no_version = Bytes::from_static(br#"{"id":"1","method":"port.list"}"#);
        let response = handle_rpc(&rig.ctx, peer, &headers, &no_version).await;
        assert_eq!(response.error.unwrap().code, -32600);

        let unknown = Bytes::from_static(
            br#"{"jsonrpc":"2.0","id":"1","method":"port.format"}"#,
        );
        let response = handle_rpc(&rig.ctx, peer, &headers, &unknown).await;
        assert_eq!(response.error.unwrap().code, -32601);
    }

    #[tokio::test]
    async fn test_injection_rejected_with_audit() {
        let rig = bridge(CoreConfig::default());
        let mut alerts = rig.ctx.audit.subscribe_alerts();
        let response = call(
            &rig.ctx,
            "127.0.0.1:5",
            None,
            rpc(
                "1",
                "agent.register",
                serde_json::json!({ "agentCard": "x; rm -rf /" }),
            ),
        )
        .await;
        assert_eq!(response.error.unwrap().code, -32602);
        // Injection attempts are risk 90, which lands on the alert channel.
        let alert = alerts.try_recv().unwrap();
        assert_eq!(alert.risk, 90);
    }

    #[tokio::test]
    async fn test_per_agent_rate_limit_burst() {
        let mut config = CoreConfig::default();
        config.security.rate_limit.agent_requests_per_minute = 10;
        config.security.rate_limit.agent_burst = 2;
        config.security.rate_limit.max_concurrent_per_agent = 100;
        let rig = bridge(config);

        let c = card(&["port.list"]);
        let agent_id = c.agent_id;
        let response = call(
            &rig.ctx,
            "127.0.0.1:2",
            None,
            rpc("1", "agent.register", serde_json::json!({ "agentCard": c })),
        )
        .await;
        let token = response.result.unwrap()["token"]
            .as_str()
            .unwrap()
            .to_string();

        let mut ok = 0;
        let mut limited = 0;
        for i in 0..15 {
            let response = call(
                &rig.ctx,
                "127.0.0.1:2",
                Some((&token, &agent_id)),
                rpc(&format!("r{}", i), "port.list", Value::Null),
            )
            .await;
            match &response.error {
                None => ok += 1,
                Some(e) => {
                    assert_eq!(e.code, -32004);
                    let retry = e.data.as_ref().unwrap()["retryAfter"].as_u64().unwrap();
                    assert!((1..=60).contains(&retry));
                    limited += 1;
                }
            }
        }
        assert_eq!(ok, 12);
        assert_eq!(limited, 3);
    }

    #[tokio::test]
    async fn test_revoked_token_fails_with_auth_error() {
        let rig = bridge(CoreConfig::default());
        let c = card(&["port.list"]);
        let agent_id = c.agent_id;
        let response = call(
            &rig.ctx,
            "127.0.0.1:3",
            None,
            rpc("1", "agent.register", serde_json::json!({ "agentCard": c })),
        )
        .await;
        let token = response.result.unwrap()["token"]
            .as_str()
            .unwrap()
            .to_string();

        rig.ctx.tokens.revoke(&token).await;
        let response = call(
            &rig.ctx,
            "127.0.0.1:3",
            Some((&token, &agent_id)),
            rpc("2", "port.list", Value::Null),
        )
        .await;
        assert_eq!(response.error.unwrap().code, -32001);
    }

    #[tokio::test]
    async fn test_stale_card_rejected() {
        let rig = bridge(CoreConfig::default());
        let mut c = card(&[]);
        c.last_seen = chrono::Utc::now() - chrono::Duration::minutes(10);
        let response = call(
            &rig.ctx,
            "127.0.0.1:4",
            None,
            rpc("1", "agent.register", serde_json::json!({ "agentCard": c })),
        )
        .await;
        let error = response.error.unwrap();
        assert_eq!(error.code, -32602);
        assert!(error.message.contains("last_seen_stale"));
    }
}

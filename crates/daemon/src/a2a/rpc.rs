//! JSON-RPC 2.0 envelope and error code registry

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Hard cap on a single JSON-RPC message.
pub const MAX_MESSAGE_BYTES: usize = 1024 * 1024;

// Standard JSON-RPC 2.0 codes.
pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

// Application codes.
pub const AUTHENTICATION_ERROR: i64 = -32001;
pub const AUTHORIZATION_ERROR: i64 = -32002;
pub const RFC1918_VIOLATION: i64 = -32003;
pub const RATE_LIMIT_EXCEEDED: i64 = -32004;
pub const AGENT_NOT_FOUND: i64 = -32005;
pub const CAPABILITY_NOT_FOUND: i64 = -32006;
pub const SERVICE_UNAVAILABLE: i64 = -32007;

/// Inbound request envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcRequest {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    /// Absent for notifications, which clients may not send.
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Structural validation: version tag and method present, id present
    /// (client->server notifications are not permitted).
    pub fn check_shape(&self) -> Result<(), RpcFailure> {
        if self.jsonrpc.as_deref() != Some("2.0") {
            return Err(RpcFailure::new(INVALID_REQUEST, "invalid request"));
        }
        if self.method.as_deref().map_or(true, str::is_empty) {
            return Err(RpcFailure::new(INVALID_REQUEST, "invalid request"));
        }
        if self.id.is_none() {
            return Err(RpcFailure::new(
                INVALID_REQUEST,
                "notifications are server to client only",
            ));
        }
        Ok(())
    }
}

/// Outbound response envelope.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: &'static str,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorBody>,
}

impl JsonRpcResponse {
    pub fn ok(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: Value, failure: RpcFailure) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(RpcErrorBody {
                code: failure.code,
                message: failure.message,
                data: failure.data,
            }),
        }
    }
}

/// The `error` member of a response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcErrorBody {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Internal failure carrying a stable code and a short, non-leaking
/// message. Detailed context belongs in the audit log, never here.
#[derive(Debug, Clone)]
pub struct RpcFailure {
    pub code: i64,
    pub message: String,
    pub data: Option<Value>,
}

impl RpcFailure {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn parse_error() -> Self {
        Self::new(PARSE_ERROR, "parse error")
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("method {} not found", method))
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(INVALID_PARAMS, message)
    }

    pub fn internal() -> Self {
        Self::new(INTERNAL_ERROR, "internal error")
    }

    pub fn authentication() -> Self {
        Self::new(AUTHENTICATION_ERROR, "authentication failed")
    }

    pub fn authorization() -> Self {
        Self::new(AUTHORIZATION_ERROR, "not authorized for this method")
    }

    pub fn rate_limited(retry_after_secs: u64) -> Self {
        Self::new(RATE_LIMIT_EXCEEDED, "rate limit exceeded")
            .with_data(serde_json::json!({ "retryAfter": retry_after_secs }))
    }

    pub fn agent_not_found() -> Self {
        Self::new(AGENT_NOT_FOUND, "agent not found")
    }

    pub fn service_unavailable() -> Self {
        Self::new(SERVICE_UNAVAILABLE, "service unavailable")
    }
}

/// Server-to-client notification (no id).
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: &'static str,
    pub method: String,
    pub params: Value,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            method: method.into(),
            params,
        }
    }
}

//! Tool wire protocol and transports.
//!
//! Backends speak JSON-RPC 2.0 (`tools/list`, `tools/call`) over one of two
//! transports: HTTP POST ([`http::HttpTransport`]) or line-delimited frames
//! on a child process's standard streams ([`stdio::StdioTransport`]).
//! Transports carry no retry policy of their own; retries belong to the
//! credential layer and TTL-driven rediscovery belongs to the manager.

pub mod http;
pub mod stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    catalog::ToolDescriptor,
    error::{GatewayError, GatewayResult},
};

pub const JSONRPC_VERSION: &str = "2.0";
pub const METHOD_LIST_TOOLS: &str = "tools/list";
pub const METHOD_CALL_TOOL: &str = "tools/call";

#[derive(Debug, Serialize)]
pub struct JsonRpcRequest<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl<'a> JsonRpcRequest<'a> {
    pub fn new(id: u64, method: &'a str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method,
            params,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcErrorObject>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

impl JsonRpcResponse {
    /// Unwrap the envelope: an upstream-declared error object is propagated
    /// unchanged, a missing `result` is a protocol violation.
    pub fn into_result(self, server: &str) -> GatewayResult<Value> {
        if let Some(err) = self.error {
            return Err(GatewayError::Upstream {
                code: err.code,
                message: err.message,
            });
        }
        match self.result {
            Some(value) => Ok(value),
            None => Err(GatewayError::UpstreamProtocol {
                server: server.to_string(),
                message: "response carries neither result nor error".to_string(),
            }),
        }
    }
}

/// One connection to one backend tool server.
#[async_trait]
pub trait ToolTransport: Send + Sync {
    /// Issue `tools/list` and parse the advertised catalog. The returned
    /// descriptors carry no owning server; the manager attaches it.
    async fn list_tools(&self) -> GatewayResult<Vec<ToolDescriptor>>;

    /// Issue `tools/call`. For bearer-authenticated HTTP servers a
    /// caller-supplied token replaces the configured static secret; other
    /// transports ignore it.
    async fn call_tool(
        &self,
        name: &str,
        args: Value,
        bearer_override: Option<&str>,
    ) -> GatewayResult<Value>;

    /// Release transport resources. Idempotent; the transport admits no
    /// further calls afterwards.
    async fn close(&self);
}

/// Parse the `tools` array out of a `tools/list` result.
pub(crate) fn parse_tool_list(server: &str, result: Value) -> GatewayResult<Vec<ToolDescriptor>> {
    let tools = result
        .get("tools")
        .cloned()
        .ok_or_else(|| GatewayError::UpstreamProtocol {
            server: server.to_string(),
            message: "tools/list result missing 'tools' array".to_string(),
        })?;
    serde_json::from_value(tools).map_err(|e| GatewayError::UpstreamProtocol {
        server: server.to_string(),
        message: format!("malformed tool descriptor: {}", e),
    })
}

/// Params for a `tools/call` request.
pub(crate) fn call_params(name: &str, args: Value) -> Value {
    serde_json::json!({ "name": name, "arguments": args })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_request_serialization_omits_empty_params() {
        let req = JsonRpcRequest::new(7, METHOD_LIST_TOOLS, None);
        let raw = serde_json::to_string(&req).expect("serialize");
        assert_eq!(raw, r#"{"jsonrpc":"2.0","id":7,"method":"tools/list"}"#);
    }

    #[test]
    fn test_request_serialization_with_params() {
        let req = JsonRpcRequest::new(
            8,
            METHOD_CALL_TOOL,
            Some(call_params("search_rooms", json!({"nights": 2}))),
        );
        let raw = serde_json::to_value(&req).expect("serialize");
        assert_eq!(raw["params"]["name"], "search_rooms");
        assert_eq!(raw["params"]["arguments"]["nights"], 2);
    }

    #[test]
    fn test_error_envelope_propagates_upstream_object() {
        let raw = r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"method not found"}}"#;
        let resp: JsonRpcResponse = serde_json::from_str(raw).expect("parse");
        let err = resp.into_result("pms").unwrap_err();
        match err {
            GatewayError::Upstream { code, message } => {
                assert_eq!(code, -32601);
                assert_eq!(message, "method not found");
            }
            other => panic!("expected Upstream, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_envelope_is_protocol_error() {
        let raw = r#"{"jsonrpc":"2.0","id":1}"#;
        let resp: JsonRpcResponse = serde_json::from_str(raw).expect("parse");
        assert!(matches!(
            resp.into_result("pms").unwrap_err(),
            GatewayError::UpstreamProtocol { .. }
        ));
    }

    #[test]
    fn test_parse_tool_list() {
        let result = json!({
            "tools": [
                {"name": "search_rooms", "description": "Find rooms", "inputSchema": {"type": "object"}},
                {"name": "create_service_request"}
            ]
        });
        let tools = parse_tool_list("pms", result).expect("parse");
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].name, "search_rooms");
        assert_eq!(tools[1].input_schema, json!({}));
    }

    #[test]
    fn test_parse_tool_list_missing_array() {
        let err = parse_tool_list("pms", json!({"count": 0})).unwrap_err();
        assert!(matches!(err, GatewayError::UpstreamProtocol { .. }));
    }
}

//! Gateway error types.
//!
//! One taxonomy for the whole crate: configuration errors (fatal for a role
//! at load time), upstream tool-call errors (returned to the calling agent as
//! structured values it can react to), and authentication-layer errors (never
//! to be conflated with tool failures).

use thiserror::Error;

pub type GatewayResult<T> = Result<T, GatewayError>;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("No configuration found for role '{0}'")]
    ConfigNotFound(String),

    #[error("Invalid configuration: {0}")]
    ConfigValidation(String),

    #[error("Secret '${{{var}}}' referenced by server '{server}' is not set in the environment")]
    MissingSecret { var: String, server: String },

    #[error("Tool name collision: '{tool_name}' exposed by servers: {servers:?}")]
    ToolCollision {
        tool_name: String,
        servers: Vec<String>,
    },

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Role '{role}' is not allowed to call tool '{tool}'")]
    AccessDenied { role: String, tool: String },

    #[error("Tool call to server '{server}' timed out")]
    UpstreamTimeout { server: String },

    #[error("Server '{server}' unreachable: {message}")]
    UpstreamUnreachable { server: String, message: String },

    #[error("Protocol error from server '{server}': {message}")]
    UpstreamProtocol { server: String, message: String },

    /// Error object declared by the upstream server, propagated unchanged.
    /// `code` is the JSON-RPC error code, or the HTTP status for non-2xx
    /// responses that never carried an envelope.
    #[error("Upstream error {code}: {message}")]
    Upstream { code: i64, message: String },

    #[error("Credential exchange rejected: {0}")]
    ExchangeRejected(String),

    #[error("Session expired; re-authentication required")]
    SessionExpired,

    #[error("Gateway is shut down")]
    GatewayClosed,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl GatewayError {
    /// True for 401-class rejections: the downstream server refused the
    /// presented credentials, as opposed to the tool failing for its own
    /// reasons. These are the only errors eligible for the single
    /// refresh-and-retry cycle.
    pub fn is_auth_rejection(&self) -> bool {
        match self {
            GatewayError::Upstream { code, .. } => *code == 401 || *code == JSONRPC_AUTH_ERROR,
            _ => false,
        }
    }

    /// True for errors that mean the user must log in again.
    pub fn is_session_terminal(&self) -> bool {
        matches!(self, GatewayError::SessionExpired)
    }
}

/// JSON-RPC application error code some tool servers use for rejected
/// credentials (the protocol reserves -32000..-32099 for servers).
pub const JSONRPC_AUTH_ERROR: i64 = -32001;

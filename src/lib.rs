//! Role-scoped gateway between an LLM chat agent and its tool servers.
//!
//! ## Modules
//!
//! - [`config`]: per-role server configuration with env-sourced secrets
//! - [`catalog`]: TTL-cached, access-filtered tool catalogs
//! - [`transport`]: JSON-RPC 2.0 over HTTP or a child process's stdio
//! - [`manager`]: discovery, allowlist enforcement, call routing, shutdown
//! - [`auth`]: sessions, token refresh, credential exchange, 401 retry
//!
//! Everything above the transports is role-keyed: a role sees exactly the
//! tools its per-server allowlists grant, and nothing else exists as far as
//! that role's agent is concerned.

// Shared infrastructure
pub mod clock;
pub mod config;
pub mod error;

// Subsystems
pub mod auth;
pub mod catalog;
pub mod manager;
pub mod transport;

pub use auth::{
    AuthedToolCaller, CredentialBroker, CredentialExchanger, Credentials,
    HttpCredentialExchanger, HttpTokenRefresher, InMemorySessionStore, RefreshedTokens, Session,
    SessionStore, SessionTokenLifecycle, SessionTokens, TokenRefresher, ToolInvoker,
};
pub use catalog::{CachedToolSet, ToolCatalogCache, ToolDescriptor};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    AuthConfig, Role, RoleConfig, RoleConfigLoader, ServerConfig, TransportConfig,
};
pub use error::{GatewayError, GatewayResult, JSONRPC_AUTH_ERROR};
pub use manager::{
    DefaultTransportFactory, ManagerStats, McpManager, RoleStats, ServerHandle, ServerState,
    TransportFactory,
};
pub use transport::{http::HttpTransport, stdio::StdioTransport, ToolTransport};

//! Refresh-and-retry policy for credential rejection mid-call.
//!
//! When a downstream server answers a tool call with a 401-class rejection,
//! the cached credentials are presumed stale: drop them, re-exchange off the
//! (possibly refreshed) identity token, and retry the call exactly once. A
//! second rejection, or a refused exchange on the retry leg, means the user's
//! authentication is genuinely dead and the session is terminated. Tool
//! failures that are not auth rejections are never retried here.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};

use super::{broker::CredentialBroker, session::SessionTokenLifecycle, Credentials};
use crate::{
    config::Role,
    error::{GatewayError, GatewayResult},
    manager::McpManager,
};

/// Where the policy stands for the current invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RetryState {
    /// First attempt with whatever credentials the broker has.
    Attempting,
    /// Credentials were rejected once; retrying with a fresh exchange.
    RefreshedRetry,
}

/// Call-routing seam so the policy can be exercised without live transports.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn call_tool(
        &self,
        role: Role,
        name: &str,
        args: Value,
        credentials: Option<&Credentials>,
    ) -> GatewayResult<Value>;
}

#[async_trait]
impl ToolInvoker for McpManager {
    async fn call_tool(
        &self,
        role: Role,
        name: &str,
        args: Value,
        credentials: Option<&Credentials>,
    ) -> GatewayResult<Value> {
        McpManager::call_tool(self, role, name, args, credentials).await
    }
}

pub struct AuthedToolCaller {
    invoker: Arc<dyn ToolInvoker>,
    lifecycle: Arc<SessionTokenLifecycle>,
    broker: Arc<CredentialBroker>,
}

impl AuthedToolCaller {
    pub fn new(
        invoker: Arc<dyn ToolInvoker>,
        lifecycle: Arc<SessionTokenLifecycle>,
        broker: Arc<CredentialBroker>,
    ) -> Self {
        Self {
            invoker,
            lifecycle,
            broker,
        }
    }

    /// Invoke a tool on behalf of a session, keeping its credentials usable
    /// across the call. Returns [`GatewayError::SessionExpired`] whenever the
    /// caller must re-authenticate; every other error is the tool call's own.
    pub async fn call(
        &self,
        session_id: &str,
        tool: &str,
        args: Value,
    ) -> GatewayResult<Value> {
        let Some(session) = self.lifecycle.get_session(session_id) else {
            return Err(GatewayError::SessionExpired);
        };
        let role = session.role;

        let mut state = RetryState::Attempting;
        loop {
            let Some(identity_token) = self.lifecycle.get_valid_token(session_id).await? else {
                return Err(GatewayError::SessionExpired);
            };

            let credentials = match self.broker.get(session_id, &identity_token).await {
                Ok(credentials) => credentials,
                Err(e @ GatewayError::ExchangeRejected(_))
                    if state == RetryState::RefreshedRetry =>
                {
                    warn!(
                        "re-exchange refused for session '{}' after rejection: {}",
                        session_id, e
                    );
                    self.lifecycle.invalidate(session_id);
                    return Err(GatewayError::SessionExpired);
                }
                Err(e) => return Err(e),
            };

            match self
                .invoker
                .call_tool(role, tool, args.clone(), Some(&credentials))
                .await
            {
                Ok(result) => return Ok(result),
                Err(e) if e.is_auth_rejection() => match state {
                    RetryState::Attempting => {
                        info!(
                            "server rejected credentials for session '{}'; re-exchanging and retrying once",
                            session_id
                        );
                        self.broker.invalidate(session_id);
                        state = RetryState::RefreshedRetry;
                    }
                    RetryState::RefreshedRetry => {
                        warn!(
                            "credentials rejected twice for session '{}'; terminating session",
                            session_id
                        );
                        self.lifecycle.invalidate(session_id);
                        return Err(GatewayError::SessionExpired);
                    }
                },
                Err(e) => return Err(e),
            }
        }
    }
}

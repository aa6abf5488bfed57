//! Gateway manager: discovery, access control, and call routing.
//!
//! Sits between the chat orchestrator and the per-server transports. Loads a
//! role's configuration lazily on first request, discovers tool catalogs
//! concurrently across the role's servers, intersects each server's
//! advertised tools with its configured allowlist (the access-control
//! boundary), and proxies authorized invocations to the owning transport.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{
    auth::Credentials,
    catalog::{ToolCatalogCache, ToolDescriptor},
    clock::{Clock, SystemClock},
    config::{RoleConfigLoader, Role, ServerConfig, TransportConfig},
    error::{GatewayError, GatewayResult},
    transport::{http::HttpTransport, stdio::StdioTransport, ToolTransport},
};

/// Connection lifecycle of one configured server.
///
/// `Degraded` means the last discovery round failed; the server's tools are
/// omitted until the next TTL-driven refresh retries it. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Uninitialized,
    Connecting,
    Ready,
    Degraded,
    Closed,
}

/// Builds a transport for a server config. Injected so tests can substitute
/// deterministic fakes.
pub trait TransportFactory: Send + Sync {
    fn create(&self, server: &ServerConfig) -> GatewayResult<Arc<dyn ToolTransport>>;
}

pub struct DefaultTransportFactory;

impl TransportFactory for DefaultTransportFactory {
    fn create(&self, server: &ServerConfig) -> GatewayResult<Arc<dyn ToolTransport>> {
        match &server.transport {
            TransportConfig::Http { url } => Ok(Arc::new(HttpTransport::new(
                &server.name,
                url,
                server.auth.clone(),
            )?)),
            TransportConfig::Stdio { command, args, envs } => Ok(Arc::new(StdioTransport::new(
                &server.name,
                command,
                args.clone(),
                envs.clone(),
            ))),
        }
    }
}

/// One configured server for one role: its config, transport, connection
/// state, and the names it advertised in the last successful round (kept to
/// distinguish "denied" from "unknown" on direct invocations).
pub struct ServerHandle {
    pub config: ServerConfig,
    transport: Arc<dyn ToolTransport>,
    state: parking_lot::Mutex<ServerState>,
    advertised: parking_lot::Mutex<HashSet<String>>,
}

impl ServerHandle {
    fn new(config: ServerConfig, transport: Arc<dyn ToolTransport>) -> Self {
        Self {
            config,
            transport,
            state: parking_lot::Mutex::new(ServerState::Uninitialized),
            advertised: parking_lot::Mutex::new(HashSet::new()),
        }
    }

    pub fn state(&self) -> ServerState {
        *self.state.lock()
    }

    fn set_state(&self, next: ServerState) {
        let mut state = self.state.lock();
        // Closed is terminal.
        if *state != ServerState::Closed {
            *state = next;
        }
    }
}

pub struct McpManager {
    loader: RoleConfigLoader,
    factory: Arc<dyn TransportFactory>,
    catalog: ToolCatalogCache,
    servers: DashMap<Role, Vec<Arc<ServerHandle>>>,
    closed: AtomicBool,
    in_flight: Arc<AtomicUsize>,
    grace_period: Duration,
}

impl McpManager {
    const DEFAULT_TOOL_TTL_SECS: i64 = 300;
    const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(2);

    pub fn new(loader: RoleConfigLoader) -> Self {
        Self::with_parts(
            loader,
            Arc::new(DefaultTransportFactory),
            Arc::new(SystemClock),
            chrono::Duration::seconds(Self::DEFAULT_TOOL_TTL_SECS),
        )
    }

    pub fn with_parts(
        loader: RoleConfigLoader,
        factory: Arc<dyn TransportFactory>,
        clock: Arc<dyn Clock>,
        tool_ttl: chrono::Duration,
    ) -> Self {
        Self {
            loader,
            factory,
            catalog: ToolCatalogCache::new(tool_ttl, clock),
            servers: DashMap::new(),
            closed: AtomicBool::new(false),
            in_flight: Arc::new(AtomicUsize::new(0)),
            grace_period: Self::DEFAULT_GRACE_PERIOD,
        }
    }

    pub fn set_grace_period(&mut self, grace_period: Duration) {
        self.grace_period = grace_period;
    }

    fn ensure_open(&self) -> GatewayResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(GatewayError::GatewayClosed)
        } else {
            Ok(())
        }
    }

    /// The role's access-filtered catalog: cached while younger than its TTL,
    /// otherwise rediscovered in one concurrent round across the role's
    /// servers. Concurrent cold-cache callers share a single round.
    pub async fn get_tools_for_role(&self, role: Role) -> GatewayResult<Vec<ToolDescriptor>> {
        self.ensure_open()?;
        let set = self
            .catalog
            .get_or_refresh(role, || self.discover_role(role))
            .await?;
        Ok(set.tools)
    }

    /// True iff `name` is in the role's current merged catalog. Used to
    /// reject invocations the agent names directly without discovery.
    pub async fn can_role_access_tool(&self, role: Role, name: &str) -> bool {
        match self.get_tools_for_role(role).await {
            Ok(tools) => tools.iter().any(|t| t.name == name),
            Err(e) => {
                debug!("access check for '{}'/'{}' failed: {}", role, name, e);
                false
            }
        }
    }

    /// Proxy one tool invocation to the owning server, re-checking access and
    /// applying the server's configured deadline. Caller-supplied credentials
    /// are injected for bearer-style downstream auth; otherwise the server's
    /// static secret from config applies.
    pub async fn call_tool(
        &self,
        role: Role,
        name: &str,
        args: Value,
        credentials: Option<&Credentials>,
    ) -> GatewayResult<Value> {
        self.ensure_open()?;
        let set = self
            .catalog
            .get_or_refresh(role, || self.discover_role(role))
            .await?;

        let Some(owner) = set.owner_of(name).map(str::to_string) else {
            return Err(self.classify_unknown_tool(role, name).await);
        };

        let handles = self.handles_for_role(role).await?;
        let handle = handles
            .iter()
            .find(|h| h.config.name == owner)
            .ok_or_else(|| GatewayError::ToolNotFound(name.to_string()))?;

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let in_flight = Arc::clone(&self.in_flight);
        let _flight = scopeguard::guard((), move |()| {
            in_flight.fetch_sub(1, Ordering::SeqCst);
        });

        let bearer = credentials.map(|c| c.session_token.as_str());
        let deadline = Duration::from_secs(handle.config.timeout_secs);
        debug!("calling '{}' on server '{}' for role '{}'", name, owner, role);

        match tokio::time::timeout(deadline, handle.transport.call_tool(name, args, bearer)).await
        {
            Ok(result) => result,
            Err(_) => Err(GatewayError::UpstreamTimeout { server: owner }),
        }
    }

    /// Distinguish "a server advertises this but the role's allowlist denies
    /// it" from "no server for this role knows the name".
    async fn classify_unknown_tool(&self, role: Role, name: &str) -> GatewayError {
        let Ok(handles) = self.handles_for_role(role).await else {
            return GatewayError::ToolNotFound(name.to_string());
        };
        let advertised = handles
            .iter()
            .any(|h| h.advertised.lock().contains(name));
        let allowlisted = handles
            .iter()
            .any(|h| h.config.tools.iter().any(|t| t == name));
        if advertised && !allowlisted {
            GatewayError::AccessDenied {
                role: role.to_string(),
                tool: name.to_string(),
            }
        } else {
            GatewayError::ToolNotFound(name.to_string())
        }
    }

    /// Drop the role's cached catalog and server handles so the next request
    /// reloads config and rediscovers. Hook for config changes.
    pub async fn invalidate_role(&self, role: Role) {
        self.catalog.invalidate(role);
        if let Some((_, handles)) = self.servers.remove(&role) {
            for handle in handles {
                handle.transport.close().await;
                handle.set_state(ServerState::Closed);
            }
            info!("released servers for role '{}'", role);
        }
    }

    /// Idempotent. Stops admitting calls, waits out a bounded grace period
    /// for in-flight invocations, then drives every server to `Closed`.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let deadline = tokio::time::Instant::now() + self.grace_period;
        while self.in_flight.load(Ordering::SeqCst) > 0
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        let stranded = self.in_flight.load(Ordering::SeqCst);
        if stranded > 0 {
            warn!("shutting down with {} call(s) still in flight", stranded);
        }

        let all_handles: Vec<Arc<ServerHandle>> = self
            .servers
            .iter()
            .flat_map(|entry| entry.value().clone())
            .collect();
        for handle in all_handles {
            handle.transport.close().await;
            handle.set_state(ServerState::Closed);
        }
        info!("gateway shut down");
    }

    pub fn stats(&self) -> ManagerStats {
        let roles = self
            .servers
            .iter()
            .map(|entry| RoleStats {
                role: *entry.key(),
                cached_tools: self
                    .catalog
                    .get_fresh(*entry.key())
                    .map(|s| s.tools.len())
                    .unwrap_or(0),
                servers: entry
                    .value()
                    .iter()
                    .map(|h| (h.config.name.clone(), h.state()))
                    .collect(),
            })
            .collect();
        ManagerStats { roles }
    }

    async fn handles_for_role(&self, role: Role) -> GatewayResult<Vec<Arc<ServerHandle>>> {
        if let Some(existing) = self.servers.get(&role) {
            return Ok(existing.clone());
        }

        let config = self.loader.load(role).await?;
        let mut handles = Vec::with_capacity(config.servers.len());
        for server in config.servers {
            let transport = self.factory.create(&server)?;
            handles.push(Arc::new(ServerHandle::new(server, transport)));
        }
        // A racing caller may have inserted first; keep whichever won.
        Ok(self.servers.entry(role).or_insert(handles).clone())
    }

    /// One concurrent discovery round across the role's servers, each bounded
    /// by its configured deadline. A failing or unresponsive server degrades
    /// (its tools are omitted and retried next cycle); a name collision
    /// between two servers is a configuration error.
    async fn discover_role(&self, role: Role) -> GatewayResult<Vec<ToolDescriptor>> {
        let handles = self.handles_for_role(role).await?;
        info!(
            "discovering tools for role '{}' across {} server(s)",
            role,
            handles.len()
        );

        let rounds = handles.iter().map(|handle| {
            let handle = Arc::clone(handle);
            async move {
                handle.set_state(ServerState::Connecting);
                let deadline = Duration::from_secs(handle.config.timeout_secs);
                match tokio::time::timeout(deadline, handle.transport.list_tools()).await {
                    Ok(Ok(advertised)) => {
                        handle.set_state(ServerState::Ready);
                        Some((handle, advertised))
                    }
                    Ok(Err(e)) => {
                        warn!(
                            "discovery failed for server '{}': {} - omitting its tools this round",
                            handle.config.name, e
                        );
                        handle.set_state(ServerState::Degraded);
                        None
                    }
                    Err(_) => {
                        warn!(
                            "discovery timed out for server '{}' after {}s - omitting its tools this round",
                            handle.config.name, handle.config.timeout_secs
                        );
                        handle.set_state(ServerState::Degraded);
                        None
                    }
                }
            }
        });
        let results = futures::future::join_all(rounds).await;

        let mut merged: Vec<ToolDescriptor> = Vec::new();
        let mut owners: HashMap<String, String> = HashMap::new();
        for (handle, advertised) in results.into_iter().flatten() {
            let allowlist: HashSet<&str> =
                handle.config.tools.iter().map(String::as_str).collect();
            *handle.advertised.lock() = advertised.iter().map(|t| t.name.clone()).collect();

            let total = advertised.len();
            let mut kept = 0usize;
            for mut tool in advertised {
                if !allowlist.contains(tool.name.as_str()) {
                    continue;
                }
                if let Some(previous) = owners.get(&tool.name) {
                    return Err(GatewayError::ToolCollision {
                        tool_name: tool.name,
                        servers: vec![previous.clone(), handle.config.name.clone()],
                    });
                }
                owners.insert(tool.name.clone(), handle.config.name.clone());
                tool.server = handle.config.name.clone();
                merged.push(tool);
                kept += 1;
            }
            info!(
                "server '{}': {} advertised, {} allowlisted for role '{}'",
                handle.config.name, total, kept, role
            );
        }
        Ok(merged)
    }
}

/// Operator-facing snapshot of the manager.
#[derive(Debug, Clone)]
pub struct ManagerStats {
    pub roles: Vec<RoleStats>,
}

#[derive(Debug, Clone)]
pub struct RoleStats {
    pub role: Role,
    pub cached_tools: usize,
    pub servers: Vec<(String, ServerState)>,
}

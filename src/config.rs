//! Role configuration types and loading.
//!
//! Each role has one JSON document describing the tool servers it may reach
//! and, per server, the explicit allowlist of tool names it may see. Secret
//! material is never written into the documents; string fields reference
//! environment variables with `${VAR}` tokens that are resolved at load time.

use std::{collections::HashMap, fmt, path::PathBuf, str::FromStr, sync::OnceLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, GatewayResult};

/// Fixed set of personas the gateway serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Guest,
    FrontDesk,
    Manager,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::Guest, Role::FrontDesk, Role::Manager];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Guest => "guest",
            Role::FrontDesk => "front_desk",
            Role::Manager => "manager",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "guest" => Ok(Role::Guest),
            "front_desk" => Ok(Role::FrontDesk),
            "manager" => Ok(Role::Manager),
            other => Err(GatewayError::ConfigValidation(format!(
                "unknown role '{}'",
                other
            ))),
        }
    }
}

/// Per-role configuration document.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RoleConfig {
    pub role: Role,
    pub servers: Vec<ServerConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Unique within a role.
    pub name: String,

    #[serde(flatten)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    /// Explicit allowlist of tool names this server may expose for the role.
    /// A server advertising tools outside this list never surfaces them.
    #[serde(default)]
    pub tools: Vec<String>,

    /// Per-server call deadline (seconds).
    #[serde(default = "default_timeout_secs", rename = "timeout")]
    pub timeout_secs: u64,
}

#[derive(Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    Http {
        url: String,
    },
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        envs: HashMap<String, String>,
    },
}

impl fmt::Debug for TransportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportConfig::Http { url } => f.debug_struct("Http").field("url", url).finish(),
            TransportConfig::Stdio { command, args, envs } => f
                .debug_struct("Stdio")
                .field("command", command)
                .field("args", args)
                .field("envs", &format!("{} vars", envs.len()))
                .finish(),
        }
    }
}

/// Auth descriptor for a server. The `secretRef` document key typically holds
/// a `${VAR}` token; after loading, `secret` holds the resolved material.
#[derive(Clone, Default, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AuthConfig {
    #[default]
    None,
    Bearer {
        #[serde(rename = "secretRef")]
        secret: String,
    },
    Basic {
        #[serde(rename = "secretRef")]
        secret: String,
    },
    /// Vendor-specific custom header (e.g. `X-API-Key`).
    Header {
        name: String,
        #[serde(rename = "secretRef")]
        secret: String,
    },
}

impl AuthConfig {
    pub fn is_none(&self) -> bool {
        matches!(self, AuthConfig::None)
    }
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthConfig::None => f.write_str("None"),
            AuthConfig::Bearer { .. } => f.debug_struct("Bearer").field("secret", &"****").finish(),
            AuthConfig::Basic { .. } => f.debug_struct("Basic").field("secret", &"****").finish(),
            AuthConfig::Header { name, .. } => f
                .debug_struct("Header")
                .field("name", name)
                .field("secret", &"****")
                .finish(),
        }
    }
}

fn default_timeout_secs() -> u64 {
    30
}

fn secret_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("secret reference pattern")
    })
}

/// Replace every `${VAR}` token with the live environment value.
/// A missing variable is an error; the literal placeholder must never be
/// sent upstream.
fn interpolate(input: &str, server: &str) -> GatewayResult<String> {
    let mut out = String::with_capacity(input.len());
    let mut last = 0;
    for caps in secret_pattern().captures_iter(input) {
        let whole = caps.get(0).map(|m| (m.start(), m.end())).unwrap_or((0, 0));
        let var = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        out.push_str(&input[last..whole.0]);
        match std::env::var(var) {
            Ok(value) => out.push_str(&value),
            Err(_) => {
                return Err(GatewayError::MissingSecret {
                    var: var.to_string(),
                    server: server.to_string(),
                })
            }
        }
        last = whole.1;
    }
    out.push_str(&input[last..]);
    Ok(out)
}

impl ServerConfig {
    fn resolve_secrets(&mut self) -> GatewayResult<()> {
        let name = self.name.clone();
        match &mut self.transport {
            TransportConfig::Http { url } => *url = interpolate(url, &name)?,
            TransportConfig::Stdio { command, args, envs } => {
                *command = interpolate(command, &name)?;
                for arg in args.iter_mut() {
                    *arg = interpolate(arg, &name)?;
                }
                for value in envs.values_mut() {
                    *value = interpolate(value, &name)?;
                }
            }
        }
        match &mut self.auth {
            AuthConfig::None => {}
            AuthConfig::Bearer { secret }
            | AuthConfig::Basic { secret }
            | AuthConfig::Header { secret, .. } => *secret = interpolate(secret, &name)?,
        }
        Ok(())
    }

    fn validate(&self) -> GatewayResult<()> {
        if self.name.trim().is_empty() {
            return Err(GatewayError::ConfigValidation(
                "server name must not be empty".to_string(),
            ));
        }
        if self.timeout_secs == 0 {
            return Err(GatewayError::ConfigValidation(format!(
                "server '{}': timeout must be positive",
                self.name
            )));
        }
        match &self.transport {
            TransportConfig::Http { url } => {
                let parsed = url::Url::parse(url).map_err(|e| {
                    GatewayError::ConfigValidation(format!(
                        "server '{}': invalid url '{}': {}",
                        self.name, url, e
                    ))
                })?;
                if !matches!(parsed.scheme(), "http" | "https") {
                    return Err(GatewayError::ConfigValidation(format!(
                        "server '{}': unsupported url scheme '{}'",
                        self.name,
                        parsed.scheme()
                    )));
                }
            }
            TransportConfig::Stdio { command, .. } => {
                if command.trim().is_empty() {
                    return Err(GatewayError::ConfigValidation(format!(
                        "server '{}': stdio command must not be empty",
                        self.name
                    )));
                }
            }
        }
        Ok(())
    }
}

impl RoleConfig {
    /// Interpolate secrets and enforce structural invariants.
    pub fn finalize(mut self, expected_role: Role) -> GatewayResult<Self> {
        if self.role != expected_role {
            return Err(GatewayError::ConfigValidation(format!(
                "document declares role '{}' but was loaded for '{}'",
                self.role, expected_role
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for server in &mut self.servers {
            server.resolve_secrets()?;
            server.validate()?;
            if !seen.insert(server.name.clone()) {
                return Err(GatewayError::ConfigValidation(format!(
                    "duplicate server name '{}' for role '{}'",
                    server.name, self.role
                )));
            }
        }
        Ok(self)
    }
}

/// Loads and validates one role configuration document per request.
///
/// Holds no cache: reloading a role means calling [`RoleConfigLoader::load`]
/// again. No side effects beyond reading the file and the environment.
#[derive(Debug, Clone)]
pub struct RoleConfigLoader {
    config_dir: PathBuf,
}

impl RoleConfigLoader {
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
        }
    }

    pub fn config_path(&self, role: Role) -> PathBuf {
        self.config_dir.join(format!("{}.json", role))
    }

    pub async fn load(&self, role: Role) -> GatewayResult<RoleConfig> {
        let path = self.config_path(role);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(GatewayError::ConfigNotFound(role.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let config: RoleConfig = serde_json::from_str(&raw).map_err(|e| {
            GatewayError::ConfigValidation(format!("{}: {}", path.display(), e))
        })?;
        config.finalize(role)
    }
}

//! Core types for role tool catalogs.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One tool as surfaced to the chat agent, with its owning server.
///
/// The wire shape (`tools/list` items) carries `name`, `description`, and
/// `inputSchema`; the owning `server` is attached by the gateway after
/// discovery and never comes from the upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default = "empty_schema")]
    pub input_schema: Value,

    /// Name of the [`crate::config::ServerConfig`] that advertised this tool.
    #[serde(default)]
    pub server: String,
}

fn empty_schema() -> Value {
    Value::Object(serde_json::Map::new())
}

/// A role's merged, access-filtered catalog plus its freshness stamp.
#[derive(Debug, Clone)]
pub struct CachedToolSet {
    pub tools: Vec<ToolDescriptor>,
    pub fetched_at: DateTime<Utc>,
    pub ttl: Duration,
}

impl CachedToolSet {
    pub fn new(tools: Vec<ToolDescriptor>, fetched_at: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            tools,
            fetched_at,
            ttl,
        }
    }

    /// Never serve past `fetched_at + ttl` without a refresh attempt.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now < self.fetched_at + self.ttl
    }

    pub fn contains(&self, tool_name: &str) -> bool {
        self.tools.iter().any(|t| t.name == tool_name)
    }

    /// Owning server of a tool in this catalog, if present.
    pub fn owner_of(&self, tool_name: &str) -> Option<&str> {
        self.tools
            .iter()
            .find(|t| t.name == tool_name)
            .map(|t| t.server.as_str())
    }
}

//! Downstream credential exchange and per-session caching.
//!
//! Tool servers that enforce their own auth accept short-lived credentials,
//! not the user's identity token. The broker exchanges a valid identity token
//! for such a credential set and caches it per session until it approaches
//! expiry or is invalidated (session end, downstream rejection).

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use url::Url;

use crate::{
    clock::Clock,
    error::{GatewayError, GatewayResult},
};

/// Short-lived credential set for downstream tool servers.
#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: String,
    pub expiration: DateTime<Utc>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"***")
            .field("session_token", &"***")
            .field("expiration", &self.expiration)
            .finish()
    }
}

#[async_trait]
pub trait CredentialExchanger: Send + Sync {
    async fn exchange(&self, identity_token: &str) -> GatewayResult<Credentials>;
}

/// Exchanges against the credential vendor's HTTP endpoint. Any non-2xx
/// answer means the identity token was not honored.
pub struct HttpCredentialExchanger {
    url: Url,
    client: reqwest::Client,
}

impl HttpCredentialExchanger {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl CredentialExchanger for HttpCredentialExchanger {
    async fn exchange(&self, identity_token: &str) -> GatewayResult<Credentials> {
        let resp = self
            .client
            .post(self.url.clone())
            .json(&serde_json::json!({ "identityToken": identity_token }))
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(GatewayError::ExchangeRejected(format!(
                "{}: {}",
                status, body
            )));
        }
        Ok(resp.json().await?)
    }
}

pub struct CredentialBroker {
    exchanger: Arc<dyn CredentialExchanger>,
    clock: Arc<dyn Clock>,
    expiry_buffer: Duration,
    cache: DashMap<String, Credentials>,
    exchange_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl CredentialBroker {
    const DEFAULT_EXPIRY_BUFFER_SECS: i64 = 60;

    pub fn new(exchanger: Arc<dyn CredentialExchanger>, clock: Arc<dyn Clock>) -> Self {
        Self {
            exchanger,
            clock,
            expiry_buffer: Duration::seconds(Self::DEFAULT_EXPIRY_BUFFER_SECS),
            cache: DashMap::new(),
            exchange_locks: DashMap::new(),
        }
    }

    pub fn set_expiry_buffer(&mut self, buffer: Duration) {
        self.expiry_buffer = buffer;
    }

    /// Credentials for the session, exchanged on first use and served from
    /// cache until they approach expiry. Concurrent cold callers share one
    /// exchange.
    pub async fn get(&self, session_id: &str, identity_token: &str) -> GatewayResult<Credentials> {
        if let Some(cached) = self.cached(session_id) {
            return Ok(cached);
        }

        let lock = self.exchange_lock(session_id);
        let _guard = lock.lock().await;

        if let Some(cached) = self.cached(session_id) {
            return Ok(cached);
        }

        let credentials = self.exchanger.exchange(identity_token).await.map_err(|e| {
            warn!("credential exchange failed for session '{}': {}", session_id, e);
            e
        })?;
        debug!(
            "exchanged credentials for session '{}' (expire {})",
            session_id, credentials.expiration
        );
        self.cache
            .insert(session_id.to_string(), credentials.clone());
        Ok(credentials)
    }

    /// Drop the session's cached credentials so the next call re-exchanges.
    /// Wired to the session lifecycle's invalidation callback and invoked
    /// directly when a downstream server rejects the set mid-call.
    pub fn invalidate(&self, session_id: &str) {
        if self.cache.remove(session_id).is_some() {
            debug!("dropped cached credentials for session '{}'", session_id);
        }
        self.exchange_locks.remove(session_id);
    }

    fn cached(&self, session_id: &str) -> Option<Credentials> {
        let entry = self.cache.get(session_id)?;
        if self.clock.now() + self.expiry_buffer < entry.expiration {
            Some(entry.clone())
        } else {
            None
        }
    }

    fn exchange_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        self.exchange_locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

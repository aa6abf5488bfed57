//! Chat sessions and identity-token refresh.
//!
//! A session binds a user, their role, and the identity token presented by
//! the auth provider. [`SessionTokenLifecycle::get_valid_token`] is the only
//! way callers obtain that token: it refreshes proactively once the token
//! enters the buffer window before expiry, coalesces concurrent refreshes per
//! session, and terminates the session instead of ever handing out a token
//! it could not refresh.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::{
    clock::Clock,
    config::Role,
    error::{GatewayError, GatewayResult},
};

#[derive(Clone)]
pub struct Session {
    pub session_id: String,
    pub user_id: String,
    pub role: Role,
    pub identity_token: String,
    pub access_token: String,
    /// Longer-lived token used to mint new identity/access tokens. Assumed
    /// single-use, which is why concurrent refreshes must share one attempt.
    pub refresh_token: String,
    pub token_expiry: DateTime<Utc>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id)
            .field("user_id", &self.user_id)
            .field("role", &self.role)
            .field("identity_token", &"***")
            .field("access_token", &"***")
            .field("refresh_token", &"***")
            .field("token_expiry", &self.token_expiry)
            .finish()
    }
}

/// Token material presented at login.
#[derive(Clone)]
pub struct SessionTokens {
    pub identity_token: String,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

/// Session persistence seam. The in-memory store is the default; a shared
/// deployment would put a remote store behind this.
pub trait SessionStore: Send + Sync {
    fn get(&self, session_id: &str) -> Option<Session>;
    fn put(&self, session: Session);
    fn delete(&self, session_id: &str) -> Option<Session>;
}

#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: DashMap<String, Session>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for InMemorySessionStore {
    fn get(&self, session_id: &str) -> Option<Session> {
        self.sessions.get(session_id).map(|s| s.clone())
    }

    fn put(&self, session: Session) {
        self.sessions.insert(session.session_id.clone(), session);
    }

    fn delete(&self, session_id: &str) -> Option<Session> {
        self.sessions.remove(session_id).map(|(_, s)| s)
    }
}

/// Fresh token material as returned by the auth provider.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshedTokens {
    pub identity_token: String,
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

/// Mints new tokens off the session's stored refresh token.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, session: &Session) -> GatewayResult<RefreshedTokens>;
}

/// Refreshes against the auth provider's HTTP endpoint.
pub struct HttpTokenRefresher {
    url: Url,
    client: reqwest::Client,
}

impl HttpTokenRefresher {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl TokenRefresher for HttpTokenRefresher {
    async fn refresh(&self, session: &Session) -> GatewayResult<RefreshedTokens> {
        let resp = self
            .client
            .post(self.url.clone())
            .json(&serde_json::json!({
                "sessionId": session.session_id,
                "refreshToken": session.refresh_token,
            }))
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(GatewayError::Upstream {
                code: i64::from(status.as_u16()),
                message: body,
            });
        }
        Ok(resp.json().await?)
    }
}

type InvalidationCallback = Arc<dyn Fn(&str) + Send + Sync>;

pub struct SessionTokenLifecycle {
    store: Arc<dyn SessionStore>,
    refresher: Arc<dyn TokenRefresher>,
    clock: Arc<dyn Clock>,
    refresh_buffer: Duration,
    refresh_locks: DashMap<String, Arc<Mutex<()>>>,
    invalidation_callback: Option<InvalidationCallback>,
}

impl SessionTokenLifecycle {
    const DEFAULT_REFRESH_BUFFER_SECS: i64 = 300;

    pub fn new(
        store: Arc<dyn SessionStore>,
        refresher: Arc<dyn TokenRefresher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            refresher,
            clock,
            refresh_buffer: Duration::seconds(Self::DEFAULT_REFRESH_BUFFER_SECS),
            refresh_locks: DashMap::new(),
            invalidation_callback: None,
        }
    }

    pub fn set_refresh_buffer(&mut self, buffer: Duration) {
        self.refresh_buffer = buffer;
    }

    /// Registered callback fires whenever a session is invalidated, so
    /// dependent caches (downstream credentials) can be dropped in lockstep.
    pub fn set_invalidation_callback<F>(&mut self, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.invalidation_callback = Some(Arc::new(callback));
    }

    pub fn create_session(&self, user_id: &str, role: Role, tokens: SessionTokens) -> Session {
        let session = Session {
            session_id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            role,
            identity_token: tokens.identity_token,
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            token_expiry: tokens.expires_at,
        };
        info!(
            "created session '{}' for user '{}' with role '{}'",
            session.session_id, user_id, role
        );
        self.store.put(session.clone());
        session
    }

    pub fn get_session(&self, session_id: &str) -> Option<Session> {
        self.store.get(session_id)
    }

    /// A usable identity token for the session, or `None` when the session
    /// no longer exists or could not be refreshed. A token still outside the
    /// buffer window is returned as-is; one inside it is refreshed first,
    /// with concurrent callers sharing a single refresh. A stale token is
    /// never returned.
    pub async fn get_valid_token(&self, session_id: &str) -> GatewayResult<Option<String>> {
        let Some(session) = self.store.get(session_id) else {
            return Ok(None);
        };
        if self.outside_buffer(&session) {
            return Ok(Some(session.identity_token));
        }

        let lock = self.refresh_lock(session_id);
        let _guard = lock.lock().await;

        // A queued caller may find the token already renewed.
        let Some(session) = self.store.get(session_id) else {
            return Ok(None);
        };
        if self.outside_buffer(&session) {
            return Ok(Some(session.identity_token));
        }

        match self.refresher.refresh(&session).await {
            Ok(renewed) => {
                debug!(
                    "refreshed tokens for session '{}' (expires {})",
                    session_id, renewed.expires_at
                );
                let mut updated = session;
                updated.identity_token = renewed.identity_token.clone();
                updated.access_token = renewed.access_token;
                if let Some(rotated) = renewed.refresh_token {
                    updated.refresh_token = rotated;
                }
                updated.token_expiry = renewed.expires_at;
                self.store.put(updated);
                Ok(Some(renewed.identity_token))
            }
            Err(e) => {
                warn!(
                    "token refresh failed for session '{}': {}; terminating session",
                    session_id, e
                );
                self.invalidate(session_id);
                Ok(None)
            }
        }
    }

    /// Delete the session and notify dependents. Used on refresh failure,
    /// repeated downstream auth rejection, and logout.
    pub fn invalidate(&self, session_id: &str) {
        if self.store.delete(session_id).is_some() {
            info!("invalidated session '{}'", session_id);
        }
        self.refresh_locks.remove(session_id);
        if let Some(callback) = &self.invalidation_callback {
            callback(session_id);
        }
    }

    pub fn logout(&self, session_id: &str) {
        self.invalidate(session_id);
    }

    fn outside_buffer(&self, session: &Session) -> bool {
        self.clock.now() + self.refresh_buffer < session.token_expiry
    }

    fn refresh_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        self.refresh_locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

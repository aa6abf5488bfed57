//! Session, token, and credential management.
//!
//! Three cooperating layers keep downstream tool calls authenticated without
//! ever surfacing a stale secret:
//!
//! - [`session`]: chat sessions and the identity-token refresh lifecycle.
//!   Tokens are refreshed proactively inside a buffer window before expiry;
//!   a failed refresh terminates the session rather than serving what it has.
//! - [`broker`]: exchanges a valid identity token for short-lived downstream
//!   credentials and caches them per session.
//! - [`retry`]: the one-shot refresh-and-retry policy applied when a
//!   downstream server rejects credentials mid-call.

pub mod broker;
pub mod retry;
pub mod session;

pub use broker::{CredentialBroker, CredentialExchanger, Credentials, HttpCredentialExchanger};
pub use retry::{AuthedToolCaller, ToolInvoker};
pub use session::{
    HttpTokenRefresher, InMemorySessionStore, RefreshedTokens, Session, SessionStore,
    SessionTokenLifecycle, SessionTokens, TokenRefresher,
};

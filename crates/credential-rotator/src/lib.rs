//! Outbound API-credential rotation
//!
//! Spreads requests to a rate-limited third-party API across a pool of
//! client credentials. Each request scope (a named class of API operation)
//! gets its own round-robin pool, token cache, and throttle state, because a
//! throttle on one operation says nothing about another.
//!
//! Request flow:
//! 1. `Dispatcher::request()` asks `get_token()` for a bearer token for the scope
//! 2. `get_token()` reuses the current credential's cached token, or walks the
//!    scope's pool, skipping credentials the shared status file marks as
//!    throttled, and performs a client-credentials exchange
//! 3. After a fresh exchange the capability probe classifies every scope for
//!    that credential and the results are written to the status file
//! 4. A 429 degrades the credential for the upstream cooldown, persists
//!    `Rate-Limited: <deadline>`, and the request is retried on the next credential
//! 5. A 404 is returned as `Fetched::NotFound`, never as an error

pub mod config;
pub mod credentials;
pub mod dispatcher;
pub mod error;
pub mod probe;
pub mod status;
pub mod throttle;
pub mod token;

pub use config::{DispatchConfig, ScopeMap};
pub use credentials::Credential;
pub use dispatcher::{Dispatcher, Fetched, Lease};
pub use error::{Error, Result};
pub use status::{ScopeStatus, StatusLabel, StatusRecord, StatusStore, StatusTable};
pub use throttle::{Outcome, RetryAfterPolicy, classify_status};
pub use token::{AccessToken, Exchange, exchange_client_credentials};

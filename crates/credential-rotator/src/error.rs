//! Error types for outbound dispatch

/// Errors from credential rotation and dispatched requests.
///
/// Absence (HTTP 404) is not an error: it is reported as `Fetched::NotFound`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Every credential for the scope is throttled, failed, or excluded.
    #[error("no credentials available for scope {scope}")]
    NoCredentialsAvailable { scope: String },

    #[error("unknown request scope: {0}")]
    UnknownScope(String),

    /// The upstream kept throttling until the retry budget ran out.
    #[error("scope {scope} still throttled after {attempts} attempts")]
    RetriesExhausted { scope: String, attempts: u32 },

    /// Non-retryable HTTP status from the upstream API.
    #[error("upstream returned {status} for {url}")]
    Upstream { status: u16, url: String },

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("status store error: {0}")]
    StatusStore(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl From<common::Error> for Error {
    fn from(err: common::Error) -> Self {
        Error::Config(err.to_string())
    }
}

/// Result alias for dispatch operations.
pub type Result<T> = std::result::Result<T, Error>;

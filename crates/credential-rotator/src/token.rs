//! Client-credentials token exchange
//!
//! POSTs `grant_type=client_credentials` to the token endpoint with the
//! credential as HTTP Basic auth. A throttled exchange is not an error: it is
//! reported as `Exchange::RateLimited` so the caller can rotate.

use std::time::Duration;

use common::Secret;
use serde::Deserialize;
use tokio::time::Instant;
use tracing::debug;

use crate::credentials::Credential;
use crate::error::{Error, Result};
use crate::throttle::RetryAfterPolicy;

/// Tokens are treated as expired this long before the server says so.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Successful token endpoint response.
#[derive(Debug, Clone, Deserialize)]
pub struct AccessToken {
    pub access_token: Secret<String>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    /// Seconds until expiry, relative to the response
    #[serde(default)]
    pub expires_in: Option<u64>,
}

fn default_token_type() -> String {
    "Bearer".into()
}

impl AccessToken {
    /// A bearer token obtained elsewhere, with no known expiry.
    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            access_token: Secret::new(token.into()),
            token_type: default_token_type(),
            expires_in: None,
        }
    }

    /// Whether a token obtained at `obtained_at` is still usable at `now`.
    ///
    /// Tokens without `expires_in` never expire locally; a 401 will evict them.
    pub fn is_fresh(&self, obtained_at: Instant, now: Instant) -> bool {
        match self.expires_in {
            None => true,
            Some(secs) => {
                let lifetime = Duration::from_secs(secs).saturating_sub(EXPIRY_MARGIN);
                now.saturating_duration_since(obtained_at) < lifetime
            }
        }
    }
}

/// Result of one exchange attempt.
#[derive(Debug)]
pub enum Exchange {
    Granted(AccessToken),
    /// 429 from the token endpoint
    RateLimited { retry_after: Duration },
    /// Any other non-success status
    Rejected { status: u16 },
}

/// Exchange a credential for an access token.
///
/// Transport failures and undecodable success bodies are errors; HTTP-level
/// refusals are `Exchange` variants.
pub async fn exchange_client_credentials(
    client: &reqwest::Client,
    token_url: &str,
    credential: &Credential,
    retry_policy: &RetryAfterPolicy,
) -> Result<Exchange> {
    let response = client
        .post(token_url)
        .basic_auth(&credential.client_id, Some(credential.client_secret.expose()))
        .form(&[("grant_type", "client_credentials")])
        .send()
        .await
        .map_err(|e| Error::Http(format!("token exchange request failed: {e}")))?;

    let status = response.status().as_u16();
    if status == 429 {
        let retry_after = retry_policy.from_headers(response.headers());
        return Ok(Exchange::RateLimited { retry_after });
    }
    if !response.status().is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));
        debug!(client_id = %credential.client_id, status, body, "token endpoint refused credential");
        return Ok(Exchange::Rejected { status });
    }

    let token = response
        .json::<AccessToken>()
        .await
        .map_err(|e| Error::Http(format!("invalid token response: {e}")))?;
    Ok(Exchange::Granted(token))
}

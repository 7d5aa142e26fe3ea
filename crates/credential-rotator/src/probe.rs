//! Capability probe
//!
//! After a fresh exchange, one lightweight GET per configured scope tells us
//! right away which operations the credential can perform. A 404 counts as
//! usable, since only the probed resource is missing. A 429 here is recorded
//! with its deadline but never slept on.

use std::collections::BTreeMap;

use futures_util::future::join_all;
use tracing::{debug, warn};

use crate::config::{ScopeMap, render_template};
use crate::status::StatusLabel;
use crate::throttle::{Outcome, RetryAfterPolicy, classify_status};
use crate::token::AccessToken;

/// Classify every scope for one token.
///
/// Scopes whose probe fails at the transport level are left out of the result,
/// so an existing label is not overwritten by a network blip.
pub async fn probe_scopes(
    client: &reqwest::Client,
    scopes: &ScopeMap,
    params: &BTreeMap<String, String>,
    token: &AccessToken,
    retry_policy: &RetryAfterPolicy,
) -> BTreeMap<String, StatusLabel> {
    let probes = scopes.iter().map(|(scope, template)| {
        let url = render_template(template, params);
        async move {
            let label = probe_one(client, &url, token, retry_policy).await;
            (scope.to_string(), label)
        }
    });

    join_all(probes)
        .await
        .into_iter()
        .filter_map(|(scope, label)| label.map(|label| (scope, label)))
        .collect()
}

async fn probe_one(
    client: &reqwest::Client,
    url: &str,
    token: &AccessToken,
    retry_policy: &RetryAfterPolicy,
) -> Option<StatusLabel> {
    let response = match client
        .get(url)
        .bearer_auth(token.access_token.expose())
        .send()
        .await
    {
        Ok(response) => response,
        Err(e) => {
            warn!(url, error = %e, "capability probe failed");
            return None;
        }
    };

    let status = response.status().as_u16();
    let label = match classify_status(status) {
        // Absence of the probed resource says nothing against the credential
        Outcome::Success | Outcome::NotFound => StatusLabel::Active,
        Outcome::Throttled => {
            StatusLabel::rate_limited_for(retry_policy.from_headers(response.headers()))
        }
        Outcome::Unauthorized | Outcome::Failed(_) => {
            StatusLabel::Error { code: status }
        }
    };
    debug!(url, status, label = %label, "capability probe");
    Some(label)
}

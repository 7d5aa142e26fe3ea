//! Outbound dispatcher
//!
//! One `Lane` per scope: a round-robin pool of all credentials plus the
//! tokens obtained for that scope. The lane's token lock is held for the whole
//! of `get_token`, so exchanges for one scope are mutually exclusive while
//! different scopes proceed independently. The lock is never held while the
//! dispatched request itself is in flight.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::Utc;
use metrics::counter;
use resource_pool::HealthSource;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{DispatchConfig, ScopeMap};
use crate::credentials::Credential;
use crate::error::{Error, Result};
use crate::probe::probe_scopes;
use crate::status::{StatusLabel, StatusStore, StatusTable};
use crate::throttle::{Outcome, RetryAfterPolicy, classify_status};
use crate::token::{AccessToken, Exchange, exchange_client_credentials};
use resource_pool::Pool;

/// Result of a dispatched request.
#[derive(Debug)]
pub enum Fetched {
    Found(reqwest::Response),
    /// The upstream answered 404
    NotFound,
}

/// A token together with the credential it belongs to.
#[derive(Debug, Clone)]
pub struct Lease {
    pub credential_id: String,
    pub token: AccessToken,
}

struct CachedToken {
    token: AccessToken,
    obtained_at: Instant,
}

impl CachedToken {
    fn is_fresh(&self, now: Instant) -> bool {
        self.token.is_fresh(self.obtained_at, now)
    }
}

struct Lane {
    pool: Pool<Credential>,
    tokens: Mutex<HashMap<String, CachedToken>>,
}

/// Credential-rotating HTTP dispatcher.
pub struct Dispatcher {
    client: reqwest::Client,
    config: DispatchConfig,
    retry_policy: RetryAfterPolicy,
    credentials: Vec<Credential>,
    lanes: HashMap<String, Lane>,
    store: StatusStore,
}

impl Dispatcher {
    pub fn new(config: DispatchConfig, credentials: Vec<Credential>) -> Result<Self> {
        if credentials.is_empty() {
            return Err(Error::Config("at least one credential is required".into()));
        }

        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| Error::Http(format!("failed to build HTTP client: {e}")))?;

        let lanes = config
            .scopes
            .names()
            .map(|scope| {
                let lane = Lane {
                    pool: Pool::new(scope, credentials.clone()),
                    tokens: Mutex::new(HashMap::new()),
                };
                (scope.to_string(), lane)
            })
            .collect();

        let store = StatusStore::new(config.dispatch.status_file.clone());
        let retry_policy = config.retry_policy();

        info!(
            scopes = config.scopes.len(),
            credentials = credentials.len(),
            status_file = %store.path().display(),
            "dispatcher ready"
        );

        Ok(Self {
            client,
            config,
            retry_policy,
            credentials,
            lanes,
            store,
        })
    }

    pub fn scopes(&self) -> &ScopeMap {
        &self.config.scopes
    }

    pub fn status_store(&self) -> &StatusStore {
        &self.store
    }

    fn lane(&self, scope: &str) -> Result<&Lane> {
        self.lanes
            .get(scope)
            .ok_or_else(|| Error::UnknownScope(scope.to_string()))
    }

    /// Bearer token for `scope`, rotating credentials as needed.
    ///
    /// Reuses the current credential's cached token while that credential is
    /// neither degraded in-process nor excluded by the status file. Otherwise
    /// walks the pool once, skipping persisted exclusions, and exchanges the
    /// first credential that yields a token.
    pub async fn get_token(&self, scope: &str) -> Result<Lease> {
        let lane = self.lane(scope)?;
        let mut tokens = lane.tokens.lock().await;
        let table = self.store.read().await;
        let status = table.for_scope(scope, Utc::now());

        if let Some(current) = lane.pool.current().await {
            let id = current.client_id.as_str();
            if lane.pool.is_eligible(id).await && status.eligible(id) {
                if let Some(cached) = tokens.get(id).filter(|c| c.is_fresh(Instant::now())) {
                    return Ok(Lease {
                        credential_id: id.to_string(),
                        token: cached.token.clone(),
                    });
                }
            }
        }

        let mut tried: HashSet<String> = HashSet::new();
        for _ in 0..lane.pool.len().await {
            let candidate = {
                let tried = &tried;
                let skip_excluded = |id: &str| !tried.contains(id) && status.eligible(id);
                lane.pool.select_where(&skip_excluded).await
            };
            let credential = match candidate {
                Ok(credential) => credential,
                Err(e) => {
                    debug!(scope, error = %e, "no eligible credential left");
                    break;
                }
            };
            let id = credential.client_id.clone();
            tried.insert(id.clone());

            if let Some(cached) = tokens.get(&id).filter(|c| c.is_fresh(Instant::now())) {
                return Ok(Lease {
                    credential_id: id,
                    token: cached.token.clone(),
                });
            }

            match exchange_client_credentials(
                &self.client,
                &self.config.dispatch.token_url,
                &credential,
                &self.retry_policy,
            )
            .await
            {
                Ok(Exchange::Granted(token)) => {
                    counter!("dispatch_token_exchanges_total", "outcome" => "granted").increment(1);
                    info!(scope, credential_id = %id, "token exchanged");
                    lane.pool.mark_healthy(&id).await;
                    tokens.insert(
                        id.clone(),
                        CachedToken {
                            token: token.clone(),
                            obtained_at: Instant::now(),
                        },
                    );

                    let labels = if self.config.dispatch.probe_on_exchange {
                        probe_scopes(
                            &self.client,
                            &self.config.scopes,
                            &self.config.probe_params,
                            &token,
                            &self.retry_policy,
                        )
                        .await
                    } else {
                        BTreeMap::from([(scope.to_string(), StatusLabel::Active)])
                    };
                    if let Err(e) = self.store.upsert_many(&id, labels).await {
                        warn!(credential_id = %id, error = %e, "failed to persist probe results");
                    }

                    return Ok(Lease {
                        credential_id: id,
                        token,
                    });
                }
                Ok(Exchange::RateLimited { retry_after }) => {
                    counter!("dispatch_token_exchanges_total", "outcome" => "rate_limited")
                        .increment(1);
                    warn!(
                        scope,
                        credential_id = %id,
                        retry_after_secs = retry_after.as_secs(),
                        "token exchange rate limited"
                    );
                    lane.pool.mark_degraded_for(&id, retry_after).await;
                    tokens.remove(&id);
                    self.persist(&id, scope, StatusLabel::rate_limited_for(retry_after))
                        .await;
                }
                Ok(Exchange::Rejected { status }) => {
                    counter!("dispatch_token_exchanges_total", "outcome" => "rejected").increment(1);
                    warn!(scope, credential_id = %id, status, "token exchange rejected");
                    tokens.remove(&id);
                    self.persist(&id, scope, StatusLabel::Error { code: status })
                        .await;
                }
                Err(e) => {
                    counter!("dispatch_token_exchanges_total", "outcome" => "error").increment(1);
                    warn!(scope, credential_id = %id, error = %e, "token exchange failed");
                }
            }
        }

        Err(Error::NoCredentialsAvailable {
            scope: scope.to_string(),
        })
    }

    /// GET `url` under `scope`, retrying on another credential when throttled.
    pub async fn request(&self, url: &str, scope: &str) -> Result<Fetched> {
        let lane = self.lane(scope)?;
        let max_retries = self.config.dispatch.max_retries;

        for attempt in 1..=max_retries {
            let lease = self.get_token(scope).await?;
            let response = self
                .client
                .get(url)
                .bearer_auth(lease.token.access_token.expose())
                .send()
                .await
                .map_err(|e| Error::Http(format!("request to {url} failed: {e}")))?;

            let status = response.status().as_u16();
            match classify_status(status) {
                Outcome::Success => {
                    lane.pool.mark_healthy(&lease.credential_id).await;
                    self.confirm_active(&lease.credential_id, scope).await;
                    return Ok(Fetched::Found(response));
                }
                Outcome::NotFound => {
                    debug!(url, scope, "resource not found");
                    return Ok(Fetched::NotFound);
                }
                Outcome::Throttled => {
                    let retry_after = self.retry_policy.from_headers(response.headers());
                    counter!("dispatch_throttled_total", "scope" => scope.to_string()).increment(1);
                    warn!(
                        scope,
                        credential_id = %lease.credential_id,
                        retry_after_secs = retry_after.as_secs(),
                        attempt,
                        "request throttled, rotating credential"
                    );
                    lane.pool
                        .mark_degraded_for(&lease.credential_id, retry_after)
                        .await;
                    lane.tokens.lock().await.remove(&lease.credential_id);
                    self.persist(
                        &lease.credential_id,
                        scope,
                        StatusLabel::rate_limited_for(retry_after),
                    )
                    .await;

                    if attempt < max_retries {
                        tokio::time::sleep(retry_after.min(self.config.max_backoff())).await;
                    }
                }
                Outcome::Unauthorized => {
                    warn!(
                        scope,
                        credential_id = %lease.credential_id,
                        "token rejected, re-exchanging"
                    );
                    lane.tokens.lock().await.remove(&lease.credential_id);
                }
                Outcome::Failed(status) => {
                    return Err(Error::Upstream {
                        status,
                        url: url.to_string(),
                    });
                }
            }
        }

        Err(Error::RetriesExhausted {
            scope: scope.to_string(),
            attempts: max_retries,
        })
    }

    /// `request` and decode the body as JSON; `None` when the resource is absent.
    pub async fn get_json<T: DeserializeOwned>(&self, url: &str, scope: &str) -> Result<Option<T>> {
        match self.request(url, scope).await? {
            Fetched::Found(response) => response
                .json::<T>()
                .await
                .map(Some)
                .map_err(|e| Error::Http(format!("invalid JSON from {url}: {e}"))),
            Fetched::NotFound => Ok(None),
        }
    }

    /// Exchange and probe every credential, then replace the status table.
    ///
    /// A throttled or rejected exchange labels every scope of that credential.
    /// Credentials whose exchange fails at the transport level are left out.
    /// A `user_token` is probed as is and stored under `dispatch.user_token_row`.
    pub async fn check_credentials(
        &self,
        user_token: Option<&AccessToken>,
    ) -> Result<StatusTable> {
        let mut table = StatusTable::default();

        for credential in &self.credentials {
            let id = credential.client_id.as_str();
            let labels = match exchange_client_credentials(
                &self.client,
                &self.config.dispatch.token_url,
                credential,
                &self.retry_policy,
            )
            .await
            {
                Ok(Exchange::Granted(token)) => {
                    probe_scopes(
                        &self.client,
                        &self.config.scopes,
                        &self.config.probe_params,
                        &token,
                        &self.retry_policy,
                    )
                    .await
                }
                Ok(Exchange::RateLimited { retry_after }) => {
                    self.every_scope(StatusLabel::rate_limited_for(retry_after))
                }
                Ok(Exchange::Rejected { status }) => {
                    self.every_scope(StatusLabel::Error { code: status })
                }
                Err(e) => {
                    warn!(credential_id = %id, error = %e, "credential check failed");
                    continue;
                }
            };
            info!(credential_id = %id, scopes = labels.len(), "credential checked");
            table.set_all(id, labels);
        }

        if let Some(token) = user_token {
            let row = self.config.dispatch.user_token_row.as_str();
            let labels = probe_scopes(
                &self.client,
                &self.config.scopes,
                &self.config.probe_params,
                token,
                &self.retry_policy,
            )
            .await;
            info!(row, scopes = labels.len(), "user token checked");
            table.set_all(row, labels);
        }

        self.store.replace(table.clone()).await?;
        Ok(table)
    }

    fn every_scope(&self, label: StatusLabel) -> BTreeMap<String, StatusLabel> {
        self.config
            .scopes
            .names()
            .map(|scope| (scope.to_string(), label.clone()))
            .collect()
    }

    /// A served request clears any stale label left for this credential and scope.
    async fn confirm_active(&self, credential_id: &str, scope: &str) {
        let table = self.store.read().await;
        if table.get(credential_id, scope) != Some(&StatusLabel::Active) {
            debug!(credential_id, scope, "credential served a request, marking active");
            self.persist(credential_id, scope, StatusLabel::Active).await;
        }
    }

    async fn persist(&self, credential_id: &str, scope: &str, label: StatusLabel) {
        if let Err(e) = self.store.upsert(credential_id, scope, label).await {
            warn!(credential_id, scope, error = %e, "failed to persist credential status");
        }
    }
}

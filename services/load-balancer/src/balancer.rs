//! Request forwarding
//!
//! Picks a healthy backend by round robin, forwards method, path, headers and
//! body, and relays the backend's response verbatim. A transport failure
//! (connect, timeout, reset) moves on to the next healthy backend; any HTTP
//! response, 5xx included, ends the request.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::Request;
use axum::response::Response;
use resource_pool::{Pool, Resource};
use tokio::sync::watch;
use tracing::{debug, instrument, warn};

use crate::error::{Error, Result};
use crate::metrics;
use crate::monitor::HealthySet;

/// Largest request body buffered for forwarding.
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Headers to strip before forwarding (hop-by-hop per RFC 2616 Section 13.5.1)
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// One backend instance, identified by its base URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backend {
    url: String,
}

impl Backend {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Resource for Backend {
    fn id(&self) -> &str {
        &self.url
    }
}

/// Process-wide counters reported by the admin health endpoint.
pub struct Counters {
    pub started_at: Instant,
    pub requests_total: AtomicU64,
    pub errors_total: AtomicU64,
}

impl Counters {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            requests_total: AtomicU64::new(0),
            errors_total: AtomicU64::new(0),
        }
    }
}

/// Shared state passed to the balancer handler via axum State extractor
#[derive(Clone)]
pub struct BalancerState {
    pub client: reqwest::Client,
    pub pool: Arc<Pool<Backend>>,
    pub healthy: watch::Receiver<HealthySet>,
    /// Per-attempt timeout
    pub timeout: Duration,
    pub counters: Arc<Counters>,
}

/// HTTP client for forwarding: redirects are relayed to the caller, not followed.
pub fn forwarding_client() -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
}

/// Forward one inbound request.
///
/// Attempts are bounded by the size of the healthy snapshot taken when the
/// request arrives, and each backend in it is tried at most once.
#[instrument(skip_all, fields(request_id = %request_id, method = %request.method(), path = %request.uri().path()))]
pub async fn forward(
    state: &BalancerState,
    request: Request<Body>,
    request_id: &str,
) -> Result<Response> {
    state.counters.requests_total.fetch_add(1, Ordering::Relaxed);

    let snapshot = state.healthy.borrow().clone();
    if snapshot.is_empty() {
        state.counters.errors_total.fetch_add(1, Ordering::Relaxed);
        warn!("no healthy backends available");
        return Err(Error::NoBackendsAvailable);
    }

    let (parts, body) = request.into_parts();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let mut headers = reqwest::header::HeaderMap::new();
    for (name, value) in &parts.headers {
        if !is_hop_by_hop(name.as_str()) && name != axum::http::header::HOST {
            headers.append(name.clone(), value.clone());
        }
    }

    let body_bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(e) => {
            state.counters.errors_total.fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, "failed to read request body");
            return Err(Error::InvalidRequest(e.to_string()));
        }
    };

    let mut tried: HashSet<String> = HashSet::new();
    for attempt in 1..=snapshot.len() {
        let selected = {
            let tried = &tried;
            let untried_healthy = |id: &str| snapshot.contains(id) && !tried.contains(id);
            state.pool.select_where(&untried_healthy).await
        };
        let backend = match selected {
            Ok(backend) => backend,
            Err(e) => {
                debug!(error = %e, "no untried healthy backend left");
                break;
            }
        };
        tried.insert(backend.id().to_string());

        let url = format!("{}{path_and_query}", backend.url());
        let result = state
            .client
            .request(parts.method.clone(), &url)
            .headers(headers.clone())
            .timeout(state.timeout)
            .body(body_bytes.clone())
            .send()
            .await;

        match result {
            Ok(upstream) => {
                debug!(backend = backend.url(), status = upstream.status().as_u16(), attempt, "relaying response");
                return Ok(relay(upstream));
            }
            Err(e) => {
                metrics::record_backend_error(backend.url());
                warn!(backend = backend.url(), attempt, error = %e, "backend unreachable, trying next");
            }
        }
    }

    state.counters.errors_total.fetch_add(1, Ordering::Relaxed);
    warn!(tried = tried.len(), "all healthy backends unreachable");
    Err(Error::AllBackendsUnreachable)
}

/// Stream a backend response back to the caller, minus hop-by-hop headers.
fn relay(upstream: reqwest::Response) -> Response {
    let status = upstream.status();
    let mut headers = upstream.headers().clone();
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }

    let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

/// Check if a header is hop-by-hop (should be stripped before forwarding)
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

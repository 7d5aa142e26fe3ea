//! Active health monitoring
//!
//! Every interval, probes `GET {backend}{path}` on each backend that is not
//! under an unexpired exclusion. A failed probe (transport error, timeout or
//! non-2xx) excludes the backend for the cooldown; excluded backends are not
//! probed again until the cooldown has elapsed. After each cycle the set of
//! backends that passed is published through a `watch` channel, which is all
//! the balancer ever reads.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use resource_pool::{HealthSource, Pool, Resource, ResourceState};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::balancer::Backend;
use crate::metrics;

/// Immutable snapshot of backends that passed their last probe.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthySet {
    ids: Arc<HashSet<String>>,
}

impl HealthySet {
    pub fn new(ids: impl IntoIterator<Item = String>) -> Self {
        Self {
            ids: Arc::new(ids.into_iter().collect()),
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

impl HealthSource for HealthySet {
    fn eligible(&self, resource_id: &str) -> bool {
        self.contains(resource_id)
    }
}

/// Probe settings
#[derive(Debug, Clone)]
pub struct ProbeSettings {
    pub interval: Duration,
    pub cooldown: Duration,
    pub timeout: Duration,
    pub path: String,
}

/// Spawn the background probe loop.
///
/// The first cycle runs immediately. The task ends when every receiver of
/// `healthy` has been dropped.
pub fn spawn_health_monitor(
    pool: Arc<Pool<Backend>>,
    client: reqwest::Client,
    settings: ProbeSettings,
    healthy: watch::Sender<HealthySet>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(settings.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            interval_secs = settings.interval.as_secs(),
            cooldown_secs = settings.cooldown.as_secs(),
            path = %settings.path,
            "health monitor started"
        );

        loop {
            interval.tick().await;
            let snapshot = probe_cycle(&pool, &client, &settings).await;
            if healthy.send(snapshot).is_err() {
                debug!("no balancer listening for health updates, stopping monitor");
                break;
            }
        }
    })
}

/// Run one probe cycle and return the new healthy set.
pub async fn probe_cycle(
    pool: &Pool<Backend>,
    client: &reqwest::Client,
    settings: &ProbeSettings,
) -> HealthySet {
    let now = Instant::now();
    let due: Vec<Backend> = pool
        .members()
        .await
        .into_iter()
        .filter(|(_, state)| state.is_eligible_at(now))
        .map(|(backend, _)| backend)
        .collect();

    let results = join_all(due.iter().map(|backend| probe(client, backend, settings))).await;

    for (backend, passed) in due.iter().zip(results) {
        if passed {
            pool.mark_healthy(backend.id()).await;
        } else {
            pool.mark_degraded_for(backend.id(), settings.cooldown).await;
        }
    }

    let healthy = HealthySet::new(
        pool.members()
            .await
            .into_iter()
            .filter(|(_, state)| *state == ResourceState::Healthy)
            .map(|(backend, _)| backend.id().to_string()),
    );

    metrics::set_healthy_backends(healthy.len());
    let total = pool.len().await;
    debug!(
        probed = due.len(),
        healthy = healthy.len(),
        total = total,
        "health cycle complete"
    );
    healthy
}

async fn probe(client: &reqwest::Client, backend: &Backend, settings: &ProbeSettings) -> bool {
    let url = format!("{}{}", backend.url(), settings.path);
    match client.get(&url).timeout(settings.timeout).send().await {
        Ok(response) if response.status().is_success() => true,
        Ok(response) => {
            warn!(
                backend = backend.url(),
                status = response.status().as_u16(),
                "health probe failed"
            );
            false
        }
        Err(e) => {
            warn!(backend = backend.url(), error = %e, "health probe failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::get;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct MockBackend {
        up: AtomicBool,
        probes: AtomicUsize,
    }

    async fn healthcheck(State(mock): State<Arc<MockBackend>>) -> StatusCode {
        mock.probes.fetch_add(1, Ordering::SeqCst);
        if mock.up.load(Ordering::SeqCst) {
            StatusCode::OK
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        }
    }

    async fn spawn_backend(up: bool) -> (String, Arc<MockBackend>) {
        let mock = Arc::new(MockBackend {
            up: AtomicBool::new(up),
            probes: AtomicUsize::new(0),
        });
        let app = Router::new()
            .route("/healthcheck", get(healthcheck))
            .with_state(mock.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        (format!("http://{addr}"), mock)
    }

    fn settings(cooldown: Duration) -> ProbeSettings {
        ProbeSettings {
            interval: Duration::from_secs(10),
            cooldown,
            timeout: Duration::from_secs(2),
            path: "/healthcheck".into(),
        }
    }

    #[test]
    fn healthy_set_is_a_health_source() {
        let set = HealthySet::new(["a".to_string(), "b".to_string()]);
        assert!(set.eligible("a"));
        assert!(!set.eligible("c"));
        assert_eq!(set.len(), 2);
        assert!(HealthySet::default().is_empty());
    }

    #[tokio::test]
    async fn failing_backend_is_excluded_until_cooldown_then_reprobed() {
        let (b1, _m1) = spawn_backend(true).await;
        let (b2, m2) = spawn_backend(false).await;
        let (b3, _m3) = spawn_backend(true).await;
        let pool = Pool::new(
            "backends",
            vec![Backend::new(&b1), Backend::new(&b2), Backend::new(&b3)],
        );
        let client = reqwest::Client::new();
        let settings = settings(Duration::from_millis(300));

        let healthy = probe_cycle(&pool, &client, &settings).await;
        assert_eq!(healthy, HealthySet::new([b1.clone(), b3.clone()]));
        assert_eq!(m2.probes.load(Ordering::SeqCst), 1);

        // Still cooling down: not probed, not published
        m2.up.store(true, Ordering::SeqCst);
        let healthy = probe_cycle(&pool, &client, &settings).await;
        assert!(!healthy.contains(&b2));
        assert_eq!(m2.probes.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(400)).await;
        let healthy = probe_cycle(&pool, &client, &settings).await;
        assert_eq!(m2.probes.load(Ordering::SeqCst), 2);
        assert_eq!(healthy.len(), 3);
    }

    #[tokio::test]
    async fn failed_reprobe_renews_exclusion() {
        let (b1, m1) = spawn_backend(false).await;
        let pool = Pool::new("backends", vec![Backend::new(&b1)]);
        let client = reqwest::Client::new();
        let settings = settings(Duration::from_millis(200));

        assert!(probe_cycle(&pool, &client, &settings).await.is_empty());
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(probe_cycle(&pool, &client, &settings).await.is_empty());
        assert_eq!(m1.probes.load(Ordering::SeqCst), 2);
        assert!(matches!(
            pool.state_of(&b1).await,
            Some(ResourceState::Degraded { .. })
        ));
    }

    #[tokio::test]
    async fn unreachable_backend_fails_probe() {
        let pool = Pool::new("backends", vec![Backend::new("http://127.0.0.1:1")]);
        let healthy = probe_cycle(&pool, &reqwest::Client::new(), &settings(Duration::from_secs(30))).await;
        assert!(healthy.is_empty());
        assert!(!pool.is_eligible("http://127.0.0.1:1").await);
    }

    #[tokio::test]
    async fn monitor_publishes_snapshots() {
        let (b1, _m1) = spawn_backend(true).await;
        let pool = Arc::new(Pool::new("backends", vec![Backend::new(&b1)]));
        let (tx, mut rx) = watch::channel(HealthySet::default());

        let handle = spawn_health_monitor(
            pool,
            reqwest::Client::new(),
            settings(Duration::from_secs(30)),
            tx,
        );

        rx.changed().await.unwrap();
        assert!(rx.borrow().contains(&b1));

        drop(rx);
        handle.abort();
    }
}

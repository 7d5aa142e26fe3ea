//! Pool state machine and round-robin selection
//!
//! The pool holds an ordered member list, a rotation cursor, and a per-member
//! `ResourceState`. Everything lives behind one `Mutex` that is held only for
//! the duration of a selection or a mark, never across the caller's I/O.
//!
//! Reinstatement is lazy: a `Degraded` member whose deadline has passed is
//! moved to `Unknown` the next time selection looks at it.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::{Error, PoolSummary, Result};

/// A pooled, interchangeable unit of capacity.
pub trait Resource: Clone + Send + Sync + 'static {
    /// Stable identity used for state tracking (backend URL, client id).
    fn id(&self) -> &str;
}

/// External eligibility signal consulted on top of the pool's own state.
///
/// The inbound balancer passes the health monitor's published snapshot; the
/// outbound dispatcher passes the persisted status table for one scope.
pub trait HealthSource: Send + Sync {
    fn eligible(&self, resource_id: &str) -> bool;
}

impl<F> HealthSource for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn eligible(&self, resource_id: &str) -> bool {
        self(resource_id)
    }
}

/// Runtime state of a pool member.
///
/// Transitions:
/// - Unknown → Healthy (successful exchange or probe)
/// - Healthy/Unknown → Degraded (failure, throttling)
/// - Degraded → Unknown (deadline reached, checked at selection time)
/// - Degraded → Healthy (explicit `mark_healthy`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    Healthy,
    Degraded { until: Instant },
    Unknown,
}

impl ResourceState {
    /// Status label for health/logging.
    pub fn label(&self) -> &'static str {
        match self {
            ResourceState::Healthy => "healthy",
            ResourceState::Degraded { .. } => "degraded",
            ResourceState::Unknown => "unknown",
        }
    }

    /// Whether a member in this state may be selected at `now`.
    pub fn is_eligible_at(&self, now: Instant) -> bool {
        match self {
            ResourceState::Degraded { until } => now >= *until,
            ResourceState::Healthy | ResourceState::Unknown => true,
        }
    }
}

struct Member<R> {
    resource: R,
    state: ResourceState,
}

impl<R: Resource> Member<R> {
    /// Reinstate an expired exclusion and report whether the member is eligible.
    fn reinstate_if_due(&mut self, now: Instant, pool: &str) -> bool {
        match self.state {
            ResourceState::Degraded { until } if now < until => false,
            ResourceState::Degraded { .. } => {
                info!(
                    pool,
                    resource = self.resource.id(),
                    "exclusion expired, resource eligible again"
                );
                self.state = ResourceState::Unknown;
                true
            }
            ResourceState::Healthy | ResourceState::Unknown => true,
        }
    }
}

struct PoolState<R> {
    members: Vec<Member<R>>,
    cursor: usize,
    current: Option<String>,
}

impl<R: Resource> PoolState<R> {
    fn position(&self, id: &str) -> Option<usize> {
        self.members.iter().position(|m| m.resource.id() == id)
    }

    fn summary(&self, now: Instant) -> PoolSummary {
        let mut summary = PoolSummary {
            total: self.members.len(),
            ..PoolSummary::default()
        };
        for member in &self.members {
            match member.state {
                ResourceState::Healthy => summary.healthy += 1,
                ResourceState::Unknown => summary.unknown += 1,
                ResourceState::Degraded { until } if now >= until => summary.unknown += 1,
                ResourceState::Degraded { .. } => summary.degraded += 1,
            }
        }
        summary
    }
}

/// Round-robin pool of resources.
///
/// Members start as `Unknown`. `select_where` returns the next eligible member
/// after the previously selected one, so excluded members are skipped without
/// disturbing the rotation order of the others.
pub struct Pool<R> {
    name: String,
    state: Mutex<PoolState<R>>,
}

impl<R: Resource> Pool<R> {
    /// Create a pool. Duplicate identities keep their first occurrence.
    pub fn new(name: impl Into<String>, resources: Vec<R>) -> Self {
        let name = name.into();
        let mut members: Vec<Member<R>> = Vec::with_capacity(resources.len());
        for resource in resources {
            if members.iter().any(|m| m.resource.id() == resource.id()) {
                debug!(pool = %name, resource = resource.id(), "duplicate resource ignored");
                continue;
            }
            members.push(Member {
                resource,
                state: ResourceState::Unknown,
            });
        }
        info!(pool = %name, resources = members.len(), "pool initialized");
        Self {
            name,
            state: Mutex::new(PoolState {
                members,
                cursor: 0,
                current: None,
            }),
        }
    }

    /// Select the next eligible member in rotation order.
    pub async fn select(&self) -> Result<R> {
        self.select_where(&|_: &str| true).await
    }

    /// Select the next member that is eligible by its own state and by `source`.
    ///
    /// Scans at most one full rotation starting at the cursor, so it never
    /// blocks. On success the cursor moves just past the chosen member; when
    /// nothing is eligible it still advances by one and `Exhausted` is returned.
    pub async fn select_where(&self, source: &dyn HealthSource) -> Result<R> {
        let mut state = self.state.lock().await;
        let n = state.members.len();
        let now = Instant::now();

        if n == 0 {
            return Err(Error::Exhausted {
                pool: self.name.clone(),
                summary: PoolSummary::default(),
            });
        }

        let start = state.cursor % n;
        for offset in 0..n {
            let idx = (start + offset) % n;
            let eligible = {
                let member = &mut state.members[idx];
                member.reinstate_if_due(now, &self.name) && source.eligible(member.resource.id())
            };
            if !eligible {
                continue;
            }

            let resource = state.members[idx].resource.clone();
            state.cursor = (idx + 1) % n;
            state.current = Some(resource.id().to_string());
            debug!(pool = %self.name, resource = resource.id(), "selected");
            return Ok(resource);
        }

        state.cursor = (start + 1) % n;
        Err(Error::Exhausted {
            pool: self.name.clone(),
            summary: state.summary(now),
        })
    }

    /// Exclude a member until `until`.
    ///
    /// An earlier deadline never shortens an existing exclusion. Returns the
    /// deadline now in force, or `None` for an unknown member.
    pub async fn mark_degraded(&self, id: &str, until: Instant) -> Option<Instant> {
        let mut state = self.state.lock().await;
        let idx = state.position(id)?;
        let member = &mut state.members[idx];

        let effective = match member.state {
            ResourceState::Degraded { until: existing } if existing >= until => existing,
            _ => until,
        };
        member.state = ResourceState::Degraded { until: effective };

        let remaining = effective.saturating_duration_since(Instant::now());
        info!(
            pool = %self.name,
            resource = id,
            cooldown_secs = remaining.as_secs(),
            "resource degraded"
        );
        Some(effective)
    }

    /// Exclude a member for `cooldown` from now.
    pub async fn mark_degraded_for(&self, id: &str, cooldown: Duration) -> Option<Instant> {
        self.mark_degraded(id, Instant::now() + cooldown).await
    }

    /// Mark a member healthy, clearing any exclusion. Returns false for an unknown member.
    pub async fn mark_healthy(&self, id: &str) -> bool {
        let mut state = self.state.lock().await;
        let Some(idx) = state.position(id) else {
            return false;
        };
        let member = &mut state.members[idx];
        if member.state != ResourceState::Healthy {
            debug!(pool = %self.name, resource = id, previous = member.state.label(), "resource healthy");
        }
        member.state = ResourceState::Healthy;
        true
    }

    /// Current state of a member.
    pub async fn state_of(&self, id: &str) -> Option<ResourceState> {
        let state = self.state.lock().await;
        state.position(id).map(|idx| state.members[idx].state)
    }

    /// Whether a member exists and is not under an unexpired exclusion.
    pub async fn is_eligible(&self, id: &str) -> bool {
        let now = Instant::now();
        self.state_of(id)
            .await
            .is_some_and(|s| s.is_eligible_at(now))
    }

    /// The most recently selected member, if it is still in the pool.
    pub async fn current(&self) -> Option<R> {
        let state = self.state.lock().await;
        let id = state.current.as_deref()?;
        state
            .position(id)
            .map(|idx| state.members[idx].resource.clone())
    }

    /// Add a member at the end of the rotation. Returns false if already present.
    pub async fn add(&self, resource: R) -> bool {
        let mut state = self.state.lock().await;
        if state.position(resource.id()).is_some() {
            return false;
        }
        info!(pool = %self.name, resource = resource.id(), "resource added to pool");
        state.members.push(Member {
            resource,
            state: ResourceState::Unknown,
        });
        true
    }

    /// Remove a member, keeping the cursor on the same successor.
    pub async fn remove(&self, id: &str) -> Option<R> {
        let mut state = self.state.lock().await;
        let idx = state.position(id)?;
        let removed = state.members.remove(idx);

        if idx < state.cursor {
            state.cursor -= 1;
        }
        let n = state.members.len();
        state.cursor = if n == 0 { 0 } else { state.cursor % n };
        if state.current.as_deref() == Some(id) {
            state.current = None;
        }

        info!(pool = %self.name, resource = id, "resource removed from pool");
        Some(removed.resource)
    }

    /// Number of members.
    pub async fn len(&self) -> usize {
        self.state.lock().await.members.len()
    }

    /// Whether the pool has no members.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Snapshot of every member with its state, in rotation order.
    pub async fn members(&self) -> Vec<(R, ResourceState)> {
        let state = self.state.lock().await;
        state
            .members
            .iter()
            .map(|m| (m.resource.clone(), m.state))
            .collect()
    }

    /// Pool health summary for health endpoints.
    ///
    /// Status mapping: every member eligible → healthy, some eligible →
    /// degraded, none (or empty pool) → unhealthy.
    pub async fn health(&self) -> serde_json::Value {
        let state = self.state.lock().await;
        let now = Instant::now();
        let summary = state.summary(now);

        let members: Vec<serde_json::Value> = state
            .members
            .iter()
            .map(|m| match m.state {
                ResourceState::Degraded { until } if now < until => serde_json::json!({
                    "id": m.resource.id(),
                    "state": "degraded",
                    "cooldown_remaining_secs": (until - now).as_secs(),
                }),
                ResourceState::Degraded { .. } => serde_json::json!({
                    "id": m.resource.id(),
                    "state": "unknown",
                }),
                other => serde_json::json!({
                    "id": m.resource.id(),
                    "state": other.label(),
                }),
            })
            .collect();

        let eligible = summary.healthy + summary.unknown;
        let status = if summary.total > 0 && eligible == summary.total {
            "healthy"
        } else if eligible > 0 {
            "degraded"
        } else {
            "unhealthy"
        };

        serde_json::json!({
            "pool": self.name,
            "status": status,
            "total": summary.total,
            "healthy": summary.healthy,
            "unknown": summary.unknown,
            "degraded": summary.degraded,
            "members": members,
        })
    }
}

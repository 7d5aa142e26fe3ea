//! Round-robin pool of interchangeable resources
//!
//! Shared core of the inbound load balancer (backends) and the outbound
//! credential rotator (API credentials). Each member carries a
//! `ResourceState`; selection walks the members in rotation order and skips
//! anything that is excluded.
//!
//! Member lifecycle:
//! 1. Member added → `Unknown` (eligible, unconfirmed)
//! 2. Successful exchange or probe → `Healthy`
//! 3. Failure or throttling → `Degraded { until }`, never selected before `until`
//! 4. Deadline passes → back to `Unknown` on the next selection
//!
//! Eligibility beyond the pool's own state (the published healthy-backend
//! snapshot, a persisted per-scope status table) is supplied by callers
//! through the `HealthSource` trait.

pub mod error;
pub mod pool;

pub use error::{Error, PoolSummary, Result};
pub use pool::{HealthSource, Pool, Resource, ResourceState};

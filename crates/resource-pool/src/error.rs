//! Error types for pool operations

use std::fmt;

/// Member counts at the moment a selection failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolSummary {
    pub total: usize,
    pub healthy: usize,
    pub unknown: usize,
    pub degraded: usize,
}

impl fmt::Display for PoolSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} total, {} healthy, {} unknown, {} degraded",
            self.total, self.healthy, self.unknown, self.degraded
        )
    }
}

/// Errors from pool operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No member is currently eligible (also returned for an empty pool).
    #[error("pool {pool} exhausted: {summary}")]
    Exhausted { pool: String, summary: PoolSummary },
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;

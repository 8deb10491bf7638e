use chrono::Duration;

/// Repository configuration, passed explicitly to the constructor instead of
/// living in ambient global state.
#[derive(Debug, Clone)]
pub struct RepositoryConfig {
    /// A lock whose heartbeat is older than this is eligible for the
    /// stale sweep.
    pub lock_expiration: Duration,
    /// Upper bound on how many jobs a single launcher acquire may claim.
    pub acquire_batch_cap: usize,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            lock_expiration: Duration::minutes(3),
            acquire_batch_cap: 64,
        }
    }
}

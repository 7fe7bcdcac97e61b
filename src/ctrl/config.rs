/// Configuration for a [`LockManager`](crate::ctrl::LockManager).
#[derive(Debug, Clone)]
pub struct LockManagerConfig {
    /// Number of independently locked shards of the lock table. At least one shard is used.
    pub table_shards: usize,
    /// Remove idle resource entries on a spawned task instead of right after the request that
    /// left them idle.
    pub deferred_cleanup: bool,
    /// Number of concurrent shared prime lock holders. An exclusive prime lock takes all of them.
    pub max_prime_readers: u32,
}

impl Default for LockManagerConfig {
    fn default() -> Self {
        Self {
            table_shards: 16,
            deferred_cleanup: false,
            max_prime_readers: 1024,
        }
    }
}

impl LockManagerConfig {
    /// A config tuned for fast testing.
    ///
    /// - **table:** A couple of shards, so that collisions between resources actually happen.
    /// - **prime lock:** Few readers, so that exclusive acquisitions are cheap to reason about.
    #[cfg(test)]
    pub fn for_testing() -> Self {
        Self {
            table_shards: 2,
            max_prime_readers: 4,
            ..Default::default()
        }
    }
}

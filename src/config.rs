//! Node-wide configuration.
//!
//! Every tunable the routing table, database, protocol layer, and republish
//! daemon consume is threaded through one [`DhtConfig`] passed at
//! construction. Nothing in the crate reads process-wide state.

use std::time::Duration;

use crate::crypto::PublicKey;

/// Acknowledgment threshold for a store fan-out to count as successful.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreQuorum {
    /// Every targeted contact must acknowledge.
    All,
    /// More than half of the targeted contacts must acknowledge.
    Majority,
    /// A single acknowledgment suffices.
    Any,
}

impl StoreQuorum {
    /// Whether `accepted` acknowledgments out of `targeted` meet the quorum.
    pub fn is_met(&self, accepted: usize, targeted: usize) -> bool {
        if targeted == 0 {
            return false;
        }
        match self {
            StoreQuorum::All => accepted == targeted,
            StoreQuorum::Majority => accepted * 2 > targeted,
            StoreQuorum::Any => accepted > 0,
        }
    }
}

/// Configuration for a DHT node and all of its components.
#[derive(Clone, Debug)]
pub struct DhtConfig {
    /// Replication parameter: bucket capacity and store fan-out width.
    pub k: usize,
    /// Concurrency factor for iterative lookups.
    pub alpha: usize,
    /// Bucket split depth limit (symbol size); a bucket at depth `d` with
    /// `d % depth_limit == 0` only splits when it covers the local region.
    pub depth_limit: usize,
    /// Replacement cache capacity per bucket.
    pub replacement_cache_size: usize,
    /// Consecutive failures before a contact is marked down.
    pub max_failures: u32,
    /// A live contact keeps its identity claim against a newcomer with the
    /// same id until it has been quiet for this long.
    pub min_reconnect_time: Duration,
    /// Buckets untouched for this long are due for a refresh lookup.
    pub bucket_refresh_after: Duration,
    /// How often the maintenance task checks for stale buckets.
    pub maintenance_interval: Duration,

    /// Maximum distinct keys held by the database.
    pub max_keys: usize,
    /// Maximum values per key (one per publisher).
    pub max_values_per_key: usize,
    /// TTL for remote values verified against the master key.
    pub value_ttl: Duration,
    /// TTL for anonymous remote values (not master-verified); conventionally
    /// half of `value_ttl`.
    pub anonymous_value_ttl: Duration,
    /// Tolerated forward clock skew on incoming value creation times.
    pub max_clock_skew: Duration,
    /// Base interval between republishes of a locally-originated value.
    pub republish_interval: Duration,
    /// Floor below which the per-value republish interval never drops.
    pub min_republish_interval: Duration,
    /// How often the republish daemon wakes up to sweep for expired values
    /// and due republishes.
    pub publisher_pass_interval: Duration,

    /// Per-RPC timeout.
    pub rpc_timeout: Duration,
    /// Retries per contact before a failure is charged against it.
    pub rpc_retries: u32,
    /// Acknowledgment threshold for store operations.
    pub store_quorum: StoreQuorum,
    /// Hard cap on iterative-lookup rounds.
    pub max_lookup_rounds: usize,
    /// Total wall-clock budget for one iterative lookup.
    pub lookup_timeout: Duration,

    /// The network trust key. Values signed by it may lock collections and
    /// bypass capacity rules. `None` disables all master-key privileges.
    pub master_key: Option<PublicKey>,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            k: 20,
            alpha: 3,
            depth_limit: 4,
            replacement_cache_size: 16,
            max_failures: 4,
            min_reconnect_time: Duration::from_secs(60),
            bucket_refresh_after: Duration::from_secs(30 * 60),
            maintenance_interval: Duration::from_secs(5 * 60),

            max_keys: 16_384,
            max_values_per_key: 5,
            value_ttl: Duration::from_secs(24 * 60 * 60),
            anonymous_value_ttl: Duration::from_secs(12 * 60 * 60),
            max_clock_skew: Duration::from_secs(60 * 60),
            republish_interval: Duration::from_secs(60 * 60),
            min_republish_interval: Duration::from_secs(5 * 60),
            publisher_pass_interval: Duration::from_secs(5 * 60),

            rpc_timeout: Duration::from_secs(3),
            rpc_retries: 1,
            store_quorum: StoreQuorum::Majority,
            max_lookup_rounds: 20,
            lookup_timeout: Duration::from_secs(10),

            master_key: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quorum_thresholds() {
        assert!(StoreQuorum::All.is_met(5, 5));
        assert!(!StoreQuorum::All.is_met(4, 5));

        assert!(StoreQuorum::Majority.is_met(3, 5));
        assert!(!StoreQuorum::Majority.is_met(2, 5));
        assert!(StoreQuorum::Majority.is_met(2, 3));

        assert!(StoreQuorum::Any.is_met(1, 20));
        assert!(!StoreQuorum::Any.is_met(0, 20));

        // an empty target set never succeeds
        assert!(!StoreQuorum::All.is_met(0, 0));
        assert!(!StoreQuorum::Any.is_met(0, 0));
    }
}

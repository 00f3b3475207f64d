use crate::routing::RoutingPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How lookups pick the nodes to query.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LookupPolicy {
    /// `alpha` parallel queries throughout the lookup.
    #[default]
    A3Classic,
    /// An aggressive first round querying up to 16 seeded nodes, then `alpha` at a time.
    A16,
}

impl LookupPolicy {
    /// Size of the first round of queries.
    pub(crate) fn initial_parallelism(&self, alpha: usize) -> usize {
        match self {
            Self::A3Classic => alpha,
            Self::A16 => alpha.max(16),
        }
    }
}

/// Tunables of a DHT instance. The defaults follow BEP-5 practice.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Bucket width and the number of closest nodes a lookup converges on.
    pub k: usize,
    /// Lookup parallelism.
    pub alpha: usize,
    pub rpc_timeout_ms: u64,
    /// Idle time after which a bucket is refreshed.
    pub bucket_refresh_s: u64,
    pub quarantine_s: u64,
    /// How long an announced peer is served.
    pub peer_validity_s: u64,
    /// The peer tracker runs a cleanup once every this many puts.
    pub peer_cleanup_puts: usize,
    pub max_peers_per_response: usize,
    pub bencode_max_depth_untrusted: usize,
    pub token_rotation_s: u64,
    /// Outgoing queries in flight above which new ones are refused.
    pub max_pending_rpcs: usize,
    /// Time a transaction id stays retired before it can be reused.
    pub tid_grace_s: u64,
    /// Persisted contacts older than this are not contacted.
    pub snapshot_max_age_s: u64,
    pub snapshot_interval_s: u64,
    pub routing_policy: RoutingPolicy,
    pub lookup_policy: LookupPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            k: 8,
            alpha: 3,
            rpc_timeout_ms: 2000,
            bucket_refresh_s: 900,
            quarantine_s: 180,
            peer_validity_s: 1800,
            peer_cleanup_puts: 5,
            max_peers_per_response: 50,
            bencode_max_depth_untrusted: crate::bencode::MAX_DEPTH_UNTRUSTED,
            token_rotation_s: 600,
            max_pending_rpcs: 512,
            tid_grace_s: 30,
            snapshot_max_age_s: 24 * 60 * 60,
            snapshot_interval_s: 600,
            routing_policy: RoutingPolicy::default(),
            lookup_policy: LookupPolicy::default(),
        }
    }
}

impl Config {
    pub(crate) fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub(crate) fn bucket_refresh(&self) -> Duration {
        Duration::from_secs(self.bucket_refresh_s)
    }

    pub(crate) fn quarantine(&self) -> Duration {
        Duration::from_secs(self.quarantine_s)
    }

    pub(crate) fn peer_validity(&self) -> Duration {
        Duration::from_secs(self.peer_validity_s)
    }

    pub(crate) fn token_rotation(&self) -> Duration {
        Duration::from_secs(self.token_rotation_s)
    }

    pub(crate) fn tid_grace(&self) -> Duration {
        Duration::from_secs(self.tid_grace_s)
    }

    pub(crate) fn snapshot_max_age(&self) -> Duration {
        Duration::from_secs(self.snapshot_max_age_s)
    }

    pub(crate) fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positive_defaults() {
        let config = Config::default();

        assert_eq!(config.k, 8);
        assert_eq!(config.alpha, 3);
        assert_eq!(config.rpc_timeout(), Duration::from_secs(2));
        assert_eq!(config.bucket_refresh(), Duration::from_secs(15 * 60));
        assert_eq!(config.quarantine(), Duration::from_secs(3 * 60));
        assert_eq!(config.peer_validity(), Duration::from_secs(30 * 60));
        assert_eq!(config.peer_cleanup_puts, 5);
        assert_eq!(config.max_peers_per_response, 50);
        assert_eq!(config.bencode_max_depth_untrusted, 4);
        assert_eq!(config.token_rotation(), Duration::from_secs(10 * 60));
        assert_eq!(config.routing_policy, RoutingPolicy::NiceRtt);
        assert_eq!(config.lookup_policy, LookupPolicy::A3Classic);
    }

    #[test]
    fn positive_partial_config_fills_defaults() {
        let encoded = b"d5:alphai5e15:peer_validity_si30ee";
        let config: Config = serde_bencode::from_bytes(encoded).unwrap();

        assert_eq!(config.alpha, 5);
        assert_eq!(config.peer_validity(), Duration::from_secs(30));
        assert_eq!(config.k, 8);
    }

    #[test]
    fn positive_lookup_policy_parallelism() {
        assert_eq!(LookupPolicy::A3Classic.initial_parallelism(3), 3);
        assert_eq!(LookupPolicy::A16.initial_parallelism(3), 16);
    }
}

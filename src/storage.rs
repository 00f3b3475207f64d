use crate::id::InfoHash;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use std::{
    collections::HashMap,
    net::SocketAddr,
    time::{Duration, Instant},
};

/// Peers announced to us, per info hash.
///
/// A peer is served for `validity` after its last announce. Expired peers are dropped lazily when
/// their info hash is looked up and eagerly by a cleanup that runs once every `cleanup_puts`
/// puts.
pub(crate) struct PeerTracker {
    peers: HashMap<InfoHash, Vec<(SocketAddr, Instant)>>,
    num_peers: usize,
    validity: Duration,
    cleanup_puts: usize,
    puts_since_cleanup: usize,
    max_peers: usize,
    rng: StdRng,
}

impl PeerTracker {
    pub fn new(validity: Duration, cleanup_puts: usize, max_peers: usize) -> Self {
        Self::with_rng(validity, cleanup_puts, max_peers, StdRng::from_entropy())
    }

    /// Construct with an explicit rng so that sampling above `max_peers` is reproducible.
    pub fn with_rng(validity: Duration, cleanup_puts: usize, max_peers: usize, rng: StdRng) -> Self {
        Self {
            peers: HashMap::new(),
            num_peers: 0,
            validity,
            cleanup_puts: cleanup_puts.max(1),
            puts_since_cleanup: 0,
            max_peers,
            rng,
        }
    }

    /// Store a peer, or refresh its timestamp if it is already stored.
    pub fn put(&mut self, info_hash: InfoHash, peer: SocketAddr, now: Instant) {
        let entries = self.peers.entry(info_hash).or_default();

        if let Some(entry) = entries.iter_mut().find(|(addr, _)| *addr == peer) {
            entry.1 = now;
        } else {
            entries.push((peer, now));
            self.num_peers += 1;
        }

        self.puts_since_cleanup += 1;
        if self.puts_since_cleanup >= self.cleanup_puts {
            self.cleanup(now);
        }
    }

    /// Non-expired peers of `info_hash`. When there are more than `max_peers`, a random sample of
    /// that size is returned.
    pub fn get(&mut self, info_hash: &InfoHash, now: Instant) -> Vec<SocketAddr> {
        let validity = self.validity;

        let entries = match self.peers.get_mut(info_hash) {
            Some(entries) => entries,
            None => return Vec::new(),
        };

        let before = entries.len();
        entries.retain(|(_, ts)| !is_expired(*ts, validity, now));
        self.num_peers -= before - entries.len();

        if entries.is_empty() {
            self.peers.remove(info_hash);
            return Vec::new();
        }

        if entries.len() > self.max_peers {
            entries
                .choose_multiple(&mut self.rng, self.max_peers)
                .map(|(addr, _)| *addr)
                .collect()
        } else {
            entries.iter().map(|(addr, _)| *addr).collect()
        }
    }

    /// Drop every expired peer, and every info hash left without peers.
    pub fn cleanup(&mut self, now: Instant) {
        let validity = self.validity;
        let mut removed = 0;

        self.peers.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|(_, ts)| !is_expired(*ts, validity, now));
            removed += before - entries.len();
            !entries.is_empty()
        });

        self.num_peers -= removed;
        self.puts_since_cleanup = 0;

        if removed > 0 {
            log::debug!("Removed {} expired peers", removed);
        }
    }

    pub fn num_peers(&self) -> usize {
        self.num_peers
    }

    #[cfg(test)]
    pub fn num_info_hashes(&self) -> usize {
        self.peers.len()
    }
}

fn is_expired(ts: Instant, validity: Duration, now: Instant) -> bool {
    now.saturating_duration_since(ts) > validity
}

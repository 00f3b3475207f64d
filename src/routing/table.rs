use super::{
    bucket::Bucket,
    node::{NodeStatus, RoutingNode},
    NodeHandle, RoutingPolicy,
};
use crate::id::{NodeId, ID_BITS};
use rand::Rng;
use std::{
    cmp::{Ordering, Reverse},
    net::SocketAddr,
    time::{Duration, Instant},
};

/// Routing table containing one bucket per log-distance from the id of the local node.
pub(crate) struct RoutingTable {
    node_id: NodeId,
    buckets: Vec<Bucket>,
    k: usize,
    quarantine: Duration,
    policy: RoutingPolicy,
}

impl RoutingTable {
    /// Create a new RoutingTable with the given node id as our id.
    pub fn new(
        node_id: NodeId,
        k: usize,
        quarantine: Duration,
        policy: RoutingPolicy,
        now: Instant,
    ) -> RoutingTable {
        let buckets = (0..ID_BITS).map(|_| Bucket::new(now)).collect();

        RoutingTable {
            node_id,
            buckets,
            k,
            quarantine,
            policy,
        }
    }

    /// Return the node id of the RoutingTable.
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Iterator over all buckets, indexed by log-distance.
    #[cfg(test)]
    pub fn buckets(&self) -> impl Iterator<Item = &Bucket> + ExactSizeIterator {
        self.buckets.iter()
    }

    /// Index of the bucket that holds `id`, or `None` for our own id.
    pub fn bucket_index(&self, id: &NodeId) -> Option<usize> {
        usize::try_from(self.node_id.log_distance(id)).ok()
    }

    /// A node answered one of our queries.
    pub fn on_response(&mut self, handle: NodeHandle, rtt: Option<Duration>, now: Instant) {
        let index = match self.bucket_index(&handle.id) {
            Some(index) => index,
            None => return,
        };
        let (k, quarantine, policy) = (self.k, self.quarantine, self.policy);

        // An id maps to exactly one bucket, so the address showing up in any other bucket means
        // the node answered under a previous id.
        for (other, bucket) in self.buckets.iter_mut().enumerate() {
            if other != index {
                bucket.remove(handle.addr);
                bucket.remove_replacement(handle.addr);
            }
        }

        let bucket = &mut self.buckets[index];

        if let Some(node) = bucket.get_mut(handle.addr) {
            if node.id() == handle.id {
                node.on_response(rtt, now, quarantine);
                bucket.touch(now);
                return;
            }

            // Same address, different id: the old entry is stale.
            log::debug!("Node at {} changed its id", handle.addr);
            bucket.remove(handle.addr);
        }

        let node = match bucket.take_replacement(handle.addr) {
            Some(mut node) if node.id() == handle.id => {
                node.on_response(rtt, now, quarantine);
                if node.in_quarantine() {
                    bucket.push_replacement(node, k);
                    return;
                }
                node
            }
            _ => {
                let mut node = RoutingNode::new(handle, now);
                node.on_response(rtt, now, quarantine);
                node
            }
        };

        let node = match bucket.admit(node, k, now) {
            Ok(()) => return,
            Err(node) => node,
        };

        // Only nodes that survived their quarantine compete with members.
        let node = if policy == RoutingPolicy::NiceRtt && !node.in_quarantine() {
            match bucket.swap_slowest(node, k) {
                Ok(()) => {
                    bucket.touch(now);
                    return;
                }
                Err(node) => node,
            }
        } else {
            node
        };

        bucket.push_replacement(node, k);
    }

    /// A node sent us a query.
    ///
    /// Returns true if the node is unknown and its bucket has room, in which case it should be
    /// pinged before it is admitted. Otherwise an unknown node is parked in the replacement cache.
    pub fn on_query(&mut self, handle: NodeHandle, now: Instant) -> bool {
        let index = match self.bucket_index(&handle.id) {
            Some(index) => index,
            None => return false,
        };
        let (k, quarantine) = (self.k, self.quarantine);
        let bucket = &mut self.buckets[index];

        if let Some(node) = bucket.get_mut(handle.addr) {
            if node.id() == handle.id {
                node.on_query(now, quarantine);
                return false;
            }
        }

        if let Some(mut node) = bucket.take_replacement(handle.addr) {
            if node.id() == handle.id {
                node.on_query(now, quarantine);

                if !node.in_quarantine() {
                    match bucket.admit(node, k, now) {
                        Ok(()) => return false,
                        Err(node) => bucket.push_replacement(node, k),
                    }
                } else {
                    bucket.push_replacement(node, k);
                }

                return false;
            }
        }

        if bucket.has_room(k, now) {
            return true;
        }

        let mut node = RoutingNode::new(handle, now);
        node.on_query(now, quarantine);
        bucket.push_replacement(node, k);

        false
    }

    /// One of our queries to the node timed out.
    pub fn on_timeout(&mut self, addr: SocketAddr, id: &NodeId, now: Instant) {
        let index = match self.bucket_index(id) {
            Some(index) => index,
            None => return,
        };
        let policy = self.policy;
        let bucket = &mut self.buckets[index];

        if let Some(node) = bucket.get_mut(addr) {
            node.on_timeout(now);

            if node.status(now) == NodeStatus::Bad {
                bucket.replace_member(addr, policy, now);
            }
        } else if let Some(node) = bucket.replacement_mut(addr) {
            node.on_timeout(now);

            if node.status(now) == NodeStatus::Bad {
                bucket.remove_replacement(addr);
            }
        }
    }

    /// Up to `count` good nodes closest to `target`, ordered by XOR distance. Ties are broken by
    /// lower RTT, then more responses, then most recent activity.
    pub fn get_closest(&self, target: &NodeId, count: usize, now: Instant) -> Vec<NodeHandle> {
        self.closest_by(target, count, |node| {
            !node.in_quarantine() && node.status(now) == NodeStatus::Good
        })
    }

    /// Like `get_closest` but includes questionable nodes. Used to answer remote queries.
    pub fn closest_pingable(&self, target: &NodeId, count: usize, now: Instant) -> Vec<NodeHandle> {
        self.closest_by(target, count, |node| {
            !node.in_quarantine() && node.is_pingable(now)
        })
    }

    fn closest_by<F>(&self, target: &NodeId, count: usize, filter: F) -> Vec<NodeHandle>
    where
        F: Fn(&RoutingNode) -> bool,
    {
        let mut nodes: Vec<_> = self
            .buckets
            .iter()
            .flat_map(|bucket| bucket.iter())
            .filter(|node| filter(node))
            .collect();

        nodes.sort_by(|a, b| compare_closeness(target, a, b));
        nodes
            .into_iter()
            .take(count)
            .map(|node| *node.handle())
            .collect()
    }

    /// Members whose status is questionable and should be pinged.
    pub fn questionable_nodes(&self, now: Instant) -> Vec<NodeHandle> {
        self.buckets
            .iter()
            .flat_map(|bucket| bucket.iter())
            .filter(|node| node.status(now) == NodeStatus::Questionable)
            .map(|node| *node.handle())
            .collect()
    }

    /// Replacement nodes whose quarantine period is over but that have not yet proven themselves
    /// with a response since.
    pub fn replacements_to_review(&self, now: Instant) -> Vec<NodeHandle> {
        self.buckets
            .iter()
            .flat_map(|bucket| bucket.replacements())
            .filter(|node| node.in_quarantine() && node.quarantine_over(now, self.quarantine))
            .map(|node| *node.handle())
            .collect()
    }

    /// Buckets that saw no change for `period`. Only buckets at or beyond the closest populated
    /// one are considered, the ones closer to us are expected to stay empty.
    pub fn buckets_to_refresh(&self, period: Duration, now: Instant) -> Vec<usize> {
        let first = match self.buckets.iter().position(|bucket| !bucket.is_empty()) {
            Some(first) => first,
            None => return Vec::new(),
        };

        self.buckets
            .iter()
            .enumerate()
            .skip(first)
            .filter(|(_, bucket)| now.saturating_duration_since(bucket.last_changed()) >= period)
            .map(|(index, _)| index)
            .collect()
    }

    /// Mark a bucket as refreshed so it is not picked again for a full period.
    pub fn mark_refreshed(&mut self, index: usize, now: Instant) {
        if let Some(bucket) = self.buckets.get_mut(index) {
            bucket.touch(now);
        }
    }

    /// Random id that falls into the bucket at `index`.
    pub fn random_id_in_bucket<R: Rng + ?Sized>(&self, index: usize, rng: &mut R) -> NodeId {
        self.node_id.random_at_log_distance(index, rng)
    }

    /// Number of good nodes in the RoutingTable.
    pub fn num_good_nodes(&self, now: Instant) -> usize {
        self.count_members(|node| node.status(now) == NodeStatus::Good)
    }

    pub fn num_questionable_nodes(&self, now: Instant) -> usize {
        self.count_members(|node| node.status(now) == NodeStatus::Questionable)
    }

    pub fn num_replacements(&self) -> usize {
        self.buckets
            .iter()
            .map(|bucket| bucket.replacements().count())
            .sum()
    }

    fn count_members<F: Fn(&RoutingNode) -> bool>(&self, filter: F) -> usize {
        self.buckets
            .iter()
            .flat_map(|bucket| bucket.iter())
            .filter(|node| filter(node))
            .count()
    }

    /// Pingable members with the time of their last activity, for persisting.
    pub fn snapshot(&self, now: Instant) -> Vec<(NodeHandle, Instant)> {
        self.buckets
            .iter()
            .flat_map(|bucket| bucket.iter())
            .filter(|node| node.is_pingable(now))
            .map(|node| (*node.handle(), node.last_action_ts()))
            .collect()
    }
}

fn compare_closeness(target: &NodeId, a: &RoutingNode, b: &RoutingNode) -> Ordering {
    let rtt = |node: &RoutingNode| node.rtt().unwrap_or(Duration::MAX);

    target
        .distance(&a.id())
        .cmp(&target.distance(&b.id()))
        .then_with(|| rtt(a).cmp(&rtt(b)))
        .then_with(|| Reverse(a.num_responses()).cmp(&Reverse(b.num_responses())))
        .then_with(|| Reverse(a.last_action_ts()).cmp(&Reverse(b.last_action_ts())))
}

use super::{
    node::{NodeStatus, RoutingNode},
    NodeHandle, RoutingPolicy,
};
use std::{
    collections::VecDeque,
    net::SocketAddr,
    time::{Duration, Instant},
};

/// Nodes at one log-distance from the owner: up to `k` members plus a replacement cache of the
/// same size, most recently seen last.
pub(crate) struct Bucket {
    nodes: Vec<RoutingNode>,
    replacements: VecDeque<RoutingNode>,
    last_changed: Instant,
}

impl Bucket {
    pub fn new(now: Instant) -> Bucket {
        Bucket {
            nodes: Vec::new(),
            replacements: VecDeque::new(),
            last_changed: now,
        }
    }

    /// Iterator over the members of the bucket.
    pub fn iter(&self) -> impl Iterator<Item = &RoutingNode> {
        self.nodes.iter()
    }

    pub fn replacements(&self) -> impl Iterator<Item = &RoutingNode> {
        self.replacements.iter()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.replacements.is_empty()
    }

    pub fn last_changed(&self) -> Instant {
        self.last_changed
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_changed = now;
    }

    pub fn get_mut(&mut self, addr: SocketAddr) -> Option<&mut RoutingNode> {
        self.nodes.iter_mut().find(|node| node.addr() == addr)
    }

    pub fn replacement_mut(&mut self, addr: SocketAddr) -> Option<&mut RoutingNode> {
        self.replacements.iter_mut().find(|node| node.addr() == addr)
    }

    pub fn take_replacement(&mut self, addr: SocketAddr) -> Option<RoutingNode> {
        let index = self
            .replacements
            .iter()
            .position(|node| node.addr() == addr)?;
        self.replacements.remove(index)
    }

    pub fn has_room(&self, k: usize, now: Instant) -> bool {
        self.nodes.len() < k || self.nodes.iter().any(|node| node.status(now) == NodeStatus::Bad)
    }

    /// Try to make the node a member, taking a free slot or the slot of a bad member.
    ///
    /// Gives the node back if the bucket is full of non-bad members.
    pub fn admit(
        &mut self,
        mut node: RoutingNode,
        k: usize,
        now: Instant,
    ) -> Result<(), RoutingNode> {
        if self.nodes.len() < k {
            node.lift_quarantine();
            self.nodes.push(node);
            self.last_changed = now;
            return Ok(());
        }

        if let Some(index) = self
            .nodes
            .iter()
            .position(|n| n.status(now) == NodeStatus::Bad)
        {
            node.lift_quarantine();
            let evicted = std::mem::replace(&mut self.nodes[index], node);
            log::trace!("Evicted bad node {:?}", evicted.handle());
            self.last_changed = now;
            return Ok(());
        }

        Err(node)
    }

    /// Swap the slowest member for `node` if `node` has a lower RTT. The demoted member moves to
    /// the replacement cache.
    pub fn swap_slowest(&mut self, node: RoutingNode, k: usize) -> Result<(), RoutingNode> {
        let candidate_rtt = match node.rtt() {
            Some(rtt) => rtt,
            None => return Err(node),
        };

        let slowest = self
            .nodes
            .iter()
            .enumerate()
            .max_by_key(|(_, n)| n.rtt().unwrap_or(Duration::MAX))
            .map(|(index, n)| (index, n.rtt().unwrap_or(Duration::MAX)));

        match slowest {
            Some((index, rtt)) if candidate_rtt < rtt => {
                let demoted = std::mem::replace(&mut self.nodes[index], node);
                self.push_replacement(demoted, k);
                Ok(())
            }
            _ => Err(node),
        }
    }

    /// Put a node into the replacement cache as the most recently seen one, dropping the oldest
    /// entry when the cache is full.
    pub fn push_replacement(&mut self, node: RoutingNode, k: usize) {
        self.replacements.retain(|n| n.addr() != node.addr());

        while self.replacements.len() >= k {
            self.replacements.pop_front();
        }

        self.replacements.push_back(node);
    }

    /// Remove a member, promoting a replacement that is out of quarantine into its slot.
    pub fn replace_member(&mut self, addr: SocketAddr, policy: RoutingPolicy, now: Instant) {
        let index = match self.nodes.iter().position(|n| n.addr() == addr) {
            Some(index) => index,
            None => return,
        };

        let promoted = match policy {
            RoutingPolicy::NiceRtt => self
                .replacements
                .iter()
                .enumerate()
                .filter(|(_, n)| !n.in_quarantine() && n.is_pingable(now))
                .min_by_key(|(_, n)| n.rtt().unwrap_or(Duration::MAX))
                .map(|(index, _)| index),
            RoutingPolicy::BucketLru => self
                .replacements
                .iter()
                .rposition(|n| !n.in_quarantine() && n.is_pingable(now)),
        };

        if let Some(promoted) = promoted.and_then(|index| self.replacements.remove(index)) {
            log::debug!("Promoting replacement node {:?}", promoted.handle());
            self.nodes[index] = promoted;
            self.last_changed = now;
        }
    }

    pub fn remove(&mut self, addr: SocketAddr) {
        self.nodes.retain(|n| n.addr() != addr);
    }

    pub fn remove_replacement(&mut self, addr: SocketAddr) {
        self.replacements.retain(|n| n.addr() != addr);
    }

    #[cfg(test)]
    pub fn contains(&self, handle: &NodeHandle) -> bool {
        self.nodes.iter().any(|n| n.handle() == handle)
    }
}

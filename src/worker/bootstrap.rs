use super::LookupId;
use crate::id::NodeId;
use std::{
    collections::HashSet,
    net::SocketAddr,
    time::Duration,
};

/// Retries back off exponentially up to 2^9 seconds.
const MAX_BACKOFF_EXPONENT: u32 = 9;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum State {
    // Before the first attempt, or waiting to retry after a failed one.
    Idle,
    Bootstrapping(LookupId),
    Bootstrapped,
}

/// Tracks where the routing table gets populated from and how the attempts went.
pub(crate) struct TableBootstrap {
    routers: HashSet<String>,
    router_addresses: HashSet<SocketAddr>,
    nodes: HashSet<SocketAddr>,
    contacts: Vec<(SocketAddr, NodeId)>,
    state: State,
    attempt: u32,
}

impl TableBootstrap {
    /// `contacts` come from the saved routing table, `nodes` and `routers` from the user.
    pub fn new(
        routers: HashSet<String>,
        nodes: HashSet<SocketAddr>,
        contacts: Vec<(SocketAddr, NodeId)>,
    ) -> Self {
        Self {
            routers,
            router_addresses: HashSet::new(),
            nodes,
            contacts,
            state: State::Idle,
            attempt: 0,
        }
    }

    /// Is there anybody to bootstrap from? Without contacts this node starts a new network.
    pub fn has_contacts(&self) -> bool {
        !self.routers.is_empty() || !self.nodes.is_empty() || !self.contacts.is_empty()
    }

    pub fn routers(&self) -> &HashSet<String> {
        &self.routers
    }

    pub fn set_router_addresses(&mut self, addresses: HashSet<SocketAddr>) {
        self.router_addresses = addresses;
    }

    /// Routers only help us find nodes. They are never added to the routing table.
    pub fn is_router(&self, addr: &SocketAddr) -> bool {
        self.router_addresses.contains(addr)
    }

    /// Where to send the bootstrap queries. Routers are used when there is no saved routing table
    /// or when an earlier attempt failed.
    pub fn seeds(&self) -> Vec<(SocketAddr, Option<NodeId>)> {
        let mut seeds: Vec<_> = self
            .contacts
            .iter()
            .map(|(addr, id)| (*addr, Some(*id)))
            .collect();

        seeds.extend(self.nodes.iter().map(|addr| (*addr, None)));

        if self.contacts.is_empty() || self.attempt > 0 {
            seeds.extend(self.router_addresses.iter().map(|addr| (*addr, None)));
        }

        seeds
    }

    pub fn start(&mut self, lookup: LookupId) {
        self.state = State::Bootstrapping(lookup);
    }

    /// The lookup of the running attempt, if any.
    pub fn lookup(&self) -> Option<LookupId> {
        match self.state {
            State::Bootstrapping(lookup) => Some(lookup),
            _ => None,
        }
    }

    pub fn is_bootstrapped(&self) -> bool {
        self.state == State::Bootstrapped
    }

    /// Record the outcome of an attempt. On failure returns the delay before the next one.
    pub fn finish(&mut self, success: bool) -> Option<Duration> {
        if success {
            self.state = State::Bootstrapped;
            self.attempt = 0;
            None
        } else {
            self.state = State::Idle;
            let delay = backoff(self.attempt);
            self.attempt = self.attempt.saturating_add(1);
            Some(delay)
        }
    }

    /// The routing table lost all its good nodes.
    pub fn reset(&mut self) {
        self.state = State::Idle;
    }
}

fn backoff(attempt: u32) -> Duration {
    Duration::from_secs(1 << attempt.min(MAX_BACKOFF_EXPONENT))
}

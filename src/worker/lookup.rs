use crate::{
    config::LookupPolicy,
    error::DhtError,
    id::{InfoHash, NodeId, ShaHash},
    message::{AnnouncePeerRequest, AnnouncePort, FindNodeRequest, GetPeersRequest, Request, Response},
};
use std::{
    cmp::Ordering,
    collections::HashSet,
    net::SocketAddr,
};

pub(crate) type LookupId = u64;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum LookupKind {
    /// Iterative `get_peers`. When `announce` is set, the closest responders are sent an
    /// `announce_peer` with `port` once the lookup converged.
    GetPeers { announce: bool, port: AnnouncePort },
    /// Iterative `find_node`, used to populate the routing table.
    FindNode,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Phase {
    Seeded,
    Querying,
    Converged,
    Announcing,
    Done,
}

/// Outcome of a finished lookup.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct LookupSummary {
    /// Distinct peers discovered.
    pub peers: usize,
    /// Nodes that responded to our queries.
    pub responded: usize,
    /// Nodes that acknowledged our announce.
    pub announced: usize,
}

/// A query the lookup wants sent.
#[derive(Debug)]
pub(crate) struct Outgoing {
    pub addr: SocketAddr,
    pub node_id: Option<NodeId>,
    pub request: Request,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum CandidateState {
    Unqueried,
    InFlight,
    Responded,
    Failed,
}

#[derive(Debug)]
struct Candidate {
    addr: SocketAddr,
    // Unknown for bootstrap contacts until they respond.
    id: Option<NodeId>,
    state: CandidateState,
    token: Option<Vec<u8>>,
}

/// State of one iterative lookup. Performs no I/O: `advance` tells the caller what to send and
/// the outcomes are fed back through `on_response` and `on_failure`.
pub(crate) struct Lookup {
    local_id: NodeId,
    target: ShaHash,
    kind: LookupKind,
    policy: LookupPolicy,
    k: usize,
    alpha: usize,
    phase: Phase,
    // Ordered by distance to the target, unknown ids last.
    shortlist: Vec<Candidate>,
    queried: HashSet<SocketAddr>,
    peers: HashSet<SocketAddr>,
    announcing: HashSet<SocketAddr>,
    responded: usize,
    announced: usize,
}

impl Lookup {
    pub fn new<I>(
        local_id: NodeId,
        target: ShaHash,
        kind: LookupKind,
        policy: LookupPolicy,
        k: usize,
        alpha: usize,
        seeds: I,
    ) -> Self
    where
        I: IntoIterator<Item = (SocketAddr, Option<NodeId>)>,
    {
        let mut lookup = Self {
            local_id,
            target,
            kind,
            policy,
            k,
            alpha: alpha.max(1),
            phase: Phase::Seeded,
            shortlist: Vec::new(),
            queried: HashSet::new(),
            peers: HashSet::new(),
            announcing: HashSet::new(),
            responded: 0,
            announced: 0,
        };

        for (addr, id) in seeds {
            lookup.add_candidate(addr, id);
        }
        lookup.sort_shortlist();

        lookup
    }

    pub fn target(&self) -> ShaHash {
        self.target
    }

    #[cfg(test)]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }

    /// Move the lookup forward and return the queries to send now.
    pub fn advance(&mut self) -> Vec<Outgoing> {
        loop {
            match self.phase {
                Phase::Seeded => {
                    self.phase = Phase::Querying;

                    let count = self.policy.initial_parallelism(self.alpha);
                    let outgoing = self.pick(count, count.max(self.k));
                    if !outgoing.is_empty() {
                        return outgoing;
                    }
                }
                Phase::Querying => {
                    let count = self.alpha.saturating_sub(self.num_in_flight());
                    let outgoing = self.pick(count, self.k);
                    if !outgoing.is_empty() || self.num_in_flight() > 0 {
                        return outgoing;
                    }

                    log::debug!(
                        "Lookup for {:?} converged after {} responses",
                        self.target,
                        self.responded
                    );
                    self.phase = Phase::Converged;
                }
                Phase::Converged => {
                    let outgoing = self.announce_requests();
                    if outgoing.is_empty() {
                        self.phase = Phase::Done;
                    } else {
                        self.phase = Phase::Announcing;
                        return outgoing;
                    }
                }
                Phase::Announcing => {
                    if self.announcing.is_empty() {
                        self.phase = Phase::Done;
                    }
                    return Vec::new();
                }
                Phase::Done => return Vec::new(),
            }
        }
    }

    /// A queried node responded. Returns the peers it reported that were not seen before in this
    /// lookup, in the order it listed them.
    pub fn on_response(&mut self, addr: SocketAddr, response: &Response) -> Vec<SocketAddr> {
        let candidate = match self
            .shortlist
            .iter_mut()
            .find(|c| c.addr == addr && c.state == CandidateState::InFlight)
        {
            Some(candidate) => candidate,
            None => return Vec::new(),
        };

        candidate.state = CandidateState::Responded;
        candidate.id.get_or_insert(response.id());
        self.responded += 1;

        let mut new_peers = Vec::new();

        if let Response::GetPeers(response) = response {
            candidate.token = Some(response.token.clone());

            if matches!(self.kind, LookupKind::GetPeers { .. }) {
                for peer in &response.values {
                    if self.peers.insert(*peer) {
                        new_peers.push(*peer);
                    }
                }
            }
        }

        for node in response.nodes() {
            self.add_candidate(node.addr, Some(node.id));
        }
        self.sort_shortlist();

        new_peers
    }

    /// A query timed out, was answered with an error or could not be sent. The node is not
    /// queried again and the nodes it contributed stay where they are.
    pub fn on_failure(&mut self, addr: SocketAddr) {
        if let Some(candidate) = self
            .shortlist
            .iter_mut()
            .find(|c| c.addr == addr && c.state == CandidateState::InFlight)
        {
            candidate.state = CandidateState::Failed;
        }
    }

    /// An announce finished. Failed announces are only logged.
    pub fn on_announce_finished(&mut self, addr: SocketAddr, success: bool) {
        if !self.announcing.remove(&addr) {
            return;
        }

        if success {
            self.announced += 1;
        } else {
            log::debug!("Announce to {} failed", addr);
        }
    }

    pub fn summary(&self) -> Result<LookupSummary, DhtError> {
        if self.responded == 0 {
            return Err(DhtError::Routing);
        }

        Ok(LookupSummary {
            peers: self.peers.len(),
            responded: self.responded,
            announced: self.announced,
        })
    }

    fn num_in_flight(&self) -> usize {
        self.shortlist
            .iter()
            .filter(|c| c.state == CandidateState::InFlight)
            .count()
    }

    /// Mark up to `count` unqueried candidates among the `window` closest live ones as in flight.
    fn pick(&mut self, count: usize, window: usize) -> Vec<Outgoing> {
        let mut picked = Vec::new();

        for candidate in self
            .shortlist
            .iter_mut()
            .filter(|c| c.state != CandidateState::Failed)
            .take(window)
        {
            if picked.len() >= count {
                break;
            }

            if candidate.state == CandidateState::Unqueried && self.queried.insert(candidate.addr)
            {
                candidate.state = CandidateState::InFlight;
                picked.push((candidate.addr, candidate.id));
            }
        }

        picked
            .into_iter()
            .map(|(addr, node_id)| Outgoing {
                addr,
                node_id,
                request: self.query(),
            })
            .collect()
    }

    fn query(&self) -> Request {
        match self.kind {
            LookupKind::GetPeers { .. } => Request::GetPeers(GetPeersRequest {
                id: self.local_id,
                info_hash: self.target,
            }),
            LookupKind::FindNode => Request::FindNode(FindNodeRequest {
                id: self.local_id,
                target: self.target,
            }),
        }
    }

    /// `announce_peer` to the `k` closest responders, each with the token it gave us.
    fn announce_requests(&mut self) -> Vec<Outgoing> {
        let port = match self.kind {
            LookupKind::GetPeers {
                announce: true,
                port,
            } => port,
            _ => return Vec::new(),
        };

        let info_hash: InfoHash = self.target;
        let local_id = self.local_id;

        let outgoing: Vec<_> = self
            .shortlist
            .iter()
            .filter(|c| c.state == CandidateState::Responded)
            .filter_map(|c| c.token.as_ref().map(|token| (c, token)))
            .take(self.k)
            .map(|(c, token)| Outgoing {
                addr: c.addr,
                node_id: c.id,
                request: Request::AnnouncePeer(AnnouncePeerRequest {
                    id: local_id,
                    info_hash,
                    port,
                    token: token.clone(),
                }),
            })
            .collect();

        self.announcing
            .extend(outgoing.iter().map(|outgoing| outgoing.addr));

        outgoing
    }

    fn add_candidate(&mut self, addr: SocketAddr, id: Option<NodeId>) {
        if id == Some(self.local_id) || self.shortlist.iter().any(|c| c.addr == addr) {
            return;
        }

        self.shortlist.push(Candidate {
            addr,
            id,
            state: CandidateState::Unqueried,
            token: None,
        });
    }

    fn sort_shortlist(&mut self) {
        let target = self.target;

        // Stable sort keeps arrival order among equally distant candidates.
        self.shortlist.sort_by(|a, b| match (a.id, b.id) {
            (Some(a), Some(b)) => target.distance(&a).cmp(&target.distance(&b)),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        id::NODE_ID_LEN,
        message::{GetPeersResponse, OtherResponse},
        routing::NodeHandle,
        test,
    };
    use std::net::Ipv4Addr;

    const K: usize = 8;
    const ALPHA: usize = 3;

    fn id_with_last_byte(byte: u8) -> NodeId {
        let mut id = [0u8; NODE_ID_LEN];
        id[NODE_ID_LEN - 1] = byte;
        id.into()
    }

    fn node(byte: u8) -> NodeHandle {
        NodeHandle::new(
            id_with_last_byte(byte),
            (Ipv4Addr::new(10, 0, 0, byte), 6881).into(),
        )
    }

    fn local_id() -> NodeId {
        [0xff; NODE_ID_LEN].into()
    }

    fn get_peers_response(
        id: NodeId,
        values: Vec<SocketAddr>,
        nodes: Vec<NodeHandle>,
        token: &[u8],
    ) -> Response {
        Response::GetPeers(GetPeersResponse {
            id,
            values,
            nodes,
            token: token.to_vec(),
        })
    }

    fn addrs(outgoing: &[Outgoing]) -> Vec<SocketAddr> {
        outgoing.iter().map(|o| o.addr).collect()
    }

    fn seeds(nodes: &[NodeHandle]) -> Vec<(SocketAddr, Option<NodeId>)> {
        nodes.iter().map(|n| (n.addr, Some(n.id))).collect()
    }

    #[test]
    fn positive_get_peers_termination_and_announce() {
        let target = test::dummy_node_id();
        let (a, b, c, d) = (node(0x10), node(0x20), node(0x30), node(0x01));
        let peers = test::dummy_block_socket_addrs(2);
        let (p1, p2) = (peers[0], peers[1]);

        let mut lookup = Lookup::new(
            local_id(),
            target,
            LookupKind::GetPeers {
                announce: true,
                port: AnnouncePort::Explicit(6881),
            },
            LookupPolicy::A3Classic,
            K,
            ALPHA,
            seeds(&[a, b, c]),
        );
        assert_eq!(lookup.phase(), Phase::Seeded);

        let outgoing = lookup.advance();
        assert_eq!(addrs(&outgoing), vec![a.addr, b.addr, c.addr]);
        assert!(outgoing
            .iter()
            .all(|o| matches!(o.request, Request::GetPeers(_))));
        assert_eq!(lookup.phase(), Phase::Querying);

        let reported = lookup.on_response(a.addr, &get_peers_response(a.id, vec![p1], vec![d], b"ta"));
        assert_eq!(reported, vec![p1]);
        assert_eq!(addrs(&lookup.advance()), vec![d.addr]);

        lookup.on_failure(b.addr);
        assert!(lookup.advance().is_empty());

        let reported = lookup.on_response(c.addr, &get_peers_response(c.id, vec![p2], vec![], b"tc"));
        assert_eq!(reported, vec![p2]);
        assert!(lookup.advance().is_empty());

        let reported = lookup.on_response(d.addr, &get_peers_response(d.id, vec![], vec![], b"td"));
        assert!(reported.is_empty());

        let outgoing = lookup.advance();
        assert_eq!(lookup.phase(), Phase::Announcing);
        assert_eq!(addrs(&outgoing), vec![d.addr, a.addr, c.addr]);

        for (outgoing, expected_token) in outgoing.iter().zip([b"td", b"ta", b"tc"]) {
            match &outgoing.request {
                Request::AnnouncePeer(request) => {
                    assert_eq!(request.token, expected_token.to_vec());
                    assert_eq!(request.info_hash, target);
                    assert_eq!(request.port, AnnouncePort::Explicit(6881));
                }
                other => panic!("unexpected request {:?}", other),
            }
        }

        for outgoing in &outgoing {
            lookup.on_announce_finished(outgoing.addr, true);
        }
        assert!(lookup.advance().is_empty());
        assert!(lookup.is_done());
        assert_eq!(
            lookup.summary().unwrap(),
            LookupSummary {
                peers: 2,
                responded: 3,
                announced: 3,
            }
        );
    }

    #[test]
    fn positive_peers_deduplicated() {
        let target = test::dummy_node_id();
        let (a, b) = (node(0x10), node(0x20));
        let peer = test::dummy_socket_addr_v4();
        let mut lookup = Lookup::new(
            local_id(),
            target,
            LookupKind::GetPeers {
                announce: false,
                port: AnnouncePort::Implied(6881),
            },
            LookupPolicy::A3Classic,
            K,
            ALPHA,
            seeds(&[a, b]),
        );

        lookup.advance();
        assert_eq!(
            lookup.on_response(a.addr, &get_peers_response(a.id, vec![peer], vec![], b"t")),
            vec![peer]
        );
        assert!(lookup
            .on_response(b.addr, &get_peers_response(b.id, vec![peer], vec![], b"t"))
            .is_empty());

        // No announce requested: the lookup ends once converged.
        assert!(lookup.advance().is_empty());
        assert!(lookup.is_done());
        assert_eq!(lookup.summary().unwrap().peers, 1);
    }

    #[test]
    fn positive_no_node_queried_twice() {
        let target = test::dummy_node_id();
        let (a, b, c) = (node(0x10), node(0x20), node(0x02));
        let mut lookup = Lookup::new(
            local_id(),
            target,
            LookupKind::FindNode,
            LookupPolicy::A3Classic,
            K,
            ALPHA,
            seeds(&[a, b]),
        );
        let mut queried = Vec::new();

        queried.extend(addrs(&lookup.advance()));
        let response = |id, nodes| Response::Other(OtherResponse { id, nodes });

        lookup.on_response(a.addr, &response(a.id, vec![b, c]));
        queried.extend(addrs(&lookup.advance()));
        lookup.on_response(b.addr, &response(b.id, vec![a, c]));
        queried.extend(addrs(&lookup.advance()));
        lookup.on_response(c.addr, &response(c.id, vec![a, b]));
        queried.extend(addrs(&lookup.advance()));

        assert!(lookup.is_done());
        let unique: HashSet<_> = queried.iter().collect();
        assert_eq!(unique.len(), queried.len());
        assert_eq!(queried.len(), 3);
    }

    #[test]
    fn positive_find_node_ignores_values_and_skips_own_id() {
        let local = local_id();
        let a = node(0x10);
        let us = NodeHandle::new(local, test::dummy_socket_addr_v4());
        let mut lookup = Lookup::new(
            local,
            local,
            LookupKind::FindNode,
            LookupPolicy::A3Classic,
            K,
            ALPHA,
            seeds(&[a]),
        );

        let outgoing = lookup.advance();
        assert!(matches!(outgoing[0].request, Request::FindNode(_)));

        let reported = lookup.on_response(
            a.addr,
            &get_peers_response(a.id, vec![test::dummy_socket_addr_v4()], vec![us], b"t"),
        );

        assert!(reported.is_empty());
        assert!(lookup.advance().is_empty());
        assert!(lookup.is_done());
    }

    #[test]
    fn positive_unknown_ids_queried_last() {
        let target = test::dummy_node_id();
        let a = node(0x10);
        let contact: SocketAddr = (Ipv4Addr::new(10, 1, 1, 1), 6881).into();
        let mut lookup = Lookup::new(
            local_id(),
            target,
            LookupKind::FindNode,
            LookupPolicy::A3Classic,
            K,
            1,
            vec![(contact, None), (a.addr, Some(a.id))],
        );

        assert_eq!(addrs(&lookup.advance()), vec![a.addr]);
        lookup.on_response(a.addr, &Response::Other(OtherResponse { id: a.id, nodes: vec![] }));
        assert_eq!(addrs(&lookup.advance()), vec![contact]);
    }

    #[test]
    fn positive_aggressive_first_round() {
        let target = test::dummy_node_id();
        let nodes: Vec<_> = (1..=20).map(node).collect();
        let mut lookup = Lookup::new(
            local_id(),
            target,
            LookupKind::FindNode,
            LookupPolicy::A16,
            K,
            ALPHA,
            seeds(&nodes),
        );

        assert_eq!(lookup.advance().len(), 16);

        // Further rounds are bounded by alpha again.
        for node in &nodes[..14] {
            lookup.on_failure(node.addr);
        }
        assert_eq!(lookup.advance().len(), 1);
    }

    #[test]
    fn negative_failures_end_lookup_with_routing_error() {
        let target = test::dummy_node_id();
        let (a, b) = (node(0x10), node(0x20));
        let mut lookup = Lookup::new(
            local_id(),
            target,
            LookupKind::GetPeers {
                announce: true,
                port: AnnouncePort::Implied(6881),
            },
            LookupPolicy::A3Classic,
            K,
            ALPHA,
            seeds(&[a, b]),
        );

        lookup.advance();
        lookup.on_failure(a.addr);
        lookup.on_failure(b.addr);

        assert!(lookup.advance().is_empty());
        assert!(lookup.is_done());
        assert!(matches!(lookup.summary(), Err(DhtError::Routing)));
    }

    #[test]
    fn negative_no_seeds() {
        let mut lookup = Lookup::new(
            local_id(),
            test::dummy_node_id(),
            LookupKind::FindNode,
            LookupPolicy::A3Classic,
            K,
            ALPHA,
            Vec::new(),
        );

        assert!(lookup.advance().is_empty());
        assert!(lookup.is_done());
    }
}

pub(crate) use self::{
    handler::{DhtHandler, HandlerParams},
    lookup::{LookupId, LookupKind},
    socket::Socket,
};
pub use self::lookup::LookupSummary;

use crate::{error::DhtError, id::InfoHash, transaction::TransactionID};
use std::{collections::HashSet, net::SocketAddr};
use tokio::sync::{mpsc, oneshot};

mod bootstrap;
mod handler;
mod lookup;
mod refresh;
mod rpc;
mod socket;
mod timer;

/// Counters describing the state of a running DHT.
#[derive(Copy, Clone, Debug, Default)]
pub struct DebugState {
    pub bootstrapped: bool,
    pub good_node_count: usize,
    pub questionable_node_count: usize,
    pub replacement_count: usize,
    pub stored_peer_count: usize,
    pub in_flight_rpc_count: usize,
    pub active_lookup_count: usize,
}

/// Notable changes in the state of the DHT, reported through the channel returned by
/// [`DhtBuilder::start`](crate::DhtBuilder::start).
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DhtEvent {
    /// The routing table has at least one good node.
    BootstrapCompleted,
    /// A bootstrap attempt ended without a good node. It will be retried.
    BootstrapFailed,
    /// The socket failed this many times within a short window. The DHT keeps running.
    SocketErrors { count: usize },
}

/// Result of a search, in the order the events happened.
#[derive(Debug)]
pub enum SearchEvent {
    /// A peer of the info hash. Each peer is reported once.
    Peer(SocketAddr),
    /// The search finished. Always the last event.
    Done(Result<LookupSummary, DhtError>),
}

/// Task that our DHT will execute immediately.
pub(crate) enum OneshotTask {
    /// Start a lookup.
    StartLookup(StartLookup),
    /// Abort a lookup and its queries in flight. It reports nothing afterwards.
    CancelLookup(LookupId),
    /// Retrieve debug information.
    GetDebugState(oneshot::Sender<DebugState>),
    /// Save the routing table and terminate. The sender is notified once done.
    Stop(oneshot::Sender<()>),
}

pub(crate) struct StartLookup {
    pub id: LookupId,
    pub info_hash: InfoHash,
    pub kind: LookupKind,
    /// Forward discovered peers to `tx`.
    pub report_peers: bool,
    pub tx: mpsc::UnboundedSender<SearchEvent>,
}

/// Task that our DHT will execute some time later.
#[derive(Copy, Clone, Debug)]
pub(crate) enum ScheduledTaskCheck {
    /// A query got no response in time.
    RpcTimeout(TransactionID, SocketAddr),
    /// Try to bootstrap again.
    BootstrapRetry,
    /// Refresh idle buckets.
    TableRefresh,
    /// Ping questionable nodes and replacements whose quarantine ended.
    QuarantineReview,
    /// Drop expired peers.
    PeerCleanup,
    /// Rotate the token secret.
    TokenRotation,
    /// Save a routing table snapshot.
    SnapshotSave,
}

pub(crate) async fn resolve(routers: &HashSet<String>) -> HashSet<SocketAddr> {
    futures_util::future::join_all(routers.iter().map(tokio::net::lookup_host))
        .await
        .into_iter()
        .filter_map(|result| result.ok())
        .flatten()
        .filter(|addr| addr.is_ipv4())
        .collect()
}

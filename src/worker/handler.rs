use super::{
    bootstrap::TableBootstrap,
    lookup::{Lookup, LookupId, LookupKind},
    refresh::{self, MAINTENANCE_INTERVAL},
    resolve,
    rpc::{Owner, QueryKind, RpcManager},
    socket::Socket,
    timer::Timer,
    DebugState, DhtEvent, OneshotTask, ScheduledTaskCheck, SearchEvent, StartLookup,
};
use crate::{
    config::Config,
    error::DhtError,
    id::{NodeId, ShaHash},
    message::{
        error_code, AnnouncePort, Error, GetPeersResponse, Message, MessageBody, OtherResponse,
        PingRequest, Request, Response,
    },
    persist::{SnapshotWriter, StoredContact},
    routing::{NodeHandle, RoutingTable},
    storage::PeerTracker,
    token::TokenStore,
};
use futures_util::StreamExt;
use std::{
    collections::{HashMap, HashSet, VecDeque},
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::{
    select,
    sync::{mpsc, oneshot},
};

/// Socket failures within this window are counted together.
const SOCKET_ERROR_WINDOW: Duration = Duration::from_secs(60);
/// Number of socket failures within the window that is reported to the host.
const SOCKET_ERROR_THRESHOLD: usize = 8;

/// Why a lookup is running.
enum Purpose {
    Search {
        tx: mpsc::UnboundedSender<SearchEvent>,
        report_peers: bool,
    },
    Bootstrap,
    Refresh,
}

struct ActiveLookup {
    lookup: Lookup,
    purpose: Purpose,
}

pub(crate) struct HandlerParams {
    pub node_id: NodeId,
    pub config: Config,
    pub read_only: bool,
    pub routers: HashSet<String>,
    pub nodes: HashSet<SocketAddr>,
    pub contacts: Vec<StoredContact>,
    pub snapshot: SnapshotWriter,
    pub lookup_ids: Arc<AtomicU64>,
}

/// Owns all the state of a DHT instance and runs its event loop.
pub(crate) struct DhtHandler {
    running: bool,
    socket: Socket,
    config: Config,
    read_only: bool,
    routing_table: RoutingTable,
    rpc: RpcManager,
    token_store: TokenStore,
    peers: PeerTracker,
    bootstrap: TableBootstrap,
    lookups: HashMap<LookupId, ActiveLookup>,
    // Lookups that have to be advanced before the next event is handled.
    dirty_lookups: VecDeque<LookupId>,
    // Searches waiting for the bootstrap to finish.
    queued_searches: Vec<StartLookup>,
    lookup_ids: Arc<AtomicU64>,
    timer: Timer<ScheduledTaskCheck>,
    snapshot: SnapshotWriter,
    command_rx: mpsc::UnboundedReceiver<OneshotTask>,
    event_tx: mpsc::UnboundedSender<DhtEvent>,
    socket_errors: VecDeque<Instant>,
    stop_tx: Option<oneshot::Sender<()>>,
}

impl DhtHandler {
    pub fn new(
        params: HandlerParams,
        socket: Socket,
        command_rx: mpsc::UnboundedReceiver<OneshotTask>,
        event_tx: mpsc::UnboundedSender<DhtEvent>,
    ) -> Self {
        let now = Instant::now();
        let config = params.config;

        let contacts = params
            .contacts
            .into_iter()
            .map(|contact| (contact.addr, contact.id))
            .collect();

        Self {
            running: false,
            socket,
            read_only: params.read_only,
            routing_table: RoutingTable::new(
                params.node_id,
                config.k,
                config.quarantine(),
                config.routing_policy,
                now,
            ),
            rpc: RpcManager::new(
                config.rpc_timeout(),
                config.max_pending_rpcs,
                config.tid_grace(),
            ),
            token_store: TokenStore::new(config.token_rotation(), now),
            peers: PeerTracker::new(
                config.peer_validity(),
                config.peer_cleanup_puts,
                config.max_peers_per_response,
            ),
            bootstrap: TableBootstrap::new(params.routers, params.nodes, contacts),
            lookups: HashMap::new(),
            dirty_lookups: VecDeque::new(),
            queued_searches: Vec::new(),
            lookup_ids: params.lookup_ids,
            timer: Timer::new(),
            snapshot: params.snapshot,
            command_rx,
            event_tx,
            socket_errors: VecDeque::new(),
            stop_tx: None,
            config,
        }
    }

    pub async fn run(mut self) {
        self.running = true;

        let now = Instant::now();
        self.schedule_maintenance(now);
        self.start_bootstrap(now).await;
        self.drive_lookups(now).await;

        while self.running {
            self.run_once().await;
        }

        self.shutdown().await;
    }

    async fn run_once(&mut self) {
        select! {
            message = self.socket.recv() => {
                match message {
                    Ok((buffer, addr)) => self.handle_incoming(&buffer, addr).await,
                    Err(error) => self.on_socket_error(error, Instant::now()),
                }
            }
            token = self.timer.next(), if !self.timer.is_empty() => {
                if let Some(token) = token {
                    self.handle_timeout(token).await
                }
            }
            command = self.command_rx.recv() => {
                match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        log::debug!("All DHT handles dropped, shutting down");
                        self.running = false;
                    }
                }
            }
        }

        self.drive_lookups(Instant::now()).await;
    }

    fn handle_command(&mut self, task: OneshotTask) {
        let now = Instant::now();

        match task {
            OneshotTask::StartLookup(start) => {
                if self.bootstrap.lookup().is_some() {
                    log::debug!("Search for {:?} queued until bootstrap finishes", start.info_hash);
                    self.queued_searches.push(start);
                } else {
                    self.begin_search(start, now);
                }
            }
            OneshotTask::CancelLookup(id) => {
                self.queued_searches.retain(|start| start.id != id);

                if self.lookups.remove(&id).is_some() {
                    let cancelled = self.rpc.cancel_owner(Owner::Lookup(id), now, &mut self.timer);
                    log::debug!("Lookup {} cancelled with {} queries in flight", id, cancelled);
                }
            }
            OneshotTask::GetDebugState(tx) => {
                tx.send(self.debug_state(now)).unwrap_or(());
            }
            OneshotTask::Stop(tx) => {
                self.stop_tx = Some(tx);
                self.running = false;
            }
        }
    }

    async fn handle_timeout(&mut self, token: ScheduledTaskCheck) {
        let now = Instant::now();

        match token {
            ScheduledTaskCheck::RpcTimeout(tid, addr) => {
                let transaction = match self.rpc.expire(tid, addr, now) {
                    Some(transaction) => transaction,
                    None => return,
                };

                log::trace!("{:?} query to {} timed out", transaction.kind, addr);

                if let Some(id) = transaction.node_id {
                    self.routing_table.on_timeout(addr, &id, now);
                }

                if let Owner::Lookup(lookup_id) = transaction.owner {
                    self.on_lookup_outcome(lookup_id, transaction.kind, addr, None);
                }
            }
            ScheduledTaskCheck::BootstrapRetry => {
                if self.bootstrap.lookup().is_none() {
                    self.start_bootstrap(now).await;
                }
            }
            ScheduledTaskCheck::TableRefresh => {
                self.handle_table_refresh(now);
                self.timer
                    .schedule_at(now + MAINTENANCE_INTERVAL, ScheduledTaskCheck::TableRefresh);
            }
            ScheduledTaskCheck::QuarantineReview => {
                let mut nodes = self.routing_table.questionable_nodes(now);
                nodes.extend(self.routing_table.replacements_to_review(now));

                for node in nodes {
                    self.ping(node, now).await;
                }

                self.timer.schedule_at(
                    now + MAINTENANCE_INTERVAL,
                    ScheduledTaskCheck::QuarantineReview,
                );
            }
            ScheduledTaskCheck::PeerCleanup => {
                self.peers.cleanup(now);
                self.timer
                    .schedule_at(now + self.peer_cleanup_interval(), ScheduledTaskCheck::PeerCleanup);
            }
            ScheduledTaskCheck::TokenRotation => {
                self.token_store.refresh_check(now);
                self.timer.schedule_at(
                    now + self.config.token_rotation(),
                    ScheduledTaskCheck::TokenRotation,
                );
            }
            ScheduledTaskCheck::SnapshotSave => {
                self.save_snapshot(now);
                self.timer.schedule_at(
                    now + self.config.snapshot_interval(),
                    ScheduledTaskCheck::SnapshotSave,
                );
            }
        }
    }

    fn schedule_maintenance(&mut self, now: Instant) {
        self.timer
            .schedule_at(now + MAINTENANCE_INTERVAL, ScheduledTaskCheck::TableRefresh);
        self.timer
            .schedule_at(now + MAINTENANCE_INTERVAL, ScheduledTaskCheck::QuarantineReview);
        self.timer
            .schedule_at(now + self.peer_cleanup_interval(), ScheduledTaskCheck::PeerCleanup);
        self.timer.schedule_at(
            now + self.config.token_rotation(),
            ScheduledTaskCheck::TokenRotation,
        );
        self.timer.schedule_at(
            now + self.config.snapshot_interval(),
            ScheduledTaskCheck::SnapshotSave,
        );
    }

    fn peer_cleanup_interval(&self) -> Duration {
        (self.config.peer_validity() / 2).max(Duration::from_secs(1))
    }

    // ----------------------------------------------------------------------------//

    async fn handle_incoming(&mut self, buffer: &[u8], addr: SocketAddr) {
        let now = Instant::now();

        if !addr.is_ipv4() {
            log::debug!("Dropping datagram from {}: {}", addr, DhtError::UnsupportedAddressFamily);
            return;
        }

        let message = match Message::decode(buffer, self.config.bencode_max_depth_untrusted) {
            Ok(message) => message,
            Err(error) => {
                log::debug!("Received invalid message from {}: {}", addr, error);

                if !self.read_only {
                    if let Some(reply) = error.reply() {
                        self.send(&reply, addr).await;
                    }
                }

                return;
            }
        };

        match message.body {
            MessageBody::Request(request) => {
                // Do not process requests if we are read only.
                if !self.read_only {
                    self.handle_request(message.transaction_id, request, addr, now)
                        .await;
                }
            }
            MessageBody::Response(response) => {
                self.handle_response(&message.transaction_id, response, addr, now)
            }
            MessageBody::Error(error) => {
                self.handle_error(&message.transaction_id, error, addr, now)
            }
        }
    }

    async fn handle_request(
        &mut self,
        transaction_id: Vec<u8>,
        request: Request,
        addr: SocketAddr,
        now: Instant,
    ) {
        let ip = match addr {
            SocketAddr::V4(addr) => *addr.ip(),
            SocketAddr::V6(_) => return,
        };

        log::trace!("Received {} query from {}", request.method(), addr);

        let node = NodeHandle::new(request.id(), addr);
        let ping_node = self.routing_table.on_query(node, now);
        let id = self.routing_table.node_id();
        let k = self.config.k;

        let body = match request {
            Request::Ping(_) => MessageBody::Response(Response::Other(OtherResponse {
                id,
                nodes: Vec::new(),
            })),
            Request::FindNode(request) => MessageBody::Response(Response::Other(OtherResponse {
                id,
                nodes: self.routing_table.closest_pingable(&request.target, k, now),
            })),
            Request::GetPeers(request) => {
                let token = self.token_store.checkout(ip, now);
                let values = self.peers.get(&request.info_hash, now);
                let nodes = if values.is_empty() {
                    self.routing_table
                        .closest_pingable(&request.info_hash, k, now)
                } else {
                    Vec::new()
                };

                MessageBody::Response(Response::GetPeers(GetPeersResponse {
                    id,
                    values,
                    nodes,
                    token: token.as_ref().to_vec(),
                }))
            }
            Request::AnnouncePeer(request) => {
                if self.token_store.checkin(ip, &request.token, now) {
                    // Create a socket address based on the implied/explicit port number
                    let mut peer = addr;
                    if let AnnouncePort::Explicit(port) = request.port {
                        peer.set_port(port);
                    }

                    log::debug!("Peer {} announced {:?}", peer, request.info_hash);
                    self.peers.put(request.info_hash, peer, now);

                    MessageBody::Response(Response::Other(OtherResponse {
                        id,
                        nodes: Vec::new(),
                    }))
                } else {
                    log::debug!("Node {} sent us an invalid token", addr);

                    MessageBody::Error(Error {
                        code: error_code::PROTOCOL_ERROR,
                        message: "invalid token".to_owned(),
                    })
                }
            }
        };

        self.send(
            &Message {
                transaction_id,
                body,
            },
            addr,
        )
        .await;

        // An unknown node has to prove it is reachable before it gets admitted.
        if ping_node {
            self.ping(node, now).await;
        }
    }

    fn handle_response(
        &mut self,
        transaction_id: &[u8],
        response: Response,
        addr: SocketAddr,
        now: Instant,
    ) {
        let transaction = match self
            .rpc
            .finish(transaction_id, addr, now, &mut self.timer)
        {
            Some(transaction) => transaction,
            None => {
                log::debug!("Received unsolicited response from {}", addr);
                return;
            }
        };

        if !self.bootstrap.is_router(&addr) {
            self.routing_table.on_response(
                NodeHandle::new(response.id(), addr),
                Some(transaction.rtt(now)),
                now,
            );
        }

        if let Owner::Lookup(id) = transaction.owner {
            self.on_lookup_outcome(id, transaction.kind, addr, Some(&response));
        }
    }

    fn handle_error(&mut self, transaction_id: &[u8], error: Error, addr: SocketAddr, now: Instant) {
        let transaction = match self
            .rpc
            .finish(transaction_id, addr, now, &mut self.timer)
        {
            Some(transaction) => transaction,
            None => {
                log::debug!("Received unsolicited error from {}", addr);
                return;
            }
        };

        log::debug!(
            "{:?} query to {} failed with error {}: {}",
            transaction.kind,
            addr,
            error.code,
            error.message
        );

        if let Owner::Lookup(id) = transaction.owner {
            self.on_lookup_outcome(id, transaction.kind, addr, None);
        }
    }

    // ----------------------------------------------------------------------------//

    fn next_lookup_id(&self) -> LookupId {
        self.lookup_ids.fetch_add(1, Ordering::Relaxed)
    }

    /// Nodes of the routing table to start a lookup from.
    fn seeds(&self, target: &ShaHash, now: Instant) -> Vec<(SocketAddr, Option<NodeId>)> {
        let count = self
            .config
            .lookup_policy
            .initial_parallelism(self.config.alpha)
            .max(self.config.k);

        self.routing_table
            .get_closest(target, count, now)
            .into_iter()
            .map(|node| (node.addr, Some(node.id)))
            .collect()
    }

    fn new_lookup<I>(&self, target: ShaHash, kind: LookupKind, seeds: I) -> Lookup
    where
        I: IntoIterator<Item = (SocketAddr, Option<NodeId>)>,
    {
        Lookup::new(
            self.routing_table.node_id(),
            target,
            kind,
            self.config.lookup_policy,
            self.config.k,
            self.config.alpha,
            seeds,
        )
    }

    fn start_lookup(&mut self, id: LookupId, lookup: Lookup, purpose: Purpose) {
        self.lookups.insert(id, ActiveLookup { lookup, purpose });
        self.dirty_lookups.push_back(id);
    }

    fn begin_search(&mut self, start: StartLookup, now: Instant) {
        let seeds = self.seeds(&start.info_hash, now);
        let lookup = self.new_lookup(start.info_hash, start.kind, seeds);

        log::debug!("Starting search {} for {:?}", start.id, start.info_hash);

        self.start_lookup(
            start.id,
            lookup,
            Purpose::Search {
                tx: start.tx,
                report_peers: start.report_peers,
            },
        );
    }

    /// Feed the outcome of a lookup query back to its lookup. `None` means it failed.
    fn on_lookup_outcome(
        &mut self,
        id: LookupId,
        kind: QueryKind,
        addr: SocketAddr,
        response: Option<&Response>,
    ) {
        let active = match self.lookups.get_mut(&id) {
            Some(active) => active,
            None => return,
        };

        let mut receiver_gone = false;

        match (kind, response) {
            (QueryKind::AnnouncePeer, response) => {
                active.lookup.on_announce_finished(addr, response.is_some())
            }
            (_, Some(response)) => {
                let peers = active.lookup.on_response(addr, response);

                if let Purpose::Search {
                    tx,
                    report_peers: true,
                } = &active.purpose
                {
                    for peer in peers {
                        if tx.send(SearchEvent::Peer(peer)).is_err() {
                            receiver_gone = true;
                            break;
                        }
                    }
                }
            }
            (_, None) => active.lookup.on_failure(addr),
        }

        if receiver_gone {
            self.handle_command(OneshotTask::CancelLookup(id));
        } else {
            self.dirty_lookups.push_back(id);
        }
    }

    async fn drive_lookups(&mut self, now: Instant) {
        while let Some(id) = self.dirty_lookups.pop_front() {
            self.drive_lookup(id, now).await;
        }
    }

    /// Send whatever the lookup wants sent. Queries refused by the rpc manager count as failed.
    async fn drive_lookup(&mut self, id: LookupId, now: Instant) {
        loop {
            let outgoing = match self.lookups.get_mut(&id) {
                Some(active) => active.lookup.advance(),
                None => return,
            };

            if outgoing.is_empty() {
                break;
            }

            let mut refused = Vec::new();

            for outgoing in outgoing {
                let is_announce = matches!(outgoing.request, Request::AnnouncePeer(_));

                match self.rpc.start(
                    outgoing.addr,
                    outgoing.node_id,
                    outgoing.request,
                    Owner::Lookup(id),
                    now,
                    &mut self.timer,
                ) {
                    Ok(message) => self.send(&message, outgoing.addr).await,
                    Err(error) => {
                        log::debug!("Query to {} refused: {}", outgoing.addr, error);
                        refused.push((outgoing.addr, is_announce));
                    }
                }
            }

            if refused.is_empty() {
                break;
            }

            if let Some(active) = self.lookups.get_mut(&id) {
                for (addr, is_announce) in refused {
                    if is_announce {
                        active.lookup.on_announce_finished(addr, false);
                    } else {
                        active.lookup.on_failure(addr);
                    }
                }
            }
        }

        if self
            .lookups
            .get(&id)
            .map(|active| active.lookup.is_done())
            .unwrap_or(false)
        {
            self.finish_lookup(id, now);
        }
    }

    fn finish_lookup(&mut self, id: LookupId, now: Instant) {
        let active = match self.lookups.remove(&id) {
            Some(active) => active,
            None => return,
        };

        let result = active.lookup.summary();

        match active.purpose {
            Purpose::Search { tx, .. } => {
                log::debug!("Search {} for {:?} finished: {:?}", id, active.lookup.target(), result);
                tx.send(SearchEvent::Done(result)).unwrap_or(());
            }
            Purpose::Bootstrap => self.finish_bootstrap(now),
            Purpose::Refresh => {
                log::trace!("Refresh of {:?} finished: {:?}", active.lookup.target(), result);
            }
        }
    }

    // ----------------------------------------------------------------------------//

    async fn start_bootstrap(&mut self, now: Instant) {
        if !self.bootstrap.has_contacts() {
            log::info!("No nodes to bootstrap from, starting a new network");
            self.bootstrap.finish(true);
            self.send_event(DhtEvent::BootstrapCompleted);
            self.start_queued_searches(now);
            return;
        }

        let addresses = resolve(self.bootstrap.routers()).await;
        self.bootstrap.set_router_addresses(addresses);

        let local_id = self.routing_table.node_id();
        let mut seeds = self.seeds(&local_id, now);
        seeds.extend(self.bootstrap.seeds());

        log::info!("Bootstrapping from {} contacts", seeds.len());

        let id = self.next_lookup_id();
        let lookup = self.new_lookup(local_id, LookupKind::FindNode, seeds);

        self.bootstrap.start(id);
        self.start_lookup(id, lookup, Purpose::Bootstrap);
    }

    fn finish_bootstrap(&mut self, now: Instant) {
        let good_nodes = self.routing_table.num_good_nodes(now);

        match self.bootstrap.finish(good_nodes > 0) {
            None => {
                log::info!("Bootstrap completed with {} good nodes", good_nodes);
                self.send_event(DhtEvent::BootstrapCompleted);
            }
            Some(delay) => {
                log::warn!("Bootstrap failed, retrying in {:?}", delay);
                self.send_event(DhtEvent::BootstrapFailed);
                self.timer
                    .schedule_at(now + delay, ScheduledTaskCheck::BootstrapRetry);
            }
        }

        self.start_queued_searches(now);
    }

    fn start_queued_searches(&mut self, now: Instant) {
        for start in std::mem::take(&mut self.queued_searches) {
            self.begin_search(start, now);
        }
    }

    fn handle_table_refresh(&mut self, now: Instant) {
        // Lost every good node since the last bootstrap.
        if self.bootstrap.is_bootstrapped()
            && self.bootstrap.has_contacts()
            && self.routing_table.num_good_nodes(now) == 0
        {
            log::warn!("Routing table has no good nodes, bootstrapping again");
            self.bootstrap.reset();
            self.timer.schedule_at(now, ScheduledTaskCheck::BootstrapRetry);
            return;
        }

        let targets = refresh::refresh_targets(
            &mut self.routing_table,
            self.config.bucket_refresh(),
            now,
            &mut rand::thread_rng(),
        );

        for target in targets {
            let seeds = self.seeds(&target, now);
            let lookup = self.new_lookup(target, LookupKind::FindNode, seeds);
            let id = self.next_lookup_id();
            self.start_lookup(id, lookup, Purpose::Refresh);
        }
    }

    // ----------------------------------------------------------------------------//

    async fn ping(&mut self, node: NodeHandle, now: Instant) {
        // One liveness check per node at a time, however often it queries us.
        if self.rpc.has_pending(node.addr, Owner::Ping) {
            return;
        }

        let request = Request::Ping(PingRequest {
            id: self.routing_table.node_id(),
        });

        match self.rpc.start(
            node.addr,
            Some(node.id),
            request,
            Owner::Ping,
            now,
            &mut self.timer,
        ) {
            Ok(message) => self.send(&message, node.addr).await,
            Err(error) => log::debug!("Not pinging {}: {}", node.addr, error),
        }
    }

    async fn send(&mut self, message: &Message, addr: SocketAddr) {
        if let Err(error) = self.socket.send(&message.encode(), addr).await {
            self.on_socket_error(error, Instant::now());
        }
    }

    fn on_socket_error(&mut self, error: io::Error, now: Instant) {
        log::warn!("Socket error: {}", error);

        while let Some(ts) = self.socket_errors.front() {
            if now.saturating_duration_since(*ts) <= SOCKET_ERROR_WINDOW {
                break;
            }
            self.socket_errors.pop_front();
        }

        self.socket_errors.push_back(now);

        if self.socket_errors.len() >= SOCKET_ERROR_THRESHOLD {
            let count = self.socket_errors.len();
            self.socket_errors.clear();
            self.send_event(DhtEvent::SocketErrors { count });
        }
    }

    fn send_event(&self, event: DhtEvent) {
        // The host may not be interested in events.
        self.event_tx.send(event).unwrap_or(());
    }

    fn debug_state(&self, now: Instant) -> DebugState {
        DebugState {
            bootstrapped: self.bootstrap.is_bootstrapped(),
            good_node_count: self.routing_table.num_good_nodes(now),
            questionable_node_count: self.routing_table.num_questionable_nodes(now),
            replacement_count: self.routing_table.num_replacements(),
            stored_peer_count: self.peers.num_peers(),
            in_flight_rpc_count: self.rpc.num_in_flight(),
            active_lookup_count: self.lookups.len(),
        }
    }

    fn save_snapshot(&self, now: Instant) {
        let contacts = self
            .routing_table
            .snapshot(now)
            .into_iter()
            .map(|(node, last_action)| StoredContact::new(node.addr, node.id, last_action, now))
            .collect();

        self.snapshot.save(contacts);
    }

    async fn shutdown(mut self) {
        let now = Instant::now();

        for (id, active) in self.lookups.drain() {
            self.rpc.cancel_owner(Owner::Lookup(id), now, &mut self.timer);

            if let Purpose::Search { tx, .. } = active.purpose {
                tx.send(SearchEvent::Done(Err(DhtError::Shutdown)))
                    .unwrap_or(());
            }
        }

        for start in self.queued_searches.drain(..) {
            start
                .tx
                .send(SearchEvent::Done(Err(DhtError::Shutdown)))
                .unwrap_or(());
        }

        self.timer.clear();
        self.save_snapshot(now);
        self.snapshot.close().await;

        if let Ok(addr) = self.socket.local_addr() {
            log::info!("DHT on {} shut down", addr);
        }

        if let Some(tx) = self.stop_tx {
            tx.send(()).unwrap_or(());
        }
    }
}

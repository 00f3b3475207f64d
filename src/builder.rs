use crate::{
    config::Config,
    error::DhtError,
    id::{InfoHash, NodeId},
    message::AnnouncePort,
    persist::{self, MemoryRoutingStore, RoutingStore, SnapshotWriter},
    search::Search,
    worker::{
        DebugState, DhtEvent, DhtHandler, HandlerParams, LookupKind, OneshotTask, SearchEvent,
        Socket, StartLookup,
    },
};
use std::{
    collections::HashSet,
    fmt,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tokio::{
    net::UdpSocket,
    sync::{mpsc, oneshot},
    task,
};

/// Maintains a Distributed Hash (Routing) Table.
///
/// This type is cheaply cloneable where each clone refers to the same underlying DHT instance. This
/// is useful to be able to issue DHT operations from multiple tasks/threads.
///
/// Only IPv4 is supported.
#[derive(Clone)]
pub struct MainlineDht {
    send: mpsc::UnboundedSender<OneshotTask>,
    lookup_ids: Arc<AtomicU64>,
    local_addr: SocketAddr,
}

impl MainlineDht {
    /// Create a new DhtBuilder.
    pub fn builder() -> DhtBuilder {
        DhtBuilder {
            nodes: HashSet::new(),
            routers: HashSet::new(),
            read_only: false,
            node_id: None,
            config: Config::default(),
            store: None,
        }
    }

    /// Start the MainlineDht with the given DhtBuilder.
    fn with_builder(
        builder: DhtBuilder,
        socket: UdpSocket,
    ) -> Result<(Self, mpsc::UnboundedReceiver<DhtEvent>), DhtError> {
        let local_addr = socket.local_addr()?;
        if !local_addr.is_ipv4() {
            return Err(DhtError::UnsupportedAddressFamily);
        }

        let mut store = builder
            .store
            .unwrap_or_else(|| Box::new(MemoryRoutingStore::default()) as Box<dyn RoutingStore>);

        let contacts = match store.load() {
            Ok(contacts) => {
                persist::fresh_contacts(contacts, builder.config.snapshot_max_age())
            }
            Err(error) => {
                log::warn!("Failed to load routing snapshot: {}", error);
                Vec::new()
            }
        };

        log::info!(
            "Starting DHT on {} with {} saved contacts",
            local_addr,
            contacts.len()
        );

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let lookup_ids = Arc::new(AtomicU64::new(0));

        let params = HandlerParams {
            node_id: builder.node_id.unwrap_or_else(rand::random),
            config: builder.config,
            read_only: builder.read_only,
            routers: builder.routers,
            nodes: builder.nodes,
            contacts,
            snapshot: SnapshotWriter::spawn(store),
            lookup_ids: lookup_ids.clone(),
        };

        let handler = DhtHandler::new(params, Socket::new(socket), command_rx, event_tx);

        task::spawn(handler.run());

        Ok((
            Self {
                send: command_tx,
                lookup_ids,
                local_addr,
            },
            event_rx,
        ))
    }

    /// Find peers of the given InfoHash.
    ///
    /// With `bt_port` set, our contact information is also announced to the closest nodes so
    /// others looking up the InfoHash can find us. The port is the one peers should connect to.
    ///
    /// If the initial bootstrap has not finished, the search will be queued and executed once
    /// the bootstrap has completed.
    pub fn get_peers(&self, info_hash: InfoHash, bt_port: Option<u16>) -> Search {
        self.search(
            info_hash,
            LookupKind::GetPeers {
                announce: bt_port.is_some(),
                port: self.announce_port(bt_port),
            },
            true,
        )
    }

    /// Announce ourselves as a peer of the given InfoHash without reporting the peers found on
    /// the way. Without `bt_port` the announce asks the remote nodes to use our source port.
    pub fn announce(&self, info_hash: InfoHash, bt_port: Option<u16>) -> Search {
        self.search(
            info_hash,
            LookupKind::GetPeers {
                announce: true,
                port: self.announce_port(bt_port),
            },
            false,
        )
    }

    /// Without a port the remote nodes are asked to use our source port. Our DHT port is sent
    /// along for nodes that insist on an explicit one.
    fn announce_port(&self, bt_port: Option<u16>) -> AnnouncePort {
        bt_port
            .map(AnnouncePort::Explicit)
            .unwrap_or_else(|| AnnouncePort::Implied(self.local_addr.port()))
    }

    fn search(&self, info_hash: InfoHash, kind: LookupKind, report_peers: bool) -> Search {
        let id = self.lookup_ids.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();

        let task = OneshotTask::StartLookup(StartLookup {
            id,
            info_hash,
            kind,
            report_peers,
            tx: tx.clone(),
        });

        if self.send.send(task).is_err() {
            log::error!("failed to start search - DhtHandler has shut down");
            tx.send(SearchEvent::Done(Err(DhtError::Shutdown)))
                .unwrap_or(());
        }

        Search::new(id, rx, self.send.clone())
    }

    /// Get the state of the DHT.
    pub async fn debug_state(&self) -> Result<DebugState, DhtError> {
        let (tx, rx) = oneshot::channel();

        self.send
            .send(OneshotTask::GetDebugState(tx))
            .map_err(|_| DhtError::Shutdown)?;

        rx.await.map_err(|_| DhtError::Shutdown)
    }

    /// Cancel all lookups, save the routing table and shut the DHT down. Returns once the
    /// snapshot is written. Every clone of this handle is stopped.
    pub async fn stop(&self) -> Result<(), DhtError> {
        let (tx, rx) = oneshot::channel();

        self.send
            .send(OneshotTask::Stop(tx))
            .map_err(|_| DhtError::Shutdown)?;

        rx.await.map_err(|_| DhtError::Shutdown)
    }

    /// Address the DHT socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

// ----------------------------------------------------------------------------//

/// Stores information for initializing a DHT.
pub struct DhtBuilder {
    nodes: HashSet<SocketAddr>,
    routers: HashSet<String>,
    read_only: bool,
    node_id: Option<NodeId>,
    config: Config,
    store: Option<Box<dyn RoutingStore>>,
}

impl DhtBuilder {
    /// Add nodes which will be distributed within our routing table.
    pub fn add_node(mut self, node_addr: SocketAddr) -> DhtBuilder {
        self.nodes.insert(node_addr);
        self
    }

    /// Add a router which will let us gather nodes if our routing table is ever empty. Routers are
    /// `host:port` strings, resolved each time a bootstrap starts.
    ///
    /// The difference between routers and nodes is that routers are not added to the routing table.
    pub fn add_router(mut self, router: impl Into<String>) -> DhtBuilder {
        self.routers.insert(router.into());
        self
    }

    /// Add routers. Same as calling `add_router` multiple times but more convenient in some cases.
    pub fn add_routers<I, T>(mut self, routers: I) -> DhtBuilder
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.routers.extend(routers.into_iter().map(Into::into));
        self
    }

    /// Set the read only flag. A read only node does not answer queries so remote nodes will not
    /// add it to their routing table.
    ///
    /// Used when we are behind a restrictive NAT and/or we want to decrease
    /// incoming network traffic. Defaults value is false.
    pub fn set_read_only(mut self, read_only: bool) -> DhtBuilder {
        self.read_only = read_only;

        self
    }

    /// Set the id of this node. If not provided, a random node id is generated.
    pub fn set_node_id(mut self, id: NodeId) -> Self {
        self.node_id = Some(id);
        self
    }

    /// Replace the default tunables.
    pub fn set_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Where to load the routing table from at start and save it to. Without a store the routing
    /// table is kept in memory only.
    pub fn set_routing_store(mut self, store: impl RoutingStore) -> Self {
        self.store = Some(Box::new(store));
        self
    }

    /// Start a mainline DHT with the current configuration and bind it to the provided socket.
    ///
    /// Must be called from within a tokio runtime. Fails if the socket is not bound to an IPv4
    /// address.
    pub fn start(
        self,
        socket: UdpSocket,
    ) -> Result<(MainlineDht, mpsc::UnboundedReceiver<DhtEvent>), DhtError> {
        MainlineDht::with_builder(self, socket)
    }
}

impl fmt::Debug for DhtBuilder {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("DhtBuilder")
            .field("nodes", &self.nodes)
            .field("routers", &self.routers)
            .field("read_only", &self.read_only)
            .field("node_id", &self.node_id)
            .field("config", &self.config)
            .field("has_store", &self.store.is_some())
            .finish()
    }
}

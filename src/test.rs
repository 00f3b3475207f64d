use crate::{
    id::{NodeId, NODE_ID_LEN},
    routing::NodeHandle,
};
use rand::{rngs::StdRng, SeedableRng};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

/// Generates a dummy Ipv4 address as an `IpAddr`.
pub fn dummy_ipv4_addr() -> Ipv4Addr {
    Ipv4Addr::new(127, 0, 0, 1)
}

/// Generates a dummy socket address v4 using dummy_ipv4_addr().
pub fn dummy_socket_addr_v4() -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(dummy_ipv4_addr(), 0))
}

/// Generates a block of unique ipv4 addresses with dummy_ipv4_addr() as the starting point
pub fn dummy_block_socket_addrs(num_addrs: u16) -> Vec<SocketAddr> {
    (0..num_addrs)
        .map(|port| SocketAddr::V4(SocketAddrV4::new(dummy_ipv4_addr(), 6000 + port)))
        .collect()
}

/// Generates a dummy node id
pub fn dummy_node_id() -> NodeId {
    NodeId::from([0u8; NODE_ID_LEN])
}

/// Generates a block of unique node ids.
pub fn dummy_block_node_ids(num_ids: u8) -> Vec<NodeId> {
    (0..num_ids)
        .map(|index| {
            let mut id = [0u8; NODE_ID_LEN];
            id[NODE_ID_LEN - 1] = index;
            id.into()
        })
        .collect()
}

/// Generates a block of node handles with unique ids and addresses.
pub fn dummy_block_node_handles(num_nodes: u16) -> Vec<NodeHandle> {
    dummy_block_node_ids(num_nodes as u8)
        .into_iter()
        .zip(dummy_block_socket_addrs(num_nodes))
        .map(|(id, addr)| NodeHandle::new(id, addr))
        .collect()
}

/// Deterministic rng for reproducible tests.
pub fn seeded_rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

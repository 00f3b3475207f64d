mod bucket;
mod node;
mod table;

pub(crate) use self::table::RoutingTable;

use crate::id::NodeId;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Node id + its socket address.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct NodeHandle {
    pub id: NodeId,
    pub addr: SocketAddr,
}

impl NodeHandle {
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self { id, addr }
    }
}

/// How a full bucket treats newcomers.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingPolicy {
    /// Swap the slowest member of a full bucket for a faster replacement whose quarantine is
    /// over.
    #[default]
    NiceRtt,
    /// Classic Kademlia: members stay until they go bad, the most recently seen replacement
    /// takes a freed slot.
    BucketLru,
}

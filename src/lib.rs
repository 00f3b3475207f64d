//! Implementation of the Bittorrent Mainline Distributed Hash Table (BEP 5) as a peer tracker.
//!
//! A [`MainlineDht`] joins the DHT over an IPv4 UDP socket, keeps a Kademlia routing table,
//! answers queries of other nodes and stores the peers they announce. Lookups for the peers of an
//! info hash are started with [`MainlineDht::get_peers`] and [`MainlineDht::announce`].

pub mod bencode;
pub mod router;

mod builder;
mod compact;
mod config;
mod error;
mod id;
mod message;
mod persist;
mod routing;
mod search;
mod storage;
#[cfg(test)]
mod test;
mod token;
mod transaction;
mod worker;

pub use crate::builder::{DhtBuilder, MainlineDht};
pub use crate::config::{Config, LookupPolicy};
pub use crate::error::DhtError;
pub use crate::id::{IdError, InfoHash, NodeId, ShaHash, INFO_HASH_LEN, NODE_ID_LEN};
pub use crate::persist::{FileRoutingStore, MemoryRoutingStore, RoutingStore, StoredContact};
pub use crate::routing::RoutingPolicy;
pub use crate::search::Search;
pub use crate::worker::{DebugState, DhtEvent, LookupSummary, SearchEvent};

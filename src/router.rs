//! Some known public DHT routers. Pass them to [`DhtBuilder::add_routers`](crate::DhtBuilder::add_routers).

pub const UTORRENT_DHT: &str = "router.utorrent.com:6881";
pub const BITTORRENT_DHT: &str = "router.bittorrent.com:6881";
pub const TRANSMISSION_DHT: &str = "dht.transmissionbt.com:6881";
pub const LIBTORRENT_DHT: &str = "dht.libtorrent.org:25401";

/// All the routers above.
pub const ALL: &[&str] = &[UTORRENT_DHT, BITTORRENT_DHT, TRANSMISSION_DHT, LIBTORRENT_DHT];

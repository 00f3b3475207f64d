use std::io;
use thiserror::Error;

/// Errors reported to users of the DHT.
#[derive(Debug, Error)]
pub enum DhtError {
    #[error("the DHT has been stopped")]
    Shutdown,
    #[error("lookup could not make progress: no node responded")]
    Routing,
    #[error("search already cancelled")]
    AlreadyCancelled,
    #[error("socket error")]
    Io(#[from] io::Error),
    #[error("only IPv4 is supported")]
    UnsupportedAddressFamily,
}

//! Bencode values with a depth-bounded decoder.
//!
//! Typed KRPC messages are (de)serialized through `serde_bencode`, but every datagram that
//! arrives from the network is first parsed here with [`MAX_DEPTH_UNTRUSTED`] so that deeply
//! nested input is rejected before it can exhaust the stack. The generic [`Value`] is also what
//! lets the worker recover the transaction id and method of a query it could not otherwise
//! understand, in order to answer it with a KRPC error.

mod decode;
mod encode;
mod error;
mod value;

pub use self::decode::decode;
pub use self::encode::encode;
pub use self::error::DecodeError;
pub use self::value::Value;

/// Nesting limit applied to datagrams received from remote nodes.
pub const MAX_DEPTH_UNTRUSTED: usize = 4;

/// Nesting limit for data produced locally (e.g. the routing snapshot).
pub const MAX_DEPTH_LOCAL: usize = 64;

#[cfg(test)]
mod tests;

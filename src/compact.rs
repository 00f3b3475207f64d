//! Compact node and peer info (IPv4 only).

use crate::id::NODE_ID_LEN;
use std::{
    convert::TryInto,
    net::{Ipv4Addr, SocketAddr},
};

pub(crate) const SOCKET_ADDR_LEN: usize = 6;
pub(crate) const NODE_INFO_LEN: usize = NODE_ID_LEN + SOCKET_ADDR_LEN;

/// Serialize/deserialize `Vec` of `SocketAddr` as a list of 6-byte strings.
pub(crate) mod values {
    use serde::{
        de::{Deserializer, Error as _, SeqAccess, Visitor},
        ser::{Error as _, SerializeSeq, Serializer},
    };
    use serde_bytes::{ByteBuf, Bytes};
    use std::{fmt, net::SocketAddr};

    pub(crate) fn serialize<S>(addrs: &[SocketAddr], s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut seq = s.serialize_seq(Some(addrs.len()))?;
        for addr in addrs {
            let bytes = super::encode_socket_addr(addr)
                .ok_or_else(|| S::Error::custom("peer addr is not ipv4"))?;
            seq.serialize_element(Bytes::new(&bytes))?
        }
        seq.end()
    }

    pub(crate) fn deserialize<'de, D>(d: D) -> Result<Vec<SocketAddr>, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct SocketAddrsVisitor;

        impl<'de> Visitor<'de> for SocketAddrsVisitor {
            type Value = Vec<SocketAddr>;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "list of 6-byte strings")
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: SeqAccess<'de>,
            {
                let mut output = Vec::with_capacity(seq.size_hint().unwrap_or(0));

                while let Some(bytes) = seq.next_element::<ByteBuf>()? {
                    let item = super::decode_socket_addr(&bytes)
                        .ok_or_else(|| A::Error::invalid_length(bytes.len(), &self))?;
                    output.push(item);
                }

                Ok(output)
            }
        }

        d.deserialize_seq(SocketAddrsVisitor)
    }
}

/// Serialize/deserialize `Vec` of `NodeHandle` as concatenated 26-byte node infos.
pub(crate) mod nodes {
    use crate::{id::NodeId, routing::NodeHandle};
    use serde::{
        de::{Deserialize, Deserializer, Error as _},
        ser::{Error as _, Serializer},
    };
    use serde_bytes::ByteBuf;
    use std::convert::TryFrom;

    pub(crate) fn serialize<S>(nodes: &[NodeHandle], s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut buffer = Vec::with_capacity(nodes.len() * super::NODE_INFO_LEN);

        for node in nodes {
            let addr = super::encode_socket_addr(&node.addr)
                .ok_or_else(|| S::Error::custom("node addr is not ipv4"))?;

            buffer.extend(node.id.as_ref());
            buffer.extend(addr);
        }

        s.serialize_bytes(&buffer)
    }

    pub(crate) fn deserialize<'de, D>(d: D) -> Result<Vec<NodeHandle>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let buffer = ByteBuf::deserialize(d)?;
        let chunks = buffer.chunks_exact(super::NODE_INFO_LEN);

        if !chunks.remainder().is_empty() {
            let msg = format!("multiple of {}", super::NODE_INFO_LEN);
            return Err(D::Error::invalid_length(buffer.len(), &msg.as_ref()));
        }

        let nodes = chunks
            .filter_map(|chunk| {
                let id = NodeId::try_from(&chunk[..super::NODE_ID_LEN]).ok()?;
                let addr = super::decode_socket_addr(&chunk[super::NODE_ID_LEN..])?;

                Some(NodeHandle { id, addr })
            })
            .collect();

        Ok(nodes)
    }
}

/// Serialize/deserialize a single `SocketAddr` as a 6-byte string.
pub(crate) mod addr {
    use serde::{
        de::{Deserialize, Deserializer, Error as _},
        ser::{Error as _, Serializer},
    };
    use serde_bytes::ByteBuf;
    use std::net::SocketAddr;

    pub(crate) fn serialize<S: Serializer>(addr: &SocketAddr, s: S) -> Result<S::Ok, S::Error> {
        let bytes = super::encode_socket_addr(addr)
            .ok_or_else(|| S::Error::custom("addr is not ipv4"))?;
        s.serialize_bytes(&bytes)
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<SocketAddr, D::Error> {
        let bytes = ByteBuf::deserialize(d)?;
        super::decode_socket_addr(&bytes)
            .ok_or_else(|| D::Error::invalid_length(bytes.len(), &"6 bytes"))
    }
}

pub(crate) fn decode_socket_addr(src: &[u8]) -> Option<SocketAddr> {
    if src.len() != SOCKET_ADDR_LEN {
        return None;
    }

    let ip: [u8; 4] = src.get(..4)?.try_into().ok()?;
    let port = u16::from_be_bytes(src.get(4..)?.try_into().ok()?);

    Some((Ipv4Addr::from(ip), port).into())
}

/// Returns `None` for IPv6 addresses, which have no compact form here.
pub(crate) fn encode_socket_addr(addr: &SocketAddr) -> Option<[u8; SOCKET_ADDR_LEN]> {
    match addr {
        SocketAddr::V4(addr) => {
            let mut buffer = [0u8; SOCKET_ADDR_LEN];
            buffer[..4].copy_from_slice(&addr.ip().octets());
            buffer[4..].copy_from_slice(&addr.port().to_be_bytes());
            Some(buffer)
        }
        SocketAddr::V6(_) => None,
    }
}

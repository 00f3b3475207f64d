use crate::{
    bencode::{self, Value},
    compact,
    id::{InfoHash, NodeId},
    routing::NodeHandle,
};
use serde::{
    de::{Deserializer, Error as _, IgnoredAny, SeqAccess, Visitor},
    ser::{SerializeSeq, Serializer},
    Deserialize, Serialize,
};
use std::{fmt, net::SocketAddr};
use thiserror::Error;

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub(crate) struct Message {
    #[serde(rename = "t", with = "serde_bytes")]
    pub transaction_id: Vec<u8>,
    #[serde(flatten)]
    pub body: MessageBody,
}

impl Message {
    /// Decode a datagram received from the network.
    ///
    /// The input is first checked by the depth-bounded bencode decoder so that nothing nested
    /// deeper than `max_depth` reaches the typed decoder.
    pub fn decode(input: &[u8], max_depth: usize) -> Result<Self, ProtocolError> {
        let value = bencode::decode(input, max_depth).map_err(ProtocolError::Bencode)?;

        serde_bencode::from_bytes(input).map_err(|error| ProtocolError::classify(&value, error))
    }

    /// Encode the message into bencode.
    pub fn encode(&self) -> Vec<u8> {
        // `expect` should be fine here as there should be no reason why a serialization into a
        // `Vec` would fail unless we have a bug somewhere.
        serde_bencode::to_bytes(self).expect("failed to serialize message")
    }

    pub fn error(transaction_id: Vec<u8>, code: u8, message: &str) -> Self {
        Self {
            transaction_id,
            body: MessageBody::Error(Error {
                code,
                message: message.to_owned(),
            }),
        }
    }
}

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(tag = "y")]
pub(crate) enum MessageBody {
    #[serde(rename = "q")]
    Request(Request),
    #[serde(rename = "r", with = "unflatten::response")]
    Response(Response),
    #[serde(rename = "e", with = "unflatten::error")]
    Error(Error),
}

// Opposite of `serde(flatten)` - artificially add one level of nesting to a field.
mod unflatten {
    macro_rules! impl_unflatten {
        ($mod:ident, $field:literal) => {
            pub(crate) mod $mod {
                use serde::{Deserialize, Deserializer, Serialize, Serializer};

                #[derive(Serialize, Deserialize)]
                struct Wrapper<T> {
                    #[serde(rename = $field)]
                    field: T,
                }

                pub(crate) fn serialize<T: Serialize, S: Serializer>(
                    value: &T,
                    s: S,
                ) -> Result<S::Ok, S::Error> {
                    Wrapper { field: value }.serialize(s)
                }

                pub(crate) fn deserialize<'de, T: Deserialize<'de>, D: Deserializer<'de>>(
                    d: D,
                ) -> Result<T, D::Error> {
                    let wrapper = Wrapper::deserialize(d)?;
                    Ok(wrapper.field)
                }
            }
        };
    }

    impl_unflatten!(response, "r");
    impl_unflatten!(error, "e");
}

/// Methods we answer. Anything else is replied to with `METHOD_UNKNOWN`.
const KNOWN_METHODS: &[&[u8]] = &[b"ping", b"find_node", b"get_peers", b"announce_peer"];

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(tag = "q", content = "a")]
#[serde(rename_all = "snake_case")]
pub(crate) enum Request {
    Ping(PingRequest),
    FindNode(FindNodeRequest),
    GetPeers(GetPeersRequest),
    AnnouncePeer(AnnouncePeerRequest),
}

impl Request {
    /// Id of the querying node.
    pub fn id(&self) -> NodeId {
        match self {
            Self::Ping(r) => r.id,
            Self::FindNode(r) => r.id,
            Self::GetPeers(r) => r.id,
            Self::AnnouncePeer(r) => r.id,
        }
    }

    pub fn method(&self) -> &'static str {
        match self {
            Self::Ping(_) => "ping",
            Self::FindNode(_) => "find_node",
            Self::GetPeers(_) => "get_peers",
            Self::AnnouncePeer(_) => "announce_peer",
        }
    }
}

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub(crate) struct PingRequest {
    pub id: NodeId,
}

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub(crate) struct FindNodeRequest {
    pub id: NodeId,
    pub target: NodeId,
}

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub(crate) struct GetPeersRequest {
    pub id: NodeId,
    pub info_hash: InfoHash,
}

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub(crate) struct AnnouncePeerRequest {
    pub id: NodeId,
    pub info_hash: InfoHash,
    #[serde(with = "port", flatten)]
    pub port: AnnouncePort,
    #[serde(with = "serde_bytes")]
    pub token: Vec<u8>,
}

/// Port of an announced peer.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) enum AnnouncePort {
    /// Peers connect to this port.
    Explicit(u16),
    /// Peers connect to the source port of the datagram (`implied_port=1`). The port is still
    /// sent because some nodes reject an `announce_peer` without it.
    Implied(u16),
}

mod port {
    use super::AnnouncePort;
    use serde::{de::Error, Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    struct Wrapper {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        port: Option<u16>,

        #[serde(
            default,
            skip_serializing_if = "is_false",
            deserialize_with = "deserialize_bool"
        )]
        implied_port: bool,
    }

    pub(crate) fn serialize<S: Serializer>(port: &AnnouncePort, s: S) -> Result<S::Ok, S::Error> {
        let wrapper = match *port {
            AnnouncePort::Explicit(port) => Wrapper {
                port: Some(port),
                implied_port: false,
            },
            AnnouncePort::Implied(port) => Wrapper {
                port: Some(port),
                implied_port: true,
            },
        };

        wrapper.serialize(s)
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<AnnouncePort, D::Error> {
        let wrapper = Wrapper::deserialize(d)?;

        match (wrapper.implied_port, wrapper.port) {
            // The port does not matter when it is implied.
            (true, port) => Ok(AnnouncePort::Implied(port.unwrap_or(0))),
            (false, Some(port)) => Ok(AnnouncePort::Explicit(port)),
            (false, None) => Err(D::Error::missing_field("port")),
        }
    }

    fn is_false(b: &bool) -> bool {
        !*b
    }

    fn deserialize_bool<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
        let num = u8::deserialize(d)?;
        Ok(num > 0)
    }
}

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub(crate) enum Response {
    // NOTE: the order these variants are listed in is important to make sure they deserialize
    // properly because we use `untagged` enum for this.
    GetPeers(GetPeersResponse),
    // This can be a response to either `ping`, `announce_peer` or `find_node`. Which it actually is
    // needs to be determined by looking up the transaction id to find the type of the corresponding
    // request.
    Other(OtherResponse),
}

impl Response {
    /// Id of the responding node.
    pub fn id(&self) -> NodeId {
        match self {
            Self::GetPeers(r) => r.id,
            Self::Other(r) => r.id,
        }
    }

    /// Closer nodes carried by the response, if any.
    pub fn nodes(&self) -> &[NodeHandle] {
        match self {
            Self::GetPeers(r) => &r.nodes,
            Self::Other(r) => &r.nodes,
        }
    }
}

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub(crate) struct OtherResponse {
    pub id: NodeId,

    #[serde(
        with = "compact::nodes",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub nodes: Vec<NodeHandle>,
}

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub(crate) struct GetPeersResponse {
    pub id: NodeId,

    #[serde(
        with = "compact::values",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub values: Vec<SocketAddr>,

    #[serde(
        with = "compact::nodes",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub nodes: Vec<NodeHandle>,

    #[serde(with = "serde_bytes")]
    pub token: Vec<u8>,
}

#[derive(Clone, Eq, PartialEq, Debug)]
pub(crate) struct Error {
    pub code: u8,
    pub message: String,
}

// Using custom Serialize/Deserialize impls because the format is too weird.
impl Serialize for Error {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        let mut seq = s.serialize_seq(Some(2))?;
        seq.serialize_element(&self.code)?;
        seq.serialize_element(&self.message)?;
        seq.end()
    }
}

impl<'de> Deserialize<'de> for Error {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        struct ErrorVisitor;

        impl<'de> Visitor<'de> for ErrorVisitor {
            type Value = Error;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "a list of two elements: an integer and a string")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let code: u8 = seq
                    .next_element()?
                    .ok_or_else(|| A::Error::invalid_length(0, &self))?;
                let message = seq
                    .next_element()?
                    .ok_or_else(|| A::Error::invalid_length(1, &self))?;

                // Make sure the list is consumed to the end.
                if seq.next_element::<IgnoredAny>()?.is_some() {
                    return Err(A::Error::invalid_length(3, &self));
                }

                Ok(Error { code, message })
            }
        }

        d.deserialize_seq(ErrorVisitor)
    }
}

pub mod error_code {
    // some of these codes are not used in this crate but we still list them here for completeness.
    #![allow(unused)]

    pub const GENERIC_ERROR: u8 = 201;
    pub const SERVER_ERROR: u8 = 202;
    pub const PROTOCOL_ERROR: u8 = 203;
    pub const METHOD_UNKNOWN: u8 = 204;
}

/// A datagram that could not be decoded into a `Message`.
#[derive(Debug, Error)]
pub(crate) enum ProtocolError {
    #[error("invalid bencode")]
    Bencode(#[source] bencode::DecodeError),
    #[error("malformed {kind}")]
    Malformed {
        kind: &'static str,
        transaction_id: Option<Vec<u8>>,
        #[source]
        source: serde_bencode::Error,
    },
    #[error("unknown method {}", String::from_utf8_lossy(.method))]
    UnknownMethod {
        method: Vec<u8>,
        transaction_id: Option<Vec<u8>>,
    },
}

impl ProtocolError {
    fn classify(value: &Value, source: serde_bencode::Error) -> Self {
        let transaction_id = value
            .get(b"t")
            .and_then(Value::as_bytes)
            .map(<[u8]>::to_vec);

        match value.get(b"y").and_then(Value::as_bytes) {
            Some(b"q") => match value.get(b"q").and_then(Value::as_bytes) {
                Some(method) if !KNOWN_METHODS.contains(&method) => Self::UnknownMethod {
                    method: method.to_vec(),
                    transaction_id,
                },
                _ => Self::Malformed {
                    kind: "query",
                    transaction_id,
                    source,
                },
            },
            Some(b"r") => Self::Malformed {
                kind: "response",
                transaction_id,
                source,
            },
            Some(b"e") => Self::Malformed {
                kind: "error",
                transaction_id,
                source,
            },
            _ => Self::Malformed {
                kind: "message",
                transaction_id: None,
                source,
            },
        }
    }

    /// The KRPC error owed to the sender. Only queries whose transaction id could be recovered
    /// are answered.
    pub fn reply(&self) -> Option<Message> {
        match self {
            Self::Malformed {
                kind: "query",
                transaction_id: Some(tid),
                ..
            } => Some(Message::error(
                tid.clone(),
                error_code::PROTOCOL_ERROR,
                "malformed query",
            )),
            Self::UnknownMethod {
                transaction_id: Some(tid),
                ..
            } => Some(Message::error(
                tid.clone(),
                error_code::METHOD_UNKNOWN,
                "method unknown",
            )),
            _ => None,
        }
    }
}

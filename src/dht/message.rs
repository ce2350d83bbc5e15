//! DHT message module
//!
//! KRPC messages: bencoded dictionaries keyed by `t` (transaction), `y`
//! (`q`/`r`/`e`) and the query, reply or error body. Compact node and peer
//! lists are decoded with fixed-size chunks; trailing bytes that do not fill
//! a whole entry are ignored.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use anyhow::Result;
use serde_bencode::value::Value;

use crate::bencode::{bytes, dict, ValueExt};
use crate::dht::node::NodeId;
use crate::error::TorrentError;

/// KRPC error codes
pub const ERROR_GENERIC: i64 = 201;
pub const ERROR_SERVER: i64 = 202;
pub const ERROR_PROTOCOL: i64 = 203;
pub const ERROR_METHOD_UNKNOWN: i64 = 204;

/// Compact IPv4 node entry length
pub const COMPACT_NODE_V4: usize = 26;
/// Compact IPv6 node entry length
pub const COMPACT_NODE_V6: usize = 38;

/// DHT query kinds we understand
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryType {
    Ping,
    FindNode,
    GetPeers,
    AnnouncePeer,
}

impl QueryType {
    pub fn method(&self) -> &'static str {
        match self {
            QueryType::Ping => "ping",
            QueryType::FindNode => "find_node",
            QueryType::GetPeers => "get_peers",
            QueryType::AnnouncePeer => "announce_peer",
        }
    }
}

impl fmt::Display for QueryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.method())
    }
}

/// Query with its arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    Ping,
    FindNode {
        target: NodeId,
    },
    GetPeers {
        info_hash: [u8; 20],
    },
    AnnouncePeer {
        info_hash: [u8; 20],
        port: u16,
        token: Vec<u8>,
        implied_port: bool,
    },
    /// Method we do not serve (answered with 204)
    Unknown(String),
    /// Known method with unusable arguments (answered with 203)
    Malformed(String),
}

impl Query {
    pub fn query_type(&self) -> Option<QueryType> {
        match self {
            Query::Ping => Some(QueryType::Ping),
            Query::FindNode { .. } => Some(QueryType::FindNode),
            Query::GetPeers { .. } => Some(QueryType::GetPeers),
            Query::AnnouncePeer { .. } => Some(QueryType::AnnouncePeer),
            Query::Unknown(_) | Query::Malformed(_) => None,
        }
    }
}

/// Reply body
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    pub id: Option<NodeId>,
    pub nodes: Vec<(NodeId, SocketAddr)>,
    pub values: Vec<SocketAddr>,
    pub token: Option<Vec<u8>>,
}

impl Response {
    pub fn new(id: NodeId) -> Self {
        Self {
            id: Some(id),
            ..Self::default()
        }
    }
}

/// Message body by `y` type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Query { id: NodeId, query: Query },
    Response(Response),
    Error { code: i64, message: String },
}

/// A decoded KRPC packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DHTMessage {
    pub transaction: Vec<u8>,
    pub body: Body,
    /// Our address as the sender sees it
    pub ip: Option<SocketAddr>,
}

impl DHTMessage {
    pub fn query(transaction: Vec<u8>, id: NodeId, query: Query) -> Self {
        Self {
            transaction,
            body: Body::Query { id, query },
            ip: None,
        }
    }

    pub fn response(transaction: Vec<u8>, response: Response, requester: SocketAddr) -> Self {
        Self {
            transaction,
            body: Body::Response(response),
            ip: Some(requester),
        }
    }

    pub fn error(transaction: Vec<u8>, code: i64, message: impl Into<String>) -> Self {
        Self {
            transaction,
            body: Body::Error {
                code,
                message: message.into(),
            },
            ip: None,
        }
    }

    pub fn message_type(&self) -> &'static str {
        match self.body {
            Body::Query { .. } => "q",
            Body::Response(_) => "r",
            Body::Error { .. } => "e",
        }
    }

    /// Encode as a bencoded dictionary
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut root: HashMap<Vec<u8>, Value> = HashMap::new();
        root.insert(b"t".to_vec(), bytes(self.transaction.clone()));
        root.insert(b"y".to_vec(), bytes(self.message_type()));
        if let Some(ip) = self.ip {
            root.insert(b"ip".to_vec(), bytes(compact_addr(&ip)));
        }

        match &self.body {
            Body::Query { id, query } => {
                let mut args: HashMap<Vec<u8>, Value> = HashMap::new();
                args.insert(b"id".to_vec(), bytes(id.as_bytes().to_vec()));
                let method = match query {
                    Query::Ping => "ping".to_string(),
                    Query::FindNode { target } => {
                        args.insert(b"target".to_vec(), bytes(target.as_bytes().to_vec()));
                        "find_node".to_string()
                    }
                    Query::GetPeers { info_hash } => {
                        args.insert(b"info_hash".to_vec(), bytes(info_hash.to_vec()));
                        "get_peers".to_string()
                    }
                    Query::AnnouncePeer { info_hash, port, token, implied_port } => {
                        args.insert(b"info_hash".to_vec(), bytes(info_hash.to_vec()));
                        args.insert(b"port".to_vec(), Value::Int(i64::from(*port)));
                        args.insert(b"token".to_vec(), bytes(token.clone()));
                        if *implied_port {
                            args.insert(b"implied_port".to_vec(), Value::Int(1));
                        }
                        "announce_peer".to_string()
                    }
                    Query::Unknown(method) | Query::Malformed(method) => method.clone(),
                };
                root.insert(b"q".to_vec(), bytes(method));
                root.insert(b"a".to_vec(), Value::Dict(args));
            }
            Body::Response(response) => {
                let mut r: HashMap<Vec<u8>, Value> = HashMap::new();
                if let Some(id) = response.id {
                    r.insert(b"id".to_vec(), bytes(id.as_bytes().to_vec()));
                }
                let (v4, v6): (Vec<_>, Vec<_>) = response.nodes.iter().partition(|(_, a)| a.is_ipv4());
                if !v4.is_empty() {
                    r.insert(b"nodes".to_vec(), bytes(serialize_compact_nodes(v4.into_iter().copied())));
                }
                if !v6.is_empty() {
                    r.insert(b"nodes6".to_vec(), bytes(serialize_compact_nodes(v6.into_iter().copied())));
                }
                if !response.values.is_empty() {
                    let values = response.values.iter().map(|a| bytes(compact_addr(a))).collect();
                    r.insert(b"values".to_vec(), Value::List(values));
                }
                if let Some(token) = &response.token {
                    r.insert(b"token".to_vec(), bytes(token.clone()));
                }
                root.insert(b"r".to_vec(), Value::Dict(r));
            }
            Body::Error { code, message } => {
                root.insert(
                    b"e".to_vec(),
                    Value::List(vec![Value::Int(*code), bytes(message.as_bytes().to_vec())]),
                );
            }
        }

        Ok(serde_bencode::to_bytes(&Value::Dict(root))?)
    }

    /// Decode a packet. Structurally broken packets are an error; queries
    /// with unusable arguments decode as [`Query::Malformed`].
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let root: Value = serde_bencode::from_bytes(data)
            .map_err(|e| TorrentError::parse_error_with_source("Invalid KRPC packet", e.to_string()))?;
        if root.as_dict().is_none() {
            return Err(TorrentError::protocol_violation("KRPC packet is not a dictionary").into());
        }

        let transaction = root
            .get_bytes(b"t")
            .ok_or_else(|| TorrentError::protocol_violation_field("Missing transaction id", "t"))?
            .to_vec();
        let ip = root.get_bytes(b"ip").and_then(parse_compact_addr);
        let kind = root
            .get_bytes(b"y")
            .ok_or_else(|| TorrentError::protocol_violation_field("Missing message type", "y"))?;

        let body = match kind {
            b"q" => {
                let method = root
                    .get_str(b"q")
                    .ok_or_else(|| TorrentError::protocol_violation_field("Missing query method", "q"))?;
                let args = root
                    .get(b"a")
                    .filter(|a| a.as_dict().is_some())
                    .ok_or_else(|| TorrentError::protocol_violation_field("Missing query arguments", "a"))?;
                let id = args
                    .get_bytes(b"id")
                    .and_then(NodeId::from_slice)
                    .ok_or_else(|| TorrentError::protocol_violation_field("Missing or invalid node id", "id"))?;
                Body::Query {
                    id,
                    query: decode_query(&method, args),
                }
            }
            b"r" => {
                let r = root
                    .get(b"r")
                    .filter(|r| r.as_dict().is_some())
                    .ok_or_else(|| TorrentError::protocol_violation_field("Missing reply body", "r"))?;
                Body::Response(decode_response(r))
            }
            b"e" => {
                let list = root.get(b"e").and_then(ValueExt::as_list).unwrap_or(&[]);
                Body::Error {
                    code: list.first().and_then(ValueExt::as_int).unwrap_or(ERROR_GENERIC),
                    message: list
                        .get(1)
                        .and_then(ValueExt::as_bytes)
                        .map(|b| String::from_utf8_lossy(b).into_owned())
                        .unwrap_or_default(),
                }
            }
            other => {
                return Err(TorrentError::protocol_violation_field(
                    format!("Unknown message type {:?}", String::from_utf8_lossy(other)),
                    "y",
                )
                .into())
            }
        };

        Ok(Self { transaction, body, ip })
    }
}

fn decode_query(method: &str, args: &Value) -> Query {
    let hash20 = |key: &[u8]| -> Option<[u8; 20]> { args.get_bytes(key)?.try_into().ok() };
    match method {
        "ping" => Query::Ping,
        "find_node" => match args.get_bytes(b"target").and_then(NodeId::from_slice) {
            Some(target) => Query::FindNode { target },
            None => Query::Malformed("find_node: invalid target".to_string()),
        },
        "get_peers" => match hash20(b"info_hash") {
            Some(info_hash) => Query::GetPeers { info_hash },
            None => Query::Malformed("get_peers: invalid info_hash".to_string()),
        },
        "announce_peer" => {
            let Some(info_hash) = hash20(b"info_hash") else {
                return Query::Malformed("announce_peer: invalid info_hash".to_string());
            };
            let Some(token) = args.get_bytes(b"token") else {
                return Query::Malformed("announce_peer: missing token".to_string());
            };
            let implied_port = args.get_int(b"implied_port").map_or(false, |v| v != 0);
            let port = args.get_int(b"port").and_then(|p| u16::try_from(p).ok());
            match (port, implied_port) {
                (Some(port), _) => Query::AnnouncePeer {
                    info_hash,
                    port,
                    token: token.to_vec(),
                    implied_port,
                },
                (None, true) => Query::AnnouncePeer {
                    info_hash,
                    port: 0,
                    token: token.to_vec(),
                    implied_port,
                },
                (None, false) => Query::Malformed("announce_peer: invalid port".to_string()),
            }
        }
        other => Query::Unknown(other.to_string()),
    }
}

fn decode_response(r: &Value) -> Response {
    let mut nodes = r.get_bytes(b"nodes").map(parse_compact_nodes).unwrap_or_default();
    if let Some(nodes6) = r.get_bytes(b"nodes6") {
        nodes.extend(parse_compact_nodes6(nodes6));
    }
    let values = r
        .get(b"values")
        .and_then(ValueExt::as_list)
        .map(|list| {
            list.iter()
                .filter_map(ValueExt::as_bytes)
                .flat_map(parse_compact_peers)
                .collect()
        })
        .unwrap_or_default();

    Response {
        id: r.get_bytes(b"id").and_then(NodeId::from_slice),
        nodes,
        values,
        token: r.get_bytes(b"token").map(<[u8]>::to_vec),
    }
}

/// Random two-byte transaction id
pub fn generate_transaction_id() -> Vec<u8> {
    rand::random::<[u8; 2]>().to_vec()
}

/// 4+2 or 16+2 byte address
pub fn compact_addr(addr: &SocketAddr) -> Vec<u8> {
    let mut out = match addr.ip() {
        IpAddr::V4(ip) => ip.octets().to_vec(),
        IpAddr::V6(ip) => ip.octets().to_vec(),
    };
    out.extend_from_slice(&addr.port().to_be_bytes());
    out
}

/// Inverse of [`compact_addr`]
pub fn parse_compact_addr(data: &[u8]) -> Option<SocketAddr> {
    match data.len() {
        6 => {
            let ip: [u8; 4] = data[..4].try_into().ok()?;
            Some(SocketAddr::new(Ipv4Addr::from(ip).into(), u16::from_be_bytes([data[4], data[5]])))
        }
        18 => {
            let ip: [u8; 16] = data[..16].try_into().ok()?;
            Some(SocketAddr::new(Ipv6Addr::from(ip).into(), u16::from_be_bytes([data[16], data[17]])))
        }
        _ => None,
    }
}

/// Parse nodes from compact format (20-byte id + 4-byte IPv4 + 2-byte port)
pub fn parse_compact_nodes(data: &[u8]) -> Vec<(NodeId, SocketAddr)> {
    data.chunks_exact(COMPACT_NODE_V4)
        .filter_map(|chunk| Some((NodeId::from_slice(&chunk[..20])?, parse_compact_addr(&chunk[20..])?)))
        .collect()
}

/// Parse nodes from compact IPv6 format (20-byte id + 16-byte IPv6 + 2-byte port)
pub fn parse_compact_nodes6(data: &[u8]) -> Vec<(NodeId, SocketAddr)> {
    data.chunks_exact(COMPACT_NODE_V6)
        .filter_map(|chunk| Some((NodeId::from_slice(&chunk[..20])?, parse_compact_addr(&chunk[20..])?)))
        .collect()
}

/// Serialize nodes to compact format
pub fn serialize_compact_nodes(nodes: impl IntoIterator<Item = (NodeId, SocketAddr)>) -> Vec<u8> {
    let mut buffer = Vec::new();
    for (id, addr) in nodes {
        buffer.extend_from_slice(id.as_bytes());
        buffer.extend_from_slice(&compact_addr(&addr));
    }
    buffer
}

/// Parse one `values` entry. An 18-byte string is a single IPv6 peer;
/// anything else is read as 6-byte IPv4 entries.
pub fn parse_compact_peers(data: &[u8]) -> Vec<SocketAddr> {
    if data.len() == 18 {
        return parse_compact_addr(data).into_iter().collect();
    }
    data.chunks_exact(6).filter_map(parse_compact_addr).collect()
}

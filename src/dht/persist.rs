//! Routing table persistence
//!
//! Saved as JSON: our id in hex plus every table node as hex-encoded
//! compact node info.

use std::net::SocketAddr;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, warn};

use crate::dht::message::{parse_compact_nodes, parse_compact_nodes6, serialize_compact_nodes, COMPACT_NODE_V4, COMPACT_NODE_V6};
use crate::dht::node::NodeId;
use crate::error::TorrentError;

/// On-disk DHT state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhtState {
    /// Our node id as hex
    pub id: String,
    /// Compact node entries as hex
    pub nodes: Vec<String>,
}

impl DhtState {
    pub fn new(id: NodeId, nodes: impl IntoIterator<Item = (NodeId, SocketAddr)>) -> Self {
        Self {
            id: id.to_hex(),
            nodes: nodes
                .into_iter()
                .map(|n| hex::encode(serialize_compact_nodes([n])))
                .collect(),
        }
    }

    pub fn node_id(&self) -> Result<NodeId> {
        NodeId::from_hex(&self.id)
            .ok_or_else(|| TorrentError::dht_error(format!("Invalid stored node id {:?}", self.id)).into())
    }

    /// Decode stored nodes, skipping unreadable entries
    pub fn contacts(&self) -> Vec<(NodeId, SocketAddr)> {
        let mut out = Vec::with_capacity(self.nodes.len());
        for entry in &self.nodes {
            let Ok(raw) = hex::decode(entry) else {
                warn!("Skipping unreadable stored node {:?}", entry);
                continue;
            };
            match raw.len() {
                COMPACT_NODE_V4 => out.extend(parse_compact_nodes(&raw)),
                COMPACT_NODE_V6 => out.extend(parse_compact_nodes6(&raw)),
                other => warn!("Skipping stored node of {} bytes", other),
            }
        }
        out
    }

    /// Serialize to bytes
    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Deserialize from bytes
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Save to file
    pub async fn save(&self, path: &Path) -> Result<()> {
        let data = self.serialize()?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        fs::write(path, data).await?;
        debug!("Saved DHT state ({} nodes) to {}", self.nodes.len(), path.display());
        Ok(())
    }

    /// Load from file
    pub async fn load(path: &Path) -> Result<Option<Self>> {
        if !fs::try_exists(path).await? {
            return Ok(None);
        }
        let data = fs::read(path).await?;
        Ok(Some(Self::deserialize(&data)?))
    }
}

//! Torrent file parser
//!
//! Decodes .torrent files into [`TorrentInfo`]. The info-hash is computed over
//! the re-encoded info dictionary, which is canonical bencode.

use anyhow::Result;
use serde_bencode::value::Value;
use tracing::{debug, error, info};

use crate::bencode::ValueExt;
use crate::error::TorrentError;
use crate::torrent::info::{TorrentFile, TorrentInfo};

/// Parser for .torrent files
pub struct TorrentParser;

impl TorrentParser {
    /// Parse a .torrent file from bytes
    pub fn parse_bytes(data: &[u8]) -> Result<TorrentInfo> {
        info!("Parsing torrent file from {} bytes", data.len());

        let root: Value = serde_bencode::from_bytes(data).map_err(|e| {
            error!("Torrent file is not valid bencode: {}", e);
            TorrentError::metadata_error_with_source("Torrent file is not valid bencode", e.to_string())
        })?;

        let torrent = Self::convert_to_torrent_info(&root)?;
        torrent.validate()?;
        info!(
            "Parsed torrent '{}': {} pieces of {} bytes, info_hash {}",
            torrent.name,
            torrent.piece_count(),
            torrent.piece_length,
            torrent.info_hash_hex()
        );
        Ok(torrent)
    }

    /// Parse a .torrent file from a file path
    pub async fn parse_file(path: &std::path::Path) -> Result<TorrentInfo> {
        info!("Loading torrent file from: {}", path.display());

        let data = tokio::fs::read(path).await.map_err(|e| {
            error!("Failed to read torrent file '{}': {}", path.display(), e);
            TorrentError::storage_error_full("Failed to read torrent file", path.display().to_string(), e.to_string())
        })?;

        debug!("Read {} bytes from torrent file", data.len());
        Self::parse_bytes(&data)
    }

    fn convert_to_torrent_info(root: &Value) -> Result<TorrentInfo> {
        let missing = |field: &str| TorrentError::metadata_error(format!("Missing or invalid '{}' field", field));

        if root.as_dict().is_none() {
            return Err(TorrentError::metadata_error("Root must be a dictionary").into());
        }

        let announce = root.get_str(b"announce");
        let mut announce_list: Vec<String> = announce.iter().cloned().collect();
        if let Some(tiers) = root.get(b"announce-list").and_then(ValueExt::as_list) {
            for url in tiers.iter().filter_map(ValueExt::as_list).flatten() {
                if let Some(bytes) = url.as_bytes() {
                    let url = String::from_utf8_lossy(bytes).into_owned();
                    if !announce_list.contains(&url) {
                        announce_list.push(url);
                    }
                }
            }
        }

        let info_dict = root
            .get(b"info")
            .filter(|v| v.as_dict().is_some())
            .ok_or_else(|| missing("info"))?;

        let name = info_dict.get_str(b"name").ok_or_else(|| missing("name"))?;
        let piece_length = info_dict
            .get_int(b"piece length")
            .filter(|&n| n > 0)
            .ok_or_else(|| missing("piece length"))? as u64;
        let pieces = TorrentInfo::parse_piece_hashes(info_dict.get_bytes(b"pieces").ok_or_else(|| missing("pieces"))?)?;

        let (length, files) = if let Some(len) = info_dict.get(b"length") {
            let len = len.as_int().filter(|&n| n >= 0).ok_or_else(|| missing("length"))?;
            (Some(len as u64), None)
        } else if let Some(list) = info_dict.get(b"files").and_then(ValueExt::as_list) {
            let mut torrent_files = Vec::with_capacity(list.len());
            for entry in list {
                let length = entry
                    .get_int(b"length")
                    .filter(|&n| n >= 0)
                    .ok_or_else(|| missing("files.length"))? as u64;
                let path = entry
                    .get(b"path")
                    .and_then(ValueExt::as_list)
                    .ok_or_else(|| missing("files.path"))?
                    .iter()
                    .map(|c| c.as_bytes().map(|b| String::from_utf8_lossy(b).into_owned()))
                    .collect::<Option<Vec<_>>>()
                    .ok_or_else(|| missing("files.path"))?;
                torrent_files.push(TorrentFile { path, length });
            }
            (None, Some(torrent_files))
        } else {
            return Err(TorrentError::metadata_error("Neither length nor files found in info dict").into());
        };

        let info_bytes = serde_bencode::to_bytes(info_dict).map_err(|e| {
            TorrentError::metadata_error_with_source("Failed to re-encode info dictionary", e.to_string())
        })?;
        let info_hash = TorrentInfo::generate_info_hash(&info_bytes);

        Ok(TorrentInfo {
            announce,
            announce_list,
            info_hash,
            piece_length,
            pieces,
            name,
            length,
            files,
        })
    }
}

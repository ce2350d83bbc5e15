//! Torrent information structures
//!
//! Structurally validated metadata: piece length, digest table and file list.

use sha1::{Digest, Sha1};
use anyhow::Result;

use crate::error::TorrentError;

/// Represents a file in the torrent's file list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentFile {
    /// File path components (e.g., ["folder", "subfolder", "file.txt"])
    pub path: Vec<String>,
    /// File size in bytes
    pub length: u64,
}

/// High-level torrent information
#[derive(Debug, Clone)]
pub struct TorrentInfo {
    /// Primary tracker announce URL
    pub announce: Option<String>,
    /// List of all tracker announce URLs
    pub announce_list: Vec<String>,
    /// SHA1 hash of the bencoded info dictionary
    pub info_hash: [u8; 20],
    /// Size of each piece in bytes
    pub piece_length: u64,
    /// List of piece hashes (each is a 20-byte SHA1 hash)
    pub pieces: Vec<[u8; 20]>,
    /// Torrent name
    pub name: String,
    /// Single file size (None for multi-file torrents)
    pub length: Option<u64>,
    /// Files in multi-file torrents (None for single-file torrents)
    pub files: Option<Vec<TorrentFile>>,
}

impl TorrentInfo {
    /// Calculate total size of all files in torrent
    pub fn total_size(&self) -> u64 {
        if let Some(length) = self.length {
            length
        } else if let Some(files) = &self.files {
            files.iter().map(|f| f.length).sum()
        } else {
            0
        }
    }

    /// Get number of pieces in torrent
    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    /// Byte length of piece `index`; only the last piece may be short
    pub fn piece_size(&self, index: usize) -> u32 {
        self.piece_range(index)
            .map(|(start, end)| (end - start) as u32)
            .unwrap_or(0)
    }

    /// Files in on-disk order, with paths relative to the download directory
    pub fn files_iter(&self) -> impl Iterator<Item = TorrentFile> + '_ {
        let name = self.name.clone();
        let length = self.length.unwrap_or(0);

        if let Some(files) = &self.files {
            Box::new(files.iter().map(move |f| {
                let mut path = Vec::with_capacity(f.path.len() + 1);
                path.push(name.clone());
                path.extend(f.path.iter().cloned());
                TorrentFile { path, length: f.length }
            })) as Box<dyn Iterator<Item = _> + '_>
        } else if self.length.is_some() {
            Box::new(std::iter::once(TorrentFile {
                path: vec![name],
                length,
            })) as Box<dyn Iterator<Item = _> + '_>
        } else {
            Box::new(std::iter::empty()) as Box<dyn Iterator<Item = _> + '_>
        }
    }

    /// Get info hash as a hex string
    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }

    /// Generate info hash from info dictionary bytes
    pub fn generate_info_hash(info_dict_bytes: &[u8]) -> [u8; 20] {
        let mut hasher = Sha1::new();
        hasher.update(info_dict_bytes);
        hasher.finalize().into()
    }

    /// Parse piece hashes from concatenated bytes in torrent file
    pub fn parse_piece_hashes(pieces_bytes: &[u8]) -> Result<Vec<[u8; 20]>> {
        if pieces_bytes.len() % 20 != 0 {
            return Err(TorrentError::metadata_error(format!(
                "Pieces field length must be a multiple of 20, got {}",
                pieces_bytes.len()
            )).into());
        }

        Ok(pieces_bytes
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect())
    }

    /// Get byte range for a specific piece
    pub fn piece_range(&self, index: usize) -> Option<(u64, u64)> {
        if index >= self.pieces.len() {
            return None;
        }

        let start = (index as u64) * self.piece_length;
        let total = self.total_size();
        let end = std::cmp::min(start + self.piece_length, total);

        Some((start, end))
    }

    /// Check that the digest table, piece length and file sizes agree
    pub fn validate(&self) -> Result<()> {
        if self.piece_length == 0 || self.piece_length > u32::MAX as u64 {
            return Err(TorrentError::metadata_error(format!("Invalid piece length {}", self.piece_length)).into());
        }
        if self.name.is_empty() {
            return Err(TorrentError::metadata_error("Torrent name is empty").into());
        }
        if self.length.is_some() == self.files.is_some() {
            return Err(TorrentError::metadata_error("Exactly one of 'length' and 'files' must be present").into());
        }

        let total = self.total_size();
        let expected = total.div_ceil(self.piece_length);
        if expected != self.pieces.len() as u64 || total == 0 {
            return Err(TorrentError::metadata_error(format!(
                "Torrent of {} bytes needs {} pieces, digest table has {}",
                total,
                expected,
                self.pieces.len()
            )).into());
        }

        if let Some(files) = &self.files {
            for file in files {
                if file.path.is_empty() || file.path.iter().any(|c| c.is_empty() || c == ".." || c == ".") {
                    return Err(TorrentError::metadata_error(format!("Unsafe file path {:?}", file.path)).into());
                }
            }
        }
        Ok(())
    }

    /// Build metadata for an in-memory payload
    #[cfg(test)]
    pub(crate) fn for_content(name: &str, piece_length: u64, content: &[u8]) -> Self {
        let pieces = content
            .chunks(piece_length as usize)
            .map(Self::generate_info_hash)
            .collect();
        Self {
            announce: None,
            announce_list: Vec::new(),
            info_hash: Self::generate_info_hash(name.as_bytes()),
            piece_length,
            pieces,
            name: name.to_string(),
            length: Some(content.len() as u64),
            files: None,
        }
    }
}

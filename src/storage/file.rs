//! File storage module
//!
//! Maps piece offsets onto the torrent's file list and keeps a bounded
//! least-recently-used cache of open handles.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, error, info, trace, warn};

use crate::error::TorrentError;
use crate::storage::backend::{BlockStore, StorageType};
use crate::torrent::TorrentInfo;

/// Default number of simultaneously open file handles
pub const DEFAULT_OPEN_FILES: usize = 32;

/// Represents a file entry in the storage layout
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub path: PathBuf,
    /// Offset of the file's first byte within the torrent payload
    pub offset: u64,
    pub length: u64,
}

#[derive(Debug)]
struct OpenFile {
    handle: fs::File,
    last_used: u64,
}

/// On-disk block store for a torrent
#[derive(Debug)]
pub struct FileBlockStore {
    base_path: PathBuf,
    piece_length: u64,
    files: Vec<FileEntry>,
    open: HashMap<usize, OpenFile>,
    max_open: usize,
    clock: u64,
}

impl FileBlockStore {
    /// Create a file store rooted at `base_path`
    pub fn new(base_path: impl Into<PathBuf>, torrent: &TorrentInfo, max_open: usize) -> Self {
        let base_path = base_path.into();
        let mut offset = 0;
        let files = torrent
            .files_iter()
            .map(|f| {
                let entry = FileEntry {
                    path: f.path.iter().fold(base_path.clone(), |p, c| p.join(c)),
                    offset,
                    length: f.length,
                };
                offset += f.length;
                entry
            })
            .collect();

        Self {
            base_path,
            piece_length: torrent.piece_length,
            files,
            open: HashMap::new(),
            max_open: max_open.max(1),
            clock: 0,
        }
    }

    /// File layout in payload order
    pub fn files(&self) -> &[FileEntry] {
        &self.files
    }

    /// Create directories and sparse files for every entry
    pub async fn create_files(&self) -> Result<()> {
        info!("Creating file structure under {}", self.base_path.display());

        for file in &self.files {
            if let Some(parent) = file.path.parent() {
                fs::create_dir_all(parent).await.map_err(|e| {
                    error!("Failed to create directory '{}': {}", parent.display(), e);
                    TorrentError::storage_error_full("Failed to create directory", parent.display().to_string(), e.to_string())
                })?;
            }

            let f = fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(false)
                .open(&file.path)
                .await
                .map_err(|e| {
                    error!("Failed to create file '{}': {}", file.path.display(), e);
                    TorrentError::storage_error_full("Failed to create file", file.path.display().to_string(), e.to_string())
                })?;

            let current = f.metadata().await.map(|m| m.len()).unwrap_or(0);
            if current != file.length {
                debug!("Sizing {} to {} bytes", file.path.display(), file.length);
                f.set_len(file.length).await.map_err(|e| {
                    TorrentError::storage_error_full("Failed to set file length", file.path.display().to_string(), e.to_string())
                })?;
            }
        }

        Ok(())
    }

    /// Number of handles currently cached
    pub fn open_handles(&self) -> usize {
        self.open.len()
    }

    fn evict_lru(&mut self) -> bool {
        let oldest = self
            .open
            .iter()
            .min_by_key(|(_, f)| f.last_used)
            .map(|(&index, _)| index);
        match oldest {
            Some(index) => {
                trace!("Evicting handle for {}", self.files[index].path.display());
                self.open.remove(&index);
                true
            }
            None => false,
        }
    }

    async fn handle(&mut self, index: usize) -> Result<&mut fs::File> {
        self.clock += 1;
        let now = self.clock;

        if !self.open.contains_key(&index) {
            while self.open.len() >= self.max_open {
                self.evict_lru();
            }

            let path = self.files[index].path.clone();
            let handle = loop {
                match open_rw(&path).await {
                    Ok(handle) => break handle,
                    Err(e) if is_handle_exhaustion(&e) => {
                        warn!("Out of file handles opening {}", path.display());
                        if !self.evict_lru() {
                            return Err(TorrentError::resource_exhausted(
                                format!("Cannot open {}: {}", path.display(), e),
                                "file handles",
                            ).into());
                        }
                    }
                    Err(e) => {
                        error!("Failed to open file '{}': {}", path.display(), e);
                        return Err(TorrentError::storage_error_full("Failed to open file", path.display().to_string(), e.to_string()).into());
                    }
                }
            };
            self.open.insert(index, OpenFile { handle, last_used: now });
        }

        let entry = self
            .open
            .get_mut(&index)
            .ok_or_else(|| TorrentError::storage_error("File handle vanished from cache"))?;
        entry.last_used = now;
        Ok(&mut entry.handle)
    }

    /// Split a payload range into per-file `(file index, file offset, length)` spans
    fn spans(&self, start: u64, len: u64) -> Result<Vec<(usize, u64, usize)>> {
        let total = self.files.last().map(|f| f.offset + f.length).unwrap_or(0);
        if start + len > total {
            return Err(TorrentError::storage_error(format!(
                "Range {}+{} beyond end of payload ({} bytes)",
                start, len, total
            )).into());
        }

        let mut spans = Vec::new();
        let mut pos = start;
        let end = start + len;
        for (index, file) in self.files.iter().enumerate() {
            let file_end = file.offset + file.length;
            if file_end <= pos || file.length == 0 {
                continue;
            }
            if pos >= end {
                break;
            }
            let take = end.min(file_end) - pos;
            spans.push((index, pos - file.offset, take as usize));
            pos += take;
        }
        Ok(spans)
    }
}

async fn open_rw(path: &Path) -> std::io::Result<fs::File> {
    fs::OpenOptions::new().read(true).write(true).create(true).truncate(false).open(path).await
}

fn is_handle_exhaustion(e: &std::io::Error) -> bool {
    // EMFILE / ENFILE
    matches!(e.raw_os_error(), Some(23) | Some(24))
}

#[async_trait]
impl BlockStore for FileBlockStore {
    async fn read_block(&mut self, piece: u32, offset: u32, len: u32) -> Result<Bytes> {
        let start = piece as u64 * self.piece_length + offset as u64;
        let mut buffer = vec![0u8; len as usize];
        let mut filled = 0;

        for (index, file_offset, take) in self.spans(start, len as u64)? {
            let path = self.files[index].path.display().to_string();
            let handle = self.handle(index).await?;
            handle.seek(SeekFrom::Start(file_offset)).await.map_err(|e| {
                TorrentError::storage_error_full("Failed to seek in file", path.clone(), e.to_string())
            })?;
            handle.read_exact(&mut buffer[filled..filled + take]).await.map_err(|e| {
                TorrentError::storage_error_full("Failed to read from file", path.clone(), e.to_string())
            })?;
            filled += take;
        }

        trace!("Read piece {} offset {} ({} bytes)", piece, offset, len);
        Ok(Bytes::from(buffer))
    }

    async fn write_block(&mut self, piece: u32, offset: u32, data: &[u8]) -> Result<()> {
        let start = piece as u64 * self.piece_length + offset as u64;
        let mut written = 0;

        for (index, file_offset, take) in self.spans(start, data.len() as u64)? {
            let path = self.files[index].path.display().to_string();
            let handle = self.handle(index).await?;
            handle.seek(SeekFrom::Start(file_offset)).await.map_err(|e| {
                TorrentError::storage_error_full("Failed to seek in file", path.clone(), e.to_string())
            })?;
            handle.write_all(&data[written..written + take]).await.map_err(|e| {
                error!("Failed to write to file '{}': {}", path, e);
                TorrentError::storage_error_full("Failed to write to file", path.clone(), e.to_string())
            })?;
            written += take;
        }

        trace!("Wrote piece {} offset {} ({} bytes)", piece, offset, data.len());
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        for (index, file) in self.open.iter_mut() {
            file.handle.flush().await.map_err(|e| {
                TorrentError::storage_error_full("Failed to flush file", self.files[*index].path.display().to_string(), e.to_string())
            })?;
        }
        debug!("Flushed {} open files", self.open.len());
        Ok(())
    }

    fn storage_type(&self) -> StorageType {
        StorageType::File
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::TorrentFile;

    fn two_file_torrent() -> TorrentInfo {
        TorrentInfo {
            announce: None,
            announce_list: Vec::new(),
            info_hash: [0u8; 20],
            piece_length: 8,
            pieces: vec![[0u8; 20]; 2],
            name: "set".to_string(),
            length: None,
            files: Some(vec![
                TorrentFile { path: vec!["a".to_string()], length: 5 },
                TorrentFile { path: vec!["sub".to_string(), "b".to_string()], length: 7 },
            ]),
        }
    }

    fn scratch_dir(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("swarm-engine-{}-{}", tag, rand::random::<u32>()))
    }

    #[test]
    fn test_spans_cross_file_boundary() {
        let store = FileBlockStore::new("/tmp/unused", &two_file_torrent(), 4);
        let spans = store.spans(3, 6).unwrap();
        assert_eq!(spans, vec![(0, 3, 2), (1, 0, 4)]);
        assert!(store.spans(10, 5).is_err());
    }

    #[tokio::test]
    async fn test_write_read_across_files() {
        let dir = scratch_dir("rw");
        let mut store = FileBlockStore::new(&dir, &two_file_torrent(), 4);
        store.create_files().await.unwrap();

        store.write_block(0, 2, &[1, 2, 3, 4, 5, 6]).await.unwrap();
        store.flush().await.unwrap();
        assert_eq!(&store.read_block(0, 2, 6).await.unwrap()[..], &[1, 2, 3, 4, 5, 6]);

        let b = tokio::fs::read(dir.join("set").join("sub").join("b")).await.unwrap();
        assert_eq!(b.len(), 7);
        assert_eq!(&b[..3], &[4, 5, 6]);

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn test_handle_cache_is_bounded() {
        let dir = scratch_dir("lru");
        let mut store = FileBlockStore::new(&dir, &two_file_torrent(), 1);
        store.create_files().await.unwrap();

        store.write_block(0, 0, &[9]).await.unwrap();
        assert_eq!(store.open_handles(), 1);
        store.write_block(1, 0, &[9]).await.unwrap();
        assert_eq!(store.open_handles(), 1);
        assert_eq!(&store.read_block(0, 0, 1).await.unwrap()[..], &[9]);

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}

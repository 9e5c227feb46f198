use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::crypto::{self, Hash};
use crate::error::{Result, SyncError};
use crate::index::FileEntry;

const PART_SUFFIX: &str = ".part";

/// Content-addressed store of encrypted chunks, keyed by the BLAKE3 hash of
/// the ciphertext. Holds chunks of downloads in progress, and every chunk of
/// an Encrypted-level folder.
#[derive(Clone)]
pub struct ChunkStore {
    storage_dir: PathBuf,
    chunk_index: Arc<RwLock<HashMap<Hash, ChunkMetadata>>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub size: u64,
    pub stored_at: chrono::DateTime<chrono::Utc>,
}

impl ChunkStore {
    /// Open (or create) a store. Existing chunks are verified and partial
    /// writes from an interrupted run are discarded.
    pub async fn open(storage_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&storage_dir).await?;

        let store = Self {
            storage_dir,
            chunk_index: Arc::new(RwLock::new(HashMap::new())),
        };
        store.verify_stored_chunks().await?;
        Ok(store)
    }

    /// Store a chunk after checking it hashes to `hash`.
    pub async fn store_chunk(&self, hash: Hash, data: &[u8]) -> Result<()> {
        if crypto::hash(data) != hash {
            return Err(SyncError::HashMismatch(hex::encode(hash)));
        }
        if self.has_chunk(&hash) {
            return Ok(());
        }

        let chunk_path = self.get_chunk_path(&hash);
        if let Some(parent) = chunk_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Write aside and rename so a crash never leaves a truncated chunk under its address
        let part_path = chunk_path.with_extension("part");
        fs::write(&part_path, data).await?;
        fs::rename(&part_path, &chunk_path).await?;

        self.chunk_index.write().insert(
            hash,
            ChunkMetadata {
                size: data.len() as u64,
                stored_at: chrono::Utc::now(),
            },
        );

        debug!("Stored chunk {} ({} bytes)", hex::encode(hash), data.len());
        Ok(())
    }

    /// Retrieve a chunk, re-verifying it against its address.
    pub async fn get_chunk(&self, hash: &Hash) -> Result<Vec<u8>> {
        if !self.has_chunk(hash) {
            return Err(SyncError::ChunkUnavailable(hex::encode(hash)));
        }

        let data = fs::read(self.get_chunk_path(hash)).await?;
        if crypto::hash(&data) != *hash {
            warn!("Chunk corruption detected: {}", hex::encode(hash));
            self.remove_chunk(hash).await?;
            return Err(SyncError::ChunkUnavailable(hex::encode(hash)));
        }
        Ok(data)
    }

    pub fn has_chunk(&self, hash: &Hash) -> bool {
        self.chunk_index.read().contains_key(hash)
    }

    pub fn get_chunk_metadata(&self, hash: &Hash) -> Option<ChunkMetadata> {
        self.chunk_index.read().get(hash).cloned()
    }

    pub async fn remove_chunk(&self, hash: &Hash) -> Result<()> {
        let chunk_path = self.get_chunk_path(hash);
        if fs::try_exists(&chunk_path).await.unwrap_or(false) {
            fs::remove_file(&chunk_path).await?;
            debug!("Deleted chunk {}", hex::encode(hash));
        }
        self.chunk_index.write().remove(hash);
        Ok(())
    }

    pub fn list_chunks(&self) -> Vec<Hash> {
        self.chunk_index.read().keys().copied().collect()
    }

    pub fn get_stats(&self) -> StorageStats {
        let index = self.chunk_index.read();
        StorageStats {
            total_chunks: index.len(),
            total_size: index.values().map(|m| m.size).sum(),
        }
    }

    /// Drop chunks that `is_referenced` no longer claims.
    pub async fn cleanup<F>(&self, is_referenced: F) -> Result<usize>
    where
        F: Fn(&Hash) -> bool,
    {
        let orphans: Vec<Hash> = self
            .chunk_index
            .read()
            .keys()
            .filter(|hash| !is_referenced(hash))
            .copied()
            .collect();

        for hash in &orphans {
            self.remove_chunk(hash).await?;
        }
        if !orphans.is_empty() {
            info!("Cleaned up {} orphaned chunks", orphans.len());
        }
        Ok(orphans.len())
    }

    /// Rebuild the in-memory index from disk, dropping corrupt and partial chunks.
    async fn verify_stored_chunks(&self) -> Result<()> {
        let chunks_dir = self.storage_dir.join("chunks");
        if !fs::try_exists(&chunks_dir).await.unwrap_or(false) {
            return Ok(());
        }

        let mut verified = HashMap::new();
        let mut discarded = 0usize;

        let mut prefixes = fs::read_dir(&chunks_dir).await?;
        while let Some(prefix) = prefixes.next_entry().await? {
            if !prefix.file_type().await?.is_dir() {
                continue;
            }
            let mut files = fs::read_dir(prefix.path()).await?;
            while let Some(file) = files.next_entry().await? {
                let path = file.path();
                let name = file.file_name().to_string_lossy().to_string();

                let mut hash = [0u8; 32];
                let valid_name = !name.ends_with(PART_SUFFIX) && hex::decode_to_slice(&name, &mut hash).is_ok();
                let data = if valid_name { fs::read(&path).await.ok() } else { None };

                match data {
                    Some(data) if crypto::hash(&data) == hash => {
                        let stored_at = file
                            .metadata()
                            .await
                            .and_then(|m| m.modified())
                            .map(chrono::DateTime::from)
                            .unwrap_or_else(|_| chrono::Utc::now());
                        verified.insert(
                            hash,
                            ChunkMetadata {
                                size: data.len() as u64,
                                stored_at,
                            },
                        );
                    }
                    _ => {
                        discarded += 1;
                        let _ = fs::remove_file(&path).await;
                    }
                }
            }
        }

        if discarded > 0 {
            warn!("Removed {} corrupted or partial chunks", discarded);
        }
        *self.chunk_index.write() = verified;
        Ok(())
    }

    fn get_chunk_path(&self, hash: &Hash) -> PathBuf {
        let hash_str = hex::encode(hash);
        let prefix = &hash_str[0..2];
        self.storage_dir.join("chunks").join(prefix).join(&hash_str)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StorageStats {
    pub total_chunks: usize,
    pub total_size: u64,
}

/// Which chunks of one entry are already held locally.
///
/// Computed from the store rather than persisted: a fetch interrupted after
/// some chunks resumes with exactly the missing ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkBitfield {
    pub chunks_stored: Vec<bool>,
}

impl ChunkBitfield {
    pub fn for_entry(entry: &FileEntry, store: &ChunkStore) -> Self {
        Self {
            chunks_stored: entry.chunks.iter().map(|c| store.has_chunk(&c.hash)).collect(),
        }
    }

    pub fn mark_chunk_stored(&mut self, chunk_index: usize) {
        if chunk_index < self.chunks_stored.len() {
            self.chunks_stored[chunk_index] = true;
        }
    }

    pub fn is_chunk_stored(&self, chunk_index: usize) -> bool {
        self.chunks_stored.get(chunk_index).copied().unwrap_or(false)
    }

    pub fn is_complete(&self) -> bool {
        self.chunks_stored.iter().all(|&stored| stored)
    }

    pub fn missing_chunks(&self) -> Vec<usize> {
        self.chunks_stored
            .iter()
            .enumerate()
            .filter(|(_, &stored)| !stored)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn completion_percentage(&self) -> f64 {
        if self.chunks_stored.is_empty() {
            return 100.0;
        }
        let stored_count = self.chunks_stored.iter().filter(|&&stored| stored).count();
        (stored_count as f64 / self.chunks_stored.len() as f64) * 100.0
    }
}

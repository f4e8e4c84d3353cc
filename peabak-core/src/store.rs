//! Collaborator boundaries: chunk byte storage and restored-file output.
//!
//! Local I/O failures never propagate as errors past these traits:
//! implementations log them and report `false` / `None`, and the protocol's
//! retry loops compensate.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::protocol::{ChunkKey, FileId};

/// Chunk bytes held on behalf of other peers, keyed by (file id, chunk no).
pub trait ChunkStore: Send + Sync {
    /// Store a chunk, replacing any previous copy. False on I/O failure.
    fn put(&self, key: ChunkKey, body: &[u8]) -> bool;
    fn get(&self, key: ChunkKey) -> Option<Vec<u8>>;
    fn has(&self, key: ChunkKey) -> bool;
    /// True if a chunk was removed.
    fn delete(&self, key: ChunkKey) -> bool;
    /// Bytes currently used by stored chunks.
    fn used_space(&self) -> u64;
    /// Every stored chunk with its size, in key order.
    fn list(&self) -> Vec<(ChunkKey, u64)>;

    /// Remove every chunk of a file. Returns how many were removed.
    fn delete_file(&self, file_id: FileId) -> usize {
        self.list()
            .into_iter()
            .filter(|(k, _)| k.file_id == file_id)
            .filter(|(k, _)| self.delete(*k))
            .count()
    }

    /// Whether any chunk of the file is still held.
    fn holds_file(&self, file_id: FileId) -> bool {
        self.list().iter().any(|(k, _)| k.file_id == file_id)
    }
}

/// Destination for restored files.
pub trait FileSink: Send + Sync {
    /// Write a restored file originally backed up from `pathname`. False on failure.
    fn write_restored(&self, pathname: &str, bytes: &[u8]) -> bool;
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Chunk store kept in memory.
#[derive(Default)]
pub struct MemoryChunkStore {
    chunks: Mutex<BTreeMap<ChunkKey, Vec<u8>>>,
}

impl MemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ChunkStore for MemoryChunkStore {
    fn put(&self, key: ChunkKey, body: &[u8]) -> bool {
        lock(&self.chunks).insert(key, body.to_vec());
        true
    }

    fn get(&self, key: ChunkKey) -> Option<Vec<u8>> {
        lock(&self.chunks).get(&key).cloned()
    }

    fn has(&self, key: ChunkKey) -> bool {
        lock(&self.chunks).contains_key(&key)
    }

    fn delete(&self, key: ChunkKey) -> bool {
        lock(&self.chunks).remove(&key).is_some()
    }

    fn used_space(&self) -> u64 {
        lock(&self.chunks).values().map(|b| b.len() as u64).sum()
    }

    fn list(&self) -> Vec<(ChunkKey, u64)> {
        lock(&self.chunks)
            .iter()
            .map(|(k, b)| (*k, b.len() as u64))
            .collect()
    }
}

/// File sink kept in memory; records every write by pathname.
#[derive(Default)]
pub struct MemoryFileSink {
    files: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryFileSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, pathname: &str) -> Option<Vec<u8>> {
        lock(&self.files).get(pathname).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.files).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FileSink for MemoryFileSink {
    fn write_restored(&self, pathname: &str, bytes: &[u8]) -> bool {
        lock(&self.files).insert(pathname.to_owned(), bytes.to_vec());
        true
    }
}

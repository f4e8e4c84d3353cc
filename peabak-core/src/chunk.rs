//! Chunk manager: split files into fixed-size chunks, derive file ids, reassemble restores.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

use crate::protocol::{FileId, PeerId};

/// Fixed chunk size in bytes.
pub const CHUNK_SIZE: usize = 64_000;

/// Number of chunks for a file of `len` bytes. Always at least one, so an
/// empty file is one empty chunk.
pub fn chunk_count(len: u64) -> u32 {
    let size = CHUNK_SIZE as u64;
    (len.div_ceil(size)).max(1) as u32
}

/// Split file contents into ordered chunks, chunk_no = index.
pub fn split_into_chunks(data: &[u8]) -> Vec<&[u8]> {
    if data.is_empty() {
        return vec![data];
    }
    data.chunks(CHUNK_SIZE).collect()
}

/// File id derived from the originating path and peer: SHA-256 over both.
pub fn derive_file_id(pathname: &str, peer_id: PeerId) -> FileId {
    let mut hasher = Sha256::new();
    hasher.update(pathname.as_bytes());
    hasher.update(b"\0");
    hasher.update(peer_id.to_string().as_bytes());
    FileId::from_bytes(hasher.finalize().into())
}

/// Chunks collected for one restore, ordered by chunk number.
#[derive(Debug)]
pub struct RestoreBuffer {
    pub file_id: FileId,
    chunk_count: u32,
    received: BTreeMap<u32, Vec<u8>>,
}

impl RestoreBuffer {
    pub fn new(file_id: FileId, chunk_count: u32) -> Self {
        Self {
            file_id,
            chunk_count,
            received: BTreeMap::new(),
        }
    }

    /// Record a chunk body. Returns true if the buffer is now complete.
    /// Chunk numbers outside the file are ignored.
    pub fn mark_received(&mut self, chunk_no: u32, body: Vec<u8>) -> bool {
        if chunk_no < self.chunk_count {
            self.received.insert(chunk_no, body);
        }
        self.is_complete()
    }

    pub fn is_complete(&self) -> bool {
        self.received.len() == self.chunk_count as usize
    }

    pub fn received_count(&self) -> usize {
        self.received.len()
    }

    /// Concatenate in chunk order. `None` unless complete.
    pub fn reassemble_into_bytes(self) -> Option<Vec<u8>> {
        if !self.is_complete() {
            return None;
        }
        let total = self.received.values().map(Vec::len).sum();
        let mut out = Vec::with_capacity(total);
        for body in self.received.into_values() {
            out.extend_from_slice(&body);
        }
        Some(out)
    }
}

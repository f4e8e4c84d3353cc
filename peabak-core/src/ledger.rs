//! Replication ledger: desired vs. perceived replication degree per chunk.
//!
//! The ledger is internally synchronized; callers share it behind an `Arc` and
//! never lock it themselves. Own files are the ones this peer originated;
//! other files are the ones it stores (or has overheard traffic about) on
//! behalf of other peers.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};

use crate::protocol::{ChunkKey, FileId, PeerId};

/// Peers believed to hold one chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    peers: BTreeSet<PeerId>,
}

impl ChunkInfo {
    pub fn degree(&self) -> usize {
        self.peers.len()
    }

    pub fn contains(&self, peer: PeerId) -> bool {
        self.peers.contains(&peer)
    }

    pub fn peers(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.peers.iter().copied()
    }
}

/// Present only on files this peer originated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ownership {
    pub pathname: String,
    pub chunk_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub file_id: FileId,
    pub desired_degree: u8,
    pub ownership: Option<Ownership>,
    chunks: BTreeMap<u32, ChunkInfo>,
}

impl FileInfo {
    fn new(file_id: FileId, desired_degree: u8) -> Self {
        Self {
            file_id,
            desired_degree,
            ownership: None,
            chunks: BTreeMap::new(),
        }
    }

    pub fn chunk(&self, chunk_no: u32) -> Option<&ChunkInfo> {
        self.chunks.get(&chunk_no)
    }

    /// Known chunks in chunk order.
    pub fn chunks(&self) -> impl Iterator<Item = (u32, &ChunkInfo)> + '_ {
        self.chunks.iter().map(|(n, c)| (*n, c))
    }

    pub fn degree(&self, chunk_no: u32) -> usize {
        self.chunk(chunk_no).map(ChunkInfo::degree).unwrap_or(0)
    }

    fn chunk_mut(&mut self, chunk_no: u32) -> &mut ChunkInfo {
        self.chunks.entry(chunk_no).or_default()
    }
}

/// Durable form of the ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub own: Vec<FileInfo>,
    pub other: Vec<FileInfo>,
}

impl LedgerSnapshot {
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

#[derive(Default)]
struct Files {
    own: HashMap<FileId, FileInfo>,
    other: HashMap<FileId, FileInfo>,
}

impl Files {
    fn get(&self, file_id: &FileId) -> Option<&FileInfo> {
        self.own.get(file_id).or_else(|| self.other.get(file_id))
    }

    /// Own record if there is one, else the other-file record, created lazily.
    fn touch(&mut self, file_id: FileId) -> &mut FileInfo {
        match self.own.get_mut(&file_id) {
            Some(info) => info,
            None => self
                .other
                .entry(file_id)
                .or_insert_with(|| FileInfo::new(file_id, 0)),
        }
    }
}

/// Thread-safe replication bookkeeping.
#[derive(Default)]
pub struct Ledger {
    files: RwLock<Files>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Files> {
        self.files.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Files> {
        self.files.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a file this peer originated. First writer wins: returns false
    /// and changes nothing if the file is already registered as own.
    pub fn register_own_file(
        &self,
        pathname: &str,
        file_id: FileId,
        chunk_count: u32,
        desired_degree: u8,
    ) -> bool {
        let mut files = self.write();
        if files.own.contains_key(&file_id) {
            return false;
        }
        let mut info = files
            .other
            .remove(&file_id)
            .unwrap_or_else(|| FileInfo::new(file_id, desired_degree));
        info.desired_degree = desired_degree;
        info.ownership = Some(Ownership {
            pathname: pathname.to_owned(),
            chunk_count,
        });
        files.own.insert(file_id, info);
        true
    }

    /// Note a file stored (or overheard) on behalf of another peer. A known
    /// non-zero desired degree is kept; an unknown one (0) is filled in.
    pub fn observe_other_file(&self, file_id: FileId, desired_degree: u8) {
        let mut files = self.write();
        let info = files.touch(file_id);
        if info.ownership.is_none() && desired_degree > 0 {
            info.desired_degree = desired_degree;
        }
    }

    /// Create the chunk record without claiming any holder.
    pub fn touch_chunk(&self, key: ChunkKey) {
        self.write().touch(key.file_id).chunk_mut(key.chunk_no);
    }

    /// Returns true if `peer` was not already counted for the chunk.
    pub fn add_backup_peer(&self, key: ChunkKey, peer: PeerId) -> bool {
        self.write()
            .touch(key.file_id)
            .chunk_mut(key.chunk_no)
            .peers
            .insert(peer)
    }

    /// Returns true if `peer` was counted for the chunk.
    pub fn remove_backup_peer(&self, key: ChunkKey, peer: PeerId) -> bool {
        self.write()
            .touch(key.file_id)
            .chunk_mut(key.chunk_no)
            .peers
            .remove(&peer)
    }

    /// Distinct peers believed to hold the chunk; 0 if unknown.
    pub fn actual_degree(&self, key: ChunkKey) -> usize {
        self.read()
            .get(&key.file_id)
            .map(|f| f.degree(key.chunk_no))
            .unwrap_or(0)
    }

    /// Desired degree of the file; 0 if unknown.
    pub fn desired_degree(&self, file_id: FileId) -> u8 {
        self.read()
            .get(&file_id)
            .map(|f| f.desired_degree)
            .unwrap_or(0)
    }

    /// Known desired degree not yet reached.
    pub fn is_deficient(&self, key: ChunkKey) -> bool {
        let files = self.read();
        match files.get(&key.file_id) {
            Some(f) => f.desired_degree > 0 && f.degree(key.chunk_no) < f.desired_degree as usize,
            None => false,
        }
    }

    pub fn is_own(&self, file_id: FileId) -> bool {
        self.read().own.contains_key(&file_id)
    }

    /// Own file originated from `pathname`: (file id, chunk count).
    pub fn own_file_by_path(&self, pathname: &str) -> Option<(FileId, u32)> {
        self.read().own.values().find_map(|f| {
            f.ownership
                .as_ref()
                .filter(|o| o.pathname == pathname)
                .map(|o| (f.file_id, o.chunk_count))
        })
    }

    pub fn own_file(&self, file_id: FileId) -> Option<FileInfo> {
        self.read().own.get(&file_id).cloned()
    }

    pub fn other_file(&self, file_id: FileId) -> Option<FileInfo> {
        self.read().other.get(&file_id).cloned()
    }

    pub fn own_files(&self) -> Vec<FileInfo> {
        let mut out: Vec<FileInfo> = self.read().own.values().cloned().collect();
        out.sort_by_key(|f| f.file_id);
        out
    }

    pub fn other_files(&self) -> Vec<FileInfo> {
        let mut out: Vec<FileInfo> = self.read().other.values().cloned().collect();
        out.sort_by_key(|f| f.file_id);
        out
    }

    pub fn delete_own_file(&self, file_id: FileId) -> Option<FileInfo> {
        self.write().own.remove(&file_id)
    }

    pub fn delete_other_file(&self, file_id: FileId) -> Option<FileInfo> {
        self.write().other.remove(&file_id)
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            own: self.own_files(),
            other: self.other_files(),
        }
    }

    pub fn from_snapshot(snapshot: LedgerSnapshot) -> Self {
        let mut files = Files::default();
        for f in snapshot.own {
            files.own.insert(f.file_id, f);
        }
        for f in snapshot.other {
            if !files.own.contains_key(&f.file_id) {
                files.other.insert(f.file_id, f);
            }
        }
        Self {
            files: RwLock::new(files),
        }
    }
}

//! Local disk collaborators: source-file reads, the chunk store and the restored-file writer.

use std::collections::BTreeMap;
use std::io::{SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use peabak_core::{ChunkKey, ChunkStore, FileId, FileSink, CHUNK_SIZE};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Whole source file, for backup.
pub async fn read_file(path: &Path) -> std::io::Result<Vec<u8>> {
    tokio::fs::read(path).await
}

/// One chunk of a source file, for re-replication by the originator.
pub async fn read_chunk(path: &Path, chunk_no: u32) -> Option<Vec<u8>> {
    match read_chunk_inner(path, chunk_no).await {
        Ok(body) => Some(body),
        Err(e) => {
            tracing::warn!(path = %path.display(), chunk_no, error = %e, "cannot re-read source chunk");
            None
        }
    }
}

async fn read_chunk_inner(path: &Path, chunk_no: u32) -> std::io::Result<Vec<u8>> {
    let mut f = tokio::fs::File::open(path).await?;
    f.seek(SeekFrom::Start(chunk_no as u64 * CHUNK_SIZE as u64))
        .await?;
    let mut body = Vec::with_capacity(CHUNK_SIZE);
    f.take(CHUNK_SIZE as u64).read_to_end(&mut body).await?;
    Ok(body)
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Chunks on disk as `<root>/<file id hex>/<chunk no>`, with an in-memory
/// size index rebuilt from the directory tree on open.
pub struct DiskChunkStore {
    root: PathBuf,
    index: Mutex<BTreeMap<ChunkKey, u64>>,
}

impl DiskChunkStore {
    pub fn open(root: impl Into<PathBuf>) -> std::io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        let index = scan(&root)?;
        tracing::info!(root = %root.display(), chunks = index.len(), "chunk store opened");
        Ok(Self {
            root,
            index: Mutex::new(index),
        })
    }

    fn file_dir(&self, file_id: FileId) -> PathBuf {
        self.root.join(file_id.to_hex())
    }

    fn chunk_path(&self, key: ChunkKey) -> PathBuf {
        self.file_dir(key.file_id).join(key.chunk_no.to_string())
    }

    fn write(&self, key: ChunkKey, body: &[u8]) -> std::io::Result<()> {
        let dir = self.file_dir(key.file_id);
        std::fs::create_dir_all(&dir)?;
        // Unique per write, so concurrent puts of one key never share it.
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(body)?;
        tmp.persist(self.chunk_path(key)).map_err(|e| e.error)?;
        Ok(())
    }
}

/// Entries that do not parse as `<hex>/<n>` are skipped.
fn scan(root: &Path) -> std::io::Result<BTreeMap<ChunkKey, u64>> {
    let mut index = BTreeMap::new();
    for dir in std::fs::read_dir(root)? {
        let dir = dir?;
        let Some(file_id) = dir.file_name().to_str().and_then(|s| s.parse::<FileId>().ok()) else {
            continue;
        };
        if !dir.file_type()?.is_dir() {
            continue;
        }
        for entry in std::fs::read_dir(dir.path())? {
            let entry = entry?;
            let Some(chunk_no) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
                continue;
            };
            index.insert(ChunkKey::new(file_id, chunk_no), entry.metadata()?.len());
        }
    }
    Ok(index)
}

impl ChunkStore for DiskChunkStore {
    fn put(&self, key: ChunkKey, body: &[u8]) -> bool {
        match self.write(key, body) {
            Ok(()) => {
                lock(&self.index).insert(key, body.len() as u64);
                true
            }
            Err(e) => {
                tracing::warn!(%key, error = %e, "cannot store chunk");
                false
            }
        }
    }

    fn get(&self, key: ChunkKey) -> Option<Vec<u8>> {
        if !self.has(key) {
            return None;
        }
        match std::fs::read(self.chunk_path(key)) {
            Ok(body) => Some(body),
            Err(e) => {
                tracing::warn!(%key, error = %e, "cannot read stored chunk");
                None
            }
        }
    }

    fn has(&self, key: ChunkKey) -> bool {
        lock(&self.index).contains_key(&key)
    }

    fn delete(&self, key: ChunkKey) -> bool {
        if lock(&self.index).remove(&key).is_none() {
            return false;
        }
        if let Err(e) = std::fs::remove_file(self.chunk_path(key)) {
            tracing::warn!(%key, error = %e, "cannot remove chunk file");
        }
        // Only succeeds once the directory is empty.
        let _ = std::fs::remove_dir(self.file_dir(key.file_id));
        true
    }

    fn used_space(&self) -> u64 {
        lock(&self.index).values().sum()
    }

    fn list(&self) -> Vec<(ChunkKey, u64)> {
        lock(&self.index).iter().map(|(k, n)| (*k, *n)).collect()
    }
}

/// Writes restored files as `<dir>/<file name of the original path>`.
pub struct DirFileSink {
    dir: PathBuf,
}

impl DirFileSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn target(&self, pathname: &str) -> PathBuf {
        let name = Path::new(pathname)
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "restored".into());
        self.dir.join(name)
    }
}

impl FileSink for DirFileSink {
    fn write_restored(&self, pathname: &str, bytes: &[u8]) -> bool {
        let target = self.target(pathname);
        let res = std::fs::create_dir_all(&self.dir).and_then(|()| std::fs::write(&target, bytes));
        match res {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(path = %target.display(), error = %e, "cannot write restored file");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peabak_core::derive_file_id;

    #[test]
    fn disk_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let a = ChunkKey::new(derive_file_id("/a", 1), 0);
        let b = ChunkKey::new(derive_file_id("/a", 1), 1);
        {
            let store = DiskChunkStore::open(dir.path()).unwrap();
            assert!(store.put(a, b"first"));
            assert!(store.put(b, b""));
            assert_eq!(store.used_space(), 5);
        }
        let store = DiskChunkStore::open(dir.path()).unwrap();
        assert_eq!(store.list(), vec![(a, 5), (b, 0)]);
        assert_eq!(store.get(a).unwrap(), b"first");
        assert_eq!(store.get(b).unwrap(), b"");
    }

    #[test]
    fn disk_store_delete_file_cleans_directory() {
        let dir = tempfile::tempdir().unwrap();
        let id = derive_file_id("/a", 1);
        let store = DiskChunkStore::open(dir.path()).unwrap();
        for n in 0..3 {
            store.put(ChunkKey::new(id, n), b"xyz");
        }
        assert_eq!(store.delete_file(id), 3);
        assert!(!store.holds_file(id));
        assert!(!dir.path().join(id.to_hex()).exists());
        assert!(!store.delete(ChunkKey::new(id, 0)));
    }

    #[test]
    fn concurrent_puts_of_one_key_all_succeed() {
        let dir = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(DiskChunkStore::open(dir.path()).unwrap());
        let key = ChunkKey::new(derive_file_id("/a", 1), 0);
        let writers: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || store.put(key, &[5u8; 4096]))
            })
            .collect();
        for w in writers {
            assert!(w.join().unwrap());
        }
        assert_eq!(store.list(), vec![(key, 4096)]);
        assert_eq!(store.get(key).unwrap(), vec![5u8; 4096]);
        let leftovers = std::fs::read_dir(dir.path().join(key.file_id.to_hex())).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn scan_skips_foreign_entries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("not-a-file-id")).unwrap();
        std::fs::write(dir.path().join("stray"), b"x").unwrap();
        let id = derive_file_id("/a", 1);
        std::fs::create_dir_all(dir.path().join(id.to_hex())).unwrap();
        std::fs::write(dir.path().join(id.to_hex()).join("4.tmp"), b"x").unwrap();
        std::fs::write(dir.path().join(id.to_hex()).join("4"), b"body").unwrap();
        let store = DiskChunkStore::open(dir.path()).unwrap();
        assert_eq!(store.list(), vec![(ChunkKey::new(id, 4), 4)]);
    }

    #[test]
    fn sink_writes_by_file_name() {
        let dir = tempfile::tempdir().unwrap();
        let sink = DirFileSink::new(dir.path().join("restored"));
        assert!(sink.write_restored("/home/u/notes.txt", b"hi"));
        assert_eq!(std::fs::read(dir.path().join("restored/notes.txt")).unwrap(), b"hi");
    }

    #[tokio::test]
    async fn read_chunk_seeks_to_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("src");
        let data: Vec<u8> = (0..150_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &data).unwrap();
        let second = read_chunk(&path, 1).await.unwrap();
        assert_eq!(second, &data[CHUNK_SIZE..2 * CHUNK_SIZE]);
        let last = read_chunk(&path, 2).await.unwrap();
        assert_eq!(last, &data[2 * CHUNK_SIZE..]);
        assert!(read_chunk(&dir.path().join("missing"), 0).await.is_none());
    }
}

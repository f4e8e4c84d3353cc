//! Peer: routes inbound messages to the ledger and live state machines, and
//! runs the backup / restore / delete / reclaim commands.

use std::fmt::Write as _;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use peabak_core::{
    derive_file_id, split_into_chunks, ChunkKey, FileId, Message, MessageKind, PeerId,
    MAX_REPLICATION_DEGREE,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::chunker::{Chunker, ChunkerHandle};
use crate::context::Context;
use crate::files;
use crate::getchunker::{GetchunkOutcome, Getchunker, GetchunkerHandle};
use crate::lifecycle::{random_between, Registry};
use crate::putchunker::{PutchunkOutcome, Putchunker, PutchunkerHandle};
use crate::removed::{RemovedWaiter, WaiterHandle, WaiterOutcome};
use crate::restorer::{RestoreOutcome, Restorer};

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("{0} was not backed up by this peer")]
    UnknownFile(String),
    #[error("cannot read {pathname}: {source}")]
    Io {
        pathname: String,
        #[source]
        source: std::io::Error,
    },
    #[error("replication degree must be between 1 and 9, got {0}")]
    InvalidDegree(u8),
    #[error("a restore of {0} is already running")]
    RestoreInProgress(String),
    #[error("a backup of {0} is already running")]
    BackupInProgress(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupReport {
    pub file_id: FileId,
    pub chunk_count: u32,
    /// Chunks that did not reach the desired degree.
    pub failed: Vec<u32>,
}

impl BackupReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReclaimReport {
    pub capacity: u64,
    pub used: u64,
    pub evicted: Vec<ChunkKey>,
}

pub struct Peer {
    ctx: Arc<Context>,
    capacity: AtomicU64,
    chunkers: Registry<ChunkKey, ChunkerHandle>,
    getchunkers: Registry<ChunkKey, GetchunkerHandle>,
    putchunkers: Registry<ChunkKey, PutchunkerHandle>,
    waiters: Registry<ChunkKey, WaiterHandle>,
    restorers: Registry<FileId, ()>,
}

impl Peer {
    pub fn new(ctx: Arc<Context>, capacity: u64) -> Self {
        Self {
            ctx,
            capacity: AtomicU64::new(capacity),
            chunkers: Registry::new(),
            getchunkers: Registry::new(),
            putchunkers: Registry::new(),
            waiters: Registry::new(),
            restorers: Registry::new(),
        }
    }

    pub fn id(&self) -> PeerId {
        self.ctx.peer_id
    }

    /// Count this peer as a holder of every chunk in its store. Repairs a
    /// ledger that was lost or is older than the store.
    pub fn reassert_stored_claims(&self) -> usize {
        let mut claimed = 0;
        for (key, _) in self.ctx.store.list() {
            if !self.ctx.ledger.is_own(key.file_id)
                && self.ctx.ledger.add_backup_peer(key, self.ctx.peer_id)
            {
                claimed += 1;
            }
        }
        if claimed > 0 {
            tracing::info!(claimed, "re-asserted claims for stored chunks");
        }
        claimed
    }

    /// Entry point for every inbound message. Own messages are filtered out
    /// by the receive loops before this point.
    pub async fn handle_message(self: &Arc<Self>, msg: Message) {
        let sender = msg.sender_id;
        let file_id = msg.file_id;
        tracing::debug!(msg_type = %msg.message_type(), sender, %file_id, "received");
        match msg.kind {
            MessageKind::Putchunk {
                chunk_no,
                replication_degree,
                body,
            } => {
                self.on_putchunk(ChunkKey::new(file_id, chunk_no), replication_degree, body)
            }
            MessageKind::Stored { chunk_no } => {
                self.ctx
                    .ledger
                    .add_backup_peer(ChunkKey::new(file_id, chunk_no), sender);
            }
            MessageKind::Getchunk { chunk_no } => self.on_getchunk(ChunkKey::new(file_id, chunk_no)),
            MessageKind::Chunk { chunk_no, body } => {
                let key = ChunkKey::new(file_id, chunk_no);
                if let Some(c) = self.chunkers.get(&key) {
                    c.suppress();
                }
                if let Some(g) = self.getchunkers.get(&key) {
                    g.assign(body);
                }
            }
            MessageKind::Delete => self.on_delete(file_id),
            MessageKind::Deleted => tracing::debug!(sender, %file_id, "DELETED ignored"),
            MessageKind::Removed { chunk_no } => {
                self.on_removed(ChunkKey::new(file_id, chunk_no), sender)
            }
        }
    }

    fn on_putchunk(&self, key: ChunkKey, degree: u8, body: Vec<u8>) {
        if let Some(w) = self.waiters.get(&key) {
            w.cancel();
        }
        let ledger = &self.ctx.ledger;
        if ledger.is_own(key.file_id) {
            return;
        }
        ledger.observe_other_file(key.file_id, degree);
        if !self.ctx.store.has(key) {
            let used = self.ctx.store.used_space();
            let capacity = self.capacity.load(Ordering::Relaxed);
            if used.saturating_add(body.len() as u64) > capacity {
                tracing::debug!(%key, used, capacity, "no room for chunk");
                return;
            }
            if !self.ctx.store.put(key, &body) {
                return;
            }
            tracing::debug!(%key, bytes = body.len(), "chunk stored");
        }
        ledger.add_backup_peer(key, self.ctx.peer_id);
        self.send_stored(key);
    }

    fn send_stored(&self, key: ChunkKey) {
        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(random_between(Duration::ZERO, ctx.timing.stored_jitter)).await;
            let msg = Message::stored(ctx.version, ctx.peer_id, key);
            ctx.dispatcher.send(msg).await;
        });
    }

    fn on_getchunk(self: &Arc<Self>, key: ChunkKey) {
        self.ctx.ledger.touch_chunk(key);
        if !self.ctx.store.has(key) {
            return;
        }
        let ctx = self.ctx.clone();
        let Some((generation, chunker)) = self.chunkers.insert_with(key, || Chunker::new(ctx, key))
        else {
            tracing::debug!(%key, "reply already pending");
            return;
        };
        let peer = self.clone();
        tokio::spawn(async move {
            let outcome = chunker.run().await;
            peer.chunkers.remove(&key, generation);
            tracing::debug!(%key, ?outcome, "chunker done");
        });
    }

    fn on_delete(&self, file_id: FileId) {
        if self.ctx.ledger.is_own(file_id) {
            return;
        }
        self.cancel_file_machines(file_id);
        for c in self.chunkers.handles_where(|k| k.file_id == file_id) {
            c.suppress();
        }
        let removed = self.ctx.store.delete_file(file_id);
        self.ctx.ledger.delete_other_file(file_id);
        tracing::info!(%file_id, removed, "file deleted by its owner");
    }

    fn on_removed(self: &Arc<Self>, key: ChunkKey, sender: PeerId) {
        let ledger = &self.ctx.ledger;
        ledger.remove_backup_peer(key, sender);
        if !ledger.is_deficient(key) {
            return;
        }
        if !ledger.is_own(key.file_id) && !self.ctx.store.has(key) {
            return;
        }
        let ctx = self.ctx.clone();
        let Some((generation, waiter)) = self.waiters.insert_with(key, || RemovedWaiter::new(ctx, key))
        else {
            return;
        };
        let peer = self.clone();
        tokio::spawn(async move {
            let outcome = waiter.run().await;
            peer.waiters.remove(&key, generation);
            if outcome == WaiterOutcome::Deficient {
                peer.re_replicate(key).await;
            }
        });
    }

    /// Start a Putchunker for a chunk that fell below its desired degree,
    /// using the stored copy or, for an own file, the source file.
    async fn re_replicate(self: &Arc<Self>, key: ChunkKey) {
        let body = match self.ctx.store.get(key) {
            Some(body) => Some(body),
            None => match self.ctx.ledger.own_file(key.file_id).and_then(|f| f.ownership) {
                Some(o) if key.chunk_no < o.chunk_count => {
                    files::read_chunk(Path::new(&o.pathname), key.chunk_no).await
                }
                _ => None,
            },
        };
        let Some(body) = body else {
            tracing::debug!(%key, "no copy to re-replicate from");
            return;
        };
        let desired = self.ctx.ledger.desired_degree(key.file_id);
        tracing::info!(%key, desired, "re-replicating chunk");
        if let Some(task) = self.spawn_putchunker(key, desired, body) {
            let outcome = task.await.unwrap_or(PutchunkOutcome::Failed);
            tracing::info!(%key, ?outcome, "re-replication finished");
        }
    }

    /// Register and spawn a Putchunker. `None` if one is already live for the key.
    fn spawn_putchunker(
        self: &Arc<Self>,
        key: ChunkKey,
        desired: u8,
        body: Vec<u8>,
    ) -> Option<JoinHandle<PutchunkOutcome>> {
        let ctx = self.ctx.clone();
        let (generation, putchunker) = self
            .putchunkers
            .insert_with(key, || Putchunker::new(ctx, key, desired, body))?;
        let peer = self.clone();
        Some(tokio::spawn(async move {
            let outcome = putchunker.run().await;
            peer.putchunkers.remove(&key, generation);
            outcome
        }))
    }

    fn cancel_file_machines(&self, file_id: FileId) {
        for p in self.putchunkers.handles_where(|k| k.file_id == file_id) {
            p.cancel();
        }
        for w in self.waiters.handles_where(|k| k.file_id == file_id) {
            w.cancel();
        }
    }

    /// Back up a local file: one Putchunker per chunk, all awaited.
    pub async fn backup(self: &Arc<Self>, pathname: &str, degree: u8) -> Result<BackupReport, CommandError> {
        if degree == 0 || degree > MAX_REPLICATION_DEGREE {
            return Err(CommandError::InvalidDegree(degree));
        }
        let data = files::read_file(Path::new(pathname))
            .await
            .map_err(|source| CommandError::Io {
                pathname: pathname.to_owned(),
                source,
            })?;
        let file_id = derive_file_id(pathname, self.ctx.peer_id);
        if !self.putchunkers.handles_where(|k| k.file_id == file_id).is_empty() {
            return Err(CommandError::BackupInProgress(pathname.to_owned()));
        }
        let chunks = split_into_chunks(&data);
        let chunk_count = chunks.len() as u32;
        let ledger = &self.ctx.ledger;
        if let Some(old) = ledger.own_file(file_id) {
            let stale = old.desired_degree != degree
                || old.ownership.map(|o| o.chunk_count) != Some(chunk_count);
            if stale {
                ledger.delete_own_file(file_id);
            }
        }
        ledger.register_own_file(pathname, file_id, chunk_count, degree);
        tracing::info!(pathname, %file_id, chunk_count, degree, "backup started");

        let mut tasks = Vec::with_capacity(chunks.len());
        for (n, chunk) in chunks.into_iter().enumerate() {
            let key = ChunkKey::new(file_id, n as u32);
            tasks.push((n as u32, self.spawn_putchunker(key, degree, chunk.to_vec())));
        }
        let mut failed = Vec::new();
        for (n, task) in tasks {
            let outcome = match task {
                Some(t) => t.await.unwrap_or(PutchunkOutcome::Failed),
                None => PutchunkOutcome::Failed,
            };
            if outcome != PutchunkOutcome::Success {
                failed.push(n);
            }
        }
        let report = BackupReport {
            file_id,
            chunk_count,
            failed,
        };
        if report.is_success() {
            tracing::info!(pathname, %file_id, "backup complete");
        } else {
            tracing::warn!(pathname, %file_id, failed = ?report.failed, "backup incomplete");
        }
        Ok(report)
    }

    /// Restore a file this peer backed up. All chunks or nothing.
    pub async fn restore(self: &Arc<Self>, pathname: &str) -> Result<RestoreOutcome, CommandError> {
        let Some((file_id, chunk_count)) = self.ctx.ledger.own_file_by_path(pathname) else {
            return Err(CommandError::UnknownFile(pathname.to_owned()));
        };
        let Some((generation, ())) = self.restorers.insert_with(file_id, || ((), ())) else {
            return Err(CommandError::RestoreInProgress(pathname.to_owned()));
        };
        tracing::info!(pathname, %file_id, chunk_count, "restore started");

        let (tx, rx) = mpsc::unbounded_channel();
        let mut children = Vec::with_capacity(chunk_count as usize);
        for n in 0..chunk_count {
            let key = ChunkKey::new(file_id, n);
            let ctx = self.ctx.clone();
            let mut handle = None;
            let inserted = self.getchunkers.insert_with(key, || {
                let (g, h) = Getchunker::new(ctx, key);
                handle = Some(h.clone());
                (g, h)
            });
            let (Some((g_gen, getchunker)), Some(handle)) = (inserted, handle) else {
                tracing::warn!(%key, "chunk already being requested");
                let _ = tx.send((n, GetchunkOutcome::Failed));
                continue;
            };
            children.push(handle);
            let peer = self.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let outcome = getchunker.run().await;
                peer.getchunkers.remove(&key, g_gen);
                let _ = tx.send((n, outcome));
            });
        }
        drop(tx);

        let restorer = Restorer::new(self.ctx.clone(), file_id, pathname.to_owned(), chunk_count);
        let peer = self.clone();
        let task = tokio::spawn(async move {
            let outcome = restorer.run(children, rx).await;
            peer.restorers.remove(&file_id, generation);
            outcome
        });
        let outcome = task.await.unwrap_or_else(|e| {
            tracing::warn!(pathname, error = %e, "restore task ended abnormally");
            RestoreOutcome::Failed {
                missing: Vec::new(),
            }
        });
        if let RestoreOutcome::Failed { missing } = &outcome {
            tracing::warn!(pathname, ?missing, "restore failed");
        }
        Ok(outcome)
    }

    /// Forget an own file and tell every holder to drop its chunks.
    pub async fn delete(self: &Arc<Self>, pathname: &str) -> Result<FileId, CommandError> {
        let Some((file_id, _)) = self.ctx.ledger.own_file_by_path(pathname) else {
            return Err(CommandError::UnknownFile(pathname.to_owned()));
        };
        self.ctx.ledger.delete_own_file(file_id);
        self.cancel_file_machines(file_id);
        let ctx = self.ctx.clone();
        ctx.dispatcher
            .send(Message::delete(ctx.version, ctx.peer_id, file_id))
            .await;
        let repeats = ctx.timing.delete_repeats;
        if repeats > 1 {
            tokio::spawn(async move {
                for _ in 1..repeats {
                    tokio::time::sleep(ctx.timing.delete_spacing).await;
                    if !ctx.dispatcher.send(Message::delete(ctx.version, ctx.peer_id, file_id)).await {
                        break;
                    }
                }
            });
        }
        tracing::info!(pathname, %file_id, "file deleted");
        Ok(file_id)
    }

    /// Set the storage capacity and evict chunks until usage fits it.
    pub async fn reclaim(self: &Arc<Self>, max_space: u64) -> ReclaimReport {
        self.capacity.store(max_space, Ordering::Relaxed);
        let mut evicted = Vec::new();
        while self.ctx.store.used_space() > max_space {
            let Some(key) = self.pick_victim() else {
                break;
            };
            if !self.ctx.store.delete(key) {
                break;
            }
            if let Some(c) = self.chunkers.get(&key) {
                c.suppress();
            }
            self.ctx.ledger.remove_backup_peer(key, self.ctx.peer_id);
            self.ctx
                .dispatcher
                .send(Message::removed(self.ctx.version, self.ctx.peer_id, key))
                .await;
            if !self.ctx.store.holds_file(key.file_id) {
                self.ctx.ledger.delete_other_file(key.file_id);
            }
            tracing::info!(%key, "chunk evicted");
            evicted.push(key);
        }
        ReclaimReport {
            capacity: max_space,
            used: self.ctx.store.used_space(),
            evicted,
        }
    }

    /// Chunk whose perceived degree most exceeds its desired degree; ties go
    /// to the largest chunk.
    fn pick_victim(&self) -> Option<ChunkKey> {
        let ledger = &self.ctx.ledger;
        self.ctx
            .store
            .list()
            .into_iter()
            .max_by_key(|(key, size)| {
                let surplus =
                    ledger.actual_degree(*key) as i64 - ledger.desired_degree(key.file_id) as i64;
                (surplus, *size)
            })
            .map(|(key, _)| key)
    }

    /// Human-readable report of own files, stored chunks and storage.
    pub fn state(&self) -> String {
        let ledger = &self.ctx.ledger;
        let mut out = String::new();
        let _ = writeln!(out, "peer {} (protocol {})", self.ctx.peer_id, self.ctx.version);
        let _ = writeln!(out, "backed up files:");
        for f in ledger.own_files() {
            let Some(o) = &f.ownership else { continue };
            let _ = writeln!(out, "  {} {} desired {}", o.pathname, f.file_id, f.desired_degree);
            for n in 0..o.chunk_count {
                let _ = writeln!(out, "    chunk {} perceived {}", n, f.degree(n));
            }
        }
        let _ = writeln!(out, "stored chunks:");
        for (key, size) in self.ctx.store.list() {
            let _ = writeln!(
                out,
                "  {} {} bytes perceived {} desired {}",
                key,
                size,
                ledger.actual_degree(key),
                ledger.desired_degree(key.file_id)
            );
        }
        let _ = writeln!(
            out,
            "storage: {} of {} bytes used",
            self.ctx.store.used_space(),
            self.capacity.load(Ordering::Relaxed)
        );
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, Lan};
    use peabak_core::{ChunkStore, MessageType, PROTOCOL_VERSION};

    fn write_source(dir: &Path, name: &str, len: usize) -> (String, Vec<u8>) {
        let data: Vec<u8> = (0..len).map(|i| (i * 7 % 256) as u8).collect();
        let path = dir.join(name);
        std::fs::write(&path, &data).unwrap();
        (path.to_string_lossy().into_owned(), data)
    }

    #[tokio::test(start_paused = true)]
    async fn backup_reaches_degree_on_every_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let (path, _) = write_source(dir.path(), "f", 150_000);
        let lan = Lan::new(&[1, 2, 3]);
        let report = lan.peer(1).backup(&path, 2).await.unwrap();
        assert!(report.is_success());
        assert_eq!(report.chunk_count, 3);
        let ledger = &lan.peer(1).ctx.ledger;
        for n in 0..3 {
            assert!(ledger.actual_degree(ChunkKey::new(report.file_id, n)) >= 2);
            assert!(lan.store(2).has(ChunkKey::new(report.file_id, n)));
            assert!(lan.store(3).has(ChunkKey::new(report.file_id, n)));
        }
        // One PUTCHUNK per chunk was enough.
        assert_eq!(lan.count(MessageType::Putchunk), 3);
        assert!(lan.store(1).list().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn backup_rejects_bad_input() {
        let lan = Lan::new(&[1]);
        let p = lan.peer(1);
        assert!(matches!(p.backup("/nowhere", 0).await, Err(CommandError::InvalidDegree(0))));
        assert!(matches!(p.backup("/nowhere", 10).await, Err(CommandError::InvalidDegree(10))));
        assert!(matches!(p.backup("/nowhere/at/all", 1).await, Err(CommandError::Io { .. })));
        assert!(matches!(p.restore("/nowhere").await, Err(CommandError::UnknownFile(_))));
        assert!(matches!(p.delete("/nowhere").await, Err(CommandError::UnknownFile(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn lone_peer_backup_fails_after_all_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let (path, _) = write_source(dir.path(), "f", 10);
        let lan = Lan::new(&[1]);
        let report = lan.peer(1).backup(&path, 1).await.unwrap();
        assert_eq!(report.failed, vec![0]);
        assert_eq!(lan.count(MessageType::Putchunk), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn restore_round_trips_through_the_lan() {
        let dir = tempfile::tempdir().unwrap();
        let (path, data) = write_source(dir.path(), "f", 130_000);
        let lan = Lan::new(&[1, 2, 3]);
        assert!(lan.peer(1).backup(&path, 1).await.unwrap().is_success());
        let outcome = lan.peer(1).restore(&path).await.unwrap();
        assert_eq!(outcome, RestoreOutcome::Restored { bytes: data.len() });
        assert_eq!(lan.sink(1).get(&path).unwrap(), data);
        assert!(lan.peer(1).getchunkers.is_empty());
        assert!(lan.peer(1).restorers.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn empty_file_is_one_empty_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let (path, _) = write_source(dir.path(), "empty", 0);
        let lan = Lan::new(&[1, 2]);
        let report = lan.peer(1).backup(&path, 1).await.unwrap();
        assert_eq!(report.chunk_count, 1);
        assert!(report.is_success());
        let outcome = lan.peer(1).restore(&path).await.unwrap();
        assert_eq!(outcome, RestoreOutcome::Restored { bytes: 0 });
        assert_eq!(lan.sink(1).get(&path).unwrap(), b"");
    }

    #[tokio::test(start_paused = true)]
    async fn single_responder_when_delays_differ() {
        let dir = tempfile::tempdir().unwrap();
        let (path, data) = write_source(dir.path(), "f", 1_000);
        let lan = Lan::with_timing(&[1, 2, 3], |id| {
            let mut t = testing::fast_timing();
            t.chunker_delay = Duration::from_millis(100 * id);
            t
        });
        assert!(lan.peer(1).backup(&path, 2).await.unwrap().is_success());
        lan.clear_log();
        let outcome = lan.peer(1).restore(&path).await.unwrap();
        assert_eq!(outcome, RestoreOutcome::Restored { bytes: data.len() });
        tokio::time::sleep(Duration::from_secs(2)).await;
        let chunks = lan.sent(MessageType::Chunk);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].sender_id, 2);
        assert!(lan.peer(3).chunkers.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_chunk_fails_restore_without_output() {
        let dir = tempfile::tempdir().unwrap();
        let (path, _) = write_source(dir.path(), "f", 130_000);
        let lan = Lan::new(&[1, 2]);
        let report = lan.peer(1).backup(&path, 1).await.unwrap();
        assert!(report.is_success());
        assert!(lan.store(2).delete(ChunkKey::new(report.file_id, 1)));
        let outcome = lan.peer(1).restore(&path).await.unwrap();
        assert_eq!(outcome, RestoreOutcome::Failed { missing: vec![1] });
        assert!(lan.sink(1).is_empty());
        assert!(lan.peer(1).getchunkers.is_empty());
        let before = lan.count(MessageType::Getchunk);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(lan.count(MessageType::Getchunk), before);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_chunk_cancels_pending_siblings() {
        let dir = tempfile::tempdir().unwrap();
        let (path, _) = write_source(dir.path(), "f", 130_000);
        let lan = Lan::with_timing(&[1, 2], |id| {
            let mut t = testing::fast_timing();
            if id == 2 {
                t.chunker_delay = Duration::from_secs(5);
            }
            t
        });
        let report = lan.peer(1).backup(&path, 1).await.unwrap();
        assert!(report.is_success());

        // Chunk 1 already has a request in flight, so this restore cannot ask for it.
        let p1 = lan.peer(1);
        let busy = ChunkKey::new(report.file_id, 1);
        let (_idle, other) = Getchunker::new(p1.ctx.clone(), busy);
        assert!(p1.getchunkers.insert_with(busy, || ((), other)).is_some());

        lan.clear_log();
        let started = tokio::time::Instant::now();
        let outcome = p1.restore(&path).await.unwrap();
        assert_eq!(outcome, RestoreOutcome::Failed { missing: vec![1] });
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(p1.getchunkers.len(), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let asked = lan.count(MessageType::Getchunk);
        assert!(asked <= 2);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(lan.count(MessageType::Getchunk), asked);
        assert!(lan.sink(1).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_restore_of_same_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (path, _) = write_source(dir.path(), "f", 10);
        let lan = Lan::new(&[1, 2]);
        assert!(lan.peer(1).backup(&path, 1).await.unwrap().is_success());
        let p = lan.peer(1).clone();
        let first = {
            let path = path.clone();
            tokio::spawn(async move { p.restore(&path).await })
        };
        tokio::task::yield_now().await;
        assert!(matches!(
            lan.peer(1).restore(&path).await,
            Err(CommandError::RestoreInProgress(_))
        ));
        assert!(matches!(first.await.unwrap(), Ok(RestoreOutcome::Restored { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn delete_clears_remote_copies() {
        let dir = tempfile::tempdir().unwrap();
        let (path, _) = write_source(dir.path(), "f", 70_000);
        let lan = Lan::new(&[1, 2, 3]);
        let report = lan.peer(1).backup(&path, 2).await.unwrap();
        assert!(lan.store(2).holds_file(report.file_id));
        lan.peer(1).delete(&path).await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        for id in [2, 3] {
            assert!(!lan.store(id).holds_file(report.file_id));
            assert!(lan.peer(id).ctx.ledger.other_file(report.file_id).is_none());
        }
        assert!(lan.peer(1).ctx.ledger.own_file_by_path(&path).is_none());
        let repeats = lan.peer(1).ctx.timing.delete_repeats as usize;
        assert_eq!(lan.count(MessageType::Delete), repeats);
        assert_eq!(lan.count(MessageType::Deleted), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reclaim_evicts_and_another_peer_restores_degree() {
        let dir = tempfile::tempdir().unwrap();
        let (path, _) = write_source(dir.path(), "f", 1_000);
        let lan = Lan::new(&[1, 2, 3, 4]);
        // Peer 4 starts full so the first backup lands on 2 and 3 only.
        lan.peer(4).capacity.store(0, Ordering::Relaxed);
        let report = lan.peer(1).backup(&path, 2).await.unwrap();
        assert!(report.is_success());
        let key = ChunkKey::new(report.file_id, 0);
        assert!(!lan.store(4).has(key));
        lan.peer(4).capacity.store(u64::MAX, Ordering::Relaxed);

        let reclaimed = lan.peer(2).reclaim(0).await;
        assert_eq!(reclaimed.evicted, vec![key]);
        assert_eq!(reclaimed.used, 0);
        assert!(!lan.store(2).has(key));
        assert!(lan.peer(2).ctx.ledger.other_file(report.file_id).is_none());

        // Waiter delay, then PUTCHUNK backoff, then STORED jitter.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(lan.count(MessageType::Removed), 1);
        assert!(lan.store(4).has(key));
        assert!(lan.peer(1).ctx.ledger.actual_degree(key) >= 2);
        assert!(lan.peer(1).waiters.is_empty());
        assert!(lan.peer(3).waiters.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn overheard_putchunk_cancels_pending_waiter() {
        let lan = Lan::new(&[1, 2]);
        let p = lan.peer(2);
        let key = testing::key(0);
        p.ctx.ledger.observe_other_file(key.file_id, 2);
        lan.store(2).put(key, b"x");
        p.ctx.ledger.add_backup_peer(key, 2);
        p.ctx.ledger.add_backup_peer(key, 3);
        p.handle_message(Message::removed(PROTOCOL_VERSION, 3, key)).await;
        assert!(p.waiters.contains(&key));
        p.handle_message(Message::putchunk(PROTOCOL_VERSION, 1, key, 2, b"x".to_vec()))
            .await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(p.waiters.is_empty());
        assert!(p.putchunkers.is_empty());
        assert_eq!(lan.count(MessageType::Putchunk), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn putchunk_beyond_capacity_is_not_stored() {
        let lan = Lan::new(&[1, 2]);
        let p = lan.peer(2);
        p.capacity.store(4, Ordering::Relaxed);
        let key = testing::key(0);
        p.handle_message(Message::putchunk(PROTOCOL_VERSION, 1, key, 1, b"too big".to_vec()))
            .await;
        assert!(!lan.store(2).has(key));
        p.handle_message(Message::putchunk(PROTOCOL_VERSION, 1, key, 1, b"ok".to_vec()))
            .await;
        assert!(lan.store(2).has(key));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(lan.count(MessageType::Stored), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stored_chunks_are_reclaimed_on_startup() {
        let (ctx, _out) = testing::context(5);
        let key = testing::key(3);
        ctx.store.put(key, b"kept");
        let peer = Peer::new(ctx.clone(), u64::MAX);
        assert_eq!(peer.reassert_stored_claims(), 1);
        assert_eq!(peer.reassert_stored_claims(), 0);
        assert_eq!(ctx.ledger.actual_degree(key), 1);
        assert!(peer.state().contains(&key.to_string()));
    }
}

//! Test fixtures: a context whose dispatcher feeds an inspectable outbox, and
//! an in-process LAN where every peer's outbound traffic reaches all others.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use peabak_core::{
    derive_file_id, ChunkKey, FileSink, Ledger, MemoryChunkStore, MemoryFileSink, Message,
    MessageType, PeerId, PROTOCOL_VERSION,
};
use tokio::sync::mpsc;

use crate::config::Timing;
use crate::context::Context;
use crate::dispatch::Dispatcher;
use crate::peer::Peer;

const QUEUE: usize = 1024;

/// Chunk of a file no test peer owns.
pub fn key(chunk_no: u32) -> ChunkKey {
    ChunkKey::new(derive_file_id("/test/file", 99), chunk_no)
}

/// Default timers without responder jitter.
pub fn fast_timing() -> Timing {
    Timing {
        chunker_jitter: Duration::ZERO,
        ..Timing::default()
    }
}

/// Everything a context sent, in order.
pub struct Outbox {
    rx: mpsc::Receiver<Message>,
    seen: Vec<Message>,
}

impl Outbox {
    fn pull(&mut self) {
        while let Ok(msg) = self.rx.try_recv() {
            self.seen.push(msg);
        }
    }

    /// Take everything sent so far.
    pub fn drain(&mut self) -> Vec<Message> {
        self.pull();
        std::mem::take(&mut self.seen)
    }

    pub fn count(&mut self, msg_type: MessageType) -> usize {
        self.pull();
        self.seen
            .iter()
            .filter(|m| m.message_type() == msg_type)
            .count()
    }
}

pub fn context(peer_id: PeerId) -> (Arc<Context>, Outbox) {
    context_with_sink(peer_id, Arc::new(MemoryFileSink::new()))
}

pub fn context_with_sink(peer_id: PeerId, sink: Arc<dyn FileSink>) -> (Arc<Context>, Outbox) {
    build_context(peer_id, sink, QUEUE)
}

/// Context whose outbound queue holds only `queue` messages.
pub fn context_with_queue(peer_id: PeerId, queue: usize) -> (Arc<Context>, Outbox) {
    build_context(peer_id, Arc::new(MemoryFileSink::new()), queue)
}

fn build_context(peer_id: PeerId, sink: Arc<dyn FileSink>, queue: usize) -> (Arc<Context>, Outbox) {
    let (dispatcher, rx) = Dispatcher::new(queue);
    let ctx = Context {
        peer_id,
        version: PROTOCOL_VERSION,
        ledger: Arc::new(Ledger::new()),
        store: Arc::new(MemoryChunkStore::new()),
        sink,
        dispatcher,
        timing: Timing::default(),
    };
    (
        Arc::new(ctx),
        Outbox {
            rx,
            seen: Vec::new(),
        },
    )
}

struct Node {
    peer: Arc<Peer>,
    store: Arc<MemoryChunkStore>,
    sink: Arc<MemoryFileSink>,
}

/// Peers joined by a lossless in-memory network. Every message put on the
/// network is recorded.
pub struct Lan {
    nodes: BTreeMap<PeerId, Node>,
    log: Arc<Mutex<Vec<Message>>>,
}

impl Lan {
    pub fn new(ids: &[PeerId]) -> Self {
        Self::with_timing(ids, |_| Timing::default())
    }

    pub fn with_timing(ids: &[PeerId], timing: impl Fn(PeerId) -> Timing) -> Self {
        let mut nodes = BTreeMap::new();
        let mut outboxes = Vec::new();
        for &id in ids {
            let (dispatcher, rx) = Dispatcher::new(QUEUE);
            let store = Arc::new(MemoryChunkStore::new());
            let sink = Arc::new(MemoryFileSink::new());
            let ctx = Context {
                peer_id: id,
                version: PROTOCOL_VERSION,
                ledger: Arc::new(Ledger::new()),
                store: store.clone(),
                sink: sink.clone(),
                dispatcher,
                timing: timing(id),
            };
            let peer = Arc::new(Peer::new(Arc::new(ctx), u64::MAX));
            nodes.insert(id, Node { peer, store, sink });
            outboxes.push((id, rx));
        }

        let log = Arc::new(Mutex::new(Vec::new()));
        let peers: Vec<Arc<Peer>> = nodes.values().map(|n| n.peer.clone()).collect();
        for (id, mut rx) in outboxes {
            let log = log.clone();
            let peers = peers.clone();
            tokio::spawn(async move {
                while let Some(msg) = rx.recv().await {
                    log.lock().unwrap().push(msg.clone());
                    for p in peers.iter().filter(|p| p.id() != id) {
                        let p = p.clone();
                        let msg = msg.clone();
                        tokio::spawn(async move { p.handle_message(msg).await });
                    }
                }
            });
        }
        Self { nodes, log }
    }

    fn node(&self, id: PeerId) -> &Node {
        self.nodes.get(&id).expect("no such peer on the LAN")
    }

    pub fn peer(&self, id: PeerId) -> &Arc<Peer> {
        &self.node(id).peer
    }

    pub fn store(&self, id: PeerId) -> &Arc<MemoryChunkStore> {
        &self.node(id).store
    }

    pub fn sink(&self, id: PeerId) -> &Arc<MemoryFileSink> {
        &self.node(id).sink
    }

    pub fn sent(&self, msg_type: MessageType) -> Vec<Message> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.message_type() == msg_type)
            .cloned()
            .collect()
    }

    pub fn count(&self, msg_type: MessageType) -> usize {
        self.sent(msg_type).len()
    }

    pub fn clear_log(&self) {
        self.log.lock().unwrap().clear();
    }
}

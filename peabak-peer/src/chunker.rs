//! Chunker: answers one GETCHUNK after a delay unless another holder answers first.

use std::sync::Arc;
use std::time::Duration;

use peabak_core::{ChunkKey, Message};

use crate::context::Context;
use crate::lifecycle::{random_between, Latch, Woke};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkerOutcome {
    /// Sent one CHUNK.
    Sent,
    /// Another holder's CHUNK was overheard first.
    Suppressed,
    /// The chunk was gone by the time the delay elapsed.
    Evicted,
}

/// Registry handle: lets overheard CHUNK traffic stop the responder.
#[derive(Clone)]
pub struct ChunkerHandle {
    latch: Arc<Latch>,
}

impl ChunkerHandle {
    /// Cancel the pending reply. False if it already fired or was cancelled.
    pub fn suppress(&self) -> bool {
        self.latch.finish_and_wake()
    }
}

pub struct Chunker {
    ctx: Arc<Context>,
    key: ChunkKey,
    delay: Duration,
    latch: Arc<Latch>,
}

impl Chunker {
    /// Delay drawn from the configured base plus jitter.
    pub fn new(ctx: Arc<Context>, key: ChunkKey) -> (Self, ChunkerHandle) {
        let t = &ctx.timing;
        let delay = random_between(t.chunker_delay, t.chunker_delay + t.chunker_jitter);
        Self::with_delay(ctx, key, delay)
    }

    pub fn with_delay(ctx: Arc<Context>, key: ChunkKey, delay: Duration) -> (Self, ChunkerHandle) {
        let latch = Arc::new(Latch::new());
        let handle = ChunkerHandle {
            latch: latch.clone(),
        };
        (
            Self {
                ctx,
                key,
                delay,
                latch,
            },
            handle,
        )
    }

    pub async fn run(self) -> ChunkerOutcome {
        if self.latch.sleep(self.delay).await == Woke::Notified || !self.latch.try_finish() {
            tracing::debug!(key = %self.key, "CHUNK overheard, reply suppressed");
            return ChunkerOutcome::Suppressed;
        }
        // Re-read: the chunk may have been evicted or deleted while waiting.
        let Some(body) = self.ctx.store.get(self.key) else {
            tracing::debug!(key = %self.key, "chunk gone before reply");
            return ChunkerOutcome::Evicted;
        };
        let msg = Message::chunk(self.ctx.version, self.ctx.peer_id, self.key, body);
        self.ctx.dispatcher.send(msg).await;
        tracing::debug!(key = %self.key, "CHUNK sent");
        ChunkerOutcome::Sent
    }
}

//! Putchunker: backs up one chunk until the ledger shows the desired degree.

use std::sync::Arc;

use peabak_core::{ChunkKey, Message};

use crate::context::Context;
use crate::lifecycle::{backoff, Latch, Woke};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutchunkOutcome {
    Success,
    /// Desired degree not reached within the attempt budget.
    Failed,
    /// Stopped because the file was deleted.
    Cancelled,
}

#[derive(Clone)]
pub struct PutchunkerHandle {
    latch: Arc<Latch>,
}

impl PutchunkerHandle {
    pub fn cancel(&self) -> bool {
        self.latch.finish_and_wake()
    }
}

pub struct Putchunker {
    ctx: Arc<Context>,
    key: ChunkKey,
    desired: u8,
    body: Vec<u8>,
    latch: Arc<Latch>,
}

impl Putchunker {
    pub fn new(
        ctx: Arc<Context>,
        key: ChunkKey,
        desired: u8,
        body: Vec<u8>,
    ) -> (Self, PutchunkerHandle) {
        let latch = Arc::new(Latch::new());
        let handle = PutchunkerHandle {
            latch: latch.clone(),
        };
        (
            Self {
                ctx,
                key,
                desired,
                body,
                latch,
            },
            handle,
        )
    }

    pub async fn run(self) -> PutchunkOutcome {
        let t = &self.ctx.timing;
        for attempt in 0..t.putchunk_attempts {
            if self.latch.is_done() {
                return PutchunkOutcome::Cancelled;
            }
            let msg = Message::putchunk(
                self.ctx.version,
                self.ctx.peer_id,
                self.key,
                self.desired,
                self.body.clone(),
            );
            self.ctx.dispatcher.send(msg).await;
            let wait = backoff(t.putchunk_base, attempt);
            tracing::debug!(key = %self.key, attempt, ?wait, "PUTCHUNK sent");
            if self.latch.sleep(wait).await == Woke::Notified {
                return PutchunkOutcome::Cancelled;
            }
            let actual = self.ctx.ledger.actual_degree(self.key);
            if actual >= self.desired as usize {
                if !self.latch.try_finish() {
                    return PutchunkOutcome::Cancelled;
                }
                tracing::debug!(key = %self.key, actual, desired = self.desired, "chunk backed up");
                return PutchunkOutcome::Success;
            }
            tracing::debug!(key = %self.key, actual, desired = self.desired, "degree not reached yet");
        }
        if !self.latch.try_finish() {
            return PutchunkOutcome::Cancelled;
        }
        tracing::warn!(
            key = %self.key,
            actual = self.ctx.ledger.actual_degree(self.key),
            desired = self.desired,
            "backup attempts exhausted"
        );
        PutchunkOutcome::Failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use peabak_core::{MessageKind, MessageType};
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn succeeds_once_degree_is_reached() {
        let (ctx, mut out) = testing::context(1);
        let key = testing::key(0);
        let ledger = ctx.ledger.clone();
        let (p, _h) = Putchunker::new(ctx, key, 2, b"abc".to_vec());
        let task = tokio::spawn(p.run());
        tokio::time::sleep(Duration::from_millis(200)).await;
        ledger.add_backup_peer(key, 2);
        ledger.add_backup_peer(key, 3);
        assert_eq!(task.await.unwrap(), PutchunkOutcome::Success);
        let sent = out.drain();
        assert_eq!(sent.len(), 1);
        match &sent[0].kind {
            MessageKind::Putchunk {
                chunk_no,
                replication_degree,
                body,
            } => {
                assert_eq!(*chunk_no, 0);
                assert_eq!(*replication_degree, 2);
                assert_eq!(body, b"abc");
            }
            other => panic!("expected PUTCHUNK, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_degree_then_succeeds() {
        let (ctx, mut out) = testing::context(1);
        let key = testing::key(0);
        let ledger = ctx.ledger.clone();
        let (p, _h) = Putchunker::new(ctx, key, 1, b"abc".to_vec());
        let task = tokio::spawn(p.run());
        // Second check happens at 1s + 2s.
        tokio::time::sleep(Duration::from_millis(2500)).await;
        ledger.add_backup_peer(key, 9);
        assert_eq!(task.await.unwrap(), PutchunkOutcome::Success);
        assert_eq!(out.count(MessageType::Putchunk), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn fails_after_attempts() {
        let (ctx, mut out) = testing::context(1);
        let attempts = ctx.timing.putchunk_attempts as usize;
        let ledger = ctx.ledger.clone();
        let key = testing::key(0);
        ledger.add_backup_peer(key, 2);
        let (p, _h) = Putchunker::new(ctx, key, 2, b"abc".to_vec());
        assert_eq!(p.run().await, PutchunkOutcome::Failed);
        assert_eq!(out.count(MessageType::Putchunk), attempts);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_wins_over_timer() {
        let (ctx, mut out) = testing::context(1);
        let (p, h) = Putchunker::new(ctx, testing::key(0), 2, b"abc".to_vec());
        let task = tokio::spawn(p.run());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(h.cancel());
        assert_eq!(task.await.unwrap(), PutchunkOutcome::Cancelled);
        assert_eq!(out.count(MessageType::Putchunk), 1);
    }
}

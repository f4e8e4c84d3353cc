//! Getchunker: requests one chunk with exponential backoff until a CHUNK arrives.

use std::sync::{Arc, Mutex, PoisonError};

use peabak_core::{ChunkKey, Message};

use crate::context::Context;
use crate::lifecycle::{backoff, Latch, Woke};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GetchunkOutcome {
    Assigned(Vec<u8>),
    /// Every attempt went unanswered.
    Failed,
    /// Stopped by its restorer.
    Cancelled,
}

#[derive(Default)]
struct Shared {
    latch: Latch,
    body: Mutex<Option<Vec<u8>>>,
}

/// Registry handle: delivers overheard CHUNK bodies, lets the restorer cancel.
#[derive(Clone)]
pub struct GetchunkerHandle {
    shared: Arc<Shared>,
}

impl GetchunkerHandle {
    /// Hand over a received body. False if the request already ended.
    pub fn assign(&self, body: Vec<u8>) -> bool {
        if !self.shared.latch.try_finish() {
            return false;
        }
        *self.shared.body.lock().unwrap_or_else(PoisonError::into_inner) = Some(body);
        self.shared.latch.wake();
        true
    }

    pub fn cancel(&self) -> bool {
        self.shared.latch.finish_and_wake()
    }
}

pub struct Getchunker {
    ctx: Arc<Context>,
    key: ChunkKey,
    shared: Arc<Shared>,
}

impl Getchunker {
    pub fn new(ctx: Arc<Context>, key: ChunkKey) -> (Self, GetchunkerHandle) {
        let shared = Arc::new(Shared::default());
        let handle = GetchunkerHandle {
            shared: shared.clone(),
        };
        (Self { ctx, key, shared }, handle)
    }

    pub async fn run(self) -> GetchunkOutcome {
        let t = &self.ctx.timing;
        for attempt in 0..t.getchunk_attempts {
            let msg = Message::getchunk(self.ctx.version, self.ctx.peer_id, self.key);
            let latch = &self.shared.latch;
            if !self.ctx.dispatcher.send_if(msg, || !latch.is_done()).await {
                break;
            }
            let wait = backoff(t.getchunk_base, attempt);
            tracing::debug!(key = %self.key, attempt, ?wait, "GETCHUNK sent");
            if self.shared.latch.sleep(wait).await == Woke::Notified {
                return self.settled();
            }
        }
        if self.shared.latch.try_finish() {
            tracing::warn!(key = %self.key, attempts = t.getchunk_attempts, "no CHUNK received, giving up");
            return GetchunkOutcome::Failed;
        }
        // Finished from outside while the timer fired; its wake follows.
        self.shared.latch.woken().await;
        self.settled()
    }

    fn settled(&self) -> GetchunkOutcome {
        match self
            .shared
            .body
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            Some(body) => GetchunkOutcome::Assigned(body),
            None => GetchunkOutcome::Cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use peabak_core::MessageType;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn exhausts_after_all_attempts() {
        let (ctx, mut out) = testing::context(1);
        let attempts = ctx.timing.getchunk_attempts;
        let (g, _h) = Getchunker::new(ctx, testing::key(2));
        let started = tokio::time::Instant::now();
        assert_eq!(g.run().await, GetchunkOutcome::Failed);
        assert_eq!(out.count(MessageType::Getchunk), attempts as usize);
        // 1+2+4+8+16 seconds with the default base of one second.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(31) && elapsed < Duration::from_secs(32));
    }

    #[tokio::test(start_paused = true)]
    async fn assigned_never_asks_again() {
        let (ctx, mut out) = testing::context(1);
        let (g, h) = Getchunker::new(ctx, testing::key(2));
        let task = tokio::spawn(g.run());
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(h.assign(b"data".to_vec()));
        assert!(!h.assign(b"late".to_vec()));
        assert!(!h.cancel());
        assert_eq!(task.await.unwrap(), GetchunkOutcome::Assigned(b"data".to_vec()));
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(out.count(MessageType::Getchunk), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn assigned_before_first_send_sends_nothing() {
        let (ctx, mut out) = testing::context(1);
        let (g, h) = Getchunker::new(ctx, testing::key(2));
        assert!(h.assign(b"early".to_vec()));
        assert_eq!(g.run().await, GetchunkOutcome::Assigned(b"early".to_vec()));
        assert_eq!(out.count(MessageType::Getchunk), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn assigned_while_queue_full_sends_nothing() {
        let (ctx, mut out) = testing::context_with_queue(1, 1);
        ctx.dispatcher
            .send(Message::stored(ctx.version, 1, testing::key(0)))
            .await;
        let (g, h) = Getchunker::new(ctx, testing::key(2));
        let task = tokio::spawn(g.run());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(h.assign(b"data".to_vec()));
        assert_eq!(out.count(MessageType::Stored), 1);
        assert_eq!(task.await.unwrap(), GetchunkOutcome::Assigned(b"data".to_vec()));
        assert_eq!(out.count(MessageType::Getchunk), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_retries() {
        let (ctx, mut out) = testing::context(1);
        let (g, h) = Getchunker::new(ctx, testing::key(2));
        let task = tokio::spawn(g.run());
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(h.cancel());
        assert_eq!(task.await.unwrap(), GetchunkOutcome::Cancelled);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(out.count(MessageType::Getchunk), 2);
    }
}

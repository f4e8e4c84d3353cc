//! RemovedWaiter: after a REMOVED leaves a chunk under-replicated, waits a
//! random delay and reports whether this peer should re-replicate it.

use std::sync::Arc;
use std::time::Duration;

use peabak_core::ChunkKey;

use crate::context::Context;
use crate::lifecycle::{random_between, Latch, Woke};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaiterOutcome {
    /// Still below the desired degree: start a Putchunker.
    Deficient,
    /// Someone else restored the degree meanwhile.
    Satisfied,
    /// A PUTCHUNK for the chunk was overheard.
    Cancelled,
}

#[derive(Clone)]
pub struct WaiterHandle {
    latch: Arc<Latch>,
}

impl WaiterHandle {
    pub fn cancel(&self) -> bool {
        self.latch.finish_and_wake()
    }
}

pub struct RemovedWaiter {
    ctx: Arc<Context>,
    key: ChunkKey,
    delay: Duration,
    latch: Arc<Latch>,
}

impl RemovedWaiter {
    pub fn new(ctx: Arc<Context>, key: ChunkKey) -> (Self, WaiterHandle) {
        let t = &ctx.timing;
        let delay = random_between(t.removed_delay_min, t.removed_delay_max);
        Self::with_delay(ctx, key, delay)
    }

    pub fn with_delay(ctx: Arc<Context>, key: ChunkKey, delay: Duration) -> (Self, WaiterHandle) {
        let latch = Arc::new(Latch::new());
        let handle = WaiterHandle {
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

    pub async fn run(self) -> WaiterOutcome {
        if self.latch.sleep(self.delay).await == Woke::Notified || !self.latch.try_finish() {
            tracing::debug!(key = %self.key, "PUTCHUNK overheard, not re-replicating");
            return WaiterOutcome::Cancelled;
        }
        if self.ctx.ledger.is_deficient(self.key) {
            WaiterOutcome::Deficient
        } else {
            WaiterOutcome::Satisfied
        }
    }
}

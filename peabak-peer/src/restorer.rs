//! Restorer: collects every chunk of one file from its Getchunkers, all or nothing.

use std::sync::Arc;

use peabak_core::{FileId, RestoreBuffer};
use tokio::sync::mpsc;

use crate::context::Context;
use crate::getchunker::{GetchunkOutcome, GetchunkerHandle};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// File handed to the sink.
    Restored { bytes: usize },
    /// These chunks could not be fetched; nothing was written.
    Failed { missing: Vec<u32> },
    /// All chunks arrived but the sink refused the file.
    WriteFailed,
}

/// Event a Getchunker reports when it ends: (chunk number, outcome).
pub type ChunkEvent = (u32, GetchunkOutcome);

pub struct Restorer {
    ctx: Arc<Context>,
    file_id: FileId,
    pathname: String,
    chunk_count: u32,
}

impl Restorer {
    pub fn new(ctx: Arc<Context>, file_id: FileId, pathname: String, chunk_count: u32) -> Self {
        Self {
            ctx,
            file_id,
            pathname,
            chunk_count,
        }
    }

    /// Drive the restore until every chunk has reported. The first failure
    /// cancels the remaining children; their reports are still awaited so
    /// that none of them outlives the restore.
    pub async fn run(
        self,
        children: Vec<GetchunkerHandle>,
        mut events: mpsc::UnboundedReceiver<ChunkEvent>,
    ) -> RestoreOutcome {
        let mut buffer = RestoreBuffer::new(self.file_id, self.chunk_count);
        let mut missing = Vec::new();
        let mut pending = self.chunk_count as usize;
        while pending > 0 {
            let Some((chunk_no, outcome)) = events.recv().await else {
                break;
            };
            pending -= 1;
            match outcome {
                GetchunkOutcome::Assigned(body) => {
                    if missing.is_empty() {
                        buffer.mark_received(chunk_no, body);
                    }
                }
                GetchunkOutcome::Failed => {
                    if missing.is_empty() {
                        let cancelled = children.iter().filter(|c| c.cancel()).count();
                        tracing::warn!(
                            file_id = %self.file_id,
                            chunk_no,
                            cancelled,
                            "chunk unavailable, abandoning restore"
                        );
                    }
                    missing.push(chunk_no);
                }
                GetchunkOutcome::Cancelled => {}
            }
        }

        if !missing.is_empty() {
            missing.sort_unstable();
            return RestoreOutcome::Failed { missing };
        }
        if !buffer.is_complete() {
            let got = buffer.received_count();
            tracing::warn!(file_id = %self.file_id, got, expected = self.chunk_count, "restore ended incomplete");
            return RestoreOutcome::Failed {
                missing: Vec::new(),
            };
        }
        let Some(bytes) = buffer.reassemble_into_bytes() else {
            return RestoreOutcome::Failed {
                missing: Vec::new(),
            };
        };
        if !self.ctx.sink.write_restored(&self.pathname, &bytes) {
            return RestoreOutcome::WriteFailed;
        }
        tracing::info!(file_id = %self.file_id, pathname = %self.pathname, bytes = bytes.len(), "file restored");
        RestoreOutcome::Restored { bytes: bytes.len() }
    }
}

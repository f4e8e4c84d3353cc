//! Everything a state machine needs, handed to each one at construction.

use std::sync::Arc;

use peabak_core::{ChunkStore, FileSink, Ledger, PeerId, Version};

use crate::config::Timing;
use crate::dispatch::Dispatcher;

pub struct Context {
    pub peer_id: PeerId,
    pub version: Version,
    pub ledger: Arc<Ledger>,
    pub store: Arc<dyn ChunkStore>,
    pub sink: Arc<dyn FileSink>,
    pub dispatcher: Dispatcher,
    pub timing: Timing,
}

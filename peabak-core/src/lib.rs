//! PeaBak protocol core.
//! No network I/O: wire codec, replication ledger, chunking and the storage
//! boundaries the peer daemon plugs its implementations into.

pub mod chunk;
pub mod ledger;
pub mod protocol;
pub mod store;
pub mod wire;

pub use chunk::{chunk_count, derive_file_id, split_into_chunks, RestoreBuffer, CHUNK_SIZE};
pub use ledger::{ChunkInfo, FileInfo, Ledger, LedgerSnapshot, Ownership};
pub use protocol::{
    ChunkKey, FileId, Message, MessageKind, MessageType, PeerId, Version, MAX_REPLICATION_DEGREE,
    PROTOCOL_VERSION,
};
pub use store::{ChunkStore, FileSink, MemoryChunkStore, MemoryFileSink};
pub use wire::{decode, encode, DecodeError, MAX_DATAGRAM_LEN};

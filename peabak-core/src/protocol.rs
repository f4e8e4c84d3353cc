//! PeaBak wire protocol: message kinds, identifiers and version.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::chunk::CHUNK_SIZE;

/// Protocol version spoken by this implementation.
pub const PROTOCOL_VERSION: Version = Version { major: 1, minor: 0 };

/// Highest replication degree expressible on the wire (single digit).
pub const MAX_REPLICATION_DEGREE: u8 = 9;

/// Peer identifier. Decimal on the wire.
pub type PeerId = u64;

/// File identifier: 32-byte digest, 64 hex chars on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileId([u8; 32]);

impl FileId {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        FileId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex rendering (always 64 chars).
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short prefix keeps log lines readable.
        write!(f, "FileId({}..)", &self.to_hex()[..12])
    }
}

impl FromStr for FileId {
    type Err = ParseFileIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.as_bytes();
        if raw.len() != 64 {
            return Err(ParseFileIdError::Length(raw.len()));
        }
        let mut out = [0u8; 32];
        for (i, pair) in raw.chunks(2).enumerate() {
            let hi = hex_value(pair[0]).ok_or(ParseFileIdError::NotHex)?;
            let lo = hex_value(pair[1]).ok_or(ParseFileIdError::NotHex)?;
            out[i] = (hi << 4) | lo;
        }
        Ok(FileId(out))
    }
}

fn hex_value(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseFileIdError {
    #[error("file id must be 64 hex chars, got {0}")]
    Length(usize),
    #[error("file id contains a non-hex character")]
    NotHex,
}

/// Identifies one chunk of one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkKey {
    pub file_id: FileId,
    pub chunk_no: u32,
}

impl ChunkKey {
    pub fn new(file_id: FileId, chunk_no: u32) -> Self {
        Self { file_id, chunk_no }
    }
}

impl fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.file_id, self.chunk_no)
    }
}

/// Protocol version, `major.minor`, one digit each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl Version {
    pub fn new(major: u8, minor: u8) -> Self {
        assert!(
            major <= 9 && minor <= 9,
            "version components must be single digits: {}.{}",
            major,
            minor
        );
        Self { major, minor }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for Version {
    type Err = ();

    /// Accepts exactly `d.d`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.as_bytes() {
            [maj, b'.', min] if maj.is_ascii_digit() && min.is_ascii_digit() => Ok(Version {
                major: maj - b'0',
                minor: min - b'0',
            }),
            _ => Err(()),
        }
    }
}

/// Message type tag as it appears first on the header line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Putchunk,
    Stored,
    Getchunk,
    Chunk,
    Delete,
    Deleted,
    Removed,
}

impl MessageType {
    pub const ALL: [MessageType; 7] = [
        MessageType::Putchunk,
        MessageType::Stored,
        MessageType::Getchunk,
        MessageType::Chunk,
        MessageType::Delete,
        MessageType::Deleted,
        MessageType::Removed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Putchunk => "PUTCHUNK",
            MessageType::Stored => "STORED",
            MessageType::Getchunk => "GETCHUNK",
            MessageType::Chunk => "CHUNK",
            MessageType::Delete => "DELETE",
            MessageType::Deleted => "DELETED",
            MessageType::Removed => "REMOVED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        MessageType::ALL.iter().copied().find(|t| t.as_str() == s)
    }

    /// Number of space-separated header fields, type included.
    pub fn arity(self) -> usize {
        match self {
            MessageType::Putchunk => 6,
            MessageType::Stored
            | MessageType::Getchunk
            | MessageType::Chunk
            | MessageType::Removed => 5,
            MessageType::Delete | MessageType::Deleted => 4,
        }
    }

    pub fn has_body(self) -> bool {
        matches!(self, MessageType::Putchunk | MessageType::Chunk)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind-specific part of a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    /// Ask peers to store a chunk at the given degree.
    Putchunk {
        chunk_no: u32,
        replication_degree: u8,
        body: Vec<u8>,
    },
    /// Announce that the sender now stores a chunk.
    Stored { chunk_no: u32 },
    /// Ask any holder for a chunk.
    Getchunk { chunk_no: u32 },
    /// Chunk payload in reply to GETCHUNK.
    Chunk { chunk_no: u32, body: Vec<u8> },
    /// Ask every peer to drop all chunks of a file.
    Delete,
    /// Acknowledgement of DELETE. Decoded, never sent by this implementation.
    Deleted,
    /// The sender evicted a chunk.
    Removed { chunk_no: u32 },
}

impl MessageKind {
    pub fn message_type(&self) -> MessageType {
        match self {
            MessageKind::Putchunk { .. } => MessageType::Putchunk,
            MessageKind::Stored { .. } => MessageType::Stored,
            MessageKind::Getchunk { .. } => MessageType::Getchunk,
            MessageKind::Chunk { .. } => MessageType::Chunk,
            MessageKind::Delete => MessageType::Delete,
            MessageKind::Deleted => MessageType::Deleted,
            MessageKind::Removed { .. } => MessageType::Removed,
        }
    }

    pub fn chunk_no(&self) -> Option<u32> {
        match self {
            MessageKind::Putchunk { chunk_no, .. }
            | MessageKind::Stored { chunk_no }
            | MessageKind::Getchunk { chunk_no }
            | MessageKind::Chunk { chunk_no, .. }
            | MessageKind::Removed { chunk_no } => Some(*chunk_no),
            MessageKind::Delete | MessageKind::Deleted => None,
        }
    }

    pub fn body(&self) -> Option<&[u8]> {
        match self {
            MessageKind::Putchunk { body, .. } | MessageKind::Chunk { body, .. } => Some(body),
            _ => None,
        }
    }
}

/// One protocol message. Construct through the kind-specific constructors,
/// which panic on arguments no valid message can carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub version: Version,
    pub sender_id: PeerId,
    pub file_id: FileId,
    pub kind: MessageKind,
    /// Header lines between the first line and the blank line, kept verbatim.
    pub extra_headers: Vec<String>,
    /// Source address, set by the receive loop only.
    pub origin: Option<SocketAddr>,
}

impl Message {
    fn build(version: Version, sender_id: PeerId, file_id: FileId, kind: MessageKind) -> Self {
        Self {
            version,
            sender_id,
            file_id,
            kind,
            extra_headers: Vec::new(),
            origin: None,
        }
    }

    pub fn putchunk(
        version: Version,
        sender_id: PeerId,
        key: ChunkKey,
        replication_degree: u8,
        body: Vec<u8>,
    ) -> Self {
        assert!(
            replication_degree <= MAX_REPLICATION_DEGREE,
            "replication degree {} is not a single digit",
            replication_degree
        );
        assert_body_len(&body);
        Self::build(
            version,
            sender_id,
            key.file_id,
            MessageKind::Putchunk {
                chunk_no: key.chunk_no,
                replication_degree,
                body,
            },
        )
    }

    pub fn stored(version: Version, sender_id: PeerId, key: ChunkKey) -> Self {
        Self::build(
            version,
            sender_id,
            key.file_id,
            MessageKind::Stored {
                chunk_no: key.chunk_no,
            },
        )
    }

    pub fn getchunk(version: Version, sender_id: PeerId, key: ChunkKey) -> Self {
        Self::build(
            version,
            sender_id,
            key.file_id,
            MessageKind::Getchunk {
                chunk_no: key.chunk_no,
            },
        )
    }

    pub fn chunk(version: Version, sender_id: PeerId, key: ChunkKey, body: Vec<u8>) -> Self {
        assert_body_len(&body);
        Self::build(
            version,
            sender_id,
            key.file_id,
            MessageKind::Chunk {
                chunk_no: key.chunk_no,
                body,
            },
        )
    }

    pub fn delete(version: Version, sender_id: PeerId, file_id: FileId) -> Self {
        Self::build(version, sender_id, file_id, MessageKind::Delete)
    }

    pub fn deleted(version: Version, sender_id: PeerId, file_id: FileId) -> Self {
        Self::build(version, sender_id, file_id, MessageKind::Deleted)
    }

    pub fn removed(version: Version, sender_id: PeerId, key: ChunkKey) -> Self {
        Self::build(
            version,
            sender_id,
            key.file_id,
            MessageKind::Removed {
                chunk_no: key.chunk_no,
            },
        )
    }

    /// Append an extra header line. Panics if the line would break framing.
    pub fn with_extra_header(mut self, line: impl Into<String>) -> Self {
        let line = line.into();
        assert!(
            line.is_ascii() && !line.is_empty() && !line.contains(['\r', '\n']),
            "extra header line must be non-empty single-line ASCII: {:?}",
            line
        );
        self.extra_headers.push(line);
        self
    }

    /// Attach the datagram source address (receive side).
    pub fn with_origin(mut self, origin: SocketAddr) -> Self {
        self.origin = Some(origin);
        self
    }

    pub fn message_type(&self) -> MessageType {
        self.kind.message_type()
    }

    /// Chunk this message is about, if the kind carries a chunk number.
    pub fn chunk_key(&self) -> Option<ChunkKey> {
        self.kind
            .chunk_no()
            .map(|chunk_no| ChunkKey::new(self.file_id, chunk_no))
    }
}

fn assert_body_len(body: &[u8]) {
    assert!(
        body.len() <= CHUNK_SIZE,
        "chunk body of {} bytes exceeds {} bytes",
        body.len(),
        CHUNK_SIZE
    );
}

//! Framing: ASCII header line(s), CRLF CRLF, then the raw body up to the end of the datagram.

use crate::chunk::CHUNK_SIZE;
use crate::protocol::{
    FileId, Message, MessageKind, MessageType, PeerId, Version, MAX_REPLICATION_DEGREE,
};

const CRLF: &[u8] = b"\r\n";
const SEPARATOR: &[u8] = b"\r\n\r\n";

/// Largest datagram the protocol produces or accepts: one full chunk plus header room.
pub const MAX_DATAGRAM_LEN: usize = 65_200;

/// Encode a message into one datagram payload. Panics on a message that
/// `decode` would reject; the constructors never build one.
pub fn encode(msg: &Message) -> Vec<u8> {
    assert_encodable(msg);
    let mut header = format!(
        "{} {} {} {}",
        msg.message_type(),
        msg.version,
        msg.sender_id,
        msg.file_id
    );
    match &msg.kind {
        MessageKind::Putchunk {
            chunk_no,
            replication_degree,
            ..
        } => {
            header.push_str(&format!(" {} {}", chunk_no, replication_degree));
        }
        MessageKind::Stored { chunk_no }
        | MessageKind::Getchunk { chunk_no }
        | MessageKind::Chunk { chunk_no, .. }
        | MessageKind::Removed { chunk_no } => {
            header.push_str(&format!(" {}", chunk_no));
        }
        MessageKind::Delete | MessageKind::Deleted => {}
    }
    let body = msg.kind.body().unwrap_or(&[]);
    let mut out = Vec::with_capacity(header.len() + SEPARATOR.len() + body.len() + 64);
    out.extend_from_slice(header.as_bytes());
    for line in &msg.extra_headers {
        out.extend_from_slice(CRLF);
        out.extend_from_slice(line.as_bytes());
    }
    out.extend_from_slice(SEPARATOR);
    out.extend_from_slice(body);
    out
}

fn assert_encodable(msg: &Message) {
    let Version { major, minor } = msg.version;
    assert!(
        major <= 9 && minor <= 9,
        "version components must be single digits: {}.{}",
        major,
        minor
    );
    if let MessageKind::Putchunk {
        replication_degree, ..
    } = msg.kind
    {
        assert!(
            replication_degree <= MAX_REPLICATION_DEGREE,
            "replication degree {} is not a single digit",
            replication_degree
        );
    }
    if let Some(body) = msg.kind.body() {
        assert!(
            body.len() <= CHUNK_SIZE,
            "chunk body of {} bytes exceeds {} bytes",
            body.len(),
            CHUNK_SIZE
        );
    }
    for line in &msg.extra_headers {
        assert!(
            line.is_ascii() && !line.is_empty() && !line.contains(['\r', '\n']),
            "extra header line must be non-empty single-line ASCII: {:?}",
            line
        );
    }
}

/// Decode one datagram. Either a fully valid message or an error; never partial.
pub fn decode(bytes: &[u8]) -> Result<Message, DecodeError> {
    let split = find_separator(bytes);
    let head_end = split.unwrap_or(bytes.len());
    let head = std::str::from_utf8(&bytes[..head_end])
        .ok()
        .filter(|s| s.is_ascii())
        .ok_or(DecodeError::NotAscii)?;

    let mut lines = head.split("\r\n");
    let first = lines.next().unwrap_or_default();
    let fields: Vec<&str> = first.split(' ').filter(|f| !f.is_empty()).collect();
    let type_field = fields.first().copied().unwrap_or_default();
    let msg_type =
        MessageType::parse(type_field).ok_or_else(|| DecodeError::UnknownType(type_field.into()))?;

    let Some(split) = split else {
        return Err(if msg_type.has_body() {
            DecodeError::MissingBody(msg_type)
        } else {
            DecodeError::MissingSeparator
        });
    };
    if fields.len() != msg_type.arity() {
        return Err(DecodeError::FieldCount {
            msg_type,
            expected: msg_type.arity(),
            got: fields.len(),
        });
    }

    let version: Version = fields[1]
        .parse()
        .map_err(|_| DecodeError::BadVersion(fields[1].into()))?;
    let sender_id = parse_sender(fields[2])?;
    let file_id: FileId = fields[3]
        .parse()
        .map_err(|_| DecodeError::BadFileId(fields[3].into()))?;

    let body = &bytes[split + SEPARATOR.len()..];
    if !msg_type.has_body() && !body.is_empty() {
        return Err(DecodeError::UnexpectedBody(msg_type));
    }

    if body.len() > CHUNK_SIZE {
        return Err(DecodeError::BodyTooLarge {
            msg_type,
            len: body.len(),
        });
    }
    let extra_headers: Vec<String> = lines.map(str::to_owned).collect();
    if let Some(line) = extra_headers.iter().find(|l| l.contains(['\r', '\n'])) {
        return Err(DecodeError::BadHeaderLine(line.clone()));
    }

    let kind = match msg_type {
        MessageType::Putchunk => MessageKind::Putchunk {
            chunk_no: parse_chunk_no(fields[4])?,
            replication_degree: parse_degree(fields[5])?,
            body: body.to_vec(),
        },
        MessageType::Chunk => MessageKind::Chunk {
            chunk_no: parse_chunk_no(fields[4])?,
            body: body.to_vec(),
        },
        MessageType::Stored => MessageKind::Stored {
            chunk_no: parse_chunk_no(fields[4])?,
        },
        MessageType::Getchunk => MessageKind::Getchunk {
            chunk_no: parse_chunk_no(fields[4])?,
        },
        MessageType::Removed => MessageKind::Removed {
            chunk_no: parse_chunk_no(fields[4])?,
        },
        MessageType::Delete => MessageKind::Delete,
        MessageType::Deleted => MessageKind::Deleted,
    };

    Ok(Message {
        version,
        sender_id,
        file_id,
        kind,
        extra_headers,
        origin: None,
    })
}

fn find_separator(bytes: &[u8]) -> Option<usize> {
    bytes
        .windows(SEPARATOR.len())
        .position(|w| w == SEPARATOR)
}

fn parse_sender(s: &str) -> Result<PeerId, DecodeError> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(DecodeError::BadSenderId(s.into()));
    }
    s.parse().map_err(|_| DecodeError::BadSenderId(s.into()))
}

fn parse_chunk_no(s: &str) -> Result<u32, DecodeError> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(DecodeError::BadChunkNo(s.into()));
    }
    s.parse().map_err(|_| DecodeError::BadChunkNo(s.into()))
}

fn parse_degree(s: &str) -> Result<u8, DecodeError> {
    match s.as_bytes() {
        [d] if d.is_ascii_digit() => Ok(d - b'0'),
        _ => Err(DecodeError::BadReplicationDegree(s.into())),
    }
}

/// Why a datagram is not a valid message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("header is not ASCII")]
    NotAscii,
    #[error("unknown message type {0:?}")]
    UnknownType(String),
    #[error("no CRLF CRLF header terminator")]
    MissingSeparator,
    #[error("{0} without a body")]
    MissingBody(MessageType),
    #[error("{msg_type} expects {expected} fields, got {got}")]
    FieldCount {
        msg_type: MessageType,
        expected: usize,
        got: usize,
    },
    #[error("bad version {0:?}")]
    BadVersion(String),
    #[error("bad sender id {0:?}")]
    BadSenderId(String),
    #[error("bad file id {0:?}")]
    BadFileId(String),
    #[error("bad chunk number {0:?}")]
    BadChunkNo(String),
    #[error("bad replication degree {0:?}")]
    BadReplicationDegree(String),
    #[error("{0} must not carry a body")]
    UnexpectedBody(MessageType),
    #[error("{msg_type} body of {len} bytes exceeds one chunk")]
    BodyTooLarge { msg_type: MessageType, len: usize },
    #[error("header line {0:?} contains a bare CR or LF")]
    BadHeaderLine(String),
}

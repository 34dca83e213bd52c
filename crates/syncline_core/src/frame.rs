//! On-wire message envelope.
//!
//! Every message travels as one binary frame inside a single WebSocket
//! binary message:
//!
//! ```text
//! [msg_type:    1 byte]
//! [doc_id_len:  2 bytes big-endian] [doc_id: UTF-8 bytes]
//! [payload_len: 4 bytes big-endian] [payload bytes]
//! ```
//!
//! Connection-global messages (`HELLO`) carry a zero-length doc id. Blob
//! messages carry the lowercase hex SHA-256 of the blob in the doc id field.
//! The codec does not interpret payloads.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SynclineError};

/// Reserved document id for the vault index.
pub const INDEX_DOC_ID: &str = "__index__";

/// Frame type tag, first byte of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MsgType {
    /// State vector announcement; opens a per-document subscription.
    SyncStep1 = 0,
    /// Diff reply to a `SyncStep1`; treated as `Update` when received by
    /// the relay.
    SyncStep2 = 1,
    /// Incremental CRDT update.
    Update = 2,
    /// Incremental CRDT update for the vault index document.
    IndexUpdate = 3,
    /// Upload blob bytes keyed by content hash.
    BlobPut = 4,
    /// Request blob bytes by content hash.
    BlobGet = 5,
    /// Blob bytes reply; empty payload means the hash is unknown.
    BlobData = 6,
    /// Connection greeting, exchanged once in each direction.
    Hello = 7,
    /// The relay compacted away history the peer's state vector requires.
    ErrHistoryLost = 8,
}

impl MsgType {
    fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(MsgType::SyncStep1),
            1 => Some(MsgType::SyncStep2),
            2 => Some(MsgType::Update),
            3 => Some(MsgType::IndexUpdate),
            4 => Some(MsgType::BlobPut),
            5 => Some(MsgType::BlobGet),
            6 => Some(MsgType::BlobData),
            7 => Some(MsgType::Hello),
            8 => Some(MsgType::ErrHistoryLost),
            _ => None,
        }
    }
}

/// A decoded wire frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub msg_type: MsgType,
    pub doc_id: String,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a frame addressed to a document.
    pub fn new(msg_type: MsgType, doc_id: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            doc_id: doc_id.into(),
            payload,
        }
    }

    /// Create a connection-global frame (zero-length doc id).
    pub fn global(msg_type: MsgType, payload: Vec<u8>) -> Self {
        Self::new(msg_type, String::new(), payload)
    }

    /// Encode the frame into wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let doc_id = self.doc_id.as_bytes();
        let mut buf = Vec::with_capacity(1 + 2 + doc_id.len() + 4 + self.payload.len());
        buf.push(self.msg_type as u8);
        buf.extend_from_slice(&(doc_id.len() as u16).to_be_bytes());
        buf.extend_from_slice(doc_id);
        buf.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decode a frame from wire bytes.
    ///
    /// Fails with [`SynclineError::MalformedFrame`] on truncated input, on a
    /// length field exceeding the buffer, on trailing bytes after the
    /// payload, on an unknown message type, and on a non-UTF-8 doc id.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut at = 0usize;

        let type_byte = *data
            .first()
            .ok_or_else(|| SynclineError::MalformedFrame("empty frame".into()))?;
        let msg_type = MsgType::from_u8(type_byte).ok_or_else(|| {
            SynclineError::MalformedFrame(format!("unknown message type {type_byte}"))
        })?;
        at += 1;

        let doc_id_len = read_u16(data, at)? as usize;
        at += 2;
        let doc_id_bytes = read_slice(data, at, doc_id_len, "doc_id")?;
        at += doc_id_len;
        let doc_id = std::str::from_utf8(doc_id_bytes)
            .map_err(|_| SynclineError::MalformedFrame("doc_id is not UTF-8".into()))?
            .to_string();

        let payload_len = read_u32(data, at)? as usize;
        at += 4;
        let payload = read_slice(data, at, payload_len, "payload")?.to_vec();
        at += payload_len;

        if at != data.len() {
            return Err(SynclineError::MalformedFrame(format!(
                "{} trailing bytes after payload",
                data.len() - at
            )));
        }

        Ok(Self {
            msg_type,
            doc_id,
            payload,
        })
    }
}

fn read_u16(data: &[u8], at: usize) -> Result<u16> {
    let bytes: [u8; 2] = data
        .get(at..at + 2)
        .ok_or_else(|| SynclineError::MalformedFrame("truncated doc_id length".into()))?
        .try_into()
        .expect("slice length checked");
    Ok(u16::from_be_bytes(bytes))
}

fn read_u32(data: &[u8], at: usize) -> Result<u32> {
    let bytes: [u8; 4] = data
        .get(at..at + 4)
        .ok_or_else(|| SynclineError::MalformedFrame("truncated payload length".into()))?
        .try_into()
        .expect("slice length checked");
    Ok(u32::from_be_bytes(bytes))
}

fn read_slice<'a>(data: &'a [u8], at: usize, len: usize, field: &str) -> Result<&'a [u8]> {
    data.get(at..at + len).ok_or_else(|| {
        SynclineError::MalformedFrame(format!("{field} length {len} exceeds frame"))
    })
}

/// Client half of the HELLO handshake (JSON payload).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientHello {
    /// Client-declared human name. Not authenticated.
    pub name: String,
}

/// Server half of the HELLO handshake (JSON payload).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerHello {
    pub banner: String,
    /// Server-assigned id for this connection, used for self-echo filtering.
    pub connection_id: String,
}

impl ClientHello {
    pub fn to_frame(&self) -> Result<Frame> {
        Ok(Frame::global(MsgType::Hello, serde_json::to_vec(self)?))
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}

impl ServerHello {
    pub fn to_frame(&self) -> Result<Frame> {
        Ok(Frame::global(MsgType::Hello, serde_json::to_vec(self)?))
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}

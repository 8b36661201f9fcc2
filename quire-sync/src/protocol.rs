//! Binary wire protocol between clients and the sync server.
//!
//! Every WebSocket binary frame carries exactly one bincode-encoded
//! message. Text frames are not part of the protocol.
//!
//! ```text
//! client                                   server
//!   │ ── connect ?token=… /docs/{uuid} ──►   │
//!   │ ◄───────────── Welcome ─────────────   │
//!   │ ◄──────── Diff (full state) ────────   │
//!   │ ◄─────────── Presence ──────────────   │
//!   │ ── Update ─────────────────────────►   │ ─► Diff to every other session
//!   │ ── SyncRequest{vector} ────────────►   │
//!   │ ◄──────── Diff (since vector) ──────   │
//!   │ ── Heartbeat ──────────────────────►   │
//!   │ ◄──────────── HeartbeatAck ─────────   │
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::auth::{Role, UserId};
use crate::crdt::{Diff, Update, VersionVector};
use crate::error::ErrorKind;
use crate::SessionId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Ask for whatever the server has beyond `vector`.
    SyncRequest { vector: VersionVector },
    Update(Update),
    Heartbeat,
    /// Ask the server to persist the document now.
    Flush,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerMessage {
    Welcome {
        session_id: SessionId,
        user_id: UserId,
        role: Role,
    },
    Diff {
        diff: Diff,
    },
    /// Everyone currently attached to the document, sorted.
    Presence {
        participants: Vec<UserId>,
    },
    Error {
        kind: ErrorKind,
        message: String,
    },
    HeartbeatAck,
    Flushed {
        durable: bool,
    },
}

#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("unexpected text frame")]
    TextFrame,
}

fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(msg, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (msg, read) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    if read != bytes.len() {
        return Err(ProtocolError::Deserialization(format!(
            "{} trailing bytes",
            bytes.len() - read
        )));
    }
    Ok(msg)
}

impl ClientMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

impl ServerMessage {
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            kind,
            message: message.into(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

//! Error taxonomy shared by the gateway, engine and persistence layers.
//!
//! Every variant maps to a wire-visible [`ErrorKind`] and tells the
//! gateway whether the connection survives it.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::auth::UserId;
use crate::crdt::{CrdtError, ReplicaId};
use crate::storage::StoreError;
use crate::DocumentId;

/// Close codes sent in the WebSocket close frame.
pub mod close {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const PROTOCOL: u16 = 1002;
    pub const INTERNAL: u16 = 1011;
    pub const UNAUTHORIZED: u16 = 4001;
    pub const FORBIDDEN: u16 = 4003;
    pub const NOT_FOUND: u16 = 4004;
    pub const TIMEOUT: u16 = 4008;
    pub const CAPACITY: u16 = 4029;
    pub const IDLE: u16 = 4010;
}

/// Wire-level classification of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Authentication,
    Authorization,
    Capacity,
    CausalGap,
    MalformedMessage,
    Persistence,
    ReadOnly,
    NotFound,
    Timeout,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Authentication => "unauthorized",
            ErrorKind::Authorization => "forbidden",
            ErrorKind::Capacity => "capacity",
            ErrorKind::CausalGap => "causal_gap",
            ErrorKind::MalformedMessage => "malformed_message",
            ErrorKind::Persistence => "persistence",
            ErrorKind::ReadOnly => "read_only",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Internal => "internal",
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("user {user} may not access document {document}")]
    Authorization { user: UserId, document: DocumentId },

    #[error("document {document} is full ({limit} sessions)")]
    Capacity { document: DocumentId, limit: usize },

    #[error("update {replica}:{seq} can never be applied: {reason}")]
    CausalGap {
        replica: ReplicaId,
        seq: u64,
        reason: String,
    },

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("persistence failure: {0}")]
    Persistence(#[from] StoreError),

    #[error("session is read-only")]
    ReadOnly,

    #[error("document {0} does not exist")]
    NotFound(DocumentId),

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("internal error: {0}")]
    Internal(String),
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Authentication(_) => ErrorKind::Authentication,
            SyncError::Authorization { .. } => ErrorKind::Authorization,
            SyncError::Capacity { .. } => ErrorKind::Capacity,
            SyncError::CausalGap { .. } => ErrorKind::CausalGap,
            SyncError::MalformedMessage(_) => ErrorKind::MalformedMessage,
            SyncError::Persistence(_) => ErrorKind::Persistence,
            SyncError::ReadOnly => ErrorKind::ReadOnly,
            SyncError::NotFound(_) => ErrorKind::NotFound,
            SyncError::Timeout(_) => ErrorKind::Timeout,
            SyncError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether the connection must be closed after reporting this error.
    pub fn is_fatal(&self) -> bool {
        self.close_code().is_some()
    }

    /// Close code for fatal errors; `None` for errors a session survives.
    pub fn close_code(&self) -> Option<u16> {
        match self {
            SyncError::Authentication(_) => Some(close::UNAUTHORIZED),
            SyncError::Authorization { .. } => Some(close::FORBIDDEN),
            SyncError::Capacity { .. } => Some(close::CAPACITY),
            SyncError::NotFound(_) => Some(close::NOT_FOUND),
            SyncError::Timeout(_) => Some(close::TIMEOUT),
            SyncError::Internal(_) => Some(close::INTERNAL),
            SyncError::CausalGap { .. }
            | SyncError::MalformedMessage(_)
            | SyncError::Persistence(_)
            | SyncError::ReadOnly => None,
        }
    }

    /// Reason text for the close frame. Never leaks internal detail.
    pub fn close_reason(&self) -> &'static str {
        self.kind().as_str()
    }
}

impl From<CrdtError> for SyncError {
    fn from(e: CrdtError) -> Self {
        SyncError::MalformedMessage(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_fatal_classification() {
        assert!(SyncError::Authentication("bad".into()).is_fatal());
        assert!(SyncError::Authorization {
            user: UserId::new("u"),
            document: Uuid::nil()
        }
        .is_fatal());
        assert!(!SyncError::MalformedMessage("x".into()).is_fatal());
        assert!(!SyncError::ReadOnly.is_fatal());
        assert!(!SyncError::CausalGap {
            replica: "r".into(),
            seq: 3,
            reason: "gone".into()
        }
        .is_fatal());
    }

    #[test]
    fn test_close_codes() {
        assert_eq!(
            SyncError::Authentication("x".into()).close_code(),
            Some(close::UNAUTHORIZED)
        );
        assert_eq!(SyncError::NotFound(Uuid::nil()).close_code(), Some(close::NOT_FOUND));
        assert_eq!(SyncError::Timeout("auth").close_reason(), "timeout");
    }

    #[test]
    fn test_crdt_errors_are_malformed() {
        let err: SyncError = CrdtError::EmptyInsert.into();
        assert_eq!(err.kind(), ErrorKind::MalformedMessage);
    }
}

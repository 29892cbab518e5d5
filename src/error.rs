//! Error types for materialize-txn.
//!
//! Every error carries enough phase context ("reading Load", "transactor.Store",
//! "commit failed") to reconstruct what the session was doing when it failed.
//! Nothing in this crate retries: callers reopen a fresh session.

use std::sync::Arc;

use thiserror::Error;

use crate::protocol::TupleError;
use crate::transport::Code;

/// Main error type for all session operations.
#[derive(Debug, Error)]
pub enum TxnError {
    /// I/O error on a byte-stream transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error while handling documents or connector state.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Frame received out of phase order, or a structurally invalid frame.
    #[error("protocol error ({0})")]
    Protocol(String),

    /// Well-formed frame violating a field-level invariant.
    #[error("validation failed: {path}: {message}")]
    Validation { path: String, message: String },

    /// A packed key or values tuple failed to decode.
    #[error("unpacking {what}: {source}")]
    Unpack {
        what: &'static str,
        #[source]
        source: TupleError,
    },

    /// Open or Opened failed validation before the session started.
    #[error("{what} is invalid: {source}")]
    Invalid {
        what: &'static str,
        #[source]
        source: Box<TxnError>,
    },

    /// A connector callback returned an error.
    #[error("transactor.{phase}: {source}")]
    Transactor {
        phase: &'static str,
        #[source]
        source: Box<TxnError>,
    },

    /// The commit future of a prior transaction resolved with an error.
    #[error("commit failed: {0}")]
    CommitFailed(#[source] Box<TxnError>),

    /// Receiving a frame of the given phase failed.
    #[error("reading {phase}: {source}")]
    Recv {
        phase: &'static str,
        #[source]
        source: Box<TxnError>,
    },

    /// Sending a frame of the given phase failed.
    #[error("sending {phase}: {source}")]
    Send {
        phase: &'static str,
        #[source]
        source: Box<TxnError>,
    },

    /// The governing context was cancelled.
    #[error("context canceled")]
    Cancelled,

    /// The governing context passed its deadline.
    #[error("context deadline exceeded")]
    DeadlineExceeded,

    /// Message carried by an internal or unknown status from the peer.
    #[error("{0}")]
    Remote(String),

    /// Any other transport status.
    #[error("transport error ({code:?}): {message}")]
    Transport { code: Code, message: String },

    /// The peer is no longer receiving.
    #[error("connection closed")]
    ConnectionClosed,

    /// End-of-stream where the protocol requires another frame.
    #[error("unexpected EOF")]
    UnexpectedEof,

    /// Error reported by a connector implementation.
    #[error("{0}")]
    Connector(String),

    /// One error observed by several waiters.
    #[error(transparent)]
    Shared(Arc<TxnError>),
}

impl TxnError {
    /// Build a protocol error naming what was expected and what arrived.
    pub fn unexpected(expected: &str, got: impl std::fmt::Debug) -> Self {
        TxnError::Protocol(format!("expected {}, got {:?}", expected, got))
    }

    /// Build a validation error for a field path.
    pub fn validation(path: impl Into<String>, message: impl Into<String>) -> Self {
        TxnError::Validation {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Build a connector-reported error from any message.
    pub fn connector(message: impl Into<String>) -> Self {
        TxnError::Connector(message.into())
    }

    pub(crate) fn recv(phase: &'static str, source: TxnError) -> Self {
        TxnError::Recv {
            phase,
            source: Box::new(source),
        }
    }

    pub(crate) fn send(phase: &'static str, source: TxnError) -> Self {
        TxnError::Send {
            phase,
            source: Box::new(source),
        }
    }

    pub(crate) fn transactor(phase: &'static str, source: TxnError) -> Self {
        TxnError::Transactor {
            phase,
            source: Box::new(source),
        }
    }

    /// Share this error so it can be handed to more than one waiter.
    pub fn into_shared(self) -> Arc<TxnError> {
        match self {
            TxnError::Shared(inner) => inner,
            other => Arc::new(other),
        }
    }

    /// The innermost error, looking through `Shared` wrappers.
    pub fn root(&self) -> &TxnError {
        match self {
            TxnError::Shared(inner) => inner.root(),
            other => other,
        }
    }

    /// Whether this error is (or wraps) a cancellation of the context.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), TxnError::Cancelled)
    }

    /// Whether this error reports a transport-level end of stream.
    pub fn is_closed(&self) -> bool {
        match self.root() {
            TxnError::ConnectionClosed => true,
            TxnError::Send { source, .. } => source.is_closed(),
            _ => false,
        }
    }
}

/// Result type alias using TxnError.
pub type Result<T> = std::result::Result<T, TxnError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_context_in_messages() {
        let err = TxnError::recv(
            "Loaded",
            TxnError::transactor("Load", TxnError::connector("mysterious load failure")),
        );
        assert_eq!(
            err.to_string(),
            "reading Loaded: transactor.Load: mysterious load failure"
        );

        let err = TxnError::recv(
            "Acknowledged",
            TxnError::CommitFailed(Box::new(TxnError::connector("boom"))),
        );
        assert_eq!(err.to_string(), "reading Acknowledged: commit failed: boom");
    }

    #[test]
    fn test_shared_is_transparent() {
        let shared = TxnError::Shared(TxnError::Cancelled.into_shared());
        assert_eq!(shared.to_string(), "context canceled");
        assert!(shared.is_cancelled());

        let again = shared.into_shared();
        assert!(matches!(*again, TxnError::Cancelled));
    }

    #[test]
    fn test_validation_names_path() {
        let err = TxnError::validation("load.items[2].key_packed", "expected non-empty");
        assert_eq!(
            err.to_string(),
            "validation failed: load.items[2].key_packed: expected non-empty"
        );
    }

    #[test]
    fn test_is_closed_looks_through_send() {
        let err = TxnError::send("Load", TxnError::ConnectionClosed);
        assert!(err.is_closed());
        assert!(!TxnError::Cancelled.is_closed());
    }
}

//! Error types shared across the core modules.

use thiserror::Error;

/// Errors raised by a peer connection or data channel implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The operation is not valid in the current signaling state.
    #[error("Invalid signaling state: {0}")]
    InvalidState(String),

    /// The peer connection has been closed.
    #[error("Peer connection closed")]
    Closed,

    /// The data channel is not open.
    #[error("Data channel not open: {0}")]
    ChannelNotOpen(String),

    /// The description or candidate was rejected by the backend.
    #[error("Rejected by transport: {0}")]
    Rejected(String),

    /// Backend-specific failure.
    #[error("Transport backend error: {0}")]
    Backend(String),
}

/// Errors raised when decoding control or data-channel payloads.
#[derive(Debug, Error)]
pub enum SignalError {
    /// Payload was not valid JSON.
    #[error("Invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    /// Payload was JSON but not an object (including the literal `null`).
    #[error("Payload is not a JSON object")]
    NotAnObject,

    /// Object carried neither a known tag.
    #[error("Payload carries no recognized field")]
    Untagged,

    /// Object carried more than one exclusive tag.
    #[error("Payload carries both `candidate` and `description`")]
    Ambiguous,

    /// A tagged field had the wrong shape.
    #[error("Malformed `{field}`: {reason}")]
    Malformed {
        /// Field that failed to decode.
        field: &'static str,
        /// Decoder message.
        reason: String,
    },
}

/// Errors raised while applying a patch to a document.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatchError {
    /// Patch path was empty.
    #[error("Patch path is empty")]
    EmptyPath,

    /// A path segment referenced a missing key or index.
    #[error("Path not found: {0}")]
    PathNotFound(String),

    /// A segment was applied to a value of the wrong type.
    #[error("Type mismatch at {0}")]
    TypeMismatch(String),

    /// `add` or `replace` without a value.
    #[error("Missing value for {op} at {path}")]
    MissingValue {
        /// Operation name.
        op: &'static str,
        /// Rendered path.
        path: String,
    },

    /// Batch reaches outside a single writer's entry.
    #[error("Patch outside the writer's own entry: {0}")]
    NotOwned(String),

    /// Patched document no longer matches the typed state model.
    #[error("Patched document is not a valid state: {0}")]
    InvalidDocument(String),
}

//! Protocol-level error types.

use thiserror::Error;

/// Errors from decoding or encoding protocol traffic.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A known `msg_type` arrived with content that doesn't match its schema.
    #[error("malformed '{msg_type}' content: {source}")]
    Malformed {
        msg_type: String,
        #[source]
        source: serde_json::Error,
    },

    /// A wire line was not a valid frame.
    #[error("invalid wire frame: {0}")]
    Frame(#[source] serde_json::Error),

    /// Serializing an outbound message failed.
    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),

    /// Connection-file or handshake I/O failed.
    #[error("protocol io: {0}")]
    Io(#[from] std::io::Error),
}

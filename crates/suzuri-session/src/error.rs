//! Error taxonomy for the session engine.
//!
//! Four failure classes cross component boundaries: launch failures (fatal
//! to that attempt, surfaced verbatim), execute preconditions (scoped to the
//! cell), transport failures (terminal for in-flight executions), and
//! unsupported lifecycle operations. A shutdown that times out is *not* an
//! error; it's a recorded [`ShutdownOutcome`](suzuri_types::ShutdownOutcome)
//! that always leads to forced cleanup.

use thiserror::Error;

use suzuri_protocol::ProtocolError;
use suzuri_types::{KernelRef, KernelStatus, TransportKind};

/// The process/session could not be created or never became ready.
///
/// Fatal to that launch attempt; reported upward, never retried
/// automatically.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("kernel spec has an empty argv")]
    EmptyArgv,

    #[error("protocol error during launch: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("compute server refused the session: {0}")]
    SessionRefused(String),

    #[error("no transport registered for kind '{0}'")]
    NoTransport(TransportKind),

    #[error("no kernel spec named '{0}'")]
    SpecNotFound(String),

    #[error("kernel handshake did not complete in time")]
    Handshake,
}

/// Mid-stream socket/process failure. Terminal for any in-flight execution;
/// the owning kernel transitions to an error status.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("channel closed")]
    Closed,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("transport io: {0}")]
    Io(#[from] std::io::Error),
}

/// Execution submission rejected or failed.
#[derive(Debug, Error)]
pub enum ExecuteError {
    /// The kernel cannot accept work in its current state. Nothing was sent
    /// on the wire; the cell is marked failed, no retry.
    #[error("kernel not connected (status: {status})")]
    KernelNotConnected { status: KernelStatus },

    #[error("unknown kernel {0}")]
    UnknownKernel(KernelRef),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Lifecycle operation failures (interrupt, restart, kill bookkeeping).
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("unknown kernel {0}")]
    UnknownKernel(KernelRef),

    /// The transport kind cannot support the requested operation; reported,
    /// no state change.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

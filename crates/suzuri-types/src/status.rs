//! Kernel and cell lifecycle status enums.
//!
//! `KernelStatus` is the per-kernel state machine the lifecycle manager
//! drives; `CellStatus` is the per-execution state a cell moves through.
//! Both serialize as snake_case strings for event payloads.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// How a kernel is reached: spawned subprocess or server-side session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TransportKind {
    /// Kernel runs as a locally spawned OS process.
    LocalProcess,
    /// Kernel runs behind a remote compute server session.
    RemoteSession,
}

impl TransportKind {
    /// Whether this transport participates in the document-close kill path.
    ///
    /// Transports that don't are skipped (with a diagnostic) by the
    /// multi-kernel shutdown orchestrator rather than blocking the close.
    pub fn supports_kill(&self) -> bool {
        match self {
            TransportKind::LocalProcess | TransportKind::RemoteSession => true,
        }
    }
}

/// Kernel lifecycle state.
///
/// ```text
/// not_connected → starting → idle ⇄ busy
///                    │          │
///                    │          ├── starting_interrupt → idle/busy
///                    │          └── shutting_down → terminated
///                    └──────────┴── process_exited / process_errored
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum KernelStatus {
    /// No transport yet; the slot exists but nothing was launched.
    NotConnected,
    /// Transport opened, waiting for the first successful handshake.
    Starting,
    /// Connected and ready for work.
    Idle,
    /// Connected and executing.
    Busy,
    /// An interrupt was requested; waiting for the kernel to settle.
    StartingInterrupt,
    /// Shutdown protocol in flight.
    ShuttingDown,
    /// The underlying process exited on its own.
    ProcessExited,
    /// The transport failed (spawn, socket, or protocol error).
    ProcessErrored,
    /// Shutdown finished; channel and process/session fully released.
    Terminated,
}

impl KernelStatus {
    /// Whether an execute submission may be sent in this state.
    pub fn can_execute(&self) -> bool {
        !matches!(
            self,
            KernelStatus::NotConnected | KernelStatus::Starting | KernelStatus::ShuttingDown
        ) && !self.is_terminal()
    }

    /// Terminal states: the kernel will never transition out of these.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            KernelStatus::ProcessExited | KernelStatus::ProcessErrored | KernelStatus::Terminated
        )
    }
}

/// Per-execution cell state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CellStatus {
    /// Submitted, not yet picked up by the kernel.
    Queued,
    /// The kernel is executing this cell.
    Busy,
    /// Execution finished (successfully or not).
    Idle,
}

/// What to do with accumulated cell outputs across a kernel restart.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputHandling {
    /// Clear every cell's outputs as part of the restart transition.
    Clear,
    /// Leave outputs in place.
    Keep,
}

/// Recorded outcome of one kernel's shutdown attempt.
///
/// Never surfaced as an error: whichever way the graceful phase resolves,
/// forced cleanup follows and `kill` reports success. The outcome is kept so
/// diagnostics can distinguish a graceful ack from a forced teardown.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ShutdownOutcome {
    /// The kernel acknowledged the shutdown request in time.
    Acked,
    /// No acknowledgement before the shutdown timeout; teardown was forced.
    TimedOut,
    /// The request itself failed; treated exactly like a timeout.
    Errored,
}

// ============================================================================
// Tests
// ============================================================================

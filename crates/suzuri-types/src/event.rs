//! Document-facing event types.
//!
//! [`CellEvent`] is what one execution's projected reply stream yields;
//! [`SessionEvent`] is the broadcast the document/UI layer subscribes to for
//! everything the session engine does. Both are plain data; consumers on
//! the other side of a broadcast channel get owned clones.

use serde::{Deserialize, Serialize};

use crate::ids::{CellId, DocumentId, KernelRef};
use crate::output::{MimeBundle, Output};
use crate::status::{CellStatus, KernelStatus, OutputHandling, ShutdownOutcome};

/// One rendered location of a display id: a cell and an index into its
/// output list. Every recorded location holds a display-data output.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DisplayLocation {
    pub cell: CellId,
    pub index: usize,
}

/// Comm sub-protocol traffic, routed by `comm_id` alongside execution replies.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CommEvent {
    Open {
        comm_id: String,
        target_name: String,
        data: serde_json::Value,
    },
    Msg {
        comm_id: String,
        data: serde_json::Value,
    },
    Close {
        comm_id: String,
        data: serde_json::Value,
    },
}

/// Events produced by projecting one execution's correlated reply stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum CellEvent {
    /// The cell moved through queued → busy → idle.
    Status(CellStatus),
    /// The kernel assigned an execution count to this submission.
    ExecutionCount(u32),
    /// An output was appended (or coalesced) at `index` in the cell's list.
    /// `output` is the full entry at that index after the append.
    Output { index: usize, output: Output },
    /// Accumulated outputs for the cell were discarded.
    Cleared,
    /// A previously rendered display was updated in place at every location.
    DisplayUpdated {
        display_id: String,
        locations: Vec<DisplayLocation>,
        data: MimeBundle,
        metadata: MimeBundle,
    },
    /// A paging payload: shown in a pager, not part of the output list.
    Page(MimeBundle),
    /// Comm traffic correlated to this execution.
    Comm(CommEvent),
    /// The transport failed mid-execution. Terminal: no further events.
    Failed(String),
}

impl CellEvent {
    /// Terminal events end the execution stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, CellEvent::Failed(_) | CellEvent::Status(CellStatus::Idle))
    }
}

/// Everything the session engine tells the document/UI layer.
///
/// Published on a `tokio::sync::broadcast`; subscribe through the session
/// handle. Cell-scoped variants are the per-execution [`CellEvent`]s fanned
/// out with their cell id attached.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum SessionEvent {
    /// A kernel's lifecycle status changed.
    KernelStatusChanged { kernel: KernelRef, status: KernelStatus },
    /// A launch attempt failed before the kernel became ready.
    KernelLaunchFailed { kernel: KernelRef, error: String },
    /// A kernel finished its shutdown protocol (always terminal).
    KernelKilled {
        kernel: KernelRef,
        outcome: ShutdownOutcome,
        restarting: bool,
    },
    /// An interrupt was delivered.
    KernelInterrupted { kernel: KernelRef },
    /// An interrupt could not be delivered.
    KernelInterruptFailed { kernel: KernelRef, error: String },
    /// A kernel is being restarted; `outputs` says whether accumulated cell
    /// outputs should be cleared as part of the same transition.
    KernelRestarted { kernel: KernelRef, outputs: OutputHandling },
    /// A diagnostic line from a local kernel's stdout/stderr side-channel.
    KernelDiagnostic { kernel: KernelRef, line: String },

    /// Per-execution event, tagged with the owning cell.
    Cell { cell: CellId, event: CellEvent },

    /// Every kernel owned by the document has resolved (or the aggregate
    /// timeout elapsed); the document may unload or reload now.
    DocumentReadyToClose { document: DocumentId, reloading: bool },
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_events() {
        assert!(CellEvent::Failed("gone".into()).is_terminal());
        assert!(CellEvent::Status(CellStatus::Idle).is_terminal());
        assert!(!CellEvent::Status(CellStatus::Busy).is_terminal());
        assert!(!CellEvent::Cleared.is_terminal());
    }

    #[test]
    fn test_session_event_roundtrip() {
        let event = SessionEvent::KernelKilled {
            kernel: KernelRef::new(),
            outcome: ShutdownOutcome::TimedOut,
            restarting: false,
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: SessionEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(event, back);
    }
}

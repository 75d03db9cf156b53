//! Shared identity, status, and output types for suzuri.
//!
//! This crate is the data-model foundation of the kernel session engine:
//! typed IDs, kernel/cell status enums, and the cell output model. It has
//! **no internal suzuri dependencies**: a pure leaf crate that the protocol
//! and session crates build on.
//!
//! # Entity-Relationship Overview
//!
//! ```text
//! Document (DocumentId)
//!     └── owns Kernel(s) (KernelRef) ← local process or remote session
//!     └── contains Cell(s) (CellId)
//!
//! Kernel (KernelRef)
//!     └── has a KernelStatus (not-connected → starting → idle ⇄ busy → ...)
//!     └── remote kernels hold a RemoteSessionId
//!
//! Cell (CellId)
//!     └── has a CellStatus (queued → busy → idle) per execution
//!     └── accumulates an ordered Output list (stream outputs coalesce)
//!     └── rich outputs may carry a display id for in-place updates
//! ```
//!
//! # Key Types
//!
//! | Type              | Purpose                                      |
//! |-------------------|----------------------------------------------|
//! | [`KernelRef`]     | Which kernel instance                        |
//! | [`CellId`]        | Which cell in a document                     |
//! | [`DocumentId`]    | Which document                               |
//! | [`RemoteSessionId`] | Server-side session of a remote kernel     |
//! | [`KernelStatus`]  | Kernel lifecycle state                       |
//! | [`CellStatus`]    | Per-execution cell state                     |
//! | [`Output`]        | Tagged cell output variant                   |
//! | [`CellEvent`]     | Per-execution event stream item              |
//! | [`SessionEvent`]  | Document-facing broadcast event              |

pub mod event;
pub mod ids;
pub mod output;
pub mod status;

// Re-export primary types at crate root for convenience.
pub use event::{CellEvent, CommEvent, DisplayLocation, SessionEvent};
pub use ids::{CellId, DocumentId, KernelRef, RemoteSessionId};
pub use output::{MimeBundle, Output, StreamName, push_coalesced};
pub use status::{CellStatus, KernelStatus, OutputHandling, ShutdownOutcome, TransportKind};

/// Current time as Unix milliseconds. Used by constructors throughout the crate.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

//! The suzuri session engine: kernel transports, lifecycle, and execution.
//!
//! Data flow, top to bottom:
//!
//! ```text
//!   SessionHandle ──commands──▶ KernelManager ──────▶ SessionEvent bus
//!        │                        │        │
//!        │                   ExecutionEngine   lifecycle (launch /
//!        │                        │             interrupt / restart /
//!        │                   CellEventStream    kill / close)
//!        │                        │                  │
//!        └── subscribe ◀── projector task      shutdown protocol
//!                                 │                  │
//!                          children_of (correlator by parent msg id)
//!                                 │
//!                              Channel ◀── LocalProcessTransport
//!                                      ◀── RemoteSessionTransport
//! ```
//!
//! A [`Channel`] is the transport-agnostic connection to one kernel. The
//! [`KernelManager`] owns every live [`Kernel`], supervises status, and
//! drives the launch/shutdown protocols. The [`ExecutionEngine`] turns an
//! execute submission into a [`CellEventStream`] of projected cell events.
//! [`spawn_session`] wraps the manager in an actor whose [`SessionHandle`]
//! is what the document layer holds.

pub mod close;
pub mod correlator;
pub mod display;
pub mod error;
pub mod execute;
pub mod handle;
pub mod lifecycle;
pub mod transport;

pub use close::{
    AlwaysClean, CLOSE_DOCUMENT_TIMEOUT, CloseOutcome, DocumentGate, close_document,
};
pub use correlator::{children_of, correlated_events};
pub use display::DisplayRegistry;
pub use error::{ExecuteError, LaunchError, LifecycleError, TransportError};
pub use execute::{CellEventStream, ExecutionEngine};
pub use handle::{HandleError, SessionCommand, SessionHandle, spawn_session};
pub use lifecycle::{Kernel, KernelManager, SHUTDOWN_TIMEOUT, STARTUP_TIMEOUT};
pub use transport::{
    Channel, KernelTransport, LocalProcessTransport, OpenedChannel, ProcessHandle,
    RemoteSessionTransport, TransportEvent,
};

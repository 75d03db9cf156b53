//! Kernel wire protocol for suzuri.
//!
//! Defines the duplex message protocol the session engine speaks with a
//! kernel, and the launch-time artifacts around it:
//!
//! - [`message`]: headers, parent-header correlation, and a *closed*
//!   [`MessageContent`] enum decoded from the `msg_type` string at the
//!   transport boundary. Unknown types decode to an explicit `Ignored`
//!   variant instead of being silently dropped.
//! - [`wire`]: channel-tagged newline-delimited JSON framing, plus the
//!   open-session handshake a remote compute server speaks before frames.
//! - [`connect`]: generated connection files: ephemeral socket ports and a
//!   key, written to disk for a spawned kernel to pick up.
//! - [`spec`]: kernel specs (argv templates) and the registry that resolves
//!   launch-by-name requests.
//!
//! The protocol is consumed, not owned, by this workspace: the session crate
//! never inspects `msg_type` strings itself; everything past the boundary
//! is an exhaustive match on [`MessageContent`].

pub mod connect;
pub mod error;
pub mod message;
pub mod spec;
pub mod wire;

pub use connect::ConnectionInfo;
pub use error::ProtocolError;
pub use message::{
    ClearOutputContent, CommClose, CommMsg, CommOpen, DisplayDataContent, ErrorContent,
    ExecuteInput, ExecuteReply, ExecuteRequest, ExecuteResultContent, ExecutionState, Header,
    KernelInfoReply, Message, MessageContent, Payload, RawMessage, ReplyStatus, ShutdownReply,
    ShutdownRequest, StatusContent, StreamContent, Transient, PROTOCOL_VERSION,
};
pub use spec::{InterruptMode, KernelSpec, KernelSpecRegistry};
pub use wire::{ChannelKind, SessionOp, WireFrame};

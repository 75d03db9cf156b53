//! Wire framing: channel-tagged, newline-delimited JSON.
//!
//! A kernel connection is several logical channels (shell for requests,
//! iopub for broadcasts, control for shutdown/interrupt). Each frame names
//! its channel so a single multiplexed socket (the remote-session case)
//! carries all of them; local transports dial one socket per channel and the
//! tag is self-describing redundancy.
//!
//! Remote compute servers additionally speak a one-line [`SessionOp`]
//! handshake before any frames flow.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use suzuri_types::RemoteSessionId;

use crate::error::ProtocolError;
use crate::message::{Message, RawMessage};

/// Logical channel a frame travels on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ChannelKind {
    /// Request/reply: execute, kernel_info.
    Shell,
    /// Broadcast: status, outputs, display updates.
    IoPub,
    /// Out-of-band: shutdown, interrupt.
    Control,
    /// Kernel-initiated input requests. Ports are allocated for it but this
    /// engine never dials it (stdin prompts are out of scope).
    Stdin,
}

/// One line on the wire: a channel tag plus an untyped message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WireFrame {
    pub channel: ChannelKind,
    pub message: RawMessage,
}

impl WireFrame {
    /// Frame a typed message for the given channel.
    pub fn new(channel: ChannelKind, message: &Message) -> Result<Self, ProtocolError> {
        Ok(Self { channel, message: message.to_raw()? })
    }

    /// Serialize to a single line (no trailing newline).
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    /// Parse one line into a frame.
    pub fn decode(line: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(line).map_err(ProtocolError::Frame)
    }

    /// Decode the carried message, consuming the frame.
    pub fn into_message(self) -> Result<(ChannelKind, Message), ProtocolError> {
        Ok((self.channel, Message::from_raw(self.message)?))
    }
}

/// Pre-frame handshake lines on a remote compute server socket.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SessionOp {
    /// Client → server: create a kernel session for the named spec.
    OpenSession { spec: String, cwd: String },
    /// Server → client: the session exists; frames may flow.
    SessionOpened { session_id: RemoteSessionId },
    /// Server → client: the session could not be created.
    SessionRefused { reason: String },
    /// Client → server: release the server-side session.
    CloseSession,
}

impl SessionOp {
    /// Serialize to a single line (no trailing newline).
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    /// Parse one handshake line.
    pub fn decode(line: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(line).map_err(ProtocolError::Frame)
    }
}

// ============================================================================
// Tests
// ============================================================================

//! Protocol messages: headers, correlation, and typed content.
//!
//! Every message carries a [`Header`] with a per-message unique `msg_id` and
//! the string `msg_type` that names its content schema. Replies carry the
//! originating request's header as `parent_header`; that single field is
//! the only correlation mechanism in the protocol, because `msg_id` is
//! unique per-message, not per-logical-operation.
//!
//! On the wire a message is an untyped [`RawMessage`]; [`Message::from_raw`]
//! decodes it into the closed [`MessageContent`] enum exactly once, at the
//! transport boundary. Unknown `msg_type`s become [`MessageContent::Ignored`].

use serde::{Deserialize, Serialize};

use suzuri_types::{now_millis, MimeBundle, StreamName};

use crate::error::ProtocolError;

/// Protocol version stamped into every header.
pub const PROTOCOL_VERSION: &str = "5.3";

// ============================================================================
// Header
// ============================================================================

/// Message identity: unique id, content type name, and owning session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Unique per-message id (UUIDv4 text). Unique per *message*; a logical
    /// operation (request + replies) is identified by the request's id.
    pub msg_id: String,
    /// Names the content schema, e.g. `execute_request`.
    pub msg_type: String,
    /// The client session this message belongs to.
    pub session: String,
    /// Unix milliseconds at creation.
    pub date: u64,
    /// Protocol version.
    pub version: String,
}

impl Header {
    /// Create a header with a fresh message id.
    pub fn new(msg_type: impl Into<String>, session: impl Into<String>) -> Self {
        Self {
            msg_id: uuid::Uuid::new_v4().to_string(),
            msg_type: msg_type.into(),
            session: session.into(),
            date: now_millis(),
            version: PROTOCOL_VERSION.to_string(),
        }
    }
}

// ============================================================================
// Content schemas
// ============================================================================

/// Request to execute source text.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub code: String,
    #[serde(default)]
    pub silent: bool,
    #[serde(default = "default_true")]
    pub store_history: bool,
    #[serde(default)]
    pub allow_stdin: bool,
    #[serde(default = "default_true")]
    pub stop_on_error: bool,
}

fn default_true() -> bool {
    true
}

/// Reply status for request/reply pairs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyStatus {
    Ok,
    Error,
    Aborted,
}

/// A reply payload entry. Paging payloads carry `source == "page"` and a
/// mime bundle to show in a pager, separate from cell outputs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub source: String,
    #[serde(default)]
    pub data: MimeBundle,
    #[serde(default)]
    pub start: Option<u32>,
}

/// Shell reply to an execute request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecuteReply {
    pub status: ReplyStatus,
    #[serde(default)]
    pub execution_count: Option<u32>,
    #[serde(default)]
    pub payload: Vec<Payload>,
}

/// Broadcast echo of the code the kernel started executing, with its count.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecuteInput {
    pub code: String,
    pub execution_count: u32,
}

/// Kernel-reported execution state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Starting,
    Busy,
    Idle,
}

/// Kernel status broadcast.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusContent {
    pub execution_state: ExecutionState,
}

/// A fragment of stdout/stderr text.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamContent {
    pub name: StreamName,
    pub text: String,
}

/// A rich, numbered execution result.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecuteResultContent {
    #[serde(default)]
    pub execution_count: Option<u32>,
    pub data: MimeBundle,
    #[serde(default)]
    pub metadata: MimeBundle,
}

/// Transient per-display fields; `display_id` addresses later updates.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Transient {
    #[serde(default)]
    pub display_id: Option<String>,
}

/// Rich display output. Also the schema of `update_display_data`, which
/// patches previously rendered outputs instead of appending.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DisplayDataContent {
    pub data: MimeBundle,
    #[serde(default)]
    pub metadata: MimeBundle,
    #[serde(default)]
    pub transient: Transient,
}

/// Execution error with traceback.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorContent {
    pub ename: String,
    pub evalue: String,
    #[serde(default)]
    pub traceback: Vec<String>,
}

/// Discard accumulated outputs. `wait` defers the clear until the next
/// output arrives, avoiding flicker in redraw loops.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearOutputContent {
    #[serde(default)]
    pub wait: bool,
}

/// Kernel identification; the reply doubles as the readiness handshake.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KernelInfoReply {
    pub protocol_version: String,
    #[serde(default)]
    pub implementation: String,
    #[serde(default)]
    pub banner: String,
}

/// Ask the kernel to shut down; `restart` is advisory.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownRequest {
    #[serde(default)]
    pub restart: bool,
}

/// Acknowledgement of a shutdown request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownReply {
    #[serde(default)]
    pub restart: bool,
}

/// Open a comm: a secondary bidirectional channel outside execution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommOpen {
    pub comm_id: String,
    pub target_name: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Traffic on an open comm.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommMsg {
    pub comm_id: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Close a comm.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommClose {
    pub comm_id: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

// ============================================================================
// MessageContent: the closed set of message types
// ============================================================================

/// Typed message content, decoded from `msg_type` at the transport boundary.
///
/// Exhaustive: consumers match on this enum and the compiler flags any
/// unhandled message type. `Ignored` is the explicit catch-all for types the
/// engine does not understand; they are logged, never silently dropped.
#[derive(Clone, Debug, PartialEq)]
pub enum MessageContent {
    ExecuteRequest(ExecuteRequest),
    ExecuteReply(ExecuteReply),
    ExecuteInput(ExecuteInput),
    Status(StatusContent),
    Stream(StreamContent),
    ExecuteResult(ExecuteResultContent),
    DisplayData(DisplayDataContent),
    UpdateDisplayData(DisplayDataContent),
    Error(ErrorContent),
    ClearOutput(ClearOutputContent),
    KernelInfoRequest,
    KernelInfoReply(KernelInfoReply),
    ShutdownRequest(ShutdownRequest),
    ShutdownReply(ShutdownReply),
    InterruptRequest,
    InterruptReply,
    CommOpen(CommOpen),
    CommMsg(CommMsg),
    CommClose(CommClose),
    /// A message type this engine does not understand.
    Ignored { msg_type: String },
}

impl MessageContent {
    /// The wire `msg_type` string for this content.
    pub fn msg_type(&self) -> &str {
        match self {
            MessageContent::ExecuteRequest(_) => "execute_request",
            MessageContent::ExecuteReply(_) => "execute_reply",
            MessageContent::ExecuteInput(_) => "execute_input",
            MessageContent::Status(_) => "status",
            MessageContent::Stream(_) => "stream",
            MessageContent::ExecuteResult(_) => "execute_result",
            MessageContent::DisplayData(_) => "display_data",
            MessageContent::UpdateDisplayData(_) => "update_display_data",
            MessageContent::Error(_) => "error",
            MessageContent::ClearOutput(_) => "clear_output",
            MessageContent::KernelInfoRequest => "kernel_info_request",
            MessageContent::KernelInfoReply(_) => "kernel_info_reply",
            MessageContent::ShutdownRequest(_) => "shutdown_request",
            MessageContent::ShutdownReply(_) => "shutdown_reply",
            MessageContent::InterruptRequest => "interrupt_request",
            MessageContent::InterruptReply => "interrupt_reply",
            MessageContent::CommOpen(_) => "comm_open",
            MessageContent::CommMsg(_) => "comm_msg",
            MessageContent::CommClose(_) => "comm_close",
            MessageContent::Ignored { msg_type } => msg_type,
        }
    }

    fn from_value(msg_type: &str, content: serde_json::Value) -> Result<Self, ProtocolError> {
        fn parse<T: serde::de::DeserializeOwned>(
            msg_type: &str,
            content: serde_json::Value,
        ) -> Result<T, ProtocolError> {
            serde_json::from_value(content).map_err(|source| ProtocolError::Malformed {
                msg_type: msg_type.to_string(),
                source,
            })
        }

        Ok(match msg_type {
            "execute_request" => MessageContent::ExecuteRequest(parse(msg_type, content)?),
            "execute_reply" => MessageContent::ExecuteReply(parse(msg_type, content)?),
            "execute_input" => MessageContent::ExecuteInput(parse(msg_type, content)?),
            "status" => MessageContent::Status(parse(msg_type, content)?),
            "stream" => MessageContent::Stream(parse(msg_type, content)?),
            "execute_result" => MessageContent::ExecuteResult(parse(msg_type, content)?),
            "display_data" => MessageContent::DisplayData(parse(msg_type, content)?),
            "update_display_data" => MessageContent::UpdateDisplayData(parse(msg_type, content)?),
            "error" => MessageContent::Error(parse(msg_type, content)?),
            "clear_output" => MessageContent::ClearOutput(parse(msg_type, content)?),
            "kernel_info_request" => MessageContent::KernelInfoRequest,
            "kernel_info_reply" => MessageContent::KernelInfoReply(parse(msg_type, content)?),
            "shutdown_request" => MessageContent::ShutdownRequest(parse(msg_type, content)?),
            "shutdown_reply" => MessageContent::ShutdownReply(parse(msg_type, content)?),
            "interrupt_request" => MessageContent::InterruptRequest,
            "interrupt_reply" => MessageContent::InterruptReply,
            "comm_open" => MessageContent::CommOpen(parse(msg_type, content)?),
            "comm_msg" => MessageContent::CommMsg(parse(msg_type, content)?),
            "comm_close" => MessageContent::CommClose(parse(msg_type, content)?),
            other => MessageContent::Ignored { msg_type: other.to_string() },
        })
    }

    fn to_value(&self) -> Result<serde_json::Value, ProtocolError> {
        let value = match self {
            MessageContent::ExecuteRequest(c) => serde_json::to_value(c),
            MessageContent::ExecuteReply(c) => serde_json::to_value(c),
            MessageContent::ExecuteInput(c) => serde_json::to_value(c),
            MessageContent::Status(c) => serde_json::to_value(c),
            MessageContent::Stream(c) => serde_json::to_value(c),
            MessageContent::ExecuteResult(c) => serde_json::to_value(c),
            MessageContent::DisplayData(c) | MessageContent::UpdateDisplayData(c) => {
                serde_json::to_value(c)
            }
            MessageContent::Error(c) => serde_json::to_value(c),
            MessageContent::ClearOutput(c) => serde_json::to_value(c),
            MessageContent::KernelInfoReply(c) => serde_json::to_value(c),
            MessageContent::ShutdownRequest(c) => serde_json::to_value(c),
            MessageContent::ShutdownReply(c) => serde_json::to_value(c),
            MessageContent::CommOpen(c) => serde_json::to_value(c),
            MessageContent::CommMsg(c) => serde_json::to_value(c),
            MessageContent::CommClose(c) => serde_json::to_value(c),
            MessageContent::KernelInfoRequest
            | MessageContent::InterruptRequest
            | MessageContent::InterruptReply
            | MessageContent::Ignored { .. } => Ok(serde_json::Value::Object(Default::default())),
        };
        value.map_err(ProtocolError::Encode)
    }
}

// ============================================================================
// Message
// ============================================================================

/// Untyped wire form of a message. Content stays a raw JSON value until the
/// transport boundary decodes it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RawMessage {
    pub header: Header,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_header: Option<Header>,
    #[serde(default)]
    pub content: serde_json::Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub buffers: Vec<Vec<u8>>,
}

/// A decoded protocol message.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub header: Header,
    pub parent_header: Option<Header>,
    pub content: MessageContent,
    pub buffers: Vec<Vec<u8>>,
}

impl Message {
    /// Create a fresh (non-reply) message for the given session.
    pub fn new(session: impl Into<String>, content: MessageContent) -> Self {
        let header = Header::new(content.msg_type().to_string(), session);
        Self { header, parent_header: None, content, buffers: Vec::new() }
    }

    /// Create a reply/child of `parent`, carrying its header for correlation.
    pub fn child_of(parent: &Message, content: MessageContent) -> Self {
        let header = Header::new(content.msg_type().to_string(), parent.header.session.clone());
        Self {
            header,
            parent_header: Some(parent.header.clone()),
            content,
            buffers: Vec::new(),
        }
    }

    /// The `msg_id` of the request this message replies to, if any.
    pub fn parent_msg_id(&self) -> Option<&str> {
        self.parent_header.as_ref().map(|h| h.msg_id.as_str())
    }

    /// Whether this message is a child of the request with the given id.
    pub fn is_child_of(&self, parent_msg_id: &str) -> bool {
        self.parent_msg_id() == Some(parent_msg_id)
    }

    /// Decode a wire message. Unknown `msg_type`s yield `Ignored` content;
    /// known types with mismatched content fail with `Malformed`.
    pub fn from_raw(raw: RawMessage) -> Result<Self, ProtocolError> {
        let content = MessageContent::from_value(&raw.header.msg_type, raw.content)?;
        Ok(Self {
            header: raw.header,
            parent_header: raw.parent_header,
            content,
            buffers: raw.buffers,
        })
    }

    /// Encode back to the wire form.
    pub fn to_raw(&self) -> Result<RawMessage, ProtocolError> {
        Ok(RawMessage {
            header: self.header.clone(),
            parent_header: self.parent_header.clone(),
            content: self.content.to_value()?,
            buffers: self.buffers.clone(),
        })
    }

    // ── Request constructors ─────────────────────────────────────────────

    /// Build an execute request for the given source text.
    pub fn execute_request(session: impl Into<String>, code: impl Into<String>) -> Self {
        Self::new(
            session,
            MessageContent::ExecuteRequest(ExecuteRequest {
                code: code.into(),
                silent: false,
                store_history: true,
                allow_stdin: false,
                stop_on_error: true,
            }),
        )
    }

    /// Build a kernel-info request (the readiness handshake).
    pub fn kernel_info_request(session: impl Into<String>) -> Self {
        Self::new(session, MessageContent::KernelInfoRequest)
    }

    /// Build a shutdown request.
    pub fn shutdown_request(session: impl Into<String>, restart: bool) -> Self {
        Self::new(session, MessageContent::ShutdownRequest(ShutdownRequest { restart }))
    }

    /// Build an interrupt request (remote-session transports only; local
    /// processes are interrupted with a signal instead).
    pub fn interrupt_request(session: impl Into<String>) -> Self {
        Self::new(session, MessageContent::InterruptRequest)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execute_request_roundtrip() {
        let msg = Message::execute_request("sess-1", "print(1)");
        assert_eq!(msg.header.msg_type, "execute_request");

        let raw = msg.to_raw().unwrap();
        let line = serde_json::to_string(&raw).unwrap();
        let raw_back: RawMessage = serde_json::from_str(&line).unwrap();
        let back = Message::from_raw(raw_back).unwrap();

        assert_eq!(back.header.msg_id, msg.header.msg_id);
        match back.content {
            MessageContent::ExecuteRequest(req) => {
                assert_eq!(req.code, "print(1)");
                assert!(req.store_history);
                assert!(!req.allow_stdin);
            }
            other => panic!("unexpected content: {other:?}"),
        }
    }

    #[test]
    fn test_child_correlates_to_parent() {
        let request = Message::execute_request("sess", "1 + 1");
        let reply = Message::child_of(
            &request,
            MessageContent::Status(StatusContent { execution_state: ExecutionState::Busy }),
        );
        assert!(reply.is_child_of(&request.header.msg_id));
        assert_ne!(reply.header.msg_id, request.header.msg_id);
        assert_eq!(reply.header.session, request.header.session);
    }

    #[test]
    fn test_unknown_msg_type_becomes_ignored() {
        let raw = RawMessage {
            header: Header::new("comm_info_reply", "sess"),
            parent_header: None,
            content: serde_json::json!({"comms": {}}),
            buffers: Vec::new(),
        };
        let msg = Message::from_raw(raw).unwrap();
        assert_eq!(
            msg.content,
            MessageContent::Ignored { msg_type: "comm_info_reply".to_string() }
        );
    }

    #[test]
    fn test_malformed_known_type_is_an_error() {
        let raw = RawMessage {
            header: Header::new("stream", "sess"),
            parent_header: None,
            content: serde_json::json!({"name": "not_a_stream", "text": "x"}),
            buffers: Vec::new(),
        };
        let err = Message::from_raw(raw).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed { .. }));
    }

    #[test]
    fn test_page_payload_shape() {
        let json = serde_json::json!({
            "status": "ok",
            "execution_count": 3,
            "payload": [{"source": "page", "data": {"text/plain": "help text"}}],
        });
        let reply: ExecuteReply = serde_json::from_value(json).unwrap();
        assert_eq!(reply.status, ReplyStatus::Ok);
        assert_eq!(reply.payload.len(), 1);
        assert_eq!(reply.payload[0].source, "page");
    }

    #[test]
    fn test_msg_type_matches_constructor() {
        assert_eq!(
            Message::shutdown_request("s", true).header.msg_type,
            "shutdown_request"
        );
        assert_eq!(
            Message::interrupt_request("s").header.msg_type,
            "interrupt_request"
        );
    }
}

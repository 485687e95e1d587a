//! Daemon WebSocket/RPC protocol definitions.
//!
//! Protocol version 1. All communication uses JSON text frames over
//! WebSocket; every frame is an object with a mandatory `op` field.
//!
//! Per-request ordering: one `ack`, then zero-or-more `progress`, then
//! exactly one of `result` | `error`.

use serde::{Deserialize, Serialize};

// ── Constants ────────────────────────────────────────────────────────────────

pub const PROTOCOL_VERSION: u32 = 1;
/// Inbound frame cap; overridable via `MAX_FRAME_BYTES`.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 32 * 1024 * 1024; // 32 MiB
pub const HANDSHAKE_TIMEOUT_MS: u64 = 10_000; // 10s
/// An `ack` must be on the wire within this budget after `call_tool` is accepted.
pub const ACK_DEADLINE_MS: u64 = 100;
/// Bounded per-connection buffer of undelivered progress frames.
pub const PROGRESS_BUFFER_FRAMES: usize = 256;
/// How long a tool gets to observe cancellation before its worker is detached.
pub const CANCEL_GRACE_MS: u64 = 5_000;

// ── Error taxonomy ───────────────────────────────────────────────────────────

/// Error kinds surfaced in `error` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    InvalidRequest,
    Unauthenticated,
    UnknownTool,
    UnknownOp,
    ContinuationNotFound,
    Overloaded,
    /// The session's semaphore is exhausted and its wait queue is full.
    SessionOverloaded,
    TimedOut,
    Cancelled,
    ProviderRateLimited,
    ProviderAuth,
    ProviderFatal,
    RepositoryUnavailable,
    Internal,
}

impl ErrorKind {
    /// Whether a client may retry the same call and reasonably expect success.
    #[must_use]
    pub fn retryable(self) -> bool {
        matches!(
            self,
            Self::Overloaded | Self::SessionOverloaded | Self::TimedOut | Self::ProviderRateLimited
        )
    }

    /// Whether the daemon closes the connection after sending this error.
    #[must_use]
    pub fn closes_connection(self) -> bool {
        matches!(self, Self::Unauthenticated)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Error payload carried by `error` frames and returned by tool execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorShape {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ErrorShape {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: kind.retryable(),
            details: None,
        }
    }

    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

// ── Frame payloads ───────────────────────────────────────────────────────────

/// Client identification sent in `hello`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Timeout hierarchy advertised to clients so external shims can size their
/// own budgets (`shim = tool × shim_multiplier`).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimeoutCaps {
    pub tool_default_s: f64,
    pub daemon_multiplier: f64,
    pub shim_multiplier: f64,
}

/// Server capabilities sent in `hello_ack`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerCaps {
    pub version: String,
    pub protocol: u32,
    pub tools: Vec<String>,
    pub models: Vec<String>,
    pub timeouts: TimeoutCaps,
    pub max_frame_bytes: usize,
}

/// Listing visibility of a tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolVisibility {
    Public,
    Hidden,
}

/// Catalog entry returned by `list_tools`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub schema: serde_json::Value,
    pub visibility: ToolVisibility,
}

/// Capabilities snapshot entry returned by `list_models`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub provider: String,
    pub model: String,
    pub context_window: u32,
    pub supports_images: bool,
    pub supports_files: bool,
    pub supports_websearch: bool,
    pub supports_streaming: bool,
}

/// Severity of a `progress` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressLevel {
    Debug,
    Info,
    Warn,
}

/// Token/latency accounting attached to a `result` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageInfo {
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub duration_ms: u64,
    pub provider: String,
    pub model: String,
}

// ── Frames ───────────────────────────────────────────────────────────────────

/// Every wire frame, discriminated by `op`. Unknown fields inside a known
/// frame are ignored; unknown ops are reported separately by [`parse_frame`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Frame {
    Hello {
        token: String,
        client: ClientInfo,
    },
    HelloAck {
        session_id: uuid::Uuid,
        server: ServerCaps,
    },
    HelloNak {
        reason: String,
    },
    ListTools {},
    Tools {
        items: Vec<ToolDescriptor>,
    },
    ListModels {},
    Models {
        items: Vec<ModelInfo>,
    },
    CallTool {
        request_id: String,
        tool: String,
        #[serde(default)]
        arguments: serde_json::Map<String, serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        continuation_id: Option<String>,
        /// Client-supplied deadline in seconds.
        #[serde(skip_serializing_if = "Option::is_none")]
        timeout: Option<f64>,
    },
    Ack {
        request_id: String,
    },
    Progress {
        request_id: String,
        level: ProgressLevel,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        fields: Option<serde_json::Value>,
    },
    Result {
        request_id: String,
        value: serde_json::Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<UsageInfo>,
        #[serde(skip_serializing_if = "Option::is_none")]
        continuation_id: Option<uuid::Uuid>,
    },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        kind: ErrorKind,
        message: String,
        retryable: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<serde_json::Value>,
    },
    Cancel {
        request_id: String,
    },
    Ping {},
    Pong {
        server_time_ms: u64,
    },
}

impl Frame {
    pub fn error(request_id: Option<String>, shape: ErrorShape) -> Self {
        Self::Error {
            request_id,
            kind: shape.kind,
            message: shape.message,
            retryable: shape.retryable,
            details: shape.details,
        }
    }

    /// Serialize for the wire. Frames are plain data; serialization cannot
    /// fail for any value this crate constructs.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"op":"error","kind":"Internal","message":"frame serialization failed","retryable":false}"#
                .to_string()
        })
    }
}

// ── Parsing ──────────────────────────────────────────────────────────────────

/// Why an inbound text frame could not become a [`Frame`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameParseError {
    /// Not JSON, not an object, or a known op with malformed fields.
    Invalid(String),
    /// Valid object with an `op` this daemon does not implement.
    UnknownOp(String),
}

impl FrameParseError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Invalid(_) => ErrorKind::InvalidRequest,
            Self::UnknownOp(_) => ErrorKind::UnknownOp,
        }
    }
}

impl std::fmt::Display for FrameParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Invalid(msg) => write!(f, "invalid frame: {msg}"),
            Self::UnknownOp(op) => write!(f, "unknown op: {op}"),
        }
    }
}

#[derive(Deserialize)]
struct RawOp {
    op: String,
}

/// Parse an inbound text frame, distinguishing malformed JSON from a
/// well-formed frame with an unrecognized `op`.
pub fn parse_frame(text: &str) -> Result<Frame, FrameParseError> {
    let raw: RawOp = serde_json::from_str(text)
        .map_err(|e| FrameParseError::Invalid(format!("not a frame object: {e}")))?;

    match serde_json::from_str::<Frame>(text) {
        Ok(frame) => Ok(frame),
        Err(e) => {
            if e.to_string().contains("unknown variant") {
                Err(FrameParseError::UnknownOp(raw.op))
            } else {
                Err(FrameParseError::Invalid(e.to_string()))
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_tool_parses_with_defaults() {
        let frame = parse_frame(r#"{"op":"call_tool","request_id":"r1","tool":"chat"}"#).unwrap();
        match frame {
            Frame::CallTool {
                request_id,
                tool,
                arguments,
                continuation_id,
                timeout,
            } => {
                assert_eq!(request_id, "r1");
                assert_eq!(tool, "chat");
                assert!(arguments.is_empty());
                assert!(continuation_id.is_none());
                assert!(timeout.is_none());
            },
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let frame = parse_frame(r#"{"op":"ping","whatever":42}"#).unwrap();
        assert!(matches!(frame, Frame::Ping {}));
    }

    #[test]
    fn unknown_op_is_distinguished_from_garbage() {
        match parse_frame(r#"{"op":"frobnicate"}"#) {
            Err(FrameParseError::UnknownOp(op)) => assert_eq!(op, "frobnicate"),
            other => panic!("expected UnknownOp, got {other:?}"),
        }
        assert!(matches!(
            parse_frame("not json at all"),
            Err(FrameParseError::Invalid(_))
        ));
    }

    #[test]
    fn error_frame_round_trips_kind() {
        let shape = ErrorShape::new(ErrorKind::Overloaded, "try later");
        let json = Frame::error(Some("r9".into()), shape).to_json();
        let back = parse_frame(&json).unwrap();
        match back {
            Frame::Error {
                kind, retryable, ..
            } => {
                assert_eq!(kind, ErrorKind::Overloaded);
                assert!(retryable);
            },
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn retryability_follows_taxonomy() {
        assert!(ErrorKind::Overloaded.retryable());
        assert!(ErrorKind::SessionOverloaded.retryable());
        assert!(ErrorKind::ProviderRateLimited.retryable());
        assert!(!ErrorKind::InvalidRequest.retryable());
        assert!(!ErrorKind::Cancelled.retryable());
        assert!(ErrorKind::Unauthenticated.closes_connection());
        assert!(!ErrorKind::TimedOut.closes_connection());
    }
}

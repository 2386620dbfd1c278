use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use hotline_tree::{RenderTree, TreeDelta};

/// Protocol version this server speaks. Clients whose major differs are
/// rejected during the handshake.
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Envelope common to every wire message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolMessage {
    pub session_id: String,
    pub protocol_version: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub body: MessageBody,
}

impl ProtocolMessage {
    /// Build a server-originated message stamped with the server's protocol
    /// version and the current time.
    pub fn new(session_id: impl Into<String>, body: MessageBody) -> Self {
        Self {
            session_id: session_id.into(),
            protocol_version: PROTOCOL_VERSION.to_string(),
            timestamp: Utc::now(),
            body,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum MessageBody {
    /// Client → server handshake request.
    Connect(ConnectPayload),
    /// Server → client handshake acceptance.
    Connected(ConnectedPayload),
    /// Server → client render-tree update.
    Update(UpdatePayload),
    /// Client → server liveness signal.
    Ping(PingPayload),
    /// Server → client liveness reply.
    Pong(PongPayload),
    /// Client → server update application report.
    Ack(AckPayload),
    /// Server → client failure report.
    Error(ErrorPayload),
    /// Client → server log line, forwarded to the host's output.
    Log(LogPayload),
}

impl MessageBody {
    /// Wire tag of this message, matching the serialized `type` field.
    pub fn kind(&self) -> &'static str {
        match self {
            MessageBody::Connect(_) => "connect",
            MessageBody::Connected(_) => "connected",
            MessageBody::Update(_) => "update",
            MessageBody::Ping(_) => "ping",
            MessageBody::Pong(_) => "pong",
            MessageBody::Ack(_) => "ack",
            MessageBody::Error(_) => "error",
            MessageBody::Log(_) => "log",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectPayload {
    pub device_id: String,
    pub platform: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    pub client_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedPayload {
    pub connection_id: String,
    /// Present when the session already has a pushed tree, so the device can
    /// render without waiting for the next update.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_tree: Option<RenderTree>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    Full,
    Incremental,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePayload {
    pub update_type: UpdateKind,
    pub sequence_number: u64,
    /// Whether the receiver should keep local component state across the
    /// update.
    pub preserve_state: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tree: Option<RenderTree>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<TreeDelta>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PingPayload {}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PongPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckPayload {
    pub sequence_number: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apply_time_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Warning,
    Error,
    Fatal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    pub severity: ErrorSeverity,
    pub recoverable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorPayload {
    pub fn new(
        code: impl Into<String>,
        message: impl Into<String>,
        severity: ErrorSeverity,
        recoverable: bool,
    ) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            severity,
            recoverable,
            details: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogPayload {
    pub message: String,
    pub level: LogLevel,
}

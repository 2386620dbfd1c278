use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a transport was closed. One code per cause so client implementations
/// can branch on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// The connection request carried no session id.
    SessionIdRequired,
    /// The session id resolved to no live session.
    SessionNotFound,
    /// The session's expiry passed before the handshake completed.
    SessionExpired,
    /// The client's protocol major version differs from the server's.
    UnsupportedVersion,
    /// A non-connect message arrived before the handshake.
    NotAuthenticated,
    /// A message's session id did not match the connection's session.
    SessionMismatch,
    /// A frame could not be decoded or the message type was not valid from
    /// a client.
    ProtocolError,
    /// The owning session was deleted.
    SessionClosed,
    /// The device missed its heartbeat window.
    ConnectionTimeout,
}

impl CloseReason {
    /// Stable machine-readable code carried on the transport close.
    pub const fn as_code(self) -> &'static str {
        match self {
            CloseReason::SessionIdRequired => "session_id_required",
            CloseReason::SessionNotFound => "session_not_found",
            CloseReason::SessionExpired => "session_expired",
            CloseReason::UnsupportedVersion => "unsupported_version",
            CloseReason::NotAuthenticated => "not_authenticated",
            CloseReason::SessionMismatch => "session_mismatch",
            CloseReason::ProtocolError => "protocol_error",
            CloseReason::SessionClosed => "session_closed",
            CloseReason::ConnectionTimeout => "connection_timeout",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_code())
    }
}

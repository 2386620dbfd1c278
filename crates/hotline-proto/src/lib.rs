//! Wire protocol for live-update sessions.
//!
//! Keeping the message model in a dedicated crate lets client bindings be
//! regenerated without pulling in the engine runtime. Messages are immutable,
//! self-contained, and independently serializable; decode failures are typed
//! values and never cross a connection boundary as panics.

mod close;
mod codec;
mod messages;
mod version;

pub use close::CloseReason;
pub use codec::{
    decode_message, encode_message, ensure_session, validate_message, CodecError,
    ProtocolViolation,
};
pub use messages::{
    AckPayload, ConnectPayload, ConnectedPayload, ErrorPayload, ErrorSeverity, LogLevel,
    LogPayload, MessageBody, PingPayload, PongPayload, ProtocolMessage, UpdateKind,
    UpdatePayload, PROTOCOL_VERSION,
};
pub use version::{check_version, VersionCompatibility};

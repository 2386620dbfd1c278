use thiserror::Error;

use crate::messages::{MessageBody, ProtocolMessage, UpdateKind};

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("encode error: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("decode error: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("invalid message: {0}")]
    Invalid(String),
}

/// A message addressed to a session other than the one the connection is
/// registered to. Distinct from a decode error so the caller can close the
/// transport with a specific reason.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("session mismatch: message addressed to {got:?}, connection registered to {expected:?}")]
pub struct ProtocolViolation {
    pub expected: String,
    pub got: String,
}

pub fn encode_message(message: &ProtocolMessage) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(message).map_err(CodecError::Encode)
}

pub fn decode_message(bytes: &[u8]) -> Result<ProtocolMessage, CodecError> {
    let message: ProtocolMessage =
        serde_json::from_slice(bytes).map_err(CodecError::Decode)?;
    validate_message(&message)?;
    Ok(message)
}

/// Structural checks beyond what deserialization enforces.
pub fn validate_message(message: &ProtocolMessage) -> Result<(), CodecError> {
    if message.protocol_version.trim().is_empty() {
        return Err(CodecError::Invalid("empty protocolVersion".into()));
    }
    if let MessageBody::Update(update) = &message.body {
        match update.update_type {
            UpdateKind::Full => {
                if update.tree.is_none() || update.delta.is_some() {
                    return Err(CodecError::Invalid(
                        "full update must carry a tree and no delta".into(),
                    ));
                }
            }
            UpdateKind::Incremental => {
                if update.delta.is_none() || update.tree.is_some() {
                    return Err(CodecError::Invalid(
                        "incremental update must carry a delta and no tree".into(),
                    ));
                }
            }
        }
    }
    Ok(())
}

/// Check a decoded message against the session the connection registered
/// with.
pub fn ensure_session(
    message: &ProtocolMessage,
    expected: &str,
) -> Result<(), ProtocolViolation> {
    if message.session_id == expected {
        Ok(())
    } else {
        Err(ProtocolViolation {
            expected: expected.to_string(),
            got: message.session_id.clone(),
        })
    }
}

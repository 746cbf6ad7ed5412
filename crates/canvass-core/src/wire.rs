use crate::{SessionSnapshot, SessionUpdate};
use serde_json::Value;
use thiserror::Error;

pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MessageError {
    #[error("message exceeds max size: {size} > {max}")]
    Oversized { size: usize, max: usize },
    #[error("message encode failed: {0}")]
    Encode(String),
    #[error("message decode failed: {0}")]
    Decode(String),
    #[error("session record {index} rejected: {reason}")]
    Record { index: usize, reason: String },
    #[error("update references unknown session {0}")]
    UnknownSession(String),
}

/// Sessions decoded from one poll body, plus the records that were skipped.
#[derive(Debug, Clone, Default)]
pub struct SessionListReport {
    pub sessions: Vec<SessionSnapshot>,
    pub errors: Vec<MessageError>,
}

pub fn encode_update(update: &SessionUpdate) -> Result<String, MessageError> {
    serde_json::to_string(update).map_err(|err| MessageError::Encode(err.to_string()))
}

pub fn decode_update(text: &str, max_message_bytes: usize) -> Result<SessionUpdate, MessageError> {
    let raw = text.trim_end_matches(['\r', '\n']);
    if raw.len() > max_message_bytes {
        return Err(MessageError::Oversized {
            size: raw.len(),
            max: max_message_bytes,
        });
    }
    serde_json::from_str(raw).map_err(|err| MessageError::Decode(err.to_string()))
}

/// Decode a `GET sessions` body. Accepts a bare array or a paginated
/// `{"results": [...]}` object; individual malformed records are reported
/// and skipped rather than failing the whole list.
pub fn decode_session_list(body: &[u8]) -> Result<SessionListReport, MessageError> {
    let value: Value =
        serde_json::from_slice(body).map_err(|err| MessageError::Decode(err.to_string()))?;
    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("results") {
            Some(Value::Array(items)) => items,
            _ => {
                return Err(MessageError::Decode(
                    "expected an array of sessions or a results page".to_string(),
                ))
            }
        },
        _ => {
            return Err(MessageError::Decode(
                "expected an array of sessions or a results page".to_string(),
            ))
        }
    };

    let mut report = SessionListReport::default();
    for (index, item) in items.into_iter().enumerate() {
        match serde_json::from_value::<SessionSnapshot>(item) {
            Ok(session) => report.sessions.push(session),
            Err(err) => report.errors.push(MessageError::Record {
                index,
                reason: err.to_string(),
            }),
        }
    }
    Ok(report)
}

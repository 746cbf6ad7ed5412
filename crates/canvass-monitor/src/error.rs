//! Error taxonomy for the monitor. None of these are fatal to the running
//! loop; they degrade health or get logged and dropped.

use canvass_core::{InvalidSessionId, MessageError};
use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TransportError {
    #[error("connection refused: {0}")]
    InvalidSessionId(#[from] InvalidSessionId),
    #[error("invalid endpoint: {0}")]
    Endpoint(String),
    #[error("connect failed: {0}")]
    Connect(String),
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PollError {
    #[error("session poll failed with status {0}")]
    HttpStatus(reqwest::StatusCode),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("session poll body rejected: {0}")]
    Decode(#[from] MessageError),
    #[error("session source unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("invalid {field} url '{value}': {reason}")]
    InvalidUrl {
        field: &'static str,
        value: String,
        reason: String,
    },
    #[error("{field} must be greater than zero")]
    ZeroInterval { field: &'static str },
    #[error("invalid {field} '{value}': expected whole seconds")]
    InvalidInterval { field: &'static str, value: String },
    #[error("unknown emit mode '{0}', expected 'log' or 'json'")]
    UnknownEmit(String),
    #[error("http client setup failed: {0}")]
    Client(String),
}

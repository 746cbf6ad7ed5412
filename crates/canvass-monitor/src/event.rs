use crate::error::PollError;
use canvass_core::SessionListReport;

/// Identifies one transport attempt; a session that reconnects gets a new
/// serial so late events from the old transport can be told apart.
pub type ConnectionSerial = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEventKind {
    Opened,
    Message(String),
    Closed(Option<String>),
    Errored(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEvent {
    pub session_id: String,
    pub serial: ConnectionSerial,
    pub kind: ConnectionEventKind,
}

impl ConnectionEvent {
    pub fn new(session_id: impl Into<String>, serial: ConnectionSerial, kind: ConnectionEventKind) -> Self {
        Self {
            session_id: session_id.into(),
            serial,
            kind,
        }
    }
}

/// Everything the monitor loop reacts to besides its own poll timer.
#[derive(Debug)]
pub enum MonitorEvent {
    Connection(ConnectionEvent),
    PollCompleted {
        generation: u64,
        result: Result<SessionListReport, PollError>,
    },
}

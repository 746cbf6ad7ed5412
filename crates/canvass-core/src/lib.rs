use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

pub mod session_id;
pub mod wire;

pub use session_id::{validate_session_id, InvalidSessionId, MAX_SESSION_ID_LEN};
pub use wire::{
    decode_session_list, decode_update, encode_update, MessageError, SessionListReport,
    DEFAULT_MAX_MESSAGE_BYTES,
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Assigned,
    Active,
    Paused,
    Completed,
    #[serde(alias = "canceled")]
    Cancelled,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Assigned => "assigned",
            SessionStatus::Active => "active",
            SessionStatus::Paused => "paused",
            SessionStatus::Completed => "completed",
            SessionStatus::Cancelled => "cancelled",
        }
    }

    /// Sessions in this status are expected to hold a live update stream.
    pub fn is_active(&self) -> bool {
        matches!(self, SessionStatus::Active)
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Cancelled)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "assigned" => Ok(SessionStatus::Assigned),
            "active" => Ok(SessionStatus::Active),
            "paused" => Ok(SessionStatus::Paused),
            "completed" => Ok(SessionStatus::Completed),
            "cancelled" | "canceled" => Ok(SessionStatus::Cancelled),
            other => Err(format!("Unknown status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolunteerRef {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
}

impl VolunteerRef {
    pub fn display_name(&self) -> String {
        let full = format!("{} {}", self.first_name.trim(), self.last_name.trim());
        let full = full.trim();
        if full.is_empty() {
            self.email.clone()
        } else {
            full.to_string()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Progress {
    pub total_voters: u32,
    pub contacted: u32,
    pub remaining: u32,
    pub percentage: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

/// Locally held view of one canvassing session, seeded by polling and
/// refined by streamed updates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSnapshot {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    pub volunteer: VolunteerRef,
    #[serde(default, deserialize_with = "deserialize_ref_id")]
    pub walk_list: Option<String>,
    pub status: SessionStatus,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub total_responses: u32,
    #[serde(default)]
    pub gps_verified_responses: u32,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<Progress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_location: Option<Location>,
}

impl SessionSnapshot {
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }
}

/// One streamed message from a session's update channel. Only the fields
/// present on the wire are applied to the matching snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionUpdate {
    #[serde(deserialize_with = "deserialize_id")]
    pub session_id: String,
    #[serde(
        default,
        deserialize_with = "deserialize_ref_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub volunteer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<SessionStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_location: Option<Location>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<Progress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Deserialize an ID that can be either a string or a number into a String
fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    match val {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(serde::de::Error::custom("expected string or number for id")),
    }
}

/// Deserialize a reference that is either a bare id, an object carrying an
/// `id`, or null.
fn deserialize_ref_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    ref_id_from_value(val).map_err(serde::de::Error::custom)
}

fn ref_id_from_value(val: Value) -> Result<Option<String>, &'static str> {
    match val {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s)),
        Value::Number(n) => Ok(Some(n.to_string())),
        Value::Object(mut map) => match map.remove("id") {
            Some(inner @ (Value::String(_) | Value::Number(_))) => ref_id_from_value(inner),
            _ => Err("reference object is missing an id"),
        },
        _ => Err("expected id, object with id, or null"),
    }
}

use crate::registry::RegistryHealth;
use canvass_core::{SessionSnapshot, SessionStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionHealth {
    Connected,
    Connecting,
    Disconnected,
}

impl ConnectionHealth {
    /// Any handshake in flight reads as connecting; otherwise one open
    /// stream is enough to be connected.
    pub fn from_registry(health: RegistryHealth) -> Self {
        if health.connecting > 0 {
            ConnectionHealth::Connecting
        } else if health.open > 0 {
            ConnectionHealth::Connected
        } else {
            ConnectionHealth::Disconnected
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionHealth::Connected => "connected",
            ConnectionHealth::Connecting => "connecting",
            ConnectionHealth::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for ConnectionHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AggregateView {
    pub active_count: usize,
    pub completed_today_count: usize,
    pub average_progress_percent: f64,
    pub distinct_volunteer_count: usize,
    pub connection_health: ConnectionHealth,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_poll_at: Option<DateTime<Utc>>,
}

impl fmt::Display for AggregateView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "active={} completed_today={} avg_progress={:.1}% volunteers={} health={}",
            self.active_count,
            self.completed_today_count,
            self.average_progress_percent,
            self.distinct_volunteer_count,
            self.connection_health
        )?;
        if let Some(error) = self.poll_error.as_deref() {
            write!(f, " poll_error=\"{error}\"")?;
        }
        Ok(())
    }
}

pub fn summarize(
    snapshots: &[SessionSnapshot],
    health: RegistryHealth,
    now: DateTime<Utc>,
) -> AggregateView {
    let today = now.date_naive();
    let mut active_count = 0;
    let mut completed_today_count = 0;
    let mut progress_sum = 0.0;
    let mut progress_samples = 0usize;
    let mut volunteers = HashSet::new();

    for snapshot in snapshots {
        volunteers.insert(snapshot.volunteer.id.as_str());
        match snapshot.status {
            SessionStatus::Active => {
                active_count += 1;
                if let Some(progress) = snapshot.progress.as_ref() {
                    progress_sum += progress.percentage;
                    progress_samples += 1;
                }
            }
            SessionStatus::Completed => {
                if snapshot
                    .end_time
                    .map(|end| end.date_naive() == today)
                    .unwrap_or(false)
                {
                    completed_today_count += 1;
                }
            }
            _ => {}
        }
    }

    let average_progress_percent = if progress_samples == 0 {
        0.0
    } else {
        progress_sum / progress_samples as f64
    };

    AggregateView {
        active_count,
        completed_today_count,
        average_progress_percent,
        distinct_volunteer_count: volunteers.len(),
        connection_health: ConnectionHealth::from_registry(health),
        poll_error: None,
        last_poll_at: None,
    }
}

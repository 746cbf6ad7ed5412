use crate::error::PollError;
use crate::event::{ConnectionEvent, ConnectionEventKind, MonitorEvent};
use crate::merger::{MergeOutcome, SnapshotStore};
use crate::poller::{SessionSource, SnapshotPoller};
use crate::registry::{ConnectionRegistry, Connector};
use crate::reporter::{summarize, AggregateView};
use canvass_core::{decode_update, MessageError, SessionListReport, DEFAULT_MAX_MESSAGE_BYTES};
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Single owner of the snapshot store, the connection registry and the
/// poller. Every mutation goes through `handle_event` or `poll_now` on the
/// task that owns the monitor.
pub struct Monitor<C, S> {
    store: SnapshotStore,
    registry: ConnectionRegistry<C>,
    poller: SnapshotPoller<S>,
    poll_error: Option<String>,
    last_poll_at: Option<DateTime<Utc>>,
    max_message_bytes: usize,
}

impl<C: Connector, S: SessionSource> Monitor<C, S> {
    pub fn new(connector: C, source: S, events: mpsc::Sender<MonitorEvent>) -> Self {
        Self {
            store: SnapshotStore::new(),
            registry: ConnectionRegistry::new(connector, events.clone()),
            poller: SnapshotPoller::new(source, events),
            poll_error: None,
            last_poll_at: None,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
        }
    }

    pub fn with_max_message_bytes(mut self, max_message_bytes: usize) -> Self {
        self.max_message_bytes = max_message_bytes;
        self
    }

    pub fn poll_now(&mut self) -> bool {
        self.poller.start_fetch()
    }

    /// Applies one event and reports whether derived state may have changed.
    pub fn handle_event(&mut self, event: MonitorEvent) -> bool {
        match event {
            MonitorEvent::PollCompleted { generation, result } => {
                if !self.poller.accept(generation) {
                    debug!(event = "poll_discarded", generation);
                    return false;
                }
                self.apply_poll(result);
                true
            }
            MonitorEvent::Connection(event) => self.apply_connection_event(event),
        }
    }

    pub fn apply_poll(&mut self, result: Result<SessionListReport, PollError>) {
        match result {
            Ok(report) => {
                for err in &report.errors {
                    warn!(event = "poll_record_skipped", error = %err);
                }
                self.store.reseed(report.sessions);
                self.poll_error = None;
                self.last_poll_at = Some(Utc::now());
                let active = self.store.active_ids();
                let reconciled = self.registry.reconcile(&active);
                info!(
                    event = "poll_applied",
                    sessions = self.store.len(),
                    active = active.len(),
                    opened = reconciled.opened.len(),
                    closed = reconciled.closed.len(),
                    refused = reconciled.refused.len()
                );
            }
            Err(err) => {
                warn!(event = "poll_failed", error = %err, retained = self.store.len());
                self.poll_error = Some(err.to_string());
            }
        }
    }

    fn apply_connection_event(&mut self, event: ConnectionEvent) -> bool {
        if !self.registry.observe(&event) {
            debug!(
                event = "connection_event_stale",
                session_id = %event.session_id,
                serial = event.serial
            );
            return false;
        }
        let ConnectionEventKind::Message(text) = &event.kind else {
            return true;
        };
        let update = match decode_update(text, self.max_message_bytes) {
            Ok(update) => update,
            Err(err) => {
                warn!(event = "update_malformed", session_id = %event.session_id, error = %err);
                return false;
            }
        };
        if update.session_id != event.session_id {
            debug!(
                event = "update_cross_session",
                stream = %event.session_id,
                session_id = %update.session_id
            );
        }
        match self.store.apply_update(&update) {
            Ok(MergeOutcome::Changed) => {
                if let Some(snapshot) = self.store.get(&update.session_id) {
                    debug!(
                        event = "update_applied",
                        session_id = %snapshot.id,
                        volunteer = %snapshot.volunteer.display_name(),
                        status = %snapshot.status
                    );
                }
                true
            }
            Ok(MergeOutcome::Unchanged) => false,
            Err(MessageError::UnknownSession(session_id)) => {
                warn!(event = "update_unknown_session", session_id = %session_id);
                false
            }
            Err(err) => {
                warn!(event = "update_rejected", session_id = %update.session_id, error = %err);
                false
            }
        }
    }

    pub fn summary(&self, now: DateTime<Utc>) -> AggregateView {
        let mut view = summarize(self.store.sessions(), self.registry.health(), now);
        view.poll_error = self.poll_error.clone();
        view.last_poll_at = self.last_poll_at;
        view
    }

    /// Stops polling and closes every connection. Safe to repeat.
    pub fn dispose(&mut self) {
        self.poller.dispose();
        self.registry.teardown();
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    pub fn registry(&self) -> &ConnectionRegistry<C> {
        &self.registry
    }

    pub fn poll_error(&self) -> Option<&str> {
        self.poll_error.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::event::ConnectionSerial;
    use crate::registry::{ConnectionHandle, ConnectionState};
    use crate::reporter::ConnectionHealth;
    use async_trait::async_trait;
    use canvass_core::{SessionSnapshot, SessionStatus, VolunteerRef};
    use chrono::TimeZone;
    use std::collections::BTreeSet;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct RecordingConnector {
        opened: Arc<Mutex<Vec<(String, ConnectionSerial)>>>,
    }

    impl RecordingConnector {
        fn serial_of(&self, session_id: &str) -> ConnectionSerial {
            self.opened
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find(|(id, _)| id == session_id)
                .map(|(_, serial)| *serial)
                .expect("session was opened")
        }
    }

    impl Connector for RecordingConnector {
        fn open(
            &self,
            session_id: &str,
            serial: ConnectionSerial,
            _events: mpsc::Sender<MonitorEvent>,
        ) -> Result<ConnectionHandle, TransportError> {
            self.opened
                .lock()
                .unwrap()
                .push((session_id.to_string(), serial));
            let (handle, _rx) = ConnectionHandle::new();
            Ok(handle)
        }
    }

    struct NeverSource;

    #[async_trait]
    impl SessionSource for NeverSource {
        async fn fetch_sessions(&self) -> Result<SessionListReport, PollError> {
            std::future::pending::<Result<SessionListReport, PollError>>().await
        }
    }

    fn session(id: &str, status: SessionStatus) -> SessionSnapshot {
        SessionSnapshot {
            id: id.to_string(),
            volunteer: VolunteerRef {
                id: format!("v-{id}"),
                email: String::new(),
                first_name: String::new(),
                last_name: String::new(),
            },
            walk_list: None,
            status,
            start_time: Utc.with_ymd_and_hms(2026, 10, 18, 9, 0, 0).unwrap(),
            end_time: None,
            total_responses: 0,
            gps_verified_responses: 0,
            notes: None,
            progress: None,
            current_location: None,
        }
    }

    fn poll(sessions: Vec<SessionSnapshot>) -> Result<SessionListReport, PollError> {
        Ok(SessionListReport {
            sessions,
            errors: Vec::new(),
        })
    }

    fn monitor() -> (Monitor<RecordingConnector, NeverSource>, RecordingConnector) {
        let connector = RecordingConnector::default();
        let (tx, _rx) = mpsc::channel(8);
        (Monitor::new(connector.clone(), NeverSource, tx), connector)
    }

    fn ids(values: &[&str]) -> BTreeSet<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    fn message(session_id: &str, serial: ConnectionSerial, text: &str) -> MonitorEvent {
        MonitorEvent::Connection(ConnectionEvent::new(
            session_id,
            serial,
            ConnectionEventKind::Message(text.to_string()),
        ))
    }

    #[test]
    fn poll_cycles_reconcile_connections() {
        let (mut monitor, _connector) = monitor();

        monitor.apply_poll(poll(vec![
            session("A", SessionStatus::Active),
            session("B", SessionStatus::Active),
            session("C", SessionStatus::Completed),
        ]));
        assert_eq!(monitor.registry().session_ids(), ids(&["A", "B"]));

        monitor.apply_poll(poll(vec![
            session("A", SessionStatus::Completed),
            session("B", SessionStatus::Active),
            session("D", SessionStatus::Active),
        ]));
        assert_eq!(monitor.registry().session_ids(), ids(&["B", "D"]));
        assert_eq!(monitor.store().len(), 3);
    }

    #[test]
    fn streamed_progress_updates_average_immediately() {
        let (mut monitor, connector) = monitor();
        monitor.apply_poll(poll(vec![
            session("A", SessionStatus::Active),
            session("B", SessionStatus::Active),
        ]));
        let serial = connector.serial_of("B");

        let changed = monitor.handle_event(message(
            "B",
            serial,
            r#"{"session_id":"B","volunteer_id":"v-B","status":"active",
                "progress":{"total_voters":50,"contacted":20,"remaining":30,"percentage":40.0},
                "timestamp":"2026-10-18T15:00:00Z"}"#,
        ));
        assert!(changed);

        let view = monitor.summary(Utc::now());
        assert_eq!(view.active_count, 2);
        assert!((view.average_progress_percent - 40.0).abs() < f64::EPSILON);
        assert_eq!(monitor.registry().state("B"), Some(ConnectionState::Open));
    }

    #[test]
    fn malformed_and_unknown_updates_are_dropped() {
        let (mut monitor, connector) = monitor();
        monitor.apply_poll(poll(vec![session("A", SessionStatus::Active)]));
        let before = monitor.store().sessions().to_vec();
        let serial = connector.serial_of("A");

        assert!(!monitor.handle_event(message("A", serial, "{not json")));
        assert!(!monitor.handle_event(message(
            "A",
            serial,
            r#"{"session_id":"ghost","status":"paused"}"#
        )));
        assert!(!monitor.handle_event(message(
            "A",
            serial,
            r#"{"session_id":"A","status":"teleported"}"#
        )));
        assert_eq!(monitor.store().sessions(), before.as_slice());
    }

    #[test]
    fn oversized_message_is_dropped() {
        let connector = RecordingConnector::default();
        let (tx, _rx) = mpsc::channel(8);
        let mut monitor =
            Monitor::new(connector.clone(), NeverSource, tx).with_max_message_bytes(64);
        monitor.apply_poll(poll(vec![session("A", SessionStatus::Active)]));
        let serial = connector.serial_of("A");

        let padded = format!(
            r#"{{"session_id":"A","status":"paused","notes":"{}"}}"#,
            "x".repeat(128)
        );
        assert!(!monitor.handle_event(message("A", serial, &padded)));
        assert_eq!(
            monitor.store().get("A").map(|s| s.status),
            Some(SessionStatus::Active)
        );

        assert!(monitor.handle_event(message(
            "A",
            serial,
            r#"{"session_id":"A","status":"paused"}"#
        )));
    }

    #[test]
    fn update_carrying_another_session_id_merges_into_that_session() {
        let (mut monitor, connector) = monitor();
        monitor.apply_poll(poll(vec![
            session("A", SessionStatus::Active),
            session("B", SessionStatus::Active),
        ]));
        let stream_a = connector.serial_of("A");
        let a_before = monitor.store().get("A").cloned();

        let changed = monitor.handle_event(message(
            "A",
            stream_a,
            r#"{"session_id":"B","status":"paused",
                "progress":{"total_voters":10,"contacted":4,"remaining":6,"percentage":40.0}}"#,
        ));
        assert!(changed);

        let b = monitor.store().get("B").expect("B tracked");
        assert_eq!(b.status, SessionStatus::Paused);
        assert_eq!(b.progress.as_ref().map(|p| p.contacted), Some(4));
        assert_eq!(monitor.store().get("A").cloned(), a_before);
    }

    #[test]
    fn messages_from_retired_connection_are_ignored() {
        let (mut monitor, connector) = monitor();
        monitor.apply_poll(poll(vec![session("A", SessionStatus::Active)]));
        let serial = connector.serial_of("A");

        monitor.apply_poll(poll(vec![session("A", SessionStatus::Paused)]));
        assert!(monitor.registry().is_empty());

        let changed = monitor.handle_event(message(
            "A",
            serial,
            r#"{"session_id":"A","status":"active"}"#,
        ));
        assert!(!changed);
        assert_eq!(
            monitor.store().get("A").map(|s| s.status),
            Some(SessionStatus::Paused)
        );
    }

    #[test]
    fn poll_failure_keeps_snapshots_and_surfaces_error() {
        let (mut monitor, _connector) = monitor();
        monitor.apply_poll(poll(vec![
            session("A", SessionStatus::Active),
            session("B", SessionStatus::Completed),
        ]));

        monitor.apply_poll(Err(PollError::Unavailable("connection reset".to_string())));
        assert_eq!(monitor.store().len(), 2);
        assert_eq!(monitor.registry().session_ids(), ids(&["A"]));
        let view = monitor.summary(Utc::now());
        assert_eq!(
            view.poll_error.as_deref(),
            Some("session source unavailable: connection reset")
        );
        assert_eq!(view.active_count, 1);

        monitor.apply_poll(poll(vec![session("A", SessionStatus::Active)]));
        assert!(monitor.poll_error().is_none());
    }

    #[test]
    fn health_follows_connection_lifecycle() {
        let (mut monitor, connector) = monitor();
        assert_eq!(
            monitor.summary(Utc::now()).connection_health,
            ConnectionHealth::Disconnected
        );

        monitor.apply_poll(poll(vec![session("A", SessionStatus::Active)]));
        assert_eq!(
            monitor.summary(Utc::now()).connection_health,
            ConnectionHealth::Connecting
        );

        let serial = connector.serial_of("A");
        monitor.handle_event(MonitorEvent::Connection(ConnectionEvent::new(
            "A",
            serial,
            ConnectionEventKind::Opened,
        )));
        assert_eq!(
            monitor.summary(Utc::now()).connection_health,
            ConnectionHealth::Connected
        );

        monitor.handle_event(MonitorEvent::Connection(ConnectionEvent::new(
            "A",
            serial,
            ConnectionEventKind::Errored("reset by peer".to_string()),
        )));
        assert_eq!(
            monitor.summary(Utc::now()).connection_health,
            ConnectionHealth::Disconnected
        );
    }

    #[test]
    fn stale_poll_generation_is_not_applied() {
        let (mut monitor, _connector) = monitor();
        let changed = monitor.handle_event(MonitorEvent::PollCompleted {
            generation: 99,
            result: poll(vec![session("A", SessionStatus::Active)]),
        });
        assert!(!changed);
        assert!(monitor.store().is_empty());
        assert!(monitor.registry().is_empty());
    }

    #[test]
    fn dispose_twice_leaves_no_connections() {
        let (mut monitor, _connector) = monitor();
        monitor.apply_poll(poll(vec![
            session("A", SessionStatus::Active),
            session("B", SessionStatus::Active),
        ]));
        assert_eq!(monitor.registry().len(), 2);

        monitor.dispose();
        assert!(monitor.registry().is_empty());
        monitor.dispose();
        assert!(monitor.registry().is_empty());
    }
}

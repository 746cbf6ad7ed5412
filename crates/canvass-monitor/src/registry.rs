use crate::error::TransportError;
use crate::event::{ConnectionEvent, ConnectionEventKind, ConnectionSerial, MonitorEvent};
use canvass_core::validate_session_id;
use std::collections::{BTreeSet, HashMap};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
    Errored,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closed => "closed",
            ConnectionState::Errored => "errored",
        }
    }

    fn is_live(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Open)
    }
}

/// Owning side of a transport's shutdown signal. Dropping the handle closes
/// the transport.
#[derive(Debug)]
pub struct ConnectionHandle {
    shutdown: watch::Sender<bool>,
}

impl ConnectionHandle {
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (shutdown, rx) = watch::channel(false);
        (Self { shutdown }, rx)
    }

    pub fn close(&self) {
        self.shutdown.send_replace(true);
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Opens one transport for one session. Implementations report lifecycle
/// and payloads through `events`, tagged with the given serial.
pub trait Connector {
    fn open(
        &self,
        session_id: &str,
        serial: ConnectionSerial,
        events: mpsc::Sender<MonitorEvent>,
    ) -> Result<ConnectionHandle, TransportError>;
}

#[derive(Debug)]
pub struct ConnectionRecord {
    pub state: ConnectionState,
    pub serial: ConnectionSerial,
    handle: Option<ConnectionHandle>,
}

impl ConnectionRecord {
    fn close(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.close();
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryHealth {
    pub connecting: usize,
    pub open: usize,
    pub closed: usize,
    pub errored: usize,
}

impl RegistryHealth {
    pub fn total(&self) -> usize {
        self.connecting + self.open + self.closed + self.errored
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub opened: Vec<String>,
    pub closed: Vec<String>,
    pub refused: Vec<String>,
    pub failed: Vec<String>,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.opened.is_empty()
            && self.closed.is_empty()
            && self.refused.is_empty()
            && self.failed.is_empty()
    }
}

/// Owns at most one transport per active session. `reconcile` and
/// `teardown` are the only operations that add or remove records.
pub struct ConnectionRegistry<C> {
    connector: C,
    events: mpsc::Sender<MonitorEvent>,
    records: HashMap<String, ConnectionRecord>,
    next_serial: ConnectionSerial,
}

impl<C: Connector> ConnectionRegistry<C> {
    pub fn new(connector: C, events: mpsc::Sender<MonitorEvent>) -> Self {
        Self {
            connector,
            events,
            records: HashMap::new(),
            next_serial: 0,
        }
    }

    pub fn reconcile(&mut self, active: &BTreeSet<String>) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        let mut stale: Vec<String> = self
            .records
            .keys()
            .filter(|id| !active.contains(*id))
            .cloned()
            .collect();
        stale.sort();
        for session_id in stale {
            if let Some(mut record) = self.records.remove(&session_id) {
                record.close();
                info!(event = "connection_closed", session_id = %session_id, reason = "inactive");
                report.closed.push(session_id);
            }
        }

        for session_id in active {
            if let Some(record) = self.records.get_mut(session_id) {
                if record.state.is_live() {
                    continue;
                }
                record.close();
                debug!(
                    event = "connection_retry",
                    session_id = %session_id,
                    previous = record.state.as_str()
                );
            }

            if let Err(err) = validate_session_id(session_id) {
                self.records.remove(session_id);
                warn!(event = "connection_refused", session_id = %session_id, error = %err);
                report.refused.push(session_id.clone());
                continue;
            }

            self.next_serial += 1;
            let serial = self.next_serial;
            match self.connector.open(session_id, serial, self.events.clone()) {
                Ok(handle) => {
                    self.records.insert(
                        session_id.clone(),
                        ConnectionRecord {
                            state: ConnectionState::Connecting,
                            serial,
                            handle: Some(handle),
                        },
                    );
                    info!(event = "connection_opening", session_id = %session_id, serial);
                    report.opened.push(session_id.clone());
                }
                Err(err) => {
                    self.records.insert(
                        session_id.clone(),
                        ConnectionRecord {
                            state: ConnectionState::Errored,
                            serial,
                            handle: None,
                        },
                    );
                    warn!(event = "connection_error", session_id = %session_id, error = %err);
                    report.failed.push(session_id.clone());
                }
            }
        }

        report
    }

    /// Applies a lifecycle event to its record. Returns false when the event
    /// belongs to a transport the registry no longer owns.
    pub fn observe(&mut self, event: &ConnectionEvent) -> bool {
        let Some(record) = self.records.get_mut(&event.session_id) else {
            return false;
        };
        if record.serial != event.serial {
            return false;
        }
        match &event.kind {
            ConnectionEventKind::Opened => {
                record.state = ConnectionState::Open;
                info!(event = "connection_open", session_id = %event.session_id, serial = event.serial);
            }
            ConnectionEventKind::Message(_) => {
                if record.state == ConnectionState::Connecting {
                    record.state = ConnectionState::Open;
                }
            }
            ConnectionEventKind::Closed(reason) => {
                record.state = ConnectionState::Closed;
                record.close();
                warn!(
                    event = "connection_lost",
                    session_id = %event.session_id,
                    reason = reason.as_deref().unwrap_or("")
                );
            }
            ConnectionEventKind::Errored(message) => {
                record.state = ConnectionState::Errored;
                record.close();
                warn!(event = "connection_error", session_id = %event.session_id, error = %message);
            }
        }
        true
    }

    /// Closes every transport and clears the registry. Safe to repeat.
    pub fn teardown(&mut self) -> usize {
        let count = self.records.len();
        for (_, mut record) in self.records.drain() {
            record.close();
        }
        if count > 0 {
            info!(event = "registry_teardown", closed = count);
        }
        count
    }

    pub fn health(&self) -> RegistryHealth {
        let mut health = RegistryHealth::default();
        for record in self.records.values() {
            match record.state {
                ConnectionState::Connecting => health.connecting += 1,
                ConnectionState::Open => health.open += 1,
                ConnectionState::Closed => health.closed += 1,
                ConnectionState::Errored => health.errored += 1,
            }
        }
        health
    }

    pub fn state(&self, session_id: &str) -> Option<ConnectionState> {
        self.records.get(session_id).map(|record| record.state)
    }

    pub fn session_ids(&self) -> BTreeSet<String> {
        self.records.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct FakeConnector {
        opened: Arc<Mutex<Vec<(String, ConnectionSerial, watch::Receiver<bool>)>>>,
        failing: Arc<Mutex<HashSet<String>>>,
    }

    impl FakeConnector {
        fn open_count(&self) -> usize {
            self.opened.lock().unwrap().len()
        }

        fn opened_ids(&self) -> Vec<String> {
            self.opened
                .lock()
                .unwrap()
                .iter()
                .map(|(id, _, _)| id.clone())
                .collect()
        }

        fn is_shut_down(&self, session_id: &str, serial: ConnectionSerial) -> bool {
            self.opened
                .lock()
                .unwrap()
                .iter()
                .find(|(id, s, _)| id == session_id && *s == serial)
                .map(|(_, _, rx)| *rx.borrow())
                .expect("connection was opened")
        }
    }

    impl Connector for FakeConnector {
        fn open(
            &self,
            session_id: &str,
            serial: ConnectionSerial,
            _events: mpsc::Sender<MonitorEvent>,
        ) -> Result<ConnectionHandle, TransportError> {
            if self.failing.lock().unwrap().contains(session_id) {
                return Err(TransportError::Connect("refused by test".to_string()));
            }
            let (handle, rx) = ConnectionHandle::new();
            self.opened
                .lock()
                .unwrap()
                .push((session_id.to_string(), serial, rx));
            Ok(handle)
        }
    }

    fn ids(values: &[&str]) -> BTreeSet<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    fn registry() -> (ConnectionRegistry<FakeConnector>, FakeConnector) {
        let connector = FakeConnector::default();
        let (tx, _rx) = mpsc::channel(8);
        (ConnectionRegistry::new(connector.clone(), tx), connector)
    }

    #[test]
    fn reconcile_tracks_latest_active_set() {
        let (mut registry, connector) = registry();

        let sequence = [
            ids(&["a", "b"]),
            ids(&["b", "d"]),
            ids(&[]),
            ids(&["a", "b", "c", "d"]),
            ids(&["c"]),
        ];
        for active in &sequence {
            registry.reconcile(active);
            assert_eq!(&registry.session_ids(), active);
        }
        assert_eq!(connector.open_count(), 2 + 1 + 4);
    }

    #[test]
    fn reconcile_is_idempotent_for_same_set() {
        let (mut registry, connector) = registry();
        let active = ids(&["a", "b"]);

        let first = registry.reconcile(&active);
        assert_eq!(first.opened, vec!["a".to_string(), "b".to_string()]);

        let second = registry.reconcile(&active);
        assert!(second.is_noop());
        assert_eq!(connector.open_count(), 2);
        assert!(!connector.is_shut_down("a", 1));
        assert!(!connector.is_shut_down("b", 2));
    }

    #[test]
    fn scenario_closes_completed_keeps_continuing_opens_new() {
        let (mut registry, connector) = registry();

        registry.reconcile(&ids(&["A", "B"]));
        assert_eq!(connector.opened_ids(), vec!["A", "B"]);

        let report = registry.reconcile(&ids(&["B", "D"]));
        assert_eq!(report.closed, vec!["A".to_string()]);
        assert_eq!(report.opened, vec!["D".to_string()]);
        assert!(connector.is_shut_down("A", 1));
        assert!(!connector.is_shut_down("B", 2));
        assert_eq!(registry.session_ids(), ids(&["B", "D"]));
    }

    #[test]
    fn invalid_ids_are_refused_before_connecting() {
        let (mut registry, connector) = registry();

        let report = registry.reconcile(&ids(&["abc-123", "abc/123;drop"]));
        assert_eq!(report.opened, vec!["abc-123".to_string()]);
        assert_eq!(report.refused, vec!["abc/123;drop".to_string()]);
        assert_eq!(connector.opened_ids(), vec!["abc-123"]);
        assert_eq!(registry.session_ids(), ids(&["abc-123"]));
    }

    #[test]
    fn failed_open_is_recorded_and_retried_on_next_reconcile() {
        let (mut registry, connector) = registry();
        connector.failing.lock().unwrap().insert("a".to_string());

        let report = registry.reconcile(&ids(&["a"]));
        assert_eq!(report.failed, vec!["a".to_string()]);
        assert_eq!(registry.state("a"), Some(ConnectionState::Errored));

        connector.failing.lock().unwrap().clear();
        let report = registry.reconcile(&ids(&["a"]));
        assert_eq!(report.opened, vec!["a".to_string()]);
        assert_eq!(registry.state("a"), Some(ConnectionState::Connecting));
    }

    #[test]
    fn closed_connection_is_reopened_only_by_reconcile() {
        let (mut registry, connector) = registry();
        let active = ids(&["a"]);
        registry.reconcile(&active);

        assert!(registry.observe(&ConnectionEvent::new("a", 1, ConnectionEventKind::Opened)));
        assert_eq!(registry.state("a"), Some(ConnectionState::Open));

        assert!(registry.observe(&ConnectionEvent::new(
            "a",
            1,
            ConnectionEventKind::Closed(Some("server going away".to_string())),
        )));
        assert_eq!(registry.state("a"), Some(ConnectionState::Closed));
        assert_eq!(connector.open_count(), 1);

        let report = registry.reconcile(&active);
        assert_eq!(report.opened, vec!["a".to_string()]);
        assert_eq!(connector.open_count(), 2);
        assert_eq!(registry.state("a"), Some(ConnectionState::Connecting));
    }

    #[test]
    fn events_from_retired_serial_are_ignored() {
        let (mut registry, _connector) = registry();
        registry.reconcile(&ids(&["a"]));
        registry.observe(&ConnectionEvent::new(
            "a",
            1,
            ConnectionEventKind::Errored("reset".to_string()),
        ));
        registry.reconcile(&ids(&["a"]));

        let stale = ConnectionEvent::new("a", 1, ConnectionEventKind::Opened);
        assert!(!registry.observe(&stale));
        assert_eq!(registry.state("a"), Some(ConnectionState::Connecting));

        let unknown = ConnectionEvent::new("zzz", 9, ConnectionEventKind::Opened);
        assert!(!registry.observe(&unknown));
    }

    #[test]
    fn health_counts_each_state() {
        let (mut registry, _connector) = registry();
        registry.reconcile(&ids(&["a", "b", "c"]));
        registry.observe(&ConnectionEvent::new("a", 1, ConnectionEventKind::Opened));
        registry.observe(&ConnectionEvent::new(
            "c",
            3,
            ConnectionEventKind::Errored("boom".to_string()),
        ));

        assert_eq!(
            registry.health(),
            RegistryHealth {
                connecting: 1,
                open: 1,
                closed: 0,
                errored: 1,
            }
        );
    }

    #[test]
    fn teardown_twice_leaves_registry_empty() {
        let (mut registry, connector) = registry();
        registry.reconcile(&ids(&["a", "b"]));

        assert_eq!(registry.teardown(), 2);
        assert!(registry.is_empty());
        assert!(connector.is_shut_down("a", 1));
        assert!(connector.is_shut_down("b", 2));

        assert_eq!(registry.teardown(), 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn dropping_a_handle_signals_shutdown() {
        let (handle, rx) = ConnectionHandle::new();
        assert!(!*rx.borrow());
        drop(handle);
        assert!(*rx.borrow());
    }
}

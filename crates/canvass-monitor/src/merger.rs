use canvass_core::{MessageError, SessionSnapshot, SessionUpdate};
use std::collections::{BTreeSet, HashMap};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Changed,
    Unchanged,
}

/// Poll-ordered snapshot collection with an id index. Polls replace it
/// wholesale; streamed updates overwrite individual fields in place.
#[derive(Debug, Default)]
pub struct SnapshotStore {
    sessions: Vec<SessionSnapshot>,
    index: HashMap<String, usize>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_sessions(sessions: Vec<SessionSnapshot>) -> Self {
        let mut store = Self::new();
        store.reseed(sessions);
        store
    }

    /// Replaces every snapshot with the polled list. Duplicate ids keep
    /// their first occurrence.
    pub fn reseed(&mut self, sessions: Vec<SessionSnapshot>) {
        self.sessions.clear();
        self.index.clear();
        for session in sessions {
            if self.index.contains_key(&session.id) {
                warn!(event = "duplicate_session", session_id = %session.id);
                continue;
            }
            self.index.insert(session.id.clone(), self.sessions.len());
            self.sessions.push(session);
        }
    }

    pub fn apply_update(&mut self, update: &SessionUpdate) -> Result<MergeOutcome, MessageError> {
        let Some(&position) = self.index.get(&update.session_id) else {
            return Err(MessageError::UnknownSession(update.session_id.clone()));
        };
        let snapshot = &mut self.sessions[position];
        let mut outcome = MergeOutcome::Unchanged;

        if let Some(status) = update.status {
            if snapshot.status != status {
                snapshot.status = status;
                outcome = MergeOutcome::Changed;
            }
        }
        if let Some(progress) = update.progress.as_ref() {
            if snapshot.progress.as_ref() != Some(progress) {
                snapshot.progress = Some(progress.clone());
                outcome = MergeOutcome::Changed;
            }
        }
        if let Some(location) = update.current_location.as_ref() {
            if snapshot.current_location.as_ref() != Some(location) {
                snapshot.current_location = Some(location.clone());
                outcome = MergeOutcome::Changed;
            }
        }
        Ok(outcome)
    }

    pub fn get(&self, session_id: &str) -> Option<&SessionSnapshot> {
        self.index
            .get(session_id)
            .map(|&position| &self.sessions[position])
    }

    pub fn sessions(&self) -> &[SessionSnapshot] {
        &self.sessions
    }

    pub fn active_ids(&self) -> BTreeSet<String> {
        self.sessions
            .iter()
            .filter(|session| session.is_active())
            .map(|session| session.id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

use crate::error::{ConfigError, PollError};
use crate::event::MonitorEvent;
use async_trait::async_trait;
use canvass_core::{decode_session_list, SessionListReport};
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use url::Url;

const SESSIONS_PATH: &str = "canvassing/sessions/";
const FETCH_TIMEOUT_SECS: u64 = 20;

/// Authoritative source of the session list.
#[async_trait]
pub trait SessionSource: Send + Sync + 'static {
    async fn fetch_sessions(&self) -> Result<SessionListReport, PollError>;
}

#[derive(Clone)]
pub struct HttpSessionSource {
    client: Client,
    url: Url,
    token: Option<String>,
}

impl HttpSessionSource {
    pub fn new(api_base: &Url, token: Option<String>) -> Result<Self, ConfigError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(FETCH_TIMEOUT_SECS))
            .build()
            .map_err(|err| ConfigError::Client(err.to_string()))?;
        Ok(Self {
            client,
            url: sessions_url(api_base)?,
            token,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

pub fn sessions_url(api_base: &Url) -> Result<Url, ConfigError> {
    let mut base = api_base.clone();
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base.join(SESSIONS_PATH).map_err(|err| ConfigError::InvalidUrl {
        field: "api-base",
        value: api_base.to_string(),
        reason: err.to_string(),
    })
}

#[async_trait]
impl SessionSource for HttpSessionSource {
    async fn fetch_sessions(&self) -> Result<SessionListReport, PollError> {
        let mut request = self.client.get(self.url.clone());
        if let Some(token) = self.token.as_deref() {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(PollError::HttpStatus(status));
        }
        let body = response.bytes().await?;
        Ok(decode_session_list(&body)?)
    }
}

/// Runs one fetch at a time off the monitor loop and tags each result with
/// a generation so results from a disposed poller are never applied. A fetch
/// stays in flight until its result is accepted, including while that result
/// waits in the event queue.
pub struct SnapshotPoller<S> {
    source: Arc<S>,
    events: mpsc::Sender<MonitorEvent>,
    generation: u64,
    in_flight: Option<JoinHandle<()>>,
    disposed: bool,
}

impl<S: SessionSource> SnapshotPoller<S> {
    pub fn new(source: S, events: mpsc::Sender<MonitorEvent>) -> Self {
        Self {
            source: Arc::new(source),
            events,
            generation: 0,
            in_flight: None,
            disposed: false,
        }
    }

    /// Spawns a fetch unless one is already pending. Must be called from
    /// within a tokio runtime.
    pub fn start_fetch(&mut self) -> bool {
        if self.disposed {
            return false;
        }
        if self.is_in_flight() {
            debug!(event = "poll_skipped", generation = self.generation);
            return false;
        }
        self.generation += 1;
        let generation = self.generation;
        let source = self.source.clone();
        let events = self.events.clone();
        self.in_flight = Some(tokio::spawn(async move {
            let result = source.fetch_sessions().await;
            let _ = events
                .send(MonitorEvent::PollCompleted { generation, result })
                .await;
        }));
        true
    }

    /// Whether a completed fetch should be applied.
    pub fn accept(&mut self, generation: u64) -> bool {
        if self.disposed || generation != self.generation {
            return false;
        }
        self.in_flight = None;
        true
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn dispose(&mut self) {
        self.disposed = true;
        if let Some(task) = self.in_flight.take() {
            task.abort();
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }
}

impl<S> Drop for SnapshotPoller<S> {
    fn drop(&mut self) {
        if let Some(task) = self.in_flight.take() {
            task.abort();
        }
    }
}

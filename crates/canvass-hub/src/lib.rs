//! Loopback stand-in for the campaign backend: serves the session list and
//! one synthetic update stream per active session.

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Path, Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use canvass_core::{
    decode_session_list, encode_update, MessageError, Progress, SessionSnapshot, SessionStatus,
    SessionUpdate,
};
use chrono::Utc;
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use std::{
    collections::HashMap,
    future::Future,
    io,
    net::SocketAddr,
    path::Path as FsPath,
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tokio::{
    net::TcpListener,
    sync::{watch, RwLock},
};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum HubError {
    #[error("fixture read failed: {0}")]
    Io(#[from] io::Error),
    #[error("fixture decode failed: {0}")]
    Fixture(#[from] MessageError),
}

pub struct HubState {
    sessions: RwLock<Vec<SessionSnapshot>>,
    update_interval: Duration,
    token: Option<String>,
    closing: watch::Sender<bool>,
}

impl HubState {
    pub fn new(sessions: Vec<SessionSnapshot>, update_interval: Duration) -> Self {
        let (closing, _) = watch::channel(false);
        Self {
            sessions: RwLock::new(sessions),
            update_interval,
            token: None,
            closing,
        }
    }

    /// Requires `Authorization: Bearer <token>` on the list and
    /// `?token=<token>` on streams.
    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token.filter(|value| !value.is_empty());
        self
    }

    pub async fn sessions(&self) -> Vec<SessionSnapshot> {
        self.sessions.read().await.clone()
    }

    pub async fn replace_sessions(&self, sessions: Vec<SessionSnapshot>) {
        *self.sessions.write().await = sessions;
    }

    pub async fn upsert(&self, snapshot: SessionSnapshot) {
        let mut sessions = self.sessions.write().await;
        match sessions.iter_mut().find(|existing| existing.id == snapshot.id) {
            Some(existing) => *existing = snapshot,
            None => sessions.push(snapshot),
        }
    }

    /// Returns false when the session is unknown. Finishing a session stamps
    /// its end time; open streams notice on their next tick.
    pub async fn set_status(&self, session_id: &str, status: SessionStatus) -> bool {
        let mut sessions = self.sessions.write().await;
        let Some(session) = sessions.iter_mut().find(|s| s.id == session_id) else {
            return false;
        };
        session.status = status;
        if status.is_finished() && session.end_time.is_none() {
            session.end_time = Some(Utc::now());
        }
        true
    }

    /// Ends every open stream with a going-away close.
    pub fn close_streams(&self) {
        self.closing.send_replace(true);
    }

    async fn status_of(&self, session_id: &str) -> Option<SessionStatus> {
        let sessions = self.sessions.read().await;
        sessions
            .iter()
            .find(|s| s.id == session_id)
            .map(|s| s.status)
    }

    /// Advances an active session by one contact and describes its state.
    async fn advance(&self, session_id: &str) -> Option<SessionUpdate> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.iter_mut().find(|s| s.id == session_id)?;
        if session.status.is_active() {
            if let Some(progress) = session.progress.as_mut() {
                *progress = next_progress(progress);
            }
        }
        Some(SessionUpdate {
            session_id: session.id.clone(),
            volunteer_id: Some(session.volunteer.id.clone()),
            status: Some(session.status),
            current_location: session.current_location.clone(),
            progress: session.progress.clone(),
            timestamp: Some(Utc::now()),
        })
    }

    fn authorized(&self, presented: Option<&str>) -> bool {
        match self.token.as_deref() {
            None => true,
            Some(expected) => presented == Some(expected),
        }
    }

    async fn stream_session(self: Arc<Self>, socket: WebSocket, session_id: String) {
        let (mut ws_sender, mut ws_receiver) = socket.split();
        let mut closing = self.closing.subscribe();

        match self.status_of(&session_id).await {
            Some(status) if status.is_active() => {}
            Some(status) => {
                debug!(event = "stream_refused", session_id = %session_id, status = %status);
                send_close(&mut ws_sender, close_code::POLICY, "session not active").await;
                return;
            }
            None => {
                debug!(event = "stream_refused", session_id = %session_id, status = "unknown");
                send_close(&mut ws_sender, close_code::POLICY, "unknown session").await;
                return;
            }
        }
        if *closing.borrow() {
            send_close(&mut ws_sender, close_code::AWAY, "hub shutting down").await;
            return;
        }

        info!(event = "stream_open", session_id = %session_id);
        let mut ticker = tokio::time::interval(self.update_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let Some(update) = self.advance(&session_id).await else {
                        send_close(&mut ws_sender, close_code::POLICY, "unknown session").await;
                        break;
                    };
                    let ended = !update.status.map(|s| s.is_active()).unwrap_or(false);
                    let text = match encode_update(&update) {
                        Ok(text) => text,
                        Err(err) => {
                            warn!(event = "stream_encode_error", session_id = %session_id, error = %err);
                            break;
                        }
                    };
                    if ws_sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                    if ended {
                        send_close(&mut ws_sender, close_code::NORMAL, "session ended").await;
                        break;
                    }
                }
                incoming = ws_receiver.next() => {
                    match incoming {
                        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                        Some(Ok(_)) => {}
                    }
                }
                _ = closing.changed() => {
                    send_close(&mut ws_sender, close_code::AWAY, "hub shutting down").await;
                    break;
                }
            }
        }
        info!(event = "stream_closed", session_id = %session_id);
    }
}

async fn send_close(
    sender: &mut SplitSink<WebSocket, Message>,
    code: u16,
    reason: &'static str,
) {
    let _ = sender
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

/// One more voter contacted, saturating at the walk list size.
pub fn next_progress(progress: &Progress) -> Progress {
    let contacted = progress
        .contacted
        .saturating_add(1)
        .min(progress.total_voters);
    let percentage = if progress.total_voters == 0 {
        0.0
    } else {
        f64::from(contacted) * 100.0 / f64::from(progress.total_voters)
    };
    Progress {
        total_voters: progress.total_voters,
        contacted,
        remaining: progress.total_voters - contacted,
        percentage,
    }
}

pub fn load_fixture(path: &FsPath) -> Result<Vec<SessionSnapshot>, HubError> {
    let body = std::fs::read(path)?;
    let report = decode_session_list(&body)?;
    for err in &report.errors {
        warn!(event = "fixture_record_skipped", path = %path.display(), error = %err);
    }
    Ok(report.sessions)
}

pub fn router(hub: Arc<HubState>) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/api/canvassing/sessions/", get(list_sessions))
        .route("/ws/canvassing/:session_id/", get(ws_handler))
        .with_state(hub)
}

/// Serves until `shutdown` resolves, then closes open streams.
pub async fn serve<F>(listener: TcpListener, hub: Arc<HubState>, shutdown: F) -> io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let closer = hub.clone();
    let shutdown = async move {
        shutdown.await;
        closer.close_streams();
    };
    axum::serve(
        listener,
        router(hub).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}

async fn list_sessions(State(hub): State<Arc<HubState>>, headers: HeaderMap) -> Response {
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    if !hub.authorized(presented) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(hub.sessions().await).into_response()
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(hub): State<Arc<HubState>>,
) -> Response {
    if !addr.ip().is_loopback() {
        return StatusCode::FORBIDDEN.into_response();
    }
    if !hub.authorized(query.get("token").map(String::as_str)) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    ws.on_upgrade(move |socket| hub.stream_session(socket, session_id))
}

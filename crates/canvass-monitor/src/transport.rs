use crate::error::TransportError;
use crate::event::{ConnectionEvent, ConnectionEventKind, ConnectionSerial, MonitorEvent};
use crate::registry::{ConnectionHandle, Connector};
use canvass_core::validate_session_id;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};
use url::Url;

/// Derives a session's update-stream endpoint. The id is validated first so
/// it can never alter the path or query of the endpoint.
pub fn session_endpoint(
    ws_base: &Url,
    session_id: &str,
    token: Option<&str>,
) -> Result<Url, TransportError> {
    let session_id = validate_session_id(session_id)?;
    let mut url = ws_base.clone();
    let base_path = url.path().trim_end_matches('/').to_string();
    url.set_path(&format!("{base_path}/ws/canvassing/{session_id}/"));
    url.set_query(None);
    url.set_fragment(None);
    if let Some(token) = token {
        url.query_pairs_mut().append_pair("token", token);
    }
    Ok(url)
}

/// Opens one WebSocket task per session. Each task forwards its lifecycle
/// and text frames to the monitor loop until shut down or disconnected.
#[derive(Clone, Debug)]
pub struct WsConnector {
    ws_base: Url,
    token: Option<String>,
}

impl WsConnector {
    pub fn new(ws_base: Url, token: Option<String>) -> Result<Self, TransportError> {
        match ws_base.scheme() {
            "ws" | "wss" => Ok(Self { ws_base, token }),
            other => Err(TransportError::Endpoint(format!(
                "unsupported websocket scheme '{other}'"
            ))),
        }
    }
}

impl Connector for WsConnector {
    fn open(
        &self,
        session_id: &str,
        serial: ConnectionSerial,
        events: mpsc::Sender<MonitorEvent>,
    ) -> Result<ConnectionHandle, TransportError> {
        let url = session_endpoint(&self.ws_base, session_id, self.token.as_deref())?;
        let (handle, shutdown) = ConnectionHandle::new();
        tokio::spawn(run_connection(
            url,
            session_id.to_string(),
            serial,
            events,
            shutdown,
        ));
        Ok(handle)
    }
}

async fn emit(
    events: &mpsc::Sender<MonitorEvent>,
    session_id: &str,
    serial: ConnectionSerial,
    kind: ConnectionEventKind,
) -> bool {
    events
        .send(MonitorEvent::Connection(ConnectionEvent::new(
            session_id, serial, kind,
        )))
        .await
        .is_ok()
}

async fn run_connection(
    url: Url,
    session_id: String,
    serial: ConnectionSerial,
    events: mpsc::Sender<MonitorEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let connect = tokio::select! {
        result = connect_async(url.as_str()) => result,
        _ = shutdown.changed() => return,
    };
    let (mut ws, _) = match connect {
        Ok(value) => value,
        Err(err) => {
            warn!(event = "ws_connect_error", session_id = %session_id, error = %err);
            emit(&events, &session_id, serial, ConnectionEventKind::Errored(err.to_string())).await;
            return;
        }
    };
    if !emit(&events, &session_id, serial, ConnectionEventKind::Opened).await {
        let _ = ws.close(None).await;
        return;
    }

    loop {
        tokio::select! {
            incoming = ws.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if !emit(&events, &session_id, serial, ConnectionEventKind::Message(text)).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame.map(|frame| format!("{} {}", u16::from(frame.code), frame.reason));
                        emit(&events, &session_id, serial, ConnectionEventKind::Closed(reason)).await;
                        return;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        emit(&events, &session_id, serial, ConnectionEventKind::Errored(err.to_string())).await;
                        return;
                    }
                    None => {
                        emit(&events, &session_id, serial, ConnectionEventKind::Closed(None)).await;
                        return;
                    }
                }
            }
            _ = shutdown.changed() => {
                debug!(event = "ws_shutdown", session_id = %session_id, serial);
                break;
            }
        }
    }
    let _ = ws.close(None).await;
}

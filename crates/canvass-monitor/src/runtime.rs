use crate::config::{EmitMode, MonitorConfig};
use crate::error::ConfigError;
use crate::event::MonitorEvent;
use crate::monitor::Monitor;
use crate::poller::{HttpSessionSource, SessionSource};
use crate::registry::Connector;
use crate::reporter::AggregateView;
use crate::transport::WsConnector;
use chrono::Utc;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

const EVENT_QUEUE: usize = 256;

/// Runs the monitor until `shutdown` resolves: polls on every tick, applies
/// events as they arrive and hands each new summary to `on_summary`.
/// Disposes the monitor before returning.
pub async fn drive<C, S, F, E>(
    monitor: &mut Monitor<C, S>,
    events: &mut mpsc::Receiver<MonitorEvent>,
    poll_interval: Duration,
    shutdown: F,
    mut on_summary: E,
) where
    C: Connector,
    S: SessionSource,
    F: Future<Output = ()>,
    E: FnMut(&AggregateView),
{
    tokio::pin!(shutdown);
    let mut poll_ticker = tokio::time::interval(poll_interval);
    poll_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_emitted: Option<AggregateView> = None;

    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => break,
            _ = poll_ticker.tick() => {
                monitor.poll_now();
            }
            maybe_event = events.recv() => {
                let Some(event) = maybe_event else { break };
                if !monitor.handle_event(event) {
                    continue;
                }
                let view = monitor.summary(Utc::now());
                if !same_figures(last_emitted.as_ref(), &view) {
                    on_summary(&view);
                    last_emitted = Some(view);
                }
            }
        }
    }
    monitor.dispose();
}

// Poll timestamps alone never count as a change.
fn same_figures(previous: Option<&AggregateView>, next: &AggregateView) -> bool {
    let Some(previous) = previous else {
        return false;
    };
    AggregateView {
        last_poll_at: None,
        ..previous.clone()
    } == AggregateView {
        last_poll_at: None,
        ..next.clone()
    }
}

pub async fn run<F>(config: MonitorConfig, shutdown: F) -> Result<(), ConfigError>
where
    F: Future<Output = ()>,
{
    let connector = WsConnector::new(config.ws_base.clone(), config.token.clone()).map_err(|err| {
        ConfigError::InvalidUrl {
            field: "ws-base",
            value: config.ws_base.to_string(),
            reason: err.to_string(),
        }
    })?;
    let source = HttpSessionSource::new(&config.api_base, config.token.clone())?;
    info!(
        event = "monitor_start",
        sessions_url = %source.url(),
        ws_base = %config.ws_base,
        poll_interval_secs = config.poll_interval.as_secs()
    );

    let (events_tx, mut events_rx) = mpsc::channel(EVENT_QUEUE);
    let mut monitor = Monitor::new(connector, source, events_tx);
    let emit = config.emit;
    drive(
        &mut monitor,
        &mut events_rx,
        config.poll_interval,
        shutdown,
        |view| emit_summary(emit, view),
    )
    .await;
    info!(event = "monitor_stop");
    Ok(())
}

fn emit_summary(mode: EmitMode, view: &AggregateView) {
    match mode {
        EmitMode::Log => info!(event = "summary", "{view}"),
        EmitMode::Json => match serde_json::to_string(view) {
            Ok(line) => println!("{line}"),
            Err(err) => warn!(event = "summary_encode_error", error = %err),
        },
    }
}

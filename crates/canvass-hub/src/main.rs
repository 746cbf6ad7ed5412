use anyhow::{bail, Context};
use canvass_hub::{load_fixture, serve, HubState};
use clap::Parser;
use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "canvass-hub")]
struct Args {
    #[arg(long, default_value = "")]
    addr: String,
    /// JSON session list served at /api/canvassing/sessions/
    #[arg(long, default_value = "")]
    fixture: String,
    /// Seconds between synthetic updates on each stream
    #[arg(long, default_value_t = 2)]
    update_interval: u64,
    #[arg(long, default_value = "")]
    token: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging();

    let addr_raw = resolve_flag(&args.addr, "CANVASS_HUB_ADDR")
        .unwrap_or_else(|| "127.0.0.1:8000".to_string());
    let addr: SocketAddr = addr_raw
        .parse()
        .with_context(|| format!("invalid hub address {addr_raw}"))?;
    if !addr.ip().is_loopback() {
        error!(event = "invalid_addr", addr = %addr);
        bail!("hub only binds loopback addresses, got {addr}");
    }
    if args.update_interval == 0 {
        bail!("--update-interval must be at least one second");
    }

    let sessions = match resolve_flag(&args.fixture, "CANVASS_HUB_FIXTURE") {
        Some(path) => load_fixture(&PathBuf::from(&path))
            .with_context(|| format!("loading fixture {path}"))?,
        None => {
            warn!(event = "no_fixture", "serving an empty session list");
            Vec::new()
        }
    };
    let hub = Arc::new(
        HubState::new(sessions, Duration::from_secs(args.update_interval))
            .with_token(resolve_flag(&args.token, "CANVASS_TOKEN")),
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(
        event = "hub_start",
        addr = %addr,
        sessions = hub.sessions().await.len()
    );
    serve(listener, hub, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await?;
    info!(event = "hub_stop");
    Ok(())
}

fn resolve_flag(flag: &str, key: &str) -> Option<String> {
    if !flag.trim().is_empty() {
        return Some(flag.trim().to_string());
    }
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn init_logging() {
    let level = std::env::var("CANVASS_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

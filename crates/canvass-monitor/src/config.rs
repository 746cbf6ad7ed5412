use crate::error::ConfigError;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

const DEFAULT_API_BASE: &str = "http://127.0.0.1:8000/api";
const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;

#[derive(Parser, Debug, Default)]
#[command(name = "canvass-monitor")]
pub struct Args {
    /// REST base, e.g. https://campaign.example.org/api
    #[arg(long, default_value = "")]
    pub api_base: String,
    /// WebSocket base; derived from --api-base when empty
    #[arg(long, default_value = "")]
    pub ws_base: String,
    #[arg(long, default_value = "")]
    pub token: String,
    #[arg(long, default_value_t = 0)]
    pub poll_interval: u64,
    #[arg(long, default_value = "")]
    pub log_dir: String,
    /// `log` or `json`
    #[arg(long, default_value = "")]
    pub emit: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EmitMode {
    Log,
    Json,
}

#[derive(Clone, Debug)]
pub struct MonitorConfig {
    pub api_base: Url,
    pub ws_base: Url,
    pub token: Option<String>,
    pub poll_interval: Duration,
    pub log_dir: Option<PathBuf>,
    pub emit: EmitMode,
}

pub fn load_config(args: Args) -> Result<MonitorConfig, ConfigError> {
    resolve_config(args, |key| std::env::var(key).ok())
}

/// Flags win over `CANVASS_*` variables, which win over defaults.
pub fn resolve_config<F>(args: Args, env: F) -> Result<MonitorConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let lookup = |flag: &str, key: &str| -> Option<String> {
        if !flag.trim().is_empty() {
            return Some(flag.trim().to_string());
        }
        env(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    };

    let api_base_raw =
        lookup(&args.api_base, "CANVASS_API_BASE").unwrap_or_else(|| DEFAULT_API_BASE.to_string());
    let api_base = parse_url("api-base", &api_base_raw)?;
    match api_base.scheme() {
        "http" | "https" => {}
        other => {
            return Err(ConfigError::InvalidUrl {
                field: "api-base",
                value: api_base_raw,
                reason: format!("unsupported scheme '{other}'"),
            })
        }
    }

    let ws_base = match lookup(&args.ws_base, "CANVASS_WS_BASE") {
        Some(value) => parse_url("ws-base", &value)?,
        None => derive_ws_base(&api_base)?,
    };

    let poll_interval_secs = if args.poll_interval > 0 {
        args.poll_interval
    } else {
        match env("CANVASS_POLL_INTERVAL_SECS") {
            Some(value) if !value.trim().is_empty() => {
                let value = value.trim();
                value
                    .parse::<u64>()
                    .map_err(|_| ConfigError::InvalidInterval {
                        field: "poll-interval",
                        value: value.to_string(),
                    })?
            }
            _ => DEFAULT_POLL_INTERVAL_SECS,
        }
    };
    if poll_interval_secs == 0 {
        return Err(ConfigError::ZeroInterval {
            field: "poll-interval",
        });
    }

    let emit = match lookup(&args.emit, "CANVASS_EMIT").as_deref() {
        None | Some("log") => EmitMode::Log,
        Some("json") => EmitMode::Json,
        Some(other) => return Err(ConfigError::UnknownEmit(other.to_string())),
    };

    Ok(MonitorConfig {
        api_base,
        ws_base,
        token: lookup(&args.token, "CANVASS_TOKEN"),
        poll_interval: Duration::from_secs(poll_interval_secs),
        log_dir: lookup(&args.log_dir, "CANVASS_LOG_DIR").map(PathBuf::from),
        emit,
    })
}

fn parse_url(field: &'static str, value: &str) -> Result<Url, ConfigError> {
    Url::parse(value).map_err(|err| ConfigError::InvalidUrl {
        field,
        value: value.to_string(),
        reason: err.to_string(),
    })
}

/// `http://host:port/api` becomes `ws://host:port/`.
pub fn derive_ws_base(api_base: &Url) -> Result<Url, ConfigError> {
    let scheme = match api_base.scheme() {
        "https" => "wss",
        _ => "ws",
    };
    let mut ws_base = api_base.clone();
    ws_base
        .set_scheme(scheme)
        .map_err(|_| ConfigError::InvalidUrl {
            field: "ws-base",
            value: api_base.to_string(),
            reason: format!("cannot switch scheme to {scheme}"),
        })?;
    ws_base.set_path("/");
    ws_base.set_query(None);
    ws_base.set_fragment(None);
    Ok(ws_base)
}

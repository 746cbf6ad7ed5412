use canvass_monitor::logging::init_logging;
use canvass_monitor::{load_config, run, Args};
use clap::Parser;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(args)?;
    let _log_guard = init_logging(config.log_dir.as_deref(), "canvass-monitor");

    run(config, async {
        let _ = tokio::signal::ctrl_c().await;
        info!(event = "shutdown_requested");
    })
    .await?;
    Ok(())
}

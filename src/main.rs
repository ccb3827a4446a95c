use std::sync::Arc;

use clap::Parser;
use colored::*;
use tracing_subscriber::EnvFilter;

use organ_bridge::cli::Args;
use organ_bridge::config::BridgeConfig;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("organ_bridge=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = Arc::new(BridgeConfig::load(&args)?);

    eprintln!(
        "{}",
        format!("  organ-bridge listening on http://{}", config.bind_addr()).bright_green()
    );
    match config.effective_collector_url() {
        Some(url) => eprintln!("{}", format!("  Pushing telemetry to {url}").bright_cyan()),
        None => eprintln!("{}", "  Collector not configured; push disabled".yellow()),
    }
    if config.secret.is_none() {
        eprintln!("{}", "  BRIDGE_TOKEN not set; /execute will reject all requests".yellow());
    }
    eprintln!("{}", "  Press Ctrl+C to stop.".bright_blue());

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("shutdown requested");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => {
                // Dropping the sender would stop the server; hold it instead.
                tracing::warn!(error = %e, "cannot listen for Ctrl+C");
                std::future::pending::<()>().await;
                drop(shutdown_tx);
            }
        }
    });

    organ_bridge::web::serve(config, shutdown_rx).await?;
    Ok(())
}

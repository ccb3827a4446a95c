use clap::Parser;
use std::path::PathBuf;

/// Flags override the config file and environment. The bearer token comes
/// only from the environment or the config file.
#[derive(Parser, Debug, Default)]
#[command(name = "organ-bridge")]
#[command(version)]
#[command(about = "Replicates organ telemetry to a collector, streams it to observers, and gates remote commands")]
pub struct Args {
    /// Optional TOML config file
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// Address to listen on (overrides BRIDGE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on (overrides BRIDGE_PORT)
    #[arg(long, short)]
    pub port: Option<u16>,

    /// Collector base URL (overrides COLLECTOR_URL)
    #[arg(long)]
    pub collector_url: Option<String>,

    /// Telemetry snapshot file (overrides TELEMETRY_PATH)
    #[arg(long)]
    pub snapshot_path: Option<PathBuf>,

    /// Status document file (overrides BLACKBOARD_PATH)
    #[arg(long)]
    pub document_path: Option<PathBuf>,

    /// Do not start the push daemon even when a collector is configured
    #[arg(long)]
    pub no_push: bool,
}

use clap::Parser;
use hearth_server::FeedStore;
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "hearth-server", about = "Reference update feed server for hearth")]
struct Cli {
    /// Port to listen on.
    #[arg(long, default_value_t = 8321)]
    port: u16,

    /// Address to bind.
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,

    /// Directory holding release listings and artifacts.
    #[arg(long, default_value = "./hearth-feed-data")]
    data_dir: PathBuf,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("HEARTH_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    if let Err(e) = fs::create_dir_all(&cli.data_dir) {
        error!("failed to create {}: {e}", cli.data_dir.display());
        return ExitCode::FAILURE;
    }

    let addr = format!("{}:{}", cli.bind, cli.port);
    info!("starting hearth-server on {addr}");
    info!("data directory: {}", cli.data_dir.display());

    let store = Arc::new(FeedStore::new(cli.data_dir));
    match hearth_server::run_server(&store, &addr) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("server failed: {e}");
            ExitCode::FAILURE
        }
    }
}

mod heartbeat;
mod report;

use clap::Parser;
use hearth_core::{install_signal_handler, telemetry, RunOutcome, ServiceRuntime, TelemetryConfig};
use hearth_schema::{parse_manifest_file, CommandLine, RuntimeCommand, MANIFEST_FILE};
use heartbeat::Heartbeat;
use report::{EXIT_MANIFEST_ERROR, EXIT_SUCCESS};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Parser)]
#[command(
    name = "hearth",
    version,
    about = "Run the heartbeat service as a single instance with self-update"
)]
struct Cli {
    /// Path to the service manifest.
    #[arg(long, default_value = MANIFEST_FILE)]
    manifest: PathBuf,

    /// Runtime directory, overriding the manifest.
    #[arg(long)]
    runtime_dir: Option<PathBuf>,

    /// Milliseconds between heartbeats.
    #[arg(long, default_value_t = 1000)]
    beat_ms: u64,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false)]
    trace: bool,

    /// Runtime commands (stop, restart, status, watch, update-check, ...) and
    /// service words (ping, beat, mode), forwarded to a running instance.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();
    let args = CommandLine::new(cli.args.clone());

    let config = TelemetryConfig {
        verbose: cli.verbose,
        trace: cli.trace,
        watch: args.contains(&RuntimeCommand::Watch),
    };
    let telemetry = match telemetry::init(&config) {
        Ok(handle) => handle,
        Err(e) => {
            report::error(&e.to_string());
            return ExitCode::from(EXIT_MANIFEST_ERROR);
        }
    };

    install_signal_handler();

    let code = run(&cli, args, telemetry.clone());
    telemetry.shutdown();
    ExitCode::from(code)
}

fn run(cli: &Cli, args: CommandLine, telemetry: hearth_core::TelemetryHandle) -> u8 {
    let manifest = match parse_manifest_file(&cli.manifest) {
        Ok(m) => m,
        Err(e) => {
            report::error(&format!(
                "failed to load manifest {}: {e}",
                cli.manifest.display()
            ));
            return EXIT_MANIFEST_ERROR;
        }
    };

    let service = Arc::new(Heartbeat::new(Duration::from_millis(cli.beat_ms.max(1))));
    let mut builder = ServiceRuntime::builder(manifest, service).telemetry(telemetry);
    if let Some(dir) = &cli.runtime_dir {
        builder = builder.runtime_dir(dir.clone());
    }

    match builder.build().and_then(|runtime| runtime.run(args)) {
        Ok(RunOutcome::Peer(ack)) => report::ack(&ack),
        Ok(RunOutcome::Stopped) => EXIT_SUCCESS,
        Ok(RunOutcome::Relaunched) => {
            info!("handed over to the updated executable");
            EXIT_SUCCESS
        }
        Err(e) => {
            report::error(&e.to_string());
            report::exit_code(&e)
        }
    }
}

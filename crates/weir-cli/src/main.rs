mod commands;
mod logging;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "weir", version, about = "Pipeline execution engine for security telemetry")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "warn", global = true)]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a pipeline
    Exec {
        /// The pipeline text, e.g. `load eve.json | read json --ndjson | head 5`
        pipeline: Option<String>,
        /// Read the pipeline text from a file instead
        #[arg(long, short, conflicts_with = "pipeline")]
        file: Option<PathBuf>,
        /// Path to the engine configuration (YAML)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Print the per-operator metrics table after the run
        #[arg(long)]
        dump_metrics: bool,
        /// Emit diagnostics as JSON records instead of text
        #[arg(long)]
        diagnostics_json: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(&cli.log_level);

    let code = match cli.command {
        Commands::Exec { pipeline, file, config, dump_metrics, diagnostics_json } => {
            commands::exec::execute(commands::exec::ExecArgs {
                pipeline,
                file,
                config,
                dump_metrics,
                diagnostics_json,
            })
            .await
        }
    };
    ExitCode::from(code)
}

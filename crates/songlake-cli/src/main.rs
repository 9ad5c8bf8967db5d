mod commands;
mod logging;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "songlake",
    version,
    about = "Builds the songplays star schema from song metadata and session logs"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Path to pipeline YAML file; built-in defaults apply when it does not exist
    #[arg(long, default_value = "songlake.yaml", global = true)]
    config: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline and write all five tables (default)
    Run,
    /// Resolve inputs and probe the output root without writing
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    logging::init(&cli.log_level);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => commands::run::execute(&cli.config).await,
        Commands::Check => commands::check::execute(&cli.config).await,
    }
}

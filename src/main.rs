//! toolharness - scenario test harness for tool aggregator servers
//!
//! Runs YAML scenarios against isolated server instances and reports the
//! outcome of every tool call.

use clap::Parser;
use commands::Commands;
use std::path::PathBuf;
use toolharness::common::logging;
use toolharness::{cli, commands};

#[derive(Parser)]
#[command(name = "toolharness", about = "Scenario test harness for tool aggregator servers")]
#[command(version, long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Configuration file (default: platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init_cli(cli.debug);

    match cli::dispatch(cli.command, cli.config.as_deref()).await {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    }
}

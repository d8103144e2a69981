//! Toolmesh CLI
//!
//! Inspect and call tools offered by the providers in a configuration
//! file, or serve them (plus the built-in tools) over stdio.
//!
//! ```bash
//! toolmesh --config toolmesh.toml providers
//! toolmesh tools --format json
//! toolmesh call scanner::nmap --args '{"target": "10.0.0.1"}'
//! toolmesh serve
//! ```

mod args;
mod commands;
mod console;
mod router;

use crate::args::Cli;
use crate::console::CliConsole;
use anyhow::Result;
use clap::Parser;
use std::process::ExitCode;
use toolmesh_core::config::init_logging;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            CliConsole::new(true).error(&format!("{:#}", e));
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = commands::load_config(&cli.config)?;
    if cli.verbose {
        config.logging.level = "debug".to_string();
    }
    init_logging(&config.logging)?;
    router::route(cli, config).await
}

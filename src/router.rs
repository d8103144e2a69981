//! Command routing logic for CLI

use crate::args::{Cli, Commands};
use crate::commands;
use anyhow::Result;
use toolmesh_core::MeshConfig;

/// Route a parsed command line to its handler
pub async fn route(cli: Cli, config: MeshConfig) -> Result<()> {
    match cli.command {
        Commands::Providers { format } => commands::providers::show_providers(&config, format).await,
        Commands::Tools { format } => commands::tools::show_tools(&config, format).await,
        Commands::Call { name, args, format } => {
            commands::call::call_tool(&config, &name, &args, format).await
        }
        Commands::Serve { local_only } => commands::serve::serve(&config, local_only).await,
    }
}

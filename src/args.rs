//! CLI argument definitions using clap
//!
//! - toolmesh providers            # Provider status and tool counts
//! - toolmesh tools                # Merged provider catalog
//! - toolmesh call <p::tool>       # Call one provider tool
//! - toolmesh serve                # Dispatcher over stdio

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Default configuration file name used across all commands.
pub const DEFAULT_CONFIG_FILE: &str = "toolmesh.toml";

#[derive(Parser)]
#[command(name = "toolmesh")]
#[command(about = "Toolmesh - uniform tool calls across local and remote providers")]
#[command(version)]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, global = true, env = "TOOLMESH_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    /// Enable debug logging
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show configured providers with their status and tool counts
    Providers {
        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// List every tool offered by the configured providers
    Tools {
        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Call a provider tool by its qualified name
    Call {
        /// Tool name as <provider>::<tool>
        name: String,

        /// Arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,

        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Serve the built-in and provider tools over stdin/stdout
    Serve {
        /// Do not connect configured providers
        #[arg(long)]
        local_only: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_call() {
        let cli = Cli::try_parse_from([
            "toolmesh",
            "--config",
            "mesh.toml",
            "call",
            "scanner::nmap",
            "--args",
            r#"{"target":"10.0.0.1"}"#,
        ])
        .unwrap();

        assert_eq!(cli.config, PathBuf::from("mesh.toml"));
        match cli.command {
            Commands::Call { name, args, format } => {
                assert_eq!(name, "scanner::nmap");
                assert!(args.contains("10.0.0.1"));
                assert_eq!(format, OutputFormat::Text);
            }
            _ => panic!("expected call"),
        }
    }

    #[test]
    fn test_format_flag() {
        let cli = Cli::try_parse_from(["toolmesh", "tools", "--format", "json"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Tools {
                format: OutputFormat::Json
            }
        ));
    }
}

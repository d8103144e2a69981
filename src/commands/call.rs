//! One-shot provider tool call

use super::connect_manager;
use crate::args::OutputFormat;
use crate::console::CliConsole;
use anyhow::{Context, Result, bail};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use toolmesh_core::MeshConfig;

/// Call `<provider>::<tool>` and print its result
///
/// Ctrl-C cancels the wait. An error-flagged result fails the command.
pub async fn call_tool(
    config: &MeshConfig,
    name: &str,
    args: &str,
    format: OutputFormat,
) -> Result<()> {
    let arguments = parse_arguments(args)?;
    let manager = connect_manager(config).await?;

    let cancel = CancellationToken::new();
    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    };

    let outcome = manager.call_tool(&cancel, name, arguments).await;
    watcher.abort();
    manager.shutdown().await;
    let result = outcome?;

    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!("{}", result.text_content());
    }

    if result.is_error {
        CliConsole::new(true).warn(&format!("{} reported an error", name));
        bail!("tool call failed");
    }
    Ok(())
}

fn parse_arguments(args: &str) -> Result<Value> {
    let value: Value = serde_json::from_str(args).context("--args must be valid JSON")?;
    if !value.is_object() {
        bail!("--args must be a JSON object");
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_arguments() {
        assert_eq!(parse_arguments(r#"{"a":1}"#).unwrap()["a"], 1);
        assert!(parse_arguments("[1]").is_err());
        assert!(parse_arguments("{").is_err());
    }
}

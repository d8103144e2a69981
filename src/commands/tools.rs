//! Merged tool catalog listing

use super::connect_manager;
use crate::args::OutputFormat;
use crate::console::{CliConsole, column_widths};
use anyhow::Result;
use tokio_util::sync::CancellationToken;
use toolmesh_core::MeshConfig;

/// Show every provider tool under its qualified name
pub async fn show_tools(config: &MeshConfig, format: OutputFormat) -> Result<()> {
    let manager = connect_manager(config).await?;
    let tools = manager.get_all_tools(&CancellationToken::new()).await;
    manager.shutdown().await;

    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&tools)?);
        return Ok(());
    }

    let console = CliConsole::new(true);
    console.print_header("Available Tools");

    let headers = ["Tool Name", "Description"];
    let rows: Vec<Vec<String>> = tools
        .iter()
        .map(|tool| {
            let summary = tool
                .short_description
                .clone()
                .unwrap_or_else(|| first_line(&tool.description).to_string());
            vec![tool.name.clone(), summary]
        })
        .collect();
    let widths = column_widths(&rows, &headers, 72);
    console.print_table_header(&headers, &widths);
    for row in &rows {
        let cells: Vec<&str> = row.iter().map(String::as_str).collect();
        console.print_table_row(&cells, &widths);
    }

    println!();
    console.info(&format!("Total tools available: {}", tools.len()));
    Ok(())
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or_default().trim()
}

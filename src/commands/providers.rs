//! Provider status listing

use super::connect_manager;
use crate::args::OutputFormat;
use crate::console::{CliConsole, column_widths, status_style};
use anyhow::Result;
use toolmesh_core::MeshConfig;

/// Connect every provider and report how each one is doing
pub async fn show_providers(config: &MeshConfig, format: OutputFormat) -> Result<()> {
    let manager = connect_manager(config).await?;
    let stats = manager.get_stats();
    manager.shutdown().await;

    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    let console = CliConsole::new(true);
    if stats.providers.is_empty() {
        console.warn("No providers configured.");
        console.info("Add a [providers.<name>] section to the configuration file.");
        return Ok(());
    }

    console.print_header("Providers");
    let headers = ["Name", "Transport", "Status", "Tools", "Endpoint"];
    let rows: Vec<Vec<String>> = stats
        .providers
        .iter()
        .map(|p| {
            let status = if p.enabled {
                p.status.to_string()
            } else {
                format!("{} (disabled)", p.status)
            };
            vec![
                p.name.clone(),
                p.transport.to_string(),
                status,
                p.tool_count.to_string(),
                p.endpoint.clone(),
            ]
        })
        .collect();
    let widths = column_widths(&rows, &headers, 60);
    console.print_table_header(&headers, &widths);

    for (provider, row) in stats.providers.iter().zip(&rows) {
        let cells: Vec<&str> = row.iter().map(String::as_str).collect();
        console.print_table_row(&cells, &widths);
        if let Some(error) = &provider.last_error {
            println!("    {}", status_style(provider.status).apply_to(error));
        }
    }

    println!();
    console.info(&format!(
        "{} of {} providers connected, {} tools",
        stats.connected,
        stats.providers.len(),
        stats.total_tools
    ));
    Ok(())
}

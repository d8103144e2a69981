//! CLI console utilities

use console::{Style, style};
use toolmesh_core::ClientStatus;

/// Formatted output for the utility commands
pub struct CliConsole {
    verbose: bool,
}

impl CliConsole {
    pub const fn new(verbose: bool) -> Self {
        Self { verbose }
    }

    /// Print an info message (verbose only)
    pub fn info(&self, message: &str) {
        if self.verbose {
            println!("{} {}", style("ℹ").blue().bold(), message);
        }
    }

    pub fn success(&self, message: &str) {
        println!("{} {}", style("✓").green().bold(), style(message).green());
    }

    pub fn warn(&self, message: &str) {
        println!("{} {}", style("⚠").yellow().bold(), style(message).yellow());
    }

    pub fn error(&self, message: &str) {
        eprintln!("{} {}", style("✗").red().bold(), style(message).red());
    }

    pub fn print_header(&self, title: &str) {
        println!();
        println!("{}", style(title).bold().underlined());
        println!("{}", style("=".repeat(title.chars().count())).dim());
    }

    /// Print a table header followed by a rule
    pub fn print_table_header(&self, headers: &[&str], widths: &[usize]) {
        println!("{}", style(pad_row(headers, widths)).bold());
        let total: usize = widths.iter().sum::<usize>() + 2 * widths.len().saturating_sub(1);
        println!("{}", style("-".repeat(total)).dim());
    }

    pub fn print_table_row(&self, cells: &[&str], widths: &[usize]) {
        println!("{}", pad_row(cells, widths));
    }
}

/// Colour for a connection state
pub fn status_style(status: ClientStatus) -> Style {
    match status {
        ClientStatus::Connected => Style::new().green(),
        ClientStatus::Connecting => Style::new().cyan(),
        ClientStatus::Disconnected => Style::new().yellow(),
        ClientStatus::Error => Style::new().red().bold(),
    }
}

/// Column widths fitting every cell, with a cap for long descriptions
pub fn column_widths(rows: &[Vec<String>], headers: &[&str], cap: usize) -> Vec<usize> {
    headers
        .iter()
        .enumerate()
        .map(|(i, header)| {
            rows.iter()
                .filter_map(|row| row.get(i))
                .map(|cell| cell.chars().count())
                .chain(std::iter::once(header.chars().count()))
                .max()
                .unwrap_or(0)
                .min(cap)
        })
        .collect()
}

fn pad_row(cells: &[&str], widths: &[usize]) -> String {
    cells
        .iter()
        .zip(widths)
        .map(|(cell, width)| format!("{:<width$}", truncate(cell, *width), width = width))
        .collect::<Vec<_>>()
        .join("  ")
        .trim_end()
        .to_string()
}

fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(width.saturating_sub(1)).collect();
    cut.push('…');
    cut
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_widths_capped() {
        let rows = vec![
            vec!["scanner::nmap".to_string(), "x".repeat(200)],
            vec!["a::b".to_string(), "short".to_string()],
        ];
        let widths = column_widths(&rows, &["Tool", "Description"], 60);
        assert_eq!(widths, vec![13, 60]);
    }

    #[test]
    fn test_pad_row_truncates() {
        let row = pad_row(&["abcdef", "z"], &[4, 1]);
        assert_eq!(row, "abc…  z");
    }
}

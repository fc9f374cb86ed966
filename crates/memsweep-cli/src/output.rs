//! Output formatting for the memsweep CLI

use anyhow::Result;
use clap::ValueEnum;
use colored::*;
use comfy_table::{presets::UTF8_FULL, Attribute, Cell, Color, ContentArrangement, Table};
use serde::Serialize;

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable tables
    #[default]
    Table,
    /// JSON documents
    Json,
}

/// Types that can be shown as a table row or a key/value listing
pub trait Formattable {
    fn table_headers() -> Vec<String>;
    fn table_row(&self) -> Vec<String>;

    /// Key/value pairs for the detailed view
    fn key_value_pairs(&self) -> Vec<(String, String)>;
}

/// Output formatter
pub struct OutputFormatter {
    format: OutputFormat,
}

impl OutputFormatter {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    /// Print a single item
    pub fn print_item<T>(&self, item: &T) -> Result<()>
    where
        T: Serialize + Formattable,
    {
        match self.format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(item)?),
            OutputFormat::Table => {
                for (key, value) in item.key_value_pairs() {
                    println!("{}: {}", key.bold().cyan(), value);
                }
            }
        }
        Ok(())
    }

    /// Print a list of items
    pub fn print_list<T>(&self, items: &[T]) -> Result<()>
    where
        T: Serialize + Formattable,
    {
        match self.format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(items)?),
            OutputFormat::Table if items.is_empty() => {
                println!("{}", "No items found".dimmed());
            }
            OutputFormat::Table => println!("{}", Self::table(items)),
        }
        Ok(())
    }

    fn table<T: Formattable>(items: &[T]) -> Table {
        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL)
            .set_content_arrangement(ContentArrangement::Dynamic);

        let header_cells: Vec<Cell> = T::table_headers()
            .iter()
            .map(|h| Cell::new(h).add_attribute(Attribute::Bold).fg(Color::Cyan))
            .collect();
        table.set_header(header_cells);

        for item in items {
            table.add_row(item.table_row());
        }
        table
    }

    /// Print a success message
    pub fn print_success(&self, message: &str) -> Result<()> {
        self.print_status("success", message, || {
            println!("{} {}", "✓".green().bold(), message.green())
        })
    }

    /// Print a warning message
    pub fn print_warning(&self, message: &str) -> Result<()> {
        self.print_status("warning", message, || {
            eprintln!("{} {}", "⚠".yellow().bold(), message.yellow())
        })
    }

    /// Print an error message
    pub fn print_error(&self, message: &str) -> Result<()> {
        self.print_status("error", message, || {
            eprintln!("{} {}", "✗".red().bold(), message.red())
        })
    }

    /// Print an info message
    pub fn print_info(&self, message: &str) -> Result<()> {
        self.print_status("info", message, || {
            println!("{} {}", "ℹ".blue().bold(), message.blue())
        })
    }

    fn print_status(&self, status: &str, message: &str, plain: impl FnOnce()) -> Result<()> {
        match self.format {
            OutputFormat::Json => {
                let result = serde_json::json!({
                    "status": status,
                    "message": message
                });
                println!("{}", serde_json::to_string_pretty(&result)?);
            }
            OutputFormat::Table => plain(),
        }
        Ok(())
    }
}

/// Format an offset the way drivers display it
pub fn format_offset(offset: Option<i32>) -> String {
    match offset {
        Some(offset) => format!("{:+} MHz", offset),
        None => "-".to_string(),
    }
}

/// Format milliseconds as a short human duration
pub fn format_duration_ms(ms: u64) -> String {
    let seconds = ms / 1000;
    if ms < 1000 {
        format!("{}ms", ms)
    } else if seconds < 60 {
        format!("{:.1}s", ms as f64 / 1000.0)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}

/// Colour a verdict or device state label
pub fn colorize_status(status: &str) -> ColoredString {
    match status.to_lowercase().as_str() {
        "stable" | "completed" | "stock" | "saved" => status.green(),
        "unstable" | "faulted" | "timed out" | "indeterminate" => status.red(),
        s if s.starts_with("rolled back") || s.starts_with("stable(") => status.yellow(),
        _ => status.normal(),
    }
}

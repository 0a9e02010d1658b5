//! Output formatting

use clap::ValueEnum;
use serde::Serialize;

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Table,
    Json,
    Yaml,
}

impl OutputFormat {
    /// Print serializable data; `Table` callers usually print a
    /// [`tabled`] table themselves and fall back here otherwise
    pub fn print<T: Serialize>(&self, data: &T) {
        match self {
            OutputFormat::Json => {
                println!("{}", serde_json::to_string_pretty(data).unwrap_or_default());
            }
            OutputFormat::Yaml => {
                println!("{}", serde_yaml::to_string(data).unwrap_or_default());
            }
            OutputFormat::Table => {
                println!("{}", serde_json::to_string_pretty(data).unwrap_or_default());
            }
        }
    }

    /// Print rows as a table, or as structured data for json/yaml
    pub fn print_rows<T: Serialize + tabled::Tabled>(&self, rows: &[T]) {
        match self {
            OutputFormat::Table => {
                if rows.is_empty() {
                    println!("(none)");
                } else {
                    println!("{}", tabled::Table::new(rows));
                }
            }
            other => other.print(&rows),
        }
    }

    pub fn is_table(&self) -> bool {
        matches!(self, OutputFormat::Table)
    }
}

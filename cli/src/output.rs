//! Output formatting

use anyhow::Result;
use clap::ValueEnum;
use colored::Colorize;
use serde::Serialize;
use tabled::{Table, Tabled};

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Table,
    Json,
    Yaml,
}

impl OutputFormat {
    /// Print a list of rows
    pub fn print_rows<T: Serialize + Tabled>(&self, rows: &[T]) -> Result<()> {
        match self {
            OutputFormat::Table => println!("{}", Table::new(rows)),
            _ => self.print(&rows)?,
        }
        Ok(())
    }

    /// Print a single document. Tables fall back to YAML.
    pub fn print<T: Serialize + ?Sized>(&self, data: &T) -> Result<()> {
        match self {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(data)?),
            OutputFormat::Yaml | OutputFormat::Table => print!("{}", serde_yaml::to_string(data)?),
        }
        Ok(())
    }

    pub fn is_table(&self) -> bool {
        matches!(self, OutputFormat::Table)
    }
}

pub fn print_success(message: &str) {
    eprintln!("{} {}", "✓".green().bold(), message);
}

pub fn print_warning(message: &str) {
    eprintln!("{} {}", "!".yellow().bold(), message);
}

pub fn print_info(message: &str) {
    eprintln!("{} {}", "•".blue(), message);
}

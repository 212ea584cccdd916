pub mod annotate;
pub mod attempts;
pub mod init;
pub mod mapping;
pub mod parse;
pub mod patterns;
pub mod sessions;
pub mod status;
pub mod upload;

use clap::{Parser, Subcommand};
use colored::Colorize;
use comfy_table::{Cell, Table};

use crate::db::{get_connection, init_db};
use crate::error::{FerretError, Result};
use crate::fmt::{directed_money, percent, truncate};
use crate::models::{CanonicalField, ExtractedTransaction, FileType, ParseResult, ParsingMethod};
use crate::orchestrator::Orchestrator;
use crate::settings::load_settings;

#[derive(Parser)]
#[command(name = "ferret", about = "Pull transactions out of bank statements, invoices and receipts.")]
pub struct Cli {
    /// Log strategy decisions to stderr (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Choose a data directory and initialize the database.
    Init {
        /// Path for ferret data (default: platform data dir)
        #[arg(long = "data-dir")]
        data_dir: Option<String>,
    },
    /// Upload a document and open a parsing session for it.
    Upload {
        /// CSV, XLSX, PDF, text or image file
        file: String,
        /// Password for a protected document
        #[arg(long)]
        password: Option<String>,
    },
    /// Run the strategy pipeline on a session.
    Parse {
        session: String,
        /// Run only this strategy: column_mapping, regex_pattern, ai_fallback, manual_annotation
        #[arg(long, value_parser = parse_method)]
        method: Option<ParsingMethod>,
        /// Stop escalating after this many strategies
        #[arg(long = "max-attempts")]
        max_attempts: Option<usize>,
    },
    /// Inspect or confirm column mappings for tabular documents.
    Mapping {
        #[command(subcommand)]
        command: MappingCommands,
    },
    /// Manage regex extraction patterns.
    Patterns {
        #[command(subcommand)]
        command: PatternCommands,
    },
    /// Enter transactions by hand from the document's lines.
    Annotate {
        #[command(subcommand)]
        command: AnnotateCommands,
    },
    /// Show the attempt log of a session.
    Attempts { session: String },
    /// List, inspect, abandon or wait on sessions.
    Sessions {
        #[command(subcommand)]
        command: SessionCommands,
    },
    /// Show current database and summary statistics.
    Status,
}

#[derive(Subcommand)]
pub enum MappingCommands {
    /// Suggest a column mapping with a preview of the first rows.
    Suggest { session: String },
    /// Apply a mapping, e.g. --map date=Date --map amount="Amount USD".
    Submit {
        session: String,
        /// field=Column pair (repeatable)
        #[arg(long = "map", value_parser = parse_field_pair)]
        map: Vec<(CanonicalField, String)>,
        /// Start from the suggested mapping; --map entries override it
        #[arg(long)]
        suggested: bool,
    },
}

#[derive(Subcommand)]
pub enum PatternCommands {
    /// List patterns, best first.
    List {
        #[arg(long = "file-type", value_parser = parse_file_type)]
        file_type: Option<FileType>,
    },
    /// Dry-run a pattern against sample text without saving it.
    Test {
        pattern: String,
        /// group=field pair, e.g. 1=date (repeatable)
        #[arg(long = "group", value_parser = parse_group_pair, required = true)]
        groups: Vec<(usize, CanonicalField)>,
        /// Sample text; use --sample-file for a whole document
        #[arg(long, conflicts_with = "sample_file")]
        sample: Option<String>,
        #[arg(long = "sample-file")]
        sample_file: Option<String>,
    },
    /// Save a named pattern.
    Create {
        name: String,
        pattern: String,
        #[arg(long = "group", value_parser = parse_group_pair, required = true)]
        groups: Vec<(usize, CanonicalField)>,
        /// Restrict to one file type (default: any)
        #[arg(long = "file-type", value_parser = parse_file_type)]
        file_type: Option<FileType>,
    },
    /// Delete a user pattern. Built-ins cannot be deleted.
    Delete { id: i64 },
}

#[derive(Subcommand)]
pub enum AnnotateCommands {
    /// Print the document's lines with their indices.
    Lines { session: String },
    /// Pre-fill an annotation from one line.
    Suggest {
        session: String,
        #[arg(long)]
        line: usize,
    },
    /// Commit annotations from a JSON file or from --entry values.
    Commit {
        session: String,
        /// JSON array of {date, amount, description, type?, category?, merchant?, source_line?}
        #[arg(long, conflicts_with = "entries")]
        file: Option<String>,
        /// "YYYY-MM-DD|amount|description[|debit|credit]" (repeatable)
        #[arg(long = "entry")]
        entries: Vec<String>,
        /// Use the pre-filled suggestion for these line indices (repeatable)
        #[arg(long = "line")]
        lines: Vec<usize>,
    },
}

#[derive(Subcommand)]
pub enum SessionCommands {
    /// List sessions, newest first.
    List,
    /// Show one session with its transactions.
    Show { session: String },
    /// Abandon a session. Learned patterns are kept.
    Abandon { session: String },
    /// Poll until the session stops parsing.
    Wait { session: String },
}

fn parse_method(s: &str) -> std::result::Result<ParsingMethod, String> {
    s.parse().map_err(|e: FerretError| e.to_string())
}

fn parse_file_type(s: &str) -> std::result::Result<FileType, String> {
    s.parse().map_err(|e: FerretError| e.to_string())
}

fn parse_field_pair(s: &str) -> std::result::Result<(CanonicalField, String), String> {
    let (field, column) = s
        .split_once('=')
        .ok_or_else(|| format!("expected field=Column, got '{s}'"))?;
    let field: CanonicalField = field.parse().map_err(|e: FerretError| e.to_string())?;
    Ok((field, column.to_string()))
}

fn parse_group_pair(s: &str) -> std::result::Result<(usize, CanonicalField), String> {
    let (group, field) = s
        .split_once('=')
        .ok_or_else(|| format!("expected group=field, got '{s}'"))?;
    let group: usize = group
        .trim()
        .parse()
        .map_err(|_| format!("'{group}' is not a capture group number"))?;
    let field: CanonicalField = field.parse().map_err(|e: FerretError| e.to_string())?;
    Ok((group, field))
}

/// Open the configured database. `init` must have run first.
pub(crate) fn open_orchestrator() -> Result<Orchestrator> {
    let settings = load_settings();
    settings.validate()?;
    let db_path = settings.db_path();
    if !db_path.exists() {
        return Err(FerretError::Other(
            "Database not found. Run `ferret init` to set up.".to_string(),
        ));
    }
    let conn = get_connection(&db_path)?;
    init_db(&conn)?;
    Ok(Orchestrator::new(conn, settings))
}

pub(crate) fn transactions_table(txns: &[ExtractedTransaction]) -> Table {
    let mut table = Table::new();
    table.set_header(vec!["#", "Date", "Description", "Amount", "Type", "Confidence"]);
    for (i, t) in txns.iter().enumerate() {
        table.add_row(vec![
            Cell::new(i + 1),
            Cell::new(&t.date),
            Cell::new(truncate(&t.description, 40)),
            Cell::new(directed_money(t.amount, t.txn_type)),
            Cell::new(t.txn_type.key()),
            Cell::new(percent(t.confidence)),
        ]);
    }
    table
}

pub(crate) fn print_parse_result(result: &ParseResult) {
    if result.success {
        let method = result.parsing_method.map_or("unknown", |m| m.name());
        println!(
            "{} {} transaction(s) via {} ({} confidence)",
            "Parsed".green().bold(),
            result.total_transactions,
            method,
            percent(result.confidence)
        );
        println!("{}", transactions_table(&result.transactions));
    } else if result.requires_manual_correction {
        println!(
            "{} {}",
            "Needs manual correction:".yellow().bold(),
            result.error.as_deref().unwrap_or("no strategy was confident enough")
        );
        if let Some(data) = &result.manual_correction_data {
            if !data.columns.is_empty() {
                println!("Columns: {}", data.columns.join(", "));
            }
            println!("{} line(s) available for annotation", data.text_content.len());
        }
    } else {
        println!(
            "{} {}",
            "Not parsed:".red().bold(),
            result.error.as_deref().unwrap_or("unknown error")
        );
    }

    if let Some(validation) = &result.validation {
        for warning in &validation.warnings {
            println!("  {} {warning}", "warning:".yellow());
        }
        for suggestion in &validation.suggestions {
            println!("  {} {suggestion}", "hint:".dimmed());
        }
    }
    println!("Session state: {}", result.state);
}

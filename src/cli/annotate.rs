use colored::Colorize;
use comfy_table::{Cell, Table};

use crate::error::{FerretError, Result};
use crate::fmt::money;
use crate::models::{ManualAnnotation, TransactionType};
use crate::normalize::parse_amount;

pub fn lines(session: &str) -> Result<()> {
    let orch = super::open_orchestrator()?;
    let lines = orch.annotation_lines(session)?;
    if lines.is_empty() {
        println!("No text lines to annotate.");
        return Ok(());
    }
    let width = lines.len().to_string().len();
    for (i, line) in lines.iter().enumerate() {
        println!("{} {line}", format!("{i:>width$}").dimmed());
    }
    Ok(())
}

pub fn suggest(session: &str, line: usize) -> Result<()> {
    let orch = super::open_orchestrator()?;
    let draft = orch.suggest_annotation(session, line)?;

    println!("Line {}: {}", draft.line_index, draft.line);
    let mut table = Table::new();
    table.set_header(vec!["Field", "Suggested"]);
    let missing = || "(not found)".yellow().to_string();
    table.add_row(vec![
        Cell::new("date"),
        Cell::new(draft.date.clone().unwrap_or_else(missing)),
    ]);
    table.add_row(vec![
        Cell::new("amount"),
        Cell::new(draft.amount.map(money).unwrap_or_else(missing)),
    ]);
    table.add_row(vec![Cell::new("description"), Cell::new(&draft.description)]);
    table.add_row(vec![Cell::new("type"), Cell::new(draft.txn_type.key())]);
    println!("{table}");
    Ok(())
}

pub fn commit(session: &str, file: Option<String>, entries: Vec<String>, lines: Vec<usize>) -> Result<()> {
    let orch = super::open_orchestrator()?;

    let mut annotations: Vec<ManualAnnotation> = match file {
        Some(path) => {
            let content = std::fs::read_to_string(&path)?;
            serde_json::from_str(&content)?
        }
        None => Vec::new(),
    };
    for entry in &entries {
        annotations.push(parse_entry(entry)?);
    }
    for line in lines {
        annotations.push(orch.suggest_annotation(session, line)?.into_annotation());
    }

    let result = orch.submit_manual_annotations(session, &annotations)?;
    super::print_parse_result(&result);
    Ok(())
}

/// `date|amount|description[|type]`. A negative amount implies credit
/// unless a type is given.
fn parse_entry(entry: &str) -> Result<ManualAnnotation> {
    let parts: Vec<&str> = entry.split('|').map(str::trim).collect();
    if !(3..=4).contains(&parts.len()) {
        return Err(FerretError::Other(format!(
            "expected date|amount|description[|type], got '{entry}'"
        )));
    }
    let signed = parse_amount(parts[1])
        .ok_or_else(|| FerretError::Other(format!("'{}' is not an amount", parts[1])))?;
    let txn_type = match parts.get(3) {
        Some(t) => t.parse()?,
        None => TransactionType::from_signed(signed),
    };
    Ok(ManualAnnotation {
        date: parts[0].to_string(),
        amount: signed.abs(),
        description: parts[2].to_string(),
        txn_type: Some(txn_type),
        category: None,
        merchant: None,
        source_line: None,
    })
}

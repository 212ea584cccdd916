use colored::Colorize;
use comfy_table::{Cell, Table};

use crate::error::{FerretError, Result};
use crate::fmt::percent;
use crate::models::{CanonicalField, FieldMapping};

pub fn suggest(session: &str) -> Result<()> {
    let orch = super::open_orchestrator()?;
    let s = orch.get_column_mapping_suggestions(session)?;

    let mut table = Table::new();
    table.set_header(vec!["Column", "Field", "Confidence", "Source"]);
    for column in &s.columns {
        match s.suggested_mapping.iter().find(|m| &m.source_column == column) {
            Some(m) => table.add_row(vec![
                Cell::new(column),
                Cell::new(m.field.key().bold()),
                Cell::new(percent(m.confidence)),
                Cell::new(if m.learned { "learned" } else { "heuristic" }),
            ]),
            None => table.add_row(vec![
                Cell::new(column),
                Cell::new("-".dimmed()),
                Cell::new(""),
                Cell::new(""),
            ]),
        };
    }
    println!("Suggested mapping\n{table}");

    if !s.sample_rows.is_empty() {
        let mut preview = Table::new();
        preview.set_header(s.columns.clone());
        for row in &s.sample_rows {
            preview.add_row(row.clone());
        }
        println!("Preview\n{preview}");
    }

    let required: Vec<&str> = s.required_fields.iter().map(|f| f.key()).collect();
    println!("Required: {} (debit + credit may stand in for amount)", required.join(", "));
    if !s.learned_mappings.is_empty() {
        println!("{} learned pairing(s) exist for this column layout.", s.learned_mappings.len());
    }
    Ok(())
}

pub fn submit(session: &str, pairs: Vec<(CanonicalField, String)>, suggested: bool) -> Result<()> {
    if pairs.is_empty() && !suggested {
        return Err(FerretError::Other(
            "Give at least one --map field=Column or use --suggested".to_string(),
        ));
    }
    let orch = super::open_orchestrator()?;
    let mut mapping: FieldMapping = if suggested {
        orch.get_column_mapping_suggestions(session)?.field_mapping()
    } else {
        FieldMapping::new()
    };
    for (field, column) in pairs {
        // One field per column: an explicit pair replaces whatever held that column.
        mapping.retain(|_, c| c != &column);
        mapping.insert(field, column);
    }
    let result = orch.submit_column_mapping(session, &mapping)?;
    super::print_parse_result(&result);
    Ok(())
}

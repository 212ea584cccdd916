use colored::Colorize;
use comfy_table::{Cell, Table};

use crate::error::{FerretError, Result};
use crate::fmt::percent;
use crate::models::{CanonicalField, FileType, GroupMapping, PatternDefinition};

pub fn list(file_type: Option<FileType>) -> Result<()> {
    let orch = super::open_orchestrator()?;
    let patterns = orch.list_patterns(file_type)?;

    let mut table = Table::new();
    table.set_header(vec!["ID", "Name", "File type", "Groups", "Success", "Failure", "Confidence"]);
    for p in patterns {
        let groups: Vec<String> = p
            .group_mappings
            .iter()
            .map(|(g, f)| format!("{g}={f}"))
            .collect();
        let name = if p.is_builtin {
            format!("{} {}", p.name, "(built-in)".dimmed())
        } else {
            p.name
        };
        table.add_row(vec![
            Cell::new(p.id),
            Cell::new(name),
            Cell::new(p.file_type.map_or("any".to_string(), |t| t.to_string())),
            Cell::new(groups.join(" ")),
            Cell::new(p.success_count),
            Cell::new(p.failure_count),
            Cell::new(percent(p.confidence)),
        ]);
    }
    println!("Patterns\n{table}");
    Ok(())
}

pub fn test(
    pattern: &str,
    groups: Vec<(usize, CanonicalField)>,
    sample: Option<String>,
    sample_file: Option<String>,
) -> Result<()> {
    let text = match (sample, sample_file) {
        (Some(text), _) => text,
        (None, Some(path)) => std::fs::read_to_string(path)?,
        (None, None) => {
            return Err(FerretError::Other("Give --sample or --sample-file".to_string()));
        }
    };
    let groups: GroupMapping = groups.into_iter().collect();
    let orch = super::open_orchestrator()?;
    let result = orch.test_regex_pattern(pattern, &text, &groups)?;

    if !result.is_valid {
        println!(
            "{} {}",
            "Invalid pattern:".red().bold(),
            result.error.unwrap_or_default()
        );
        return Ok(());
    }
    println!("{} line(s) matched", result.match_count);
    if result.matches.is_empty() {
        return Ok(());
    }
    let fields: Vec<CanonicalField> = groups.values().copied().collect();
    let mut table = Table::new();
    let mut header = vec!["Line".to_string()];
    header.extend(fields.iter().map(|f| f.key().to_string()));
    table.set_header(header);
    for m in &result.matches {
        let mut row = vec![Cell::new(m.line_index)];
        row.extend(
            fields
                .iter()
                .map(|f| Cell::new(m.fields.get(f).map(String::as_str).unwrap_or(""))),
        );
        table.add_row(row);
    }
    println!("{table}");
    Ok(())
}

pub fn create(
    name: &str,
    pattern: &str,
    groups: Vec<(usize, CanonicalField)>,
    file_type: Option<FileType>,
) -> Result<()> {
    let orch = super::open_orchestrator()?;
    let id = orch.create_regex_pattern(&PatternDefinition {
        name: name.to_string(),
        file_type,
        pattern: pattern.to_string(),
        group_mappings: groups.into_iter().collect(),
    })?;
    println!("Created pattern {id}: {name}");
    Ok(())
}

pub fn delete(id: i64) -> Result<()> {
    let orch = super::open_orchestrator()?;
    orch.delete_pattern(id)?;
    println!("Deleted pattern {id}");
    Ok(())
}

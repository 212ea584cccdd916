use colored::Colorize;
use comfy_table::{Cell, Table};

use crate::error::Result;
use crate::fmt::{duration_ms, percent};
use crate::models::{AttemptStatus, ParsingAttempt};

pub(crate) fn attempts_table(attempts: &[ParsingAttempt]) -> Table {
    let mut table = Table::new();
    table.set_header(vec!["#", "Method", "Status", "Found", "Confidence", "Time", "Reason"]);
    for a in attempts {
        let status = match a.status {
            AttemptStatus::Success => a.status.key().green().to_string(),
            AttemptStatus::Failed => a.status.key().red().to_string(),
            _ => a.status.key().to_string(),
        };
        table.add_row(vec![
            Cell::new(a.sequence),
            Cell::new(a.method.name()),
            Cell::new(status),
            Cell::new(a.transactions_found),
            Cell::new(percent(a.confidence)),
            Cell::new(duration_ms(a.duration_ms)),
            Cell::new(a.error_message.as_deref().unwrap_or("")),
        ]);
    }
    table
}

pub fn run(session: &str) -> Result<()> {
    let orch = super::open_orchestrator()?;
    let attempts = orch.get_parsing_attempts(session)?;
    if attempts.is_empty() {
        println!("No attempts yet for session {session}.");
        return Ok(());
    }
    println!("Attempts for {session}\n{}", attempts_table(&attempts));
    Ok(())
}

use colored::Colorize;
use comfy_table::{Cell, Table};

use crate::error::Result;
use crate::models::SessionState;

fn colored_state(state: SessionState) -> String {
    let label = state.to_string();
    match state {
        SessionState::Succeeded => label.green().to_string(),
        SessionState::RequiresManualCorrection => label.yellow().to_string(),
        SessionState::Abandoned => label.dimmed().to_string(),
        SessionState::Created | SessionState::Parsing => label,
    }
}

pub fn list() -> Result<()> {
    let orch = super::open_orchestrator()?;
    let sessions = orch.list_sessions()?;
    if sessions.is_empty() {
        println!("No sessions yet. Start with `ferret upload <file>`.");
        return Ok(());
    }

    let mut table = Table::new();
    table.set_header(vec!["ID", "File", "Type", "State", "Method", "Attempts", "Transactions", "Created"]);
    for s in sessions {
        table.add_row(vec![
            Cell::new(&s.id),
            Cell::new(&s.file_name),
            Cell::new(s.file_type.key()),
            Cell::new(colored_state(s.state)),
            Cell::new(s.final_method.map_or("", |m| m.key())),
            Cell::new(s.attempts),
            Cell::new(s.transactions),
            Cell::new(&s.created_at),
        ]);
    }
    println!("Sessions\n{table}");
    Ok(())
}

pub fn show(session: &str) -> Result<()> {
    let orch = super::open_orchestrator()?;
    let s = orch.get_session(session)?;

    println!("Session:  {}", s.id);
    println!("File:     {} ({})", s.file_name, s.file_type);
    println!("Checksum: {}", s.checksum);
    println!("State:    {}", colored_state(s.state));
    if let Some(method) = s.final_method {
        println!("Parsed by {}", method.name());
    }
    println!();
    println!("{} attempt(s)", s.attempts.len());
    if !s.attempts.is_empty() {
        println!("{}", super::attempts::attempts_table(&s.attempts));
    }
    match &s.transactions {
        Some(txns) => println!("Transactions\n{}", super::transactions_table(txns)),
        None => println!("No transactions stored."),
    }
    if !s.state.is_terminal() && s.state != SessionState::Parsing {
        println!("Resume with `ferret parse {}`", s.id);
    }
    Ok(())
}

pub fn abandon(session: &str) -> Result<()> {
    let orch = super::open_orchestrator()?;
    orch.abandon_session(session)?;
    println!("Abandoned session {session}. Learned patterns were kept.");
    Ok(())
}

pub fn wait(session: &str) -> Result<()> {
    let orch = super::open_orchestrator()?;
    let outcome = orch.wait_for_settled(session)?;
    if outcome.timed_out {
        println!(
            "Still {} after {}s; run `ferret sessions wait {session}` again to keep waiting.",
            outcome.state,
            orch.settings().poll_ceiling_secs
        );
    } else {
        println!("Session {session} is {}", colored_state(outcome.state));
    }
    Ok(())
}

use crate::error::Result;
use crate::fmt::{format_bytes, percent};
use crate::models::SessionState;
use crate::settings::load_settings;

pub fn run() -> Result<()> {
    let settings = load_settings();
    let db_path = settings.db_path();

    println!("Data dir:   {}", settings.data_dir);
    println!("Database:   {}", db_path.display());
    println!("Threshold:  {}", percent(settings.acceptance_threshold));
    println!(
        "AI service: {}",
        settings.ai_endpoint.as_deref().unwrap_or("(not configured)")
    );

    if !db_path.exists() {
        println!();
        println!("Database not found. Run `ferret init` to set up.");
        return Ok(());
    }

    let size = std::fs::metadata(&db_path)?.len();
    println!("DB size:    {}", format_bytes(size));

    let orch = super::open_orchestrator()?;
    let conn = orch.conn();
    println!();
    for state in [
        SessionState::Created,
        SessionState::Parsing,
        SessionState::Succeeded,
        SessionState::RequiresManualCorrection,
        SessionState::Abandoned,
    ] {
        let count: i64 = conn.query_row(
            "SELECT count(*) FROM sessions WHERE state = ?1",
            [state.key()],
            |r| r.get(0),
        )?;
        if count > 0 {
            println!("{:<26} {count}", format!("Sessions {state}:"));
        }
    }
    let transactions: i64 =
        conn.query_row("SELECT count(*) FROM session_transactions", [], |r| r.get(0))?;
    let patterns: i64 = conn.query_row("SELECT count(*) FROM regex_patterns", [], |r| r.get(0))?;
    let mappings: i64 = conn.query_row("SELECT count(*) FROM column_mappings", [], |r| r.get(0))?;
    println!("{:<26} {transactions}", "Transactions:");
    println!("{:<26} {patterns}", "Regex patterns:");
    println!("{:<26} {mappings}", "Learned column mappings:");
    Ok(())
}

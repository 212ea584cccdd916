use crate::error::Result;
use crate::models::ParsingMethod;

pub fn run(session: &str, method: Option<ParsingMethod>, max_attempts: Option<usize>) -> Result<()> {
    let orch = super::open_orchestrator()?;
    let result = orch.run_multi_level_parse(session, method, max_attempts)?;
    super::print_parse_result(&result);
    if result.requires_manual_correction {
        println!();
        println!("Try `ferret mapping suggest {session}`, `ferret patterns test` or `ferret annotate lines {session}`.");
    }
    Ok(())
}

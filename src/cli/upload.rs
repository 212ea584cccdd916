use std::path::Path;

use colored::Colorize;

use crate::error::{FerretError, Result};

pub fn run(file: &str, password: Option<&str>) -> Result<()> {
    let path = Path::new(file);
    if !path.exists() {
        return Err(FerretError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("{file} does not exist"),
        )));
    }
    let orch = super::open_orchestrator()?;
    let outcome = orch.upload_document(path, password)?;

    if outcome.requires_password {
        println!(
            "{} {file} is password protected; re-run with --password",
            "Locked:".yellow().bold()
        );
        return Ok(());
    }
    let Some(id) = outcome.session_id else {
        return Ok(());
    };
    if outcome.duplicate {
        println!("Already uploaded as session {id}");
    } else {
        println!("Uploaded {file} ({}) as session {}", outcome.file_type, id.bold());
        println!("Next: ferret parse {id}");
    }
    Ok(())
}

mod cli;
mod db;
mod document;
mod error;
mod fmt;
mod models;
mod normalize;
mod orchestrator;
mod pattern_store;
mod session;
mod settings;
mod strategy;
mod validation;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{AnnotateCommands, Cli, Commands, MappingCommands, PatternCommands, SessionCommands};

fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "ferret=debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Commands::Init { data_dir } => cli::init::run(data_dir),
        Commands::Upload { file, password } => cli::upload::run(&file, password.as_deref()),
        Commands::Parse {
            session,
            method,
            max_attempts,
        } => cli::parse::run(&session, method, max_attempts),
        Commands::Mapping { command } => match command {
            MappingCommands::Suggest { session } => cli::mapping::suggest(&session),
            MappingCommands::Submit {
                session,
                map,
                suggested,
            } => cli::mapping::submit(&session, map, suggested),
        },
        Commands::Patterns { command } => match command {
            PatternCommands::List { file_type } => cli::patterns::list(file_type),
            PatternCommands::Test {
                pattern,
                groups,
                sample,
                sample_file,
            } => cli::patterns::test(&pattern, groups, sample, sample_file),
            PatternCommands::Create {
                name,
                pattern,
                groups,
                file_type,
            } => cli::patterns::create(&name, &pattern, groups, file_type),
            PatternCommands::Delete { id } => cli::patterns::delete(id),
        },
        Commands::Annotate { command } => match command {
            AnnotateCommands::Lines { session } => cli::annotate::lines(&session),
            AnnotateCommands::Suggest { session, line } => cli::annotate::suggest(&session, line),
            AnnotateCommands::Commit {
                session,
                file,
                entries,
                lines,
            } => cli::annotate::commit(&session, file, entries, lines),
        },
        Commands::Attempts { session } => cli::attempts::run(&session),
        Commands::Sessions { command } => match command {
            SessionCommands::List => cli::sessions::list(),
            SessionCommands::Show { session } => cli::sessions::show(&session),
            SessionCommands::Abandon { session } => cli::sessions::abandon(&session),
            SessionCommands::Wait { session } => cli::sessions::wait(&session),
        },
        Commands::Status => cli::status::run(),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

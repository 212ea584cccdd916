use thiserror::Error;

#[derive(Error, Debug)]
pub enum FerretError {
    #[error("Database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[cfg(feature = "spreadsheet")]
    #[error("Spreadsheet error: {0}")]
    Spreadsheet(#[from] calamine::Error),

    #[cfg(feature = "ai")]
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Document is password protected")]
    EncryptedDocument,

    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),

    #[error("Incomplete mapping, missing required fields: {}", .0.join(", "))]
    IncompleteMapping(Vec<String>),

    #[error("No transactions found")]
    NoMatchFound,

    #[error("Strategy unavailable: {0}")]
    StrategyUnavailable(String),

    #[error("Invalid annotation: {}", format_field_errors(.0))]
    ValidationError(Vec<FieldError>),

    #[error("Unknown session: {0}")]
    UnknownSession(String),

    #[error("Cannot {event} a session that is {state}")]
    InvalidTransition { state: String, event: String },

    #[error("Unsupported file: {0}")]
    UnsupportedFile(String),

    #[error("Unknown pattern: {0}")]
    UnknownPattern(i64),

    #[error("Built-in pattern {0} cannot be deleted")]
    BuiltInPattern(i64),

    #[error("Settings error: {0}")]
    Settings(String),

    #[error("{0}")]
    Other(String),
}

/// One offending field of a manual annotation.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldError {
    pub index: usize,
    pub field: &'static str,
    pub message: String,
}

fn format_field_errors(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(|e| format!("#{} {}: {}", e.index + 1, e.field, e.message))
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, FerretError>;

pub mod ai;
pub mod column_mapping;
pub mod manual;
pub mod regex_pattern;

use rusqlite::Connection;

use crate::document::Document;
use crate::error::FerretError;
use crate::models::{ExtractedTransaction, FieldMapping, ParsingMethod};
use crate::settings::Settings;

use self::ai::AiExtractor;

/// Everything a strategy may read. Strategies never touch session state.
pub struct StrategyContext<'a> {
    pub conn: &'a Connection,
    pub document: &'a Document,
    pub settings: &'a Settings,
    pub ai: &'a dyn AiExtractor,
}

/// Write-back the orchestrator performs if the attempt is accepted.
#[derive(Debug, Clone, PartialEq)]
pub enum Learning {
    None,
    Mapping { signature: String, mapping: FieldMapping },
}

#[derive(Debug)]
pub enum AttemptOutcome {
    Extracted {
        transactions: Vec<ExtractedTransaction>,
        confidence: f64,
        learning: Learning,
        detail: Option<String>,
    },
    Failed(FerretError),
    /// The strategy needs caller input before it can produce anything.
    AwaitingInput,
}

impl ParsingMethod {
    /// Whether this strategy can run against `document` at all.
    pub fn applies_to(&self, document: &Document) -> bool {
        match self {
            Self::ColumnMapping => document.file_type.is_tabular() && document.table.is_some(),
            Self::RegexPattern => !document.lines.is_empty(),
            Self::AiFallback | Self::ManualAnnotation => true,
        }
    }

    pub fn attempt(&self, ctx: &StrategyContext<'_>) -> AttemptOutcome {
        match self {
            Self::ColumnMapping => column_mapping::attempt(ctx),
            Self::RegexPattern => regex_pattern::attempt(ctx),
            Self::AiFallback => ai::attempt(ctx),
            Self::ManualAnnotation => manual::attempt(ctx),
        }
    }
}

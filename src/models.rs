use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::error::{FerretError, Result};

// ---------------------------------------------------------------------------
// File types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    Csv,
    Spreadsheet,
    Pdf,
    Text,
    Image,
}

impl FileType {
    pub fn key(&self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Spreadsheet => "spreadsheet",
            Self::Pdf => "pdf",
            Self::Text => "text",
            Self::Image => "image",
        }
    }

    /// Delimited and spreadsheet inputs carry a header row the column mapper can use.
    pub fn is_tabular(&self) -> bool {
        matches!(self, Self::Csv | Self::Spreadsheet)
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for FileType {
    type Err = FerretError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "csv" => Ok(Self::Csv),
            "spreadsheet" => Ok(Self::Spreadsheet),
            "pdf" => Ok(Self::Pdf),
            "text" => Ok(Self::Text),
            "image" => Ok(Self::Image),
            other => Err(FerretError::UnsupportedFile(format!("unknown file type '{other}'"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Session state machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Parsing,
    Succeeded,
    RequiresManualCorrection,
    Abandoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Start,
    Succeed,
    Exhaust,
    Cancel,
}

impl SessionEvent {
    pub(crate) fn verb(&self) -> &'static str {
        match self {
            Self::Start => "start parsing",
            Self::Succeed => "complete",
            Self::Exhaust => "exhaust",
            Self::Cancel => "abandon",
        }
    }
}

impl SessionState {
    pub fn key(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Parsing => "parsing",
            Self::Succeeded => "succeeded",
            Self::RequiresManualCorrection => "requires_manual_correction",
            Self::Abandoned => "abandoned",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Abandoned)
    }

    /// Next state for `event`, or `InvalidTransition` if the event is not allowed here.
    pub fn transition(self, event: SessionEvent) -> Result<SessionState> {
        use SessionEvent as E;
        use SessionState as S;
        let next = match (self, event) {
            (S::Created | S::RequiresManualCorrection, E::Start) => S::Parsing,
            (S::Parsing, E::Succeed) => S::Succeeded,
            (S::Parsing, E::Exhaust) => S::RequiresManualCorrection,
            (S::Created | S::Parsing | S::RequiresManualCorrection, E::Cancel) => S::Abandoned,
            _ => {
                return Err(FerretError::InvalidTransition {
                    state: self.key().replace('_', " "),
                    event: event.verb().to_string(),
                })
            }
        };
        Ok(next)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for SessionState {
    type Err = FerretError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "created" => Ok(Self::Created),
            "parsing" => Ok(Self::Parsing),
            "succeeded" => Ok(Self::Succeeded),
            "requires_manual_correction" => Ok(Self::RequiresManualCorrection),
            "abandoned" => Ok(Self::Abandoned),
            other => Err(FerretError::Other(format!("unknown session state '{other}'"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Strategies and attempts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParsingMethod {
    ColumnMapping,
    RegexPattern,
    AiFallback,
    ManualAnnotation,
}

impl ParsingMethod {
    /// Escalation order, cheapest first.
    pub const PRIORITY: [ParsingMethod; 4] = [
        Self::ColumnMapping,
        Self::RegexPattern,
        Self::AiFallback,
        Self::ManualAnnotation,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            Self::ColumnMapping => "column_mapping",
            Self::RegexPattern => "regex_pattern",
            Self::AiFallback => "ai_fallback",
            Self::ManualAnnotation => "manual_annotation",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::ColumnMapping => "Column mapping",
            Self::RegexPattern => "Regex pattern",
            Self::AiFallback => "AI fallback",
            Self::ManualAnnotation => "Manual annotation",
        }
    }
}

impl fmt::Display for ParsingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for ParsingMethod {
    type Err = FerretError;

    fn from_str(s: &str) -> Result<Self> {
        Self::PRIORITY
            .iter()
            .find(|m| m.key() == s)
            .copied()
            .ok_or_else(|| FerretError::Other(format!("unknown parsing method '{s}'")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Pending,
    InProgress,
    Success,
    Failed,
}

impl AttemptStatus {
    pub fn key(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for AttemptStatus {
    type Err = FerretError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            other => Err(FerretError::Other(format!("unknown attempt status '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsingAttempt {
    pub sequence: i64,
    pub method: ParsingMethod,
    pub status: AttemptStatus,
    pub transactions_found: usize,
    pub confidence: f64,
    pub error_message: Option<String>,
    pub duration_ms: u64,
}

/// An attempt that is still running. Only finished attempts reach the log.
pub struct RunningAttempt {
    method: ParsingMethod,
    started: Instant,
}

impl RunningAttempt {
    pub fn start(method: ParsingMethod) -> Self {
        Self {
            method,
            started: Instant::now(),
        }
    }

    pub fn status(&self) -> AttemptStatus {
        AttemptStatus::InProgress
    }

    pub fn succeed(self, transactions_found: usize, confidence: f64) -> ParsingAttempt {
        self.finish(AttemptStatus::Success, transactions_found, confidence, None)
    }

    pub fn fail(self, transactions_found: usize, confidence: f64, message: String) -> ParsingAttempt {
        self.finish(AttemptStatus::Failed, transactions_found, confidence, Some(message))
    }

    fn finish(
        self,
        status: AttemptStatus,
        transactions_found: usize,
        confidence: f64,
        error_message: Option<String>,
    ) -> ParsingAttempt {
        ParsingAttempt {
            // assigned by the session log on append
            sequence: 0,
            method: self.method,
            status,
            transactions_found,
            confidence,
            error_message,
            duration_ms: self.started.elapsed().as_millis() as u64,
        }
    }
}

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Debit,
    Credit,
}

impl TransactionType {
    pub fn key(&self) -> &'static str {
        match self {
            Self::Debit => "debit",
            Self::Credit => "credit",
        }
    }

    /// Negative source amounts are money coming back in.
    pub fn from_signed(amount: f64) -> Self {
        if amount < 0.0 {
            Self::Credit
        } else {
            Self::Debit
        }
    }
}

impl FromStr for TransactionType {
    type Err = FerretError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "debit" | "expense" | "dr" | "d" => Ok(Self::Debit),
            "credit" | "income" | "cr" | "c" => Ok(Self::Credit),
            other => Err(FerretError::Other(format!("unknown transaction type '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedTransaction {
    pub date: String,
    pub amount: f64,
    pub description: String,
    #[serde(rename = "type")]
    pub txn_type: TransactionType,
    #[serde(default)]
    pub balance: Option<f64>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub merchant: Option<String>,
    #[serde(default)]
    pub reference: Option<String>,
    pub confidence: f64,
    pub source: ParsingMethod,
    #[serde(default)]
    pub source_line: Option<usize>,
}

impl ExtractedTransaction {
    /// Build a transaction from a signed amount; the sign moves into `txn_type`.
    pub fn from_signed(
        date: String,
        signed_amount: f64,
        description: String,
        confidence: f64,
        source: ParsingMethod,
    ) -> Self {
        Self {
            date,
            amount: signed_amount.abs(),
            description,
            txn_type: TransactionType::from_signed(signed_amount),
            balance: None,
            category: None,
            merchant: None,
            reference: None,
            confidence,
            source,
            source_line: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Column mappings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalField {
    Date,
    Amount,
    Description,
    Debit,
    Credit,
    Balance,
    Category,
    Merchant,
    Reference,
    AccountNumber,
}

impl CanonicalField {
    pub const ALL: [CanonicalField; 10] = [
        Self::Date,
        Self::Amount,
        Self::Description,
        Self::Debit,
        Self::Credit,
        Self::Balance,
        Self::Category,
        Self::Merchant,
        Self::Reference,
        Self::AccountNumber,
    ];

    pub const REQUIRED: [CanonicalField; 3] = [Self::Date, Self::Amount, Self::Description];

    pub fn key(&self) -> &'static str {
        match self {
            Self::Date => "date",
            Self::Amount => "amount",
            Self::Description => "description",
            Self::Debit => "debit",
            Self::Credit => "credit",
            Self::Balance => "balance",
            Self::Category => "category",
            Self::Merchant => "merchant",
            Self::Reference => "reference",
            Self::AccountNumber => "account_number",
        }
    }

    pub fn is_monetary(&self) -> bool {
        matches!(self, Self::Amount | Self::Debit | Self::Credit | Self::Balance)
    }
}

impl fmt::Display for CanonicalField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for CanonicalField {
    type Err = FerretError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .find(|f| f.key() == s.trim())
            .copied()
            .ok_or_else(|| FerretError::Other(format!("unknown field '{s}'")))
    }
}

/// Canonical field -> source column name, as submitted by a caller.
pub type FieldMapping = BTreeMap<CanonicalField, String>;

/// One suggested source column -> canonical field pairing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnMapping {
    pub source_column: String,
    pub field: CanonicalField,
    pub confidence: f64,
    pub learned: bool,
}

/// A learned pairing as persisted in the pattern store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearnedMapping {
    pub id: i64,
    pub file_type: FileType,
    pub signature: String,
    pub source_column: String,
    pub field: CanonicalField,
    pub success_count: i64,
    pub failure_count: i64,
    pub confidence: f64,
}

// ---------------------------------------------------------------------------
// Regex patterns
// ---------------------------------------------------------------------------

/// Capture group index -> canonical field. Unlisted groups are ignored.
pub type GroupMapping = BTreeMap<usize, CanonicalField>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegexPattern {
    pub id: i64,
    pub name: String,
    pub file_type: Option<FileType>,
    pub pattern: String,
    pub group_mappings: GroupMapping,
    pub success_count: i64,
    pub failure_count: i64,
    pub confidence: f64,
    pub is_builtin: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternDefinition {
    pub name: String,
    pub file_type: Option<FileType>,
    pub pattern: String,
    pub group_mappings: GroupMapping,
}

// ---------------------------------------------------------------------------
// Manual annotation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualAnnotation {
    pub date: String,
    pub amount: f64,
    pub description: String,
    #[serde(rename = "type", default)]
    pub txn_type: Option<TransactionType>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub merchant: Option<String>,
    #[serde(default)]
    pub source_line: Option<usize>,
}

/// Pre-filled annotation derived from one text line; every field is editable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationDraft {
    pub line_index: usize,
    pub line: String,
    pub date: Option<String>,
    pub amount: Option<f64>,
    pub description: String,
    pub txn_type: TransactionType,
}

impl AnnotationDraft {
    pub fn into_annotation(self) -> ManualAnnotation {
        ManualAnnotation {
            date: self.date.unwrap_or_default(),
            amount: self.amount.unwrap_or(0.0),
            description: self.description,
            txn_type: Some(self.txn_type),
            category: None,
            merchant: None,
            source_line: Some(self.line_index),
        }
    }
}

// ---------------------------------------------------------------------------
// Sessions and results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsingSession {
    pub id: String,
    pub file_name: String,
    pub file_path: String,
    pub file_type: FileType,
    pub checksum: String,
    pub state: SessionState,
    pub final_method: Option<ParsingMethod>,
    pub attempts: Vec<ParsingAttempt>,
    pub transactions: Option<Vec<ExtractedTransaction>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManualCorrectionData {
    pub text_content: Vec<String>,
    pub columns: Vec<String>,
    pub sample_data: Vec<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParseResult {
    pub success: bool,
    pub parsing_method: Option<ParsingMethod>,
    pub total_transactions: usize,
    pub transactions: Vec<ExtractedTransaction>,
    pub confidence: f64,
    pub state: SessionState,
    pub requires_manual_correction: bool,
    pub manual_correction_data: Option<ManualCorrectionData>,
    pub validation: Option<crate::validation::ValidationResult>,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let s = SessionState::Created.transition(SessionEvent::Start).unwrap();
        assert_eq!(s, SessionState::Parsing);
        assert_eq!(s.transition(SessionEvent::Succeed).unwrap(), SessionState::Succeeded);
    }

    #[test]
    fn test_manual_correction_is_resumable() {
        let s = SessionState::Parsing.transition(SessionEvent::Exhaust).unwrap();
        assert_eq!(s, SessionState::RequiresManualCorrection);
        assert!(!s.is_terminal());
        assert_eq!(s.transition(SessionEvent::Start).unwrap(), SessionState::Parsing);
        assert_eq!(s.transition(SessionEvent::Cancel).unwrap(), SessionState::Abandoned);
    }

    #[test]
    fn test_terminal_states_reject_events() {
        for state in [SessionState::Succeeded, SessionState::Abandoned] {
            assert!(state.is_terminal());
            for event in [SessionEvent::Start, SessionEvent::Succeed, SessionEvent::Exhaust, SessionEvent::Cancel] {
                assert!(state.transition(event).is_err(), "{state} accepted {event:?}");
            }
        }
    }

    #[test]
    fn test_created_cannot_succeed_without_parsing() {
        assert!(SessionState::Created.transition(SessionEvent::Succeed).is_err());
        assert!(SessionState::Parsing.transition(SessionEvent::Start).is_err());
    }

    #[test]
    fn test_from_signed_strips_sign() {
        let t = ExtractedTransaction::from_signed(
            "2024-01-16".into(),
            -2000.0,
            "Salary".into(),
            0.9,
            ParsingMethod::ColumnMapping,
        );
        assert_eq!(t.amount, 2000.0);
        assert_eq!(t.txn_type, TransactionType::Credit);
    }

    #[test]
    fn test_method_keys_roundtrip() {
        for m in ParsingMethod::PRIORITY {
            assert_eq!(m.key().parse::<ParsingMethod>().unwrap(), m);
        }
        assert!("ocr".parse::<ParsingMethod>().is_err());
    }

    #[test]
    fn test_transaction_type_aliases() {
        assert_eq!("income".parse::<TransactionType>().unwrap(), TransactionType::Credit);
        assert_eq!("Expense".parse::<TransactionType>().unwrap(), TransactionType::Debit);
    }
}

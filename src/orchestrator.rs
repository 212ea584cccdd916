use std::path::Path;

use rusqlite::Connection;
use serde::Serialize;

use crate::document::{self, Document};
use crate::error::{FerretError, Result};
use crate::models::{
    AnnotationDraft, ExtractedTransaction, FieldMapping, FileType, ManualAnnotation,
    ManualCorrectionData, ParseResult, ParsingAttempt, ParsingMethod, ParsingSession,
    PatternDefinition, RegexPattern, RunningAttempt, SessionEvent, SessionState,
};
use crate::pattern_store;
use crate::session::{self, NewSession, SessionSummary, WaitOutcome};
use crate::settings::Settings;
use crate::strategy::ai::{self, AiExtractor};
use crate::strategy::column_mapping::{self, MappingSuggestions, CONFIRMED_MAPPING_CONFIDENCE};
use crate::strategy::manual;
use crate::strategy::regex_pattern::{self, TestResult};
use crate::strategy::{AttemptOutcome, Learning, StrategyContext};
use crate::validation::{self, ValidationResult};

const CORRECTION_SAMPLE_ROWS: usize = 10;

#[derive(Debug, Clone, Serialize)]
pub struct UploadOutcome {
    pub session_id: Option<String>,
    pub file_type: FileType,
    pub requires_password: bool,
    /// The same bytes were uploaded before; `session_id` is that session.
    pub duplicate: bool,
}

pub struct Orchestrator {
    conn: Connection,
    settings: Settings,
    ai: Box<dyn AiExtractor>,
}

impl Orchestrator {
    pub fn new(conn: Connection, settings: Settings) -> Self {
        let ai = ai::from_settings(&settings);
        Self::with_extractor(conn, settings, ai)
    }

    pub fn with_extractor(conn: Connection, settings: Settings, ai: Box<dyn AiExtractor>) -> Self {
        Self { conn, settings, ai }
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    // -----------------------------------------------------------------------
    // Upload
    // -----------------------------------------------------------------------

    pub fn upload_document(&self, path: &Path, password: Option<&str>) -> Result<UploadOutcome> {
        let bytes = std::fs::read(path)?;
        let file_type = document::detect_file_type(path, &bytes)?;

        if document::is_encrypted(file_type, &bytes) {
            if password.is_none() {
                tracing::info!(path = %path.display(), "document is password protected");
                return Ok(UploadOutcome {
                    session_id: None,
                    file_type,
                    requires_password: true,
                    duplicate: false,
                });
            }
            return Err(FerretError::EncryptedDocument);
        }

        let checksum = document::compute_checksum(&bytes);
        if let Some(existing) = session::find_by_checksum(&self.conn, &checksum)? {
            tracing::info!(session_id = %existing, "document already uploaded");
            return Ok(UploadOutcome {
                session_id: Some(existing),
                file_type,
                requires_password: false,
                duplicate: true,
            });
        }

        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("upload")
            .to_string();
        let uploads = self.settings.uploads_dir();
        std::fs::create_dir_all(&uploads)?;
        let stored = uploads.join(format!("{}-{}", &checksum[..12], file_name));
        std::fs::write(&stored, &bytes)?;
        // Fail on unreadable content now rather than on the first parse.
        if let Err(e) = document::load_bytes(&stored, file_type, bytes) {
            let _ = std::fs::remove_file(&stored);
            return Err(e);
        }

        let id = session::create_session(
            &self.conn,
            &NewSession {
                file_name: &file_name,
                file_path: &stored.to_string_lossy(),
                file_type,
                checksum: &checksum,
            },
        )?;
        Ok(UploadOutcome {
            session_id: Some(id),
            file_type,
            requires_password: false,
            duplicate: false,
        })
    }

    fn load_document(&self, session: &ParsingSession) -> Result<Document> {
        let path = Path::new(&session.file_path);
        let bytes = std::fs::read(path)?;
        document::load_bytes(path, session.file_type, bytes)
    }

    // -----------------------------------------------------------------------
    // Column mapping
    // -----------------------------------------------------------------------

    pub fn get_column_mapping_suggestions(&self, session_id: &str) -> Result<MappingSuggestions> {
        let session = session::get_session(&self.conn, session_id)?;
        let doc = self.load_document(&session)?;
        let table = doc.table.as_ref().ok_or_else(|| {
            FerretError::UnsupportedFile(format!("{} has no columns to map", session.file_name))
        })?;
        column_mapping::suggest(&self.conn, table, self.settings.date_pivot_year)
    }

    /// Apply a caller-confirmed mapping. An incomplete mapping is rejected
    /// before the session is touched.
    pub fn submit_column_mapping(&self, session_id: &str, mapping: &FieldMapping) -> Result<ParseResult> {
        let session = session::get_session(&self.conn, session_id)?;
        session.state.transition(SessionEvent::Start)?;
        let doc = self.load_document(&session)?;
        let table = doc.table.as_ref().ok_or_else(|| {
            FerretError::UnsupportedFile(format!("{} has no columns to map", session.file_name))
        })?;
        let pivot = self.settings.date_pivot_year;
        let txns = column_mapping::apply(table, mapping, CONFIRMED_MAPPING_CONFIDENCE, pivot)?;

        session::apply_event(&self.conn, session_id, SessionEvent::Start, None)?;
        let running = RunningAttempt::start(ParsingMethod::ColumnMapping);
        let validation = validation::validate(&txns);
        // Invalid rows are reported, not held against an otherwise good mapping.
        let kept = valid_only(txns, &validation);
        let confidence = validation::validate(&kept).confidence;
        let accepted = !kept.is_empty() && confidence >= self.settings.acceptance_threshold;

        if let Err(e) = pattern_store::record_mapping_outcome(
            &self.conn,
            session.file_type,
            &table.signature(),
            mapping,
            accepted,
        ) {
            tracing::warn!(session_id, error = %e, "failed to record mapping outcome");
        }

        if accepted {
            let attempt = running.succeed(kept.len(), confidence);
            session::append_attempt(&self.conn, session_id, &attempt)?;
            return self.succeed(session_id, ParsingMethod::ColumnMapping, kept, validation);
        }
        let message = rejection_message(confidence, self.settings.acceptance_threshold, &validation);
        let attempt = running.fail(kept.len() + validation.invalid.len(), confidence, message.clone());
        session::append_attempt(&self.conn, session_id, &attempt)?;
        self.exhaust(session_id, &doc, Some(validation), message)
    }

    // -----------------------------------------------------------------------
    // Regex patterns
    // -----------------------------------------------------------------------

    /// Dry-run a pattern. A malformed pattern is reported in the result, not as an error.
    pub fn test_regex_pattern(
        &self,
        pattern: &str,
        sample_text: &str,
        group_mappings: &crate::models::GroupMapping,
    ) -> Result<TestResult> {
        match regex_pattern::test(pattern, sample_text, group_mappings) {
            Err(FerretError::InvalidPattern(msg)) => Ok(TestResult {
                is_valid: false,
                error: Some(msg),
                match_count: 0,
                matches: Vec::new(),
            }),
            other => other,
        }
    }

    pub fn create_regex_pattern(&self, definition: &PatternDefinition) -> Result<i64> {
        pattern_store::create_pattern(&self.conn, definition)
    }

    pub fn list_patterns(&self, file_type: Option<FileType>) -> Result<Vec<RegexPattern>> {
        pattern_store::list_patterns(&self.conn, file_type)
    }

    pub fn delete_pattern(&self, id: i64) -> Result<()> {
        pattern_store::delete_pattern(&self.conn, id)
    }

    // -----------------------------------------------------------------------
    // Progressive parse
    // -----------------------------------------------------------------------

    /// Run strategies in priority order until one clears the acceptance
    /// threshold. With `force_method` only that strategy runs.
    pub fn run_multi_level_parse(
        &self,
        session_id: &str,
        force_method: Option<ParsingMethod>,
        max_attempts: Option<usize>,
    ) -> Result<ParseResult> {
        let session = session::get_session(&self.conn, session_id)?;
        session.state.transition(SessionEvent::Start)?;
        let doc = self.load_document(&session)?;
        session::apply_event(&self.conn, session_id, SessionEvent::Start, None)?;

        let limit = max_attempts.unwrap_or(self.settings.max_attempts).max(1);
        let methods: Vec<ParsingMethod> = match force_method {
            Some(m) => vec![m],
            None => ParsingMethod::PRIORITY
                .into_iter()
                .filter(|m| m.applies_to(&doc))
                .collect(),
        };
        let ctx = StrategyContext {
            conn: &self.conn,
            document: &doc,
            settings: &self.settings,
            ai: self.ai.as_ref(),
        };
        let threshold = self.settings.acceptance_threshold;
        let mut last_error = String::from("no strategy applies to this document");

        for method in methods.into_iter().take(limit) {
            // Another process may abandon the session between strategies.
            if session::session_state(&self.conn, session_id)? == SessionState::Abandoned {
                tracing::info!(session_id, "session abandoned during parse");
                return Ok(abandoned_result());
            }

            let running = RunningAttempt::start(method);
            tracing::debug!(session_id, method = method.key(), status = running.status().key(), "trying strategy");
            let attempt = match method.attempt(&ctx) {
                AttemptOutcome::Extracted {
                    transactions,
                    confidence,
                    learning,
                    detail,
                } => {
                    let validation = validation::validate(&transactions);
                    let accepted = confidence >= threshold && validation.valid_count(transactions.len()) > 0;
                    // A low score alone says nothing against the mapping; bad data does.
                    if accepted || !validation.is_valid {
                        self.write_back(session_id, session.file_type, &learning, accepted);
                    }
                    if accepted {
                        let kept = valid_only(transactions, &validation);
                        let attempt = running.succeed(kept.len(), confidence);
                        tracing::info!(
                            session_id,
                            method = method.key(),
                            confidence,
                            transactions = kept.len(),
                            duration_ms = attempt.duration_ms,
                            "strategy succeeded"
                        );
                        session::append_attempt(&self.conn, session_id, &attempt)?;
                        return self.succeed(session_id, method, kept, validation);
                    }
                    let mut message = rejection_message(confidence, threshold, &validation);
                    if let Some(detail) = detail {
                        message = format!("{message} ({detail})");
                    }
                    running.fail(transactions.len(), confidence, message)
                }
                AttemptOutcome::Failed(e) => running.fail(0, 0.0, e.to_string()),
                AttemptOutcome::AwaitingInput => running.fail(0, 0.0, "awaiting manual annotation".to_string()),
            };
            tracing::info!(
                session_id,
                method = method.key(),
                confidence = attempt.confidence,
                error = attempt.error_message.as_deref().unwrap_or(""),
                "strategy escalated"
            );
            if let Some(msg) = &attempt.error_message {
                last_error = msg.clone();
            }
            session::append_attempt(&self.conn, session_id, &attempt)?;
            if method == ParsingMethod::ManualAnnotation {
                break;
            }
        }

        self.exhaust(session_id, &doc, None, last_error)
    }

    /// Learning write-back. Failures never block the parse.
    fn write_back(&self, session_id: &str, file_type: FileType, learning: &Learning, success: bool) {
        if let Learning::Mapping { signature, mapping } = learning {
            if let Err(e) = pattern_store::record_mapping_outcome(&self.conn, file_type, signature, mapping, success) {
                tracing::warn!(session_id, error = %e, "failed to record mapping outcome");
            }
        }
    }

    fn succeed(
        &self,
        session_id: &str,
        method: ParsingMethod,
        txns: Vec<ExtractedTransaction>,
        validation: ValidationResult,
    ) -> Result<ParseResult> {
        session::replace_transactions(&self.conn, session_id, &txns)?;
        let state = match session::apply_event(&self.conn, session_id, SessionEvent::Succeed, Some(method)) {
            Ok(state) => state,
            Err(FerretError::InvalidTransition { .. })
                if session::session_state(&self.conn, session_id)? == SessionState::Abandoned =>
            {
                return Ok(abandoned_result());
            }
            Err(e) => return Err(e),
        };
        Ok(ParseResult {
            success: true,
            parsing_method: Some(method),
            total_transactions: txns.len(),
            confidence: validation.confidence,
            transactions: txns,
            state,
            requires_manual_correction: false,
            manual_correction_data: None,
            validation: Some(validation),
            error: None,
        })
    }

    fn exhaust(
        &self,
        session_id: &str,
        doc: &Document,
        validation: Option<ValidationResult>,
        error: String,
    ) -> Result<ParseResult> {
        let state = match session::apply_event(&self.conn, session_id, SessionEvent::Exhaust, None) {
            Ok(state) => state,
            Err(FerretError::InvalidTransition { .. })
                if session::session_state(&self.conn, session_id)? == SessionState::Abandoned =>
            {
                return Ok(abandoned_result());
            }
            Err(e) => return Err(e),
        };
        tracing::warn!(session_id, error = %error, "all strategies exhausted, manual correction required");
        Ok(ParseResult {
            success: false,
            parsing_method: None,
            total_transactions: 0,
            transactions: Vec::new(),
            confidence: validation.as_ref().map_or(0.0, |v| v.confidence),
            state,
            requires_manual_correction: true,
            manual_correction_data: Some(correction_data(doc)),
            validation,
            error: Some(error),
        })
    }

    // -----------------------------------------------------------------------
    // Manual annotation
    // -----------------------------------------------------------------------

    pub fn annotation_lines(&self, session_id: &str) -> Result<Vec<String>> {
        let session = session::get_session(&self.conn, session_id)?;
        Ok(self.load_document(&session)?.lines)
    }

    pub fn suggest_annotation(&self, session_id: &str, line_index: usize) -> Result<AnnotationDraft> {
        let lines = self.annotation_lines(session_id)?;
        let count = lines.len();
        manual::suggest_from_line(&lines, line_index, self.settings.date_pivot_year).ok_or_else(|| {
            FerretError::Other(format!("line {line_index} is out of range (document has {count} lines)"))
        })
    }

    /// Commit caller-entered transactions. A rejected batch leaves the
    /// session exactly as it was.
    pub fn submit_manual_annotations(
        &self,
        session_id: &str,
        annotations: &[ManualAnnotation],
    ) -> Result<ParseResult> {
        let session = session::get_session(&self.conn, session_id)?;
        session.state.transition(SessionEvent::Start)?;
        let txns = manual::commit(annotations)?;

        session::apply_event(&self.conn, session_id, SessionEvent::Start, None)?;
        let running = RunningAttempt::start(ParsingMethod::ManualAnnotation);
        let validation = validation::validate(&txns);
        let attempt = running.succeed(txns.len(), validation.confidence);
        session::append_attempt(&self.conn, session_id, &attempt)?;
        tracing::info!(session_id, transactions = txns.len(), "manual annotations committed");
        self.succeed(session_id, ParsingMethod::ManualAnnotation, txns, validation)
    }

    // -----------------------------------------------------------------------
    // Session queries
    // -----------------------------------------------------------------------

    pub fn get_parsing_attempts(&self, session_id: &str) -> Result<Vec<ParsingAttempt>> {
        session::session_state(&self.conn, session_id)?;
        session::list_attempts(&self.conn, session_id)
    }

    pub fn get_session(&self, session_id: &str) -> Result<ParsingSession> {
        session::get_session(&self.conn, session_id)
    }

    pub fn list_sessions(&self) -> Result<Vec<SessionSummary>> {
        session::list_sessions(&self.conn)
    }

    /// Abandon a session. Learning already written to the pattern store stays.
    pub fn abandon_session(&self, session_id: &str) -> Result<SessionState> {
        let state = session::apply_event(&self.conn, session_id, SessionEvent::Cancel, None)?;
        tracing::info!(session_id, "session abandoned");
        Ok(state)
    }

    pub fn wait_for_settled(&self, session_id: &str) -> Result<WaitOutcome> {
        session::wait_for_settled(
            &self.conn,
            session_id,
            std::time::Duration::from_secs(self.settings.poll_interval_secs),
            std::time::Duration::from_secs(self.settings.poll_ceiling_secs),
        )
    }
}

fn valid_only(txns: Vec<ExtractedTransaction>, validation: &ValidationResult) -> Vec<ExtractedTransaction> {
    txns.into_iter()
        .enumerate()
        .filter(|(i, _)| !validation.invalid.contains(i))
        .map(|(_, t)| t)
        .collect()
}

fn rejection_message(confidence: f64, threshold: f64, validation: &ValidationResult) -> String {
    if confidence < threshold {
        format!("confidence {confidence:.2} below threshold {threshold:.2}")
    } else {
        validation
            .warnings
            .first()
            .cloned()
            .unwrap_or_else(|| "validation failed".to_string())
    }
}

fn correction_data(doc: &Document) -> ManualCorrectionData {
    ManualCorrectionData {
        text_content: doc.lines.clone(),
        columns: doc.table.as_ref().map(|t| t.headers.clone()).unwrap_or_default(),
        sample_data: doc
            .table
            .as_ref()
            .map(|t| t.sample_rows(CORRECTION_SAMPLE_ROWS))
            .unwrap_or_default(),
    }
}

fn abandoned_result() -> ParseResult {
    ParseResult {
        success: false,
        parsing_method: None,
        total_transactions: 0,
        transactions: Vec::new(),
        confidence: 0.0,
        state: SessionState::Abandoned,
        requires_manual_correction: false,
        manual_correction_data: None,
        validation: None,
        error: Some("session was abandoned".to_string()),
    }
}

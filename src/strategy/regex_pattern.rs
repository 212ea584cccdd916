use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use super::{AttemptOutcome, Learning, StrategyContext};
use crate::error::{FerretError, Result};
use crate::models::{CanonicalField, ExtractedTransaction, GroupMapping, ParsingMethod, RegexPattern};
use crate::normalize::{normalize_date, parse_amount, round_cents};
use crate::pattern_store;
use crate::validation::{session_confidence, validate};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternMatch {
    pub line_index: usize,
    pub fields: BTreeMap<CanonicalField, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub is_valid: bool,
    pub error: Option<String>,
    pub match_count: usize,
    pub matches: Vec<PatternMatch>,
}

/// Lines that look like they carry a transaction, whether or not a pattern matched them.
fn date_hint_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b(\d{1,2}[/-]\d{1,2}[/-]\d{2,4}|\d{4}-\d{2}-\d{2})\b").expect("invalid date hint regex")
    })
}

/// Pull the mapped groups out of one line. Money fields come back cleaned
/// (`$1,234.50` -> `1234.50`); everything else is trimmed verbatim.
pub fn extract_fields(
    re: &Regex,
    groups: &GroupMapping,
    line: &str,
) -> Option<BTreeMap<CanonicalField, String>> {
    let caps = re.captures(line)?;
    let mut fields = BTreeMap::new();
    for (&group, &field) in groups {
        let Some(m) = caps.get(group) else {
            continue;
        };
        let raw = m.as_str().trim();
        if raw.is_empty() {
            continue;
        }
        let value = if field.is_monetary() {
            parse_amount(raw).map_or_else(|| raw.to_string(), |v| format!("{v:.2}"))
        } else {
            raw.to_string()
        };
        fields.insert(field, value);
    }
    Some(fields)
}

fn match_lines<'a>(
    re: &'a Regex,
    groups: &'a GroupMapping,
    lines: &'a [String],
) -> impl Iterator<Item = PatternMatch> + 'a {
    lines.iter().enumerate().filter_map(move |(i, line)| {
        extract_fields(re, groups, line.trim()).map(|fields| PatternMatch {
            line_index: i,
            fields,
        })
    })
}

/// Dry-run a pattern over sample text. Touches no counters, so repeated calls
/// give identical results.
pub fn test(pattern: &str, sample_text: &str, groups: &GroupMapping) -> Result<TestResult> {
    let re = pattern_store::compile_pattern(pattern, groups)?;
    let lines: Vec<String> = sample_text.lines().map(str::to_string).collect();
    let matches: Vec<PatternMatch> = match_lines(&re, groups, &lines).collect();
    Ok(TestResult {
        is_valid: true,
        error: None,
        match_count: matches.len(),
        matches,
    })
}

fn to_transaction(
    m: PatternMatch,
    confidence: f64,
    pivot: u32,
) -> Option<ExtractedTransaction> {
    let get = |f: CanonicalField| m.fields.get(&f).cloned();
    let money = |f: CanonicalField| get(f).and_then(|v| parse_amount(&v)).filter(|v| *v != 0.0);

    let signed = match get(CanonicalField::Amount).and_then(|v| parse_amount(&v)) {
        Some(v) => v,
        None => match (money(CanonicalField::Debit), money(CanonicalField::Credit)) {
            (Some(d), _) => d.abs(),
            (None, Some(c)) => -c.abs(),
            (None, None) => return None,
        },
    };
    let raw_date = get(CanonicalField::Date).unwrap_or_default();
    let mut txn = ExtractedTransaction::from_signed(
        normalize_date(&raw_date, pivot).unwrap_or(raw_date),
        round_cents(signed),
        get(CanonicalField::Description).unwrap_or_default(),
        confidence,
        ParsingMethod::RegexPattern,
    );
    txn.balance = money(CanonicalField::Balance);
    txn.category = get(CanonicalField::Category);
    txn.merchant = get(CanonicalField::Merchant);
    txn.reference = get(CanonicalField::Reference);
    txn.source_line = Some(m.line_index);
    Some(txn)
}

#[derive(Debug, Clone)]
pub struct Application {
    pub transactions: Vec<ExtractedTransaction>,
    /// Validity-weighted confidence scaled by how many transaction-looking lines matched.
    pub confidence: f64,
    pub matched_lines: usize,
    pub candidate_lines: usize,
    pub pattern_confidence: f64,
}

/// Run a stored pattern over the whole document and count the outcome
/// against the pattern: success when the result passes validation. A pattern
/// that matches nothing records no outcome.
pub fn apply(
    conn: &Connection,
    pattern: &RegexPattern,
    lines: &[String],
    pivot: u32,
) -> Result<Application> {
    let re = pattern_store::compile_pattern(&pattern.pattern, &pattern.group_mappings)?;
    // A neutral pattern (0.5) scores clean matches at 0.75.
    let txn_confidence = (pattern.confidence + 1.0) / 2.0;
    let matches: Vec<PatternMatch> = match_lines(&re, &pattern.group_mappings, lines).collect();
    let matched_lines = matches.len();
    let candidate_lines = lines.iter().filter(|l| date_hint_re().is_match(l)).count();
    let transactions: Vec<ExtractedTransaction> = matches
        .into_iter()
        .filter_map(|m| to_transaction(m, txn_confidence, pivot))
        .collect();

    let coverage = if matched_lines == 0 {
        0.0
    } else {
        matched_lines as f64 / matched_lines.max(candidate_lines) as f64
    };
    let confidence = session_confidence(&transactions) * coverage;

    // A pattern that extracted nothing did not apply; its counters stay put.
    let passed = !transactions.is_empty() && validate(&transactions).is_valid;
    let pattern_confidence = if transactions.is_empty() {
        pattern.confidence
    } else {
        match pattern_store::record_pattern_outcome(conn, pattern.id, passed) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(pattern_id = pattern.id, error = %e, "failed to record pattern outcome");
                pattern.confidence
            }
        }
    };
    tracing::debug!(
        pattern_id = pattern.id,
        matched_lines,
        candidate_lines,
        confidence,
        passed,
        "applied regex pattern"
    );
    Ok(Application {
        transactions,
        confidence,
        matched_lines,
        candidate_lines,
        pattern_confidence,
    })
}

/// Try every pattern for the file type, best first; the first to clear the
/// acceptance threshold wins, otherwise the best-scoring result is returned.
pub fn attempt(ctx: &StrategyContext<'_>) -> AttemptOutcome {
    let lines = &ctx.document.lines;
    if lines.is_empty() {
        return AttemptOutcome::Failed(FerretError::NoMatchFound);
    }
    let patterns = match pattern_store::list_patterns(ctx.conn, Some(ctx.document.file_type)) {
        Ok(p) => p,
        Err(e) => return AttemptOutcome::Failed(e),
    };

    let mut best: Option<(Application, &RegexPattern)> = None;
    for pattern in &patterns {
        let application = match apply(ctx.conn, pattern, lines, ctx.settings.date_pivot_year) {
            Ok(a) => a,
            Err(e) => {
                tracing::warn!(pattern_id = pattern.id, error = %e, "skipping unusable pattern");
                continue;
            }
        };
        if application.transactions.is_empty() {
            continue;
        }
        if application.confidence >= ctx.settings.acceptance_threshold {
            best = Some((application, pattern));
            break;
        }
        if best.as_ref().map_or(true, |(b, _)| application.confidence > b.confidence) {
            best = Some((application, pattern));
        }
    }

    match best {
        Some((application, pattern)) => AttemptOutcome::Extracted {
            detail: Some(format!(
                "pattern '{}' matched {} of {} transaction lines",
                pattern.name, application.matched_lines, application.candidate_lines
            )),
            confidence: application.confidence,
            transactions: application.transactions,
            learning: Learning::None,
        },
        None => AttemptOutcome::Failed(FerretError::NoMatchFound),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;
    use crate::models::{FileType, PatternDefinition, TransactionType};

    const SCENARIO_B: &str = r"(\d{1,2}/\d{1,2}/\d{4})\s+(.+?)\s+(\$[\d,]+\.\d{2})";

    fn groups(pairs: &[(usize, CanonicalField)]) -> GroupMapping {
        pairs.iter().copied().collect()
    }

    fn scenario_groups() -> GroupMapping {
        groups(&[
            (1, CanonicalField::Date),
            (2, CanonicalField::Description),
            (3, CanonicalField::Amount),
        ])
    }

    fn lines(text: &str) -> Vec<String> {
        text.lines().map(str::to_string).collect()
    }

    #[test]
    fn test_scenario_walmart_line() {
        let result = test(SCENARIO_B, "12/31/2023 WALMART $45.67", &scenario_groups()).unwrap();
        assert!(result.is_valid);
        assert_eq!(result.match_count, 1);
        let fields = &result.matches[0].fields;
        assert_eq!(fields[&CanonicalField::Date], "12/31/2023");
        assert_eq!(fields[&CanonicalField::Description], "WALMART");
        assert_eq!(fields[&CanonicalField::Amount], "45.67");
    }

    #[test]
    fn test_is_idempotent() {
        let text = "12/31/2023 WALMART $45.67\nnoise\n01/02/2024 TARGET $1,200.00\n";
        let a = test(SCENARIO_B, text, &scenario_groups()).unwrap();
        let b = test(SCENARIO_B, text, &scenario_groups()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.match_count, 2);
        assert_eq!(a.matches[1].fields[&CanonicalField::Amount], "1200.00");
    }

    #[test]
    fn test_malformed_pattern_is_reported() {
        let err = test(r"(\d{1,2}/(\d+", "x", &scenario_groups()).unwrap_err();
        assert!(matches!(err, FerretError::InvalidPattern(_)));
    }

    #[test]
    fn test_apply_updates_counters_and_confidence() {
        let (_dir, conn) = test_db();
        let id = pattern_store::create_pattern(
            &conn,
            &PatternDefinition {
                name: "walmart".into(),
                file_type: Some(FileType::Text),
                pattern: SCENARIO_B.into(),
                group_mappings: scenario_groups(),
            },
        )
        .unwrap();
        let pattern = pattern_store::get_pattern(&conn, id).unwrap();
        let doc = lines("12/31/2023 WALMART $45.67\n01/02/2024 TARGET $12.00");

        let app = apply(&conn, &pattern, &doc, 50).unwrap();
        assert_eq!(app.transactions.len(), 2);
        assert_eq!(app.transactions[0].date, "2023-12-31");
        assert_eq!(app.transactions[0].amount, 45.67);
        assert_eq!(app.pattern_confidence, 1.0);
        assert!((app.confidence - 0.75).abs() < 1e-9);

        let app = apply(&conn, &pattern, &lines("99/99/2023 BAD DATE $1.00"), 50).unwrap();
        assert_eq!(app.transactions.len(), 1);
        let stored = pattern_store::get_pattern(&conn, id).unwrap();
        assert_eq!((stored.success_count, stored.failure_count), (1, 1));
        assert_eq!(stored.confidence, 0.5);
        assert_eq!(app.pattern_confidence, 0.5);
    }

    #[test]
    fn test_unmatched_document_leaves_counters_alone() {
        let (_dir, conn) = test_db();
        let builtins = pattern_store::list_patterns(&conn, Some(FileType::Csv)).unwrap();
        let csv = lines("When,What,How much\n01/15/2024,Coffee Shop,4.50");
        for pattern in &builtins {
            let app = apply(&conn, pattern, &csv, 50).unwrap();
            assert!(app.transactions.is_empty());
            assert_eq!(app.pattern_confidence, 0.5);
        }
        for stored in pattern_store::list_patterns(&conn, None).unwrap() {
            assert_eq!((stored.success_count, stored.failure_count), (0, 0));
            assert_eq!(stored.confidence, 0.5);
        }
    }

    #[test]
    fn test_coverage_lowers_confidence() {
        let (_dir, conn) = test_db();
        let id = pattern_store::create_pattern(
            &conn,
            &PatternDefinition {
                name: "dollar lines".into(),
                file_type: None,
                pattern: SCENARIO_B.into(),
                group_mappings: scenario_groups(),
            },
        )
        .unwrap();
        let pattern = pattern_store::get_pattern(&conn, id).unwrap();
        let doc = lines("12/31/2023 WALMART $45.67\n01/01/2024 TARGET 12.00\n01/02/2024 CVS 3.10\n01/03/2024 GAS 40.00");
        let app = apply(&conn, &pattern, &doc, 50).unwrap();
        assert_eq!(app.matched_lines, 1);
        assert_eq!(app.candidate_lines, 4);
        assert!(app.confidence < 0.6);
    }

    #[test]
    fn test_builtin_debit_credit_layout() {
        let (_dir, conn) = test_db();
        let pattern = pattern_store::list_patterns(&conn, None)
            .unwrap()
            .into_iter()
            .find(|p| p.group_mappings.values().any(|f| *f == CanonicalField::Credit))
            .unwrap();
        let doc = lines("01/05/2024 GROCERY STORE 54.20 -\n01/06/2024 PAYROLL - 1,500.00");
        let app = apply(&conn, &pattern, &doc, 50).unwrap();
        assert_eq!(app.transactions.len(), 2);
        assert_eq!(app.transactions[0].txn_type, TransactionType::Debit);
        assert_eq!(app.transactions[1].txn_type, TransactionType::Credit);
        assert_eq!(app.transactions[1].amount, 1500.0);
    }
}

use std::sync::OnceLock;

use regex::Regex;

use super::{AttemptOutcome, StrategyContext};
use crate::error::{FerretError, FieldError, Result};
use crate::models::{AnnotationDraft, ExtractedTransaction, ManualAnnotation, ParsingMethod, TransactionType};
use crate::normalize::{is_iso_date, normalize_date, parse_amount, round_cents};

fn date_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d{1,2}[-/]\d{1,2}[-/]\d{2,4}").expect("invalid date regex"))
}

fn amount_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\(?-?\$?\d[\d,]*\.\d{2}\)?-?").expect("invalid amount regex"))
}

fn space_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").expect("invalid whitespace regex"))
}

/// Pre-fill an annotation from one line: first date, first amount, and
/// whatever text remains as the description.
pub fn suggest_from_line(lines: &[String], index: usize, pivot: u32) -> Option<AnnotationDraft> {
    let line = lines.get(index)?;
    let mut residual = line.clone();

    let date_match = date_re().find(line);
    let date = date_match.and_then(|m| normalize_date(m.as_str(), pivot));
    // Prefer an amount after the date, then one before it; never inside it.
    let amount_match = match date_match {
        Some(d) => amount_re()
            .find_at(line, d.end())
            .or_else(|| amount_re().find(&line[..d.start()])),
        None => amount_re().find(line),
    };
    let signed = amount_match.and_then(|m| parse_amount(m.as_str()));

    // Cut from the right so earlier offsets stay valid.
    let mut cuts: Vec<(usize, usize)> = [date_match, amount_match]
        .iter()
        .flatten()
        .map(|m| (m.start(), m.end()))
        .collect();
    cuts.sort_by(|a, b| b.0.cmp(&a.0));
    for (start, end) in cuts {
        residual.replace_range(start..end, " ");
    }
    let description = space_re().replace_all(residual.trim(), " ").into_owned();

    Some(AnnotationDraft {
        line_index: index,
        line: line.clone(),
        date,
        amount: signed.map(|v| round_cents(v.abs())),
        description,
        txn_type: signed.map_or(TransactionType::Debit, TransactionType::from_signed),
    })
}

/// Check every annotation and convert the batch, or report each bad field.
/// Nothing is committed unless the whole batch is valid.
pub fn commit(annotations: &[ManualAnnotation]) -> Result<Vec<ExtractedTransaction>> {
    if annotations.is_empty() {
        return Err(FerretError::ValidationError(vec![FieldError {
            index: 0,
            field: "annotations",
            message: "at least one annotation is required".to_string(),
        }]));
    }

    let mut errors = Vec::new();
    for (index, a) in annotations.iter().enumerate() {
        if !is_iso_date(a.date.trim()) {
            errors.push(FieldError {
                index,
                field: "date",
                message: format!("'{}' is not a YYYY-MM-DD calendar date", a.date),
            });
        }
        if !a.amount.is_finite() || a.amount <= 0.0 {
            errors.push(FieldError {
                index,
                field: "amount",
                message: "must be a positive number".to_string(),
            });
        }
        if a.description.trim().is_empty() {
            errors.push(FieldError {
                index,
                field: "description",
                message: "must not be empty".to_string(),
            });
        }
    }
    if !errors.is_empty() {
        return Err(FerretError::ValidationError(errors));
    }

    Ok(annotations
        .iter()
        .map(|a| ExtractedTransaction {
            date: a.date.trim().to_string(),
            amount: round_cents(a.amount),
            description: a.description.trim().to_string(),
            txn_type: a.txn_type.unwrap_or(TransactionType::Debit),
            balance: None,
            category: a.category.clone(),
            merchant: a.merchant.clone(),
            reference: None,
            confidence: 1.0,
            source: ParsingMethod::ManualAnnotation,
            source_line: a.source_line,
        })
        .collect())
}

/// Manual annotation has nothing to do until a person supplies entries.
pub fn attempt(_ctx: &StrategyContext<'_>) -> AttemptOutcome {
    AttemptOutcome::AwaitingInput
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(text: &str) -> Vec<String> {
        text.lines().map(str::to_string).collect()
    }

    fn annotation(date: &str, amount: f64, description: &str) -> ManualAnnotation {
        ManualAnnotation {
            date: date.to_string(),
            amount,
            description: description.to_string(),
            txn_type: None,
            category: None,
            merchant: None,
            source_line: None,
        }
    }

    #[test]
    fn test_suggest_fills_all_fields() {
        let doc = lines("Statement for January\n01/15/24  COFFEE SHOP #12  $4.50");
        let draft = suggest_from_line(&doc, 1, 50).unwrap();
        assert_eq!(draft.date.as_deref(), Some("2024-01-15"));
        assert_eq!(draft.amount, Some(4.50));
        assert_eq!(draft.description, "COFFEE SHOP #12");
        assert_eq!(draft.txn_type, TransactionType::Debit);
        assert_eq!(draft.line_index, 1);
    }

    #[test]
    fn test_suggest_reads_credit_from_sign() {
        let doc = lines("02-01-2024 REFUND (25.00)");
        let draft = suggest_from_line(&doc, 0, 50).unwrap();
        assert_eq!(draft.amount, Some(25.0));
        assert_eq!(draft.txn_type, TransactionType::Credit);
        assert_eq!(draft.description, "REFUND");
    }

    #[test]
    fn test_suggest_finds_amount_before_date() {
        let doc = lines("COFFEE 4.50 01/15/2024");
        let draft = suggest_from_line(&doc, 0, 50).unwrap();
        assert_eq!(draft.amount, Some(4.50));
        assert_eq!(draft.date.as_deref(), Some("2024-01-15"));
        assert_eq!(draft.description, "COFFEE");
    }

    #[test]
    fn test_suggest_leaves_unknowns_empty() {
        let doc = lines("Opening balance carried forward");
        let draft = suggest_from_line(&doc, 0, 50).unwrap();
        assert!(draft.date.is_none());
        assert!(draft.amount.is_none());
        assert_eq!(draft.description, "Opening balance carried forward");
        assert!(suggest_from_line(&doc, 5, 50).is_none());
    }

    #[test]
    fn test_suggest_honors_pivot() {
        let doc = lines("01/15/49 A 1.00\n01/15/50 B 1.00");
        assert_eq!(suggest_from_line(&doc, 0, 50).unwrap().date.as_deref(), Some("2049-01-15"));
        assert_eq!(suggest_from_line(&doc, 1, 50).unwrap().date.as_deref(), Some("1950-01-15"));
    }

    #[test]
    fn test_commit_rejects_impossible_date() {
        let err = commit(&[annotation("2024-13-01", 10.0, "Coffee")]).unwrap_err();
        match err {
            FerretError::ValidationError(fields) => {
                assert_eq!(fields.len(), 1);
                assert_eq!(fields[0].field, "date");
            }
            other => panic!("expected ValidationError, got {other:?}"),
        }
    }

    #[test]
    fn test_commit_names_every_bad_field() {
        let err = commit(&[
            annotation("2024-01-01", 10.0, "Coffee"),
            annotation("01/02/2024", 0.0, " "),
        ])
        .unwrap_err();
        let FerretError::ValidationError(fields) = err else {
            panic!("expected ValidationError");
        };
        let named: Vec<(usize, &str)> = fields.iter().map(|f| (f.index, f.field)).collect();
        assert_eq!(named, vec![(1, "date"), (1, "amount"), (1, "description")]);
    }

    #[test]
    fn test_commit_marks_manual_source() {
        let mut a = annotation("2024-01-01", 10.004, "Coffee");
        a.txn_type = Some(TransactionType::Credit);
        a.source_line = Some(3);
        let txns = commit(&[a]).unwrap();
        assert_eq!(txns[0].confidence, 1.0);
        assert_eq!(txns[0].source, ParsingMethod::ManualAnnotation);
        assert_eq!(txns[0].amount, 10.0);
        assert_eq!(txns[0].txn_type, TransactionType::Credit);
        assert_eq!(txns[0].source_line, Some(3));
    }

    #[test]
    fn test_commit_requires_one_annotation() {
        assert!(matches!(commit(&[]), Err(FerretError::ValidationError(_))));
    }
}

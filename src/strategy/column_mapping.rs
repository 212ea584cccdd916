use std::collections::BTreeMap;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use super::{AttemptOutcome, Learning, StrategyContext};
use crate::document::Table;
use crate::error::{FerretError, Result};
use crate::models::{
    CanonicalField, ColumnMapping, ExtractedTransaction, FieldMapping, LearnedMapping, ParsingMethod,
};
use crate::normalize::{fold, normalize_date, parse_amount, round_cents};
use crate::pattern_store;
use crate::validation::session_confidence;

/// Confidence given to every column of a mapping the caller confirmed by hand.
pub const CONFIRMED_MAPPING_CONFIDENCE: f64 = 0.9;

const EXACT_HEADER_CONFIDENCE: f64 = 0.9;
const PARTIAL_HEADER_CONFIDENCE: f64 = 0.6;
const DATA_DATE_CONFIDENCE: f64 = 0.4;
const DATA_AMOUNT_CONFIDENCE: f64 = 0.4;
const DATA_TEXT_CONFIDENCE: f64 = 0.3;
const PREVIEW_ROWS: usize = 3;

// Header keywords per field, most specific first.
const HEADER_KEYWORDS: &[(CanonicalField, &[&str])] = &[
    (
        CanonicalField::Date,
        &["date", "transaction date", "trans date", "posting date", "posted date", "value date", "booking date"],
    ),
    (
        CanonicalField::Description,
        &["description", "desc", "details", "memo", "narrative", "particulars", "payee", "transaction"],
    ),
    (CanonicalField::Amount, &["amount", "amt", "transaction amount", "value", "sum"]),
    (CanonicalField::Debit, &["debit", "withdrawal", "withdrawals", "money out", "paid out"]),
    (CanonicalField::Credit, &["credit", "deposit", "deposits", "money in", "paid in"]),
    (CanonicalField::Balance, &["balance", "running bal.", "running balance", "bal"]),
    (CanonicalField::Category, &["category"]),
    (CanonicalField::Merchant, &["merchant", "vendor", "store"]),
    (CanonicalField::Reference, &["reference", "ref", "check number", "check #", "transaction id"]),
    (CanonicalField::AccountNumber, &["account number", "account", "acct", "account no"]),
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingSuggestions {
    pub columns: Vec<String>,
    pub sample_rows: Vec<Vec<String>>,
    pub suggested_mapping: Vec<ColumnMapping>,
    pub learned_mappings: Vec<LearnedMapping>,
    pub required_fields: Vec<CanonicalField>,
    pub signature: String,
}

impl MappingSuggestions {
    pub fn field_mapping(&self) -> FieldMapping {
        self.suggested_mapping
            .iter()
            .map(|m| (m.field, m.source_column.clone()))
            .collect()
    }

    pub fn confidence_of(&self, field: CanonicalField) -> Option<f64> {
        self.suggested_mapping
            .iter()
            .find(|m| m.field == field)
            .map(|m| m.confidence)
    }
}

fn header_confidence(header: &str, field: CanonicalField) -> Option<f64> {
    let header = fold(header);
    let keywords = HEADER_KEYWORDS.iter().find(|(f, _)| *f == field)?.1;
    if keywords.iter().any(|k| *k == header) {
        return Some(EXACT_HEADER_CONFIDENCE);
    }
    let words: Vec<&str> = header
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    if keywords
        .iter()
        .filter(|k| !k.contains(' ') && k.len() > 2)
        .any(|k| words.contains(k))
    {
        return Some(PARTIAL_HEADER_CONFIDENCE);
    }
    None
}

fn column_values<'a>(table: &'a Table, column: usize) -> impl Iterator<Item = &'a str> + 'a {
    table
        .rows
        .iter()
        .map(move |r| table.cell(r, column))
        .filter(|c| !c.is_empty())
}

fn mostly(table: &Table, column: usize, pred: impl Fn(&str) -> bool) -> bool {
    let values: Vec<&str> = column_values(table, column).take(20).collect();
    !values.is_empty() && values.iter().filter(|&&v| pred(v)).count() * 2 > values.len()
}

/// Suggest one field per column: learned pairings first, then header
/// keywords, then what the data itself looks like.
pub fn suggest_mapping(table: &Table, learned: &[LearnedMapping], pivot: u32) -> Vec<ColumnMapping> {
    // (field) -> (column index, confidence, learned)
    let mut best: BTreeMap<CanonicalField, (usize, f64, bool)> = BTreeMap::new();
    let mut taken: Vec<bool> = vec![false; table.headers.len()];

    for m in learned {
        let Some(idx) = table.column_index(&m.source_column) else {
            continue;
        };
        if taken[idx] || best.contains_key(&m.field) || m.success_count == 0 {
            continue;
        }
        best.insert(m.field, (idx, m.confidence, true));
        taken[idx] = true;
    }

    let mut candidates: Vec<(f64, usize, CanonicalField)> = Vec::new();
    for (idx, header) in table.headers.iter().enumerate() {
        for field in CanonicalField::ALL {
            if let Some(c) = header_confidence(header, field) {
                candidates.push((c, idx, field));
            }
        }
    }
    // Highest confidence first; ties go to the leftmost column, then field order.
    candidates.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));
    for (c, idx, field) in candidates {
        if taken[idx] || best.contains_key(&field) {
            continue;
        }
        best.insert(field, (idx, c, false));
        taken[idx] = true;
    }

    if !best.contains_key(&CanonicalField::Date) {
        if let Some(idx) = (0..table.headers.len())
            .find(|&i| !taken[i] && mostly(table, i, |v| normalize_date(v, pivot).is_some()))
        {
            best.insert(CanonicalField::Date, (idx, DATA_DATE_CONFIDENCE, false));
            taken[idx] = true;
        }
    }
    let has_amount = best.contains_key(&CanonicalField::Amount)
        || (best.contains_key(&CanonicalField::Debit) && best.contains_key(&CanonicalField::Credit));
    if !has_amount {
        if let Some(idx) = (0..table.headers.len())
            .find(|&i| !taken[i] && mostly(table, i, |v| parse_amount(v).is_some()))
        {
            best.insert(CanonicalField::Amount, (idx, DATA_AMOUNT_CONFIDENCE, false));
            taken[idx] = true;
        }
    }
    if !best.contains_key(&CanonicalField::Description) {
        if let Some(idx) = (0..table.headers.len()).find(|&i| {
            !taken[i]
                && mostly(table, i, |v| parse_amount(v).is_none() && normalize_date(v, pivot).is_none())
        }) {
            best.insert(CanonicalField::Description, (idx, DATA_TEXT_CONFIDENCE, false));
            taken[idx] = true;
        }
    }

    let mut out: Vec<ColumnMapping> = best
        .into_iter()
        .map(|(field, (idx, confidence, learned))| ColumnMapping {
            source_column: table.headers[idx].clone(),
            field,
            confidence,
            learned,
        })
        .collect();
    out.sort_by_key(|m| table.column_index(&m.source_column));
    out
}

pub fn suggest(conn: &Connection, table: &Table, pivot: u32) -> Result<MappingSuggestions> {
    let signature = table.signature();
    let learned = pattern_store::learned_mappings(conn, &signature)?;
    let suggested_mapping = suggest_mapping(table, &learned, pivot);
    Ok(MappingSuggestions {
        columns: table.headers.clone(),
        sample_rows: table.sample_rows(PREVIEW_ROWS),
        suggested_mapping,
        learned_mappings: learned,
        required_fields: CanonicalField::REQUIRED.to_vec(),
        signature,
    })
}

/// Required fields the mapping leaves unmapped, or maps to a column the table lacks.
/// A debit/credit column pair stands in for `amount`.
pub fn missing_required(table: &Table, mapping: &FieldMapping) -> Vec<String> {
    let present = |f: CanonicalField| {
        mapping
            .get(&f)
            .map_or(false, |col| table.column_index(col).is_some())
    };
    CanonicalField::REQUIRED
        .iter()
        .filter(|&&f| {
            if f == CanonicalField::Amount {
                !(present(f) || (present(CanonicalField::Debit) && present(CanonicalField::Credit)))
            } else {
                !present(f)
            }
        })
        .map(|f| f.key().to_string())
        .collect()
}

/// Turn every data row into a transaction. Rows with no readable amount, and
/// blank rows, are structural noise and are skipped.
pub fn apply(
    table: &Table,
    mapping: &FieldMapping,
    confidence: f64,
    pivot: u32,
) -> Result<Vec<ExtractedTransaction>> {
    let missing = missing_required(table, mapping);
    if !missing.is_empty() {
        return Err(FerretError::IncompleteMapping(missing));
    }
    let col = |f: CanonicalField| mapping.get(&f).and_then(|c| table.column_index(c));
    let (date_col, desc_col) = (col(CanonicalField::Date), col(CanonicalField::Description));
    let amount_col = col(CanonicalField::Amount);
    let (debit_col, credit_col) = (col(CanonicalField::Debit), col(CanonicalField::Credit));
    let text = |row: &[String], c: Option<usize>| {
        c.map(|c| table.cell(row, c).to_string()).filter(|s| !s.is_empty())
    };

    let mut txns = Vec::new();
    for (i, row) in table.rows.iter().enumerate() {
        let row = row.as_slice();
        let signed = match amount_col {
            Some(c) => parse_amount(table.cell(row, c)),
            None => {
                let debit = debit_col.and_then(|c| parse_amount(table.cell(row, c))).filter(|v| *v != 0.0);
                let credit = credit_col.and_then(|c| parse_amount(table.cell(row, c))).filter(|v| *v != 0.0);
                match (debit, credit) {
                    (Some(d), _) => Some(d.abs()),
                    (None, Some(c)) => Some(-c.abs()),
                    (None, None) => None,
                }
            }
        };
        let Some(signed) = signed else {
            tracing::debug!(row = i + 1, "skipping row without an amount");
            continue;
        };
        let raw_date = text(row, date_col).unwrap_or_default();
        let date = normalize_date(&raw_date, pivot).unwrap_or(raw_date);
        let description = text(row, desc_col).unwrap_or_default();

        let mut txn = ExtractedTransaction::from_signed(
            date,
            round_cents(signed),
            description,
            confidence,
            ParsingMethod::ColumnMapping,
        );
        txn.balance = text(row, col(CanonicalField::Balance)).and_then(|b| parse_amount(&b));
        txn.category = text(row, col(CanonicalField::Category));
        txn.merchant = text(row, col(CanonicalField::Merchant));
        txn.reference = text(row, col(CanonicalField::Reference));
        txn.source_line = Some(i);
        txns.push(txn);
    }
    Ok(txns)
}

/// Mean confidence of the columns that feed the required fields.
fn mapping_confidence(suggestions: &MappingSuggestions) -> f64 {
    let mut scores = Vec::new();
    for field in CanonicalField::REQUIRED {
        match suggestions.confidence_of(field) {
            Some(c) => scores.push(c),
            None if field == CanonicalField::Amount => {
                let pair = [CanonicalField::Debit, CanonicalField::Credit]
                    .iter()
                    .filter_map(|f| suggestions.confidence_of(*f))
                    .collect::<Vec<_>>();
                if pair.len() == 2 {
                    scores.push(pair.iter().sum::<f64>() / 2.0);
                }
            }
            None => {}
        }
    }
    if scores.is_empty() {
        0.0
    } else {
        scores.iter().sum::<f64>() / scores.len() as f64
    }
}

pub fn attempt(ctx: &StrategyContext<'_>) -> AttemptOutcome {
    let Some(table) = ctx.document.table.as_ref() else {
        return AttemptOutcome::Failed(FerretError::UnsupportedFile(
            "document has no header row to map".to_string(),
        ));
    };
    let suggestions = match suggest(ctx.conn, table, ctx.settings.date_pivot_year) {
        Ok(s) => s,
        Err(e) => return AttemptOutcome::Failed(e),
    };
    let mapping = suggestions.field_mapping();
    let confidence = mapping_confidence(&suggestions);
    let transactions = match apply(table, &mapping, confidence, ctx.settings.date_pivot_year) {
        Ok(t) => t,
        Err(e) => return AttemptOutcome::Failed(e),
    };
    if transactions.is_empty() {
        return AttemptOutcome::Failed(FerretError::NoMatchFound);
    }
    AttemptOutcome::Extracted {
        confidence: session_confidence(&transactions),
        transactions,
        learning: Learning::Mapping {
            signature: suggestions.signature.clone(),
            mapping,
        },
        detail: Some(format!("{} of {} columns mapped", suggestions.suggested_mapping.len(), table.headers.len())),
    }
}

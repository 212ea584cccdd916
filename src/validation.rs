use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::models::ExtractedTransaction;
use crate::normalize::{fold, is_iso_date};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub warnings: Vec<String>,
    pub suggestions: Vec<String>,
    /// Indices of transactions that break a hard invariant; excluded from commit.
    pub invalid: Vec<usize>,
    /// Groups of indices sharing date, amount and folded description.
    pub duplicates: Vec<Vec<usize>>,
    pub confidence: f64,
}

impl ValidationResult {
    pub fn valid_count(&self, total: usize) -> usize {
        total - self.invalid.len()
    }
}

/// Fields of `txn` that break a hard invariant.
pub fn check_transaction(txn: &ExtractedTransaction) -> Vec<&'static str> {
    let mut problems = Vec::new();
    if !is_iso_date(&txn.date) {
        problems.push("date");
    }
    if !txn.amount.is_finite() || txn.amount < 0.0 {
        problems.push("amount");
    }
    if txn.description.trim().is_empty() {
        problems.push("description");
    }
    problems
}

/// Mean confidence where invalid transactions count as zero.
pub fn session_confidence(txns: &[ExtractedTransaction]) -> f64 {
    if txns.is_empty() {
        return 0.0;
    }
    let sum: f64 = txns
        .iter()
        .map(|t| {
            if check_transaction(t).is_empty() {
                t.confidence.clamp(0.0, 1.0)
            } else {
                0.0
            }
        })
        .sum();
    sum / txns.len() as f64
}

pub fn find_duplicates(txns: &[ExtractedTransaction]) -> Vec<Vec<usize>> {
    let mut groups: BTreeMap<(String, i64, String), Vec<usize>> = BTreeMap::new();
    for (i, t) in txns.iter().enumerate() {
        let cents = (t.amount * 100.0).round() as i64;
        groups
            .entry((t.date.clone(), cents, fold(&t.description)))
            .or_default()
            .push(i);
    }
    let mut dups: Vec<Vec<usize>> = groups.into_values().filter(|g| g.len() > 1).collect();
    dups.sort();
    dups
}

pub fn validate(txns: &[ExtractedTransaction]) -> ValidationResult {
    let mut result = ValidationResult::default();

    if txns.is_empty() {
        result.warnings.push("No transactions were extracted".to_string());
        result
            .suggestions
            .push("Try a different parsing method or annotate lines manually".to_string());
        return result;
    }

    let mut bad_fields: BTreeMap<&'static str, usize> = BTreeMap::new();
    for (i, t) in txns.iter().enumerate() {
        let problems = check_transaction(t);
        if problems.is_empty() {
            continue;
        }
        result.invalid.push(i);
        for p in &problems {
            *bad_fields.entry(*p).or_default() += 1;
        }
        result.warnings.push(format!(
            "Transaction {} ({}) has invalid {}",
            i + 1,
            if t.description.trim().is_empty() { "no description" } else { t.description.trim() },
            problems.join(", ")
        ));
    }

    if bad_fields.contains_key("date") {
        result
            .suggestions
            .push("Some dates could not be read; check which column or group holds the date".to_string());
    }
    if bad_fields.contains_key("amount") {
        result
            .suggestions
            .push("Some amounts are not numeric; check the amount or debit/credit mapping".to_string());
    }
    if bad_fields.contains_key("description") {
        result
            .suggestions
            .push("Some descriptions are empty; map a description column".to_string());
    }

    result.duplicates = find_duplicates(txns);
    for group in &result.duplicates {
        let positions: Vec<String> = group.iter().map(|i| (i + 1).to_string()).collect();
        result.warnings.push(format!(
            "Possible duplicates: transactions {}",
            positions.join(", ")
        ));
    }
    if !result.duplicates.is_empty() {
        result
            .suggestions
            .push("Review duplicates and deselect any that should not be imported".to_string());
    }

    result.is_valid = result.invalid.is_empty();
    result.confidence = session_confidence(txns);
    result
}

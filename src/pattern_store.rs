//! Learned column mappings and regex patterns, with their success statistics.
//!
//! Counter updates are single `UPDATE` statements so concurrent sessions
//! exercising the same row never lose an increment.

use regex::Regex;
use rusqlite::{Connection, OptionalExtension, Row};

use crate::db::NEUTRAL_CONFIDENCE;
use crate::error::{FerretError, Result};
use crate::models::{
    CanonicalField, FieldMapping, FileType, GroupMapping, LearnedMapping, PatternDefinition,
    RegexPattern,
};

// ---------------------------------------------------------------------------
// Regex patterns
// ---------------------------------------------------------------------------

const PATTERN_COLUMNS: &str = "id, name, file_type, pattern, group_mappings, success_count, \
                               failure_count, confidence, is_builtin";

fn pattern_from_row(row: &Row<'_>) -> rusqlite::Result<RegexPattern> {
    let file_type: Option<String> = row.get(2)?;
    let groups: String = row.get(4)?;
    Ok(RegexPattern {
        id: row.get(0)?,
        name: row.get(1)?,
        file_type: file_type.and_then(|t| t.parse().ok()),
        pattern: row.get(3)?,
        group_mappings: serde_json::from_str(&groups).unwrap_or_default(),
        success_count: row.get(5)?,
        failure_count: row.get(6)?,
        confidence: row.get(7)?,
        is_builtin: row.get::<_, i64>(8)? == 1,
    })
}

/// Patterns usable for `file_type` (including untyped ones), best first.
pub fn list_patterns(conn: &Connection, file_type: Option<FileType>) -> Result<Vec<RegexPattern>> {
    let sql = format!(
        "SELECT {PATTERN_COLUMNS} FROM regex_patterns \
         WHERE ?1 IS NULL OR file_type IS NULL OR file_type = ?1 \
         ORDER BY confidence DESC, success_count DESC, id ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([file_type.map(|t| t.key())], pattern_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn get_pattern(conn: &Connection, id: i64) -> Result<RegexPattern> {
    let sql = format!("SELECT {PATTERN_COLUMNS} FROM regex_patterns WHERE id = ?1");
    conn.query_row(&sql, [id], pattern_from_row)
        .optional()?
        .ok_or(FerretError::UnknownPattern(id))
}

/// Compile a pattern and check its group mapping against the capture count.
pub fn compile_pattern(pattern: &str, groups: &GroupMapping) -> Result<Regex> {
    let re = Regex::new(pattern).map_err(|e| FerretError::InvalidPattern(e.to_string()))?;
    let captures = re.captures_len() - 1;
    if captures == 0 {
        return Err(FerretError::InvalidPattern(
            "pattern has no capture groups".to_string(),
        ));
    }
    if let Some(bad) = groups.keys().find(|&&g| g == 0 || g > captures) {
        return Err(FerretError::InvalidPattern(format!(
            "group {bad} is mapped but the pattern has {captures} capture group(s)"
        )));
    }
    Ok(re)
}

pub fn create_pattern(conn: &Connection, definition: &PatternDefinition) -> Result<i64> {
    if definition.name.trim().is_empty() {
        return Err(FerretError::InvalidPattern("pattern name is empty".to_string()));
    }
    compile_pattern(&definition.pattern, &definition.group_mappings)?;
    let groups = serde_json::to_string(&definition.group_mappings)?;
    conn.execute(
        "INSERT INTO regex_patterns (name, file_type, pattern, group_mappings, confidence) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
        rusqlite::params![
            definition.name.trim(),
            definition.file_type.map(|t| t.key()),
            definition.pattern,
            groups,
            NEUTRAL_CONFIDENCE,
        ],
    )?;
    let id = conn.last_insert_rowid();
    tracing::info!(pattern_id = id, name = %definition.name, "created regex pattern");
    Ok(id)
}

pub fn delete_pattern(conn: &Connection, id: i64) -> Result<()> {
    let pattern = get_pattern(conn, id)?;
    if pattern.is_builtin {
        return Err(FerretError::BuiltInPattern(id));
    }
    conn.execute("DELETE FROM regex_patterns WHERE id = ?1", [id])?;
    Ok(())
}

/// Count one application of a pattern and return its recomputed confidence.
pub fn record_pattern_outcome(conn: &Connection, id: i64, success: bool) -> Result<f64> {
    let (s, f) = if success { (1, 0) } else { (0, 1) };
    let changed = conn.execute(
        "UPDATE regex_patterns SET \
            success_count = success_count + ?2, \
            failure_count = failure_count + ?3, \
            confidence = CAST(success_count + ?2 AS REAL) / (success_count + failure_count + ?2 + ?3) \
         WHERE id = ?1",
        rusqlite::params![id, s, f],
    )?;
    if changed == 0 {
        return Err(FerretError::UnknownPattern(id));
    }
    let confidence: f64 =
        conn.query_row("SELECT confidence FROM regex_patterns WHERE id = ?1", [id], |r| r.get(0))?;
    Ok(confidence)
}

// ---------------------------------------------------------------------------
// Column mappings
// ---------------------------------------------------------------------------

fn mapping_from_row(row: &Row<'_>) -> rusqlite::Result<Option<LearnedMapping>> {
    let file_type: String = row.get(1)?;
    let field: String = row.get(4)?;
    let (Ok(file_type), Ok(field)) = (file_type.parse::<FileType>(), field.parse::<CanonicalField>())
    else {
        return Ok(None);
    };
    Ok(Some(LearnedMapping {
        id: row.get(0)?,
        file_type,
        signature: row.get(2)?,
        source_column: row.get(3)?,
        field,
        success_count: row.get(5)?,
        failure_count: row.get(6)?,
        confidence: row.get(7)?,
    }))
}

/// Active learned pairings for a header signature.
pub fn learned_mappings(conn: &Connection, signature: &str) -> Result<Vec<LearnedMapping>> {
    let mut stmt = conn.prepare(
        "SELECT id, file_type, signature, source_column, field, success_count, failure_count, confidence \
         FROM column_mappings WHERE signature = ?1 AND is_active = 1 \
         ORDER BY confidence DESC, id ASC",
    )?;
    let rows = stmt
        .query_map([signature], mapping_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows.into_iter().flatten().collect())
}

/// Record the outcome of a confirmed mapping.
///
/// On success each pairing becomes the single active mapping for its source
/// column; any other active field for that column was edited away and takes a
/// failure. On failure every submitted pairing takes a failure.
pub fn record_mapping_outcome(
    conn: &Connection,
    file_type: FileType,
    signature: &str,
    mapping: &FieldMapping,
    success: bool,
) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    for (field, column) in mapping {
        if success {
            tx.execute(
                "UPDATE column_mappings SET \
                    failure_count = failure_count + 1, \
                    confidence = CAST(success_count AS REAL) / (success_count + failure_count + 1), \
                    is_active = 0, updated_at = datetime('now') \
                 WHERE signature = ?1 AND source_column = ?2 AND field != ?3 AND is_active = 1",
                rusqlite::params![signature, column, field.key()],
            )?;
        }
        let (s, f) = if success { (1, 0) } else { (0, 1) };
        tx.execute(
            "INSERT INTO column_mappings (file_type, signature, source_column, field, success_count, failure_count, confidence, is_active) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, CAST(?5 AS REAL) / (?5 + ?6), ?7) \
             ON CONFLICT (signature, source_column, field) DO UPDATE SET \
                success_count = success_count + ?5, \
                failure_count = failure_count + ?6, \
                confidence = CAST(success_count + ?5 AS REAL) / (success_count + failure_count + ?5 + ?6), \
                is_active = CASE WHEN ?5 = 1 THEN 1 ELSE is_active END, \
                updated_at = datetime('now')",
            rusqlite::params![file_type.key(), signature, column, field.key(), s, f, success as i64],
        )?;
    }
    tx.commit()?;
    tracing::debug!(signature, success, columns = mapping.len(), "recorded mapping outcome");
    Ok(())
}

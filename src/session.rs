//! Persistence for parsing sessions: state, the append-only attempt log and
//! the accepted transaction set.

use std::time::{Duration, Instant};

use rand::Rng;
use rusqlite::{Connection, OptionalExtension, Row};
use serde::Serialize;

use crate::error::{FerretError, Result};
use crate::models::{
    ExtractedTransaction, FileType, ParsingAttempt, ParsingMethod, ParsingSession, SessionEvent,
    SessionState,
};

pub fn new_session_id() -> String {
    let bytes: [u8; 8] = rand::thread_rng().gen();
    hex::encode(bytes)
}

pub struct NewSession<'a> {
    pub file_name: &'a str,
    pub file_path: &'a str,
    pub file_type: FileType,
    pub checksum: &'a str,
}

pub fn create_session(conn: &Connection, new: &NewSession<'_>) -> Result<String> {
    let id = new_session_id();
    conn.execute(
        "INSERT INTO sessions (id, file_name, file_path, file_type, checksum, state) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![
            id,
            new.file_name,
            new.file_path,
            new.file_type.key(),
            new.checksum,
            SessionState::Created.key(),
        ],
    )?;
    tracing::info!(session_id = %id, file = new.file_name, file_type = new.file_type.key(), "created session");
    Ok(id)
}

/// Most recent live session for an identical upload. Abandoned sessions do
/// not count, so a file can be re-uploaded after giving up on it.
pub fn find_by_checksum(conn: &Connection, checksum: &str) -> Result<Option<String>> {
    let id = conn
        .query_row(
            "SELECT id FROM sessions WHERE checksum = ?1 AND state != ?2 \
             ORDER BY created_at DESC, rowid DESC LIMIT 1",
            rusqlite::params![checksum, SessionState::Abandoned.key()],
            |r| r.get(0),
        )
        .optional()?;
    Ok(id)
}

fn parse_column<T: std::str::FromStr>(idx: usize, value: String) -> rusqlite::Result<T> {
    value.parse().map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("unexpected value '{value}'").into(),
        )
    })
}

pub fn session_state(conn: &Connection, id: &str) -> Result<SessionState> {
    let state: Option<String> = conn
        .query_row("SELECT state FROM sessions WHERE id = ?1", [id], |r| r.get(0))
        .optional()?;
    let state = state.ok_or_else(|| FerretError::UnknownSession(id.to_string()))?;
    state.parse()
}

/// Apply `event` to the stored state. The write is a compare-and-set on the
/// state that was read, so a concurrent abandon is never overwritten.
pub fn apply_event(
    conn: &Connection,
    id: &str,
    event: SessionEvent,
    final_method: Option<ParsingMethod>,
) -> Result<SessionState> {
    let current = session_state(conn, id)?;
    let next = current.transition(event)?;
    let changed = conn.execute(
        "UPDATE sessions SET state = ?1, final_method = COALESCE(?2, final_method), \
         updated_at = datetime('now') WHERE id = ?3 AND state = ?4",
        rusqlite::params![next.key(), final_method.map(|m| m.key()), id, current.key()],
    )?;
    if changed == 0 {
        // Someone else moved the session first; report against what they left.
        let now = session_state(conn, id)?;
        return Err(FerretError::InvalidTransition {
            state: now.key().replace('_', " "),
            event: event.verb().to_string(),
        });
    }
    tracing::debug!(session_id = id, from = current.key(), to = next.key(), "session transition");
    Ok(next)
}

/// Append a finished attempt, assigning the next sequence number.
pub fn append_attempt(conn: &Connection, id: &str, attempt: &ParsingAttempt) -> Result<ParsingAttempt> {
    conn.execute(
        "INSERT INTO attempts (session_id, sequence, method, status, transactions_found, confidence, error_message, duration_ms) \
         SELECT ?1, COALESCE(MAX(sequence), 0) + 1, ?2, ?3, ?4, ?5, ?6, ?7 FROM attempts WHERE session_id = ?1",
        rusqlite::params![
            id,
            attempt.method.key(),
            attempt.status.key(),
            attempt.transactions_found as i64,
            attempt.confidence,
            attempt.error_message,
            attempt.duration_ms as i64,
        ],
    )?;
    let sequence: i64 = conn.query_row(
        "SELECT sequence FROM attempts WHERE rowid = ?1",
        [conn.last_insert_rowid()],
        |r| r.get(0),
    )?;
    Ok(ParsingAttempt {
        sequence,
        ..attempt.clone()
    })
}

fn attempt_from_row(row: &Row<'_>) -> rusqlite::Result<ParsingAttempt> {
    Ok(ParsingAttempt {
        sequence: row.get(0)?,
        method: parse_column(1, row.get(1)?)?,
        status: parse_column(2, row.get(2)?)?,
        transactions_found: row.get::<_, i64>(3)? as usize,
        confidence: row.get(4)?,
        error_message: row.get(5)?,
        duration_ms: row.get::<_, i64>(6)? as u64,
    })
}

pub fn list_attempts(conn: &Connection, id: &str) -> Result<Vec<ParsingAttempt>> {
    let mut stmt = conn.prepare(
        "SELECT sequence, method, status, transactions_found, confidence, error_message, duration_ms \
         FROM attempts WHERE session_id = ?1 ORDER BY sequence",
    )?;
    let rows = stmt
        .query_map([id], attempt_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Replace the session's accepted transaction set.
pub fn replace_transactions(conn: &Connection, id: &str, txns: &[ExtractedTransaction]) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    tx.execute("DELETE FROM session_transactions WHERE session_id = ?1", [id])?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO session_transactions \
             (session_id, position, date, amount, description, txn_type, balance, category, merchant, reference, confidence, source, source_line) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        )?;
        for (i, t) in txns.iter().enumerate() {
            stmt.execute(rusqlite::params![
                id,
                i as i64,
                t.date,
                t.amount,
                t.description,
                t.txn_type.key(),
                t.balance,
                t.category,
                t.merchant,
                t.reference,
                t.confidence,
                t.source.key(),
                t.source_line.map(|l| l as i64),
            ])?;
        }
    }
    tx.commit()?;
    Ok(())
}

fn transaction_from_row(row: &Row<'_>) -> rusqlite::Result<ExtractedTransaction> {
    Ok(ExtractedTransaction {
        date: row.get(0)?,
        amount: row.get(1)?,
        description: row.get(2)?,
        txn_type: parse_column(3, row.get(3)?)?,
        balance: row.get(4)?,
        category: row.get(5)?,
        merchant: row.get(6)?,
        reference: row.get(7)?,
        confidence: row.get(8)?,
        source: parse_column(9, row.get(9)?)?,
        source_line: row.get::<_, Option<i64>>(10)?.map(|l| l as usize),
    })
}

pub fn load_transactions(conn: &Connection, id: &str) -> Result<Vec<ExtractedTransaction>> {
    let mut stmt = conn.prepare(
        "SELECT date, amount, description, txn_type, balance, category, merchant, reference, confidence, source, source_line \
         FROM session_transactions WHERE session_id = ?1 ORDER BY position",
    )?;
    let rows = stmt
        .query_map([id], transaction_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn get_session(conn: &Connection, id: &str) -> Result<ParsingSession> {
    let row = conn
        .query_row(
            "SELECT id, file_name, file_path, file_type, checksum, state, final_method FROM sessions WHERE id = ?1",
            [id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    parse_column::<FileType>(3, r.get(3)?)?,
                    r.get::<_, String>(4)?,
                    parse_column::<SessionState>(5, r.get(5)?)?,
                    r.get::<_, Option<String>>(6)?,
                ))
            },
        )
        .optional()?;
    let Some((id, file_name, file_path, file_type, checksum, state, final_method)) = row else {
        return Err(FerretError::UnknownSession(id.to_string()));
    };
    let final_method = final_method.map(|m| m.parse::<ParsingMethod>()).transpose()?;
    let attempts = list_attempts(conn, &id)?;
    let transactions = load_transactions(conn, &id)?;
    Ok(ParsingSession {
        transactions: (!transactions.is_empty()).then_some(transactions),
        id,
        file_name,
        file_path,
        file_type,
        checksum,
        state,
        final_method,
        attempts,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub file_name: String,
    pub file_type: FileType,
    pub state: SessionState,
    pub final_method: Option<ParsingMethod>,
    pub attempts: i64,
    pub transactions: i64,
    pub created_at: String,
}

pub fn list_sessions(conn: &Connection) -> Result<Vec<SessionSummary>> {
    let mut stmt = conn.prepare(
        "SELECT s.id, s.file_name, s.file_type, s.state, s.final_method, \
                (SELECT count(*) FROM attempts a WHERE a.session_id = s.id), \
                (SELECT count(*) FROM session_transactions t WHERE t.session_id = s.id), \
                COALESCE(s.created_at, '') \
         FROM sessions s ORDER BY s.created_at DESC, s.rowid DESC",
    )?;
    let rows = stmt
        .query_map([], |r| {
            Ok(SessionSummary {
                id: r.get(0)?,
                file_name: r.get(1)?,
                file_type: parse_column(2, r.get(2)?)?,
                state: parse_column(3, r.get(3)?)?,
                final_method: r
                    .get::<_, Option<String>>(4)?
                    .map(|m| parse_column(4, m))
                    .transpose()?,
                attempts: r.get(5)?,
                transactions: r.get(6)?,
                created_at: r.get(7)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitOutcome {
    pub state: SessionState,
    pub timed_out: bool,
}

/// Poll until the session leaves `created`/`parsing`, or the ceiling passes.
/// A timeout is not an error; the session stays resumable.
pub fn wait_for_settled(
    conn: &Connection,
    id: &str,
    interval: Duration,
    ceiling: Duration,
) -> Result<WaitOutcome> {
    let started = Instant::now();
    loop {
        let state = session_state(conn, id)?;
        if !matches!(state, SessionState::Created | SessionState::Parsing) {
            return Ok(WaitOutcome { state, timed_out: false });
        }
        if started.elapsed() >= ceiling {
            tracing::warn!(session_id = id, state = state.key(), "gave up waiting for session");
            return Ok(WaitOutcome { state, timed_out: true });
        }
        std::thread::sleep(interval.min(ceiling.saturating_sub(started.elapsed())));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;
    use crate::models::{AttemptStatus, RunningAttempt, TransactionType};

    fn new_session(conn: &Connection) -> String {
        create_session(
            conn,
            &NewSession {
                file_name: "statement.csv",
                file_path: "/tmp/statement.csv",
                file_type: FileType::Csv,
                checksum: "abc123",
            },
        )
        .unwrap()
    }

    #[test]
    fn test_create_and_get() {
        let (_dir, conn) = test_db();
        let id = new_session(&conn);
        assert_eq!(id.len(), 16);
        let s = get_session(&conn, &id).unwrap();
        assert_eq!(s.state, SessionState::Created);
        assert_eq!(s.file_type, FileType::Csv);
        assert!(s.attempts.is_empty());
        assert!(s.transactions.is_none());
        assert!(matches!(get_session(&conn, "missing"), Err(FerretError::UnknownSession(_))));
    }

    #[test]
    fn test_find_by_checksum_ignores_abandoned() {
        let (_dir, conn) = test_db();
        let id = new_session(&conn);
        assert_eq!(find_by_checksum(&conn, "abc123").unwrap(), Some(id.clone()));
        apply_event(&conn, &id, SessionEvent::Cancel, None).unwrap();
        assert_eq!(find_by_checksum(&conn, "abc123").unwrap(), None);
    }

    #[test]
    fn test_events_follow_state_machine() {
        let (_dir, conn) = test_db();
        let id = new_session(&conn);
        assert!(apply_event(&conn, &id, SessionEvent::Succeed, None).is_err());
        apply_event(&conn, &id, SessionEvent::Start, None).unwrap();
        apply_event(&conn, &id, SessionEvent::Succeed, Some(ParsingMethod::RegexPattern)).unwrap();
        let s = get_session(&conn, &id).unwrap();
        assert_eq!(s.state, SessionState::Succeeded);
        assert_eq!(s.final_method, Some(ParsingMethod::RegexPattern));
        assert!(matches!(
            apply_event(&conn, &id, SessionEvent::Cancel, None),
            Err(FerretError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_attempt_log_is_append_only() {
        let (_dir, conn) = test_db();
        let id = new_session(&conn);
        let first = append_attempt(&conn, &id, &RunningAttempt::start(ParsingMethod::ColumnMapping).fail(0, 0.3, "low".into())).unwrap();
        let second = append_attempt(&conn, &id, &RunningAttempt::start(ParsingMethod::RegexPattern).succeed(4, 0.75)).unwrap();
        assert_eq!((first.sequence, second.sequence), (1, 2));

        let log = list_attempts(&conn, &id).unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].status, AttemptStatus::Failed);
        assert_eq!(log[0].error_message.as_deref(), Some("low"));
        assert_eq!(log[1].transactions_found, 4);

        append_attempt(&conn, &id, &RunningAttempt::start(ParsingMethod::AiFallback).fail(0, 0.0, "x".into())).unwrap();
        let later = list_attempts(&conn, &id).unwrap();
        assert_eq!(later.len(), 3);
        assert_eq!(later[0].error_message, log[0].error_message);
        assert_eq!(later[1].confidence, log[1].confidence);
    }

    #[test]
    fn test_replace_transactions_roundtrip() {
        let (_dir, conn) = test_db();
        let id = new_session(&conn);
        let mut t = ExtractedTransaction::from_signed(
            "2024-01-16".into(),
            -2000.0,
            "Salary".into(),
            0.9,
            ParsingMethod::ColumnMapping,
        );
        t.balance = Some(2500.0);
        t.source_line = Some(1);
        replace_transactions(&conn, &id, &[t.clone(), t.clone()]).unwrap();
        replace_transactions(&conn, &id, &[t.clone()]).unwrap();
        let loaded = load_transactions(&conn, &id).unwrap();
        assert_eq!(loaded, vec![t]);
        assert_eq!(loaded[0].txn_type, TransactionType::Credit);
    }

    #[test]
    fn test_list_sessions_counts() {
        let (_dir, conn) = test_db();
        let id = new_session(&conn);
        append_attempt(&conn, &id, &RunningAttempt::start(ParsingMethod::ColumnMapping).succeed(0, 0.0)).unwrap();
        let list = list_sessions(&conn).unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].attempts, 1);
        assert_eq!(list[0].transactions, 0);
    }

    #[test]
    fn test_wait_for_settled() {
        let (_dir, conn) = test_db();
        let id = new_session(&conn);
        let out = wait_for_settled(&conn, &id, Duration::from_millis(5), Duration::from_millis(20)).unwrap();
        assert!(out.timed_out);
        assert_eq!(out.state, SessionState::Created);

        apply_event(&conn, &id, SessionEvent::Start, None).unwrap();
        apply_event(&conn, &id, SessionEvent::Exhaust, None).unwrap();
        let out = wait_for_settled(&conn, &id, Duration::from_millis(5), Duration::from_secs(1)).unwrap();
        assert_eq!(out, WaitOutcome { state: SessionState::RequiresManualCorrection, timed_out: false });
    }
}

// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Server-audit trail — append-only SQLite log of operational events that the
// error handling design sends to `server-audit` subscribers: policy
// rejections, filesystem errors, and internal invariant violations.
//
// Schema:
//   audit_log(
//     id         INTEGER PRIMARY KEY AUTOINCREMENT,
//     timestamp  TEXT    NOT NULL,   -- RFC 3339
//     action     TEXT    NOT NULL,   -- e.g. "cancel-job", "spool-io", "policy-deny"
//     subject    TEXT    NOT NULL,   -- job id or printer/class name involved
//     success    INTEGER NOT NULL,   -- 0 = failure, 1 = success
//     details    TEXT                -- optional free-form context
//   )

use std::path::Path;

use chrono::Utc;
use presswerk_core::error::SchedulerError;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

// ---------------------------------------------------------------------------
// Local error helpers
// ---------------------------------------------------------------------------

fn db_err(e: rusqlite::Error) -> SchedulerError {
    SchedulerError::Database(e.to_string())
}

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// A single entry in the audit log, used for queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: i64,
    pub timestamp: String,
    pub action: String,
    pub subject: String,
    pub success: bool,
    pub details: Option<String>,
}

/// Append-only audit log backed by a SQLite database.
///
/// Every operational error and policy decision the event loop surfaces is
/// recorded with a timestamp, action name, the job/printer subject involved,
/// and a success/failure flag. Kept separate from the five crash-safe
/// configuration files the scheduler owns directly; losing the audit trail
/// across a crash is acceptable, losing job/printer state is not.
pub struct AuditLog {
    conn: Connection,
}

impl AuditLog {
    /// Open (or create) the audit database at `path`.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SchedulerError> {
        let conn = Connection::open(path).map_err(db_err)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")
            .map_err(db_err)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS audit_log (
                id        INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT    NOT NULL,
                action    TEXT    NOT NULL,
                subject   TEXT    NOT NULL,
                success   INTEGER NOT NULL,
                details   TEXT
            );",
        )
        .map_err(db_err)?;

        debug!("audit log opened");
        Ok(Self { conn })
    }

    /// Open an in-memory audit database (useful for tests).
    pub fn open_in_memory() -> Result<Self, SchedulerError> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS audit_log (
                id        INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT    NOT NULL,
                action    TEXT    NOT NULL,
                subject   TEXT    NOT NULL,
                success   INTEGER NOT NULL,
                details   TEXT
            );",
        )
        .map_err(db_err)?;

        debug!("in-memory audit log opened");
        Ok(Self { conn })
    }

    /// Record a new audit entry.
    #[instrument(skip(self, details), fields(%action, %subject, success))]
    pub fn record(
        &self,
        action: &str,
        subject: &str,
        success: bool,
        details: Option<&str>,
    ) -> Result<(), SchedulerError> {
        let timestamp = Utc::now().to_rfc3339();
        let success_int: i32 = if success { 1 } else { 0 };

        self.conn
            .execute(
                "INSERT INTO audit_log (timestamp, action, subject, success, details)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![timestamp, action, subject, success_int, details],
            )
            .map_err(db_err)?;

        debug!("audit entry recorded");
        Ok(())
    }

    /// Retrieve all entries for a given subject, ordered by timestamp
    /// ascending.
    pub fn entries_for_subject(&self, subject: &str) -> Result<Vec<AuditEntry>, SchedulerError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, timestamp, action, subject, success, details
                 FROM audit_log
                 WHERE subject = ?1
                 ORDER BY timestamp ASC",
            )
            .map_err(db_err)?;

        let rows = stmt
            .query_map(params![subject], Self::row_to_entry)
            .map_err(db_err)?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row.map_err(db_err)?);
        }
        Ok(entries)
    }

    /// Retrieve the most recent `limit` entries, ordered newest-first.
    pub fn recent_entries(&self, limit: u32) -> Result<Vec<AuditEntry>, SchedulerError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, timestamp, action, subject, success, details
                 FROM audit_log
                 ORDER BY id DESC
                 LIMIT ?1",
            )
            .map_err(db_err)?;

        let rows = stmt
            .query_map(params![limit], Self::row_to_entry)
            .map_err(db_err)?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row.map_err(db_err)?);
        }
        Ok(entries)
    }

    /// Return the total number of entries in the audit log.
    pub fn count(&self) -> Result<u64, SchedulerError> {
        self.conn
            .query_row("SELECT COUNT(*) FROM audit_log", [], |row| row.get(0))
            .map_err(db_err)
    }

    fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditEntry> {
        Ok(AuditEntry {
            id: row.get(0)?,
            timestamp: row.get(1)?,
            action: row.get(2)?,
            subject: row.get(3)?,
            success: row.get::<_, i32>(4)? != 0,
            details: row.get(5)?,
        })
    }
}

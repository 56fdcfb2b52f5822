use std::collections::HashSet;
use std::path::Path;

use rusqlite::{Connection, ErrorCode, OpenFlags, OptionalExtension};

use crate::error::{FreebeanError, Result};
use crate::models::SyncType;

pub const SCHEMA_VERSION: &str = "1";

pub const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sync_history (
    id INTEGER PRIMARY KEY,
    sync_type TEXT NOT NULL,
    freee_id INTEGER NOT NULL,
    issue_date TEXT NOT NULL,
    amount INTEGER NOT NULL,
    beancount_file TEXT NOT NULL,
    synced_at TEXT DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    UNIQUE (sync_type, freee_id)
);

CREATE INDEX IF NOT EXISTS idx_sync_history_issue_date ON sync_history(issue_date);
CREATE INDEX IF NOT EXISTS idx_sync_history_freee_id ON sync_history(freee_id);

CREATE TABLE IF NOT EXISTS document_attachments (
    id INTEGER PRIMARY KEY,
    transaction_date TEXT NOT NULL,
    ref_number TEXT,
    deal_id INTEGER,
    document_path TEXT NOT NULL,
    attached_at TEXT DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);

CREATE INDEX IF NOT EXISTS idx_document_attachments_date ON document_attachments(transaction_date);

CREATE TABLE IF NOT EXISTS sync_metadata (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT DEFAULT (datetime('now'))
);
";

pub fn get_connection(db_path: &Path) -> Result<Connection> {
    let conn = Connection::open(db_path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    Ok(conn)
}

pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)?;
    if get_metadata(conn, "schema_version").is_none() {
        set_metadata(conn, "schema_version", SCHEMA_VERSION)?;
    }
    Ok(())
}

/// Open the history database, creating the schema if needed.
pub fn open_history(db_path: &Path) -> Result<Connection> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let conn = get_connection(db_path)?;
    init_db(&conn)?;
    Ok(conn)
}

/// Open the history database without creating or migrating anything. A missing file reads
/// as an empty history.
pub fn open_history_read_only(db_path: &Path) -> Result<Connection> {
    if !db_path.exists() {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        return Ok(conn);
    }
    let conn = Connection::open_with_flags(
        db_path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    Ok(conn)
}

// ---------------------------------------------------------------------------
// Sync history
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SyncRecord {
    pub sync_type: SyncType,
    pub freee_id: i64,
    pub issue_date: String,
    pub amount: i64,
    pub beancount_file: String,
}

pub fn get_synced_ids(conn: &Connection, sync_type: SyncType) -> Result<HashSet<i64>> {
    let mut stmt = conn.prepare("SELECT freee_id FROM sync_history WHERE sync_type = ?1")?;
    let ids = stmt
        .query_map([sync_type.as_str()], |row| row.get(0))?
        .collect::<std::result::Result<HashSet<i64>, _>>()?;
    Ok(ids)
}

/// Fails with `DuplicateSync` when the (type, id) pair is already recorded.
pub fn record_sync(conn: &Connection, record: &SyncRecord) -> Result<()> {
    let result = conn.execute(
        "INSERT INTO sync_history (sync_type, freee_id, issue_date, amount, beancount_file) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
        rusqlite::params![
            record.sync_type.as_str(),
            record.freee_id,
            record.issue_date,
            record.amount,
            record.beancount_file,
        ],
    );
    match result {
        Ok(_) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
            Err(FreebeanError::DuplicateSync {
                sync_type: record.sync_type,
                freee_id: record.freee_id,
            })
        }
        Err(e) => Err(e.into()),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncStats {
    pub total_deals: i64,
    pub total_journals: i64,
    pub total_documents: i64,
    pub last_sync: Option<String>,
}

pub fn get_stats(conn: &Connection) -> Result<SyncStats> {
    let count_type = |sync_type: SyncType| -> Result<i64> {
        Ok(conn.query_row(
            "SELECT count(*) FROM sync_history WHERE sync_type = ?1",
            [sync_type.as_str()],
            |r| r.get(0),
        )?)
    };
    let total_documents: i64 =
        conn.query_row("SELECT count(*) FROM document_attachments", [], |r| r.get(0))?;
    let last_sync: Option<String> =
        conn.query_row("SELECT max(synced_at) FROM sync_history", [], |r| r.get(0))?;

    Ok(SyncStats {
        total_deals: count_type(SyncType::Deal)?,
        total_journals: count_type(SyncType::Journal)?,
        total_documents,
        last_sync,
    })
}

/// Synced items per month, newest first.
#[derive(Debug, Clone, PartialEq)]
pub struct MonthSummary {
    pub month: String,
    pub deals: i64,
    pub journals: i64,
    pub amount: i64,
}

pub fn get_monthly_summary(conn: &Connection) -> Result<Vec<MonthSummary>> {
    let mut stmt = conn.prepare(
        "SELECT strftime('%Y-%m', issue_date) AS month,
                sum(CASE WHEN sync_type = 'deal' THEN 1 ELSE 0 END),
                sum(CASE WHEN sync_type = 'journal' THEN 1 ELSE 0 END),
                sum(amount)
         FROM sync_history
         GROUP BY month
         ORDER BY month DESC",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok(MonthSummary {
                month: row.get(0)?,
                deals: row.get(1)?,
                journals: row.get(2)?,
                amount: row.get(3)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ---------------------------------------------------------------------------
// Metadata
// ---------------------------------------------------------------------------

pub fn get_metadata(conn: &Connection, key: &str) -> Option<String> {
    conn.query_row("SELECT value FROM sync_metadata WHERE key = ?1", [key], |r| r.get(0))
        .optional()
        .ok()
        .flatten()
}

pub fn set_metadata(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO sync_metadata (key, value) VALUES (?1, ?2) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = datetime('now')",
        [key, value],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Document attachments
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DocumentAttachment {
    pub transaction_date: String,
    pub ref_number: Option<String>,
    pub deal_id: Option<i64>,
    pub document_path: String,
}

pub fn record_document_attachment(conn: &Connection, doc: &DocumentAttachment) -> Result<i64> {
    conn.execute(
        "INSERT INTO document_attachments (transaction_date, ref_number, deal_id, document_path) \
         VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![doc.transaction_date, doc.ref_number, doc.deal_id, doc.document_path],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn is_document_attached(conn: &Connection, document_path: &str) -> Result<bool> {
    let mut stmt = conn.prepare_cached("SELECT 1 FROM document_attachments WHERE document_path = ?1")?;
    Ok(stmt.exists([document_path])?)
}

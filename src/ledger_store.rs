use std::path::Path;

use rusqlite::{params, Connection};
use tracing::info;

use crate::error::{SyncError, SyncResult};
use crate::transaction::{
    parse_sheet_datetime, LedgerRow, Transaction, FIRST_DATA_ROW, POSTED_MARKER,
};

/// Durable row store with spreadsheet semantics: a fixed
/// `email_date, date_of_use, amount, store, mf` schema, insertion order
/// preserved, and 1-based sheet rows where row 1 is the header.
///
/// This process is the sole writer per run; `mark_posted` still reports
/// `StoreConflict` when the addressed row no longer exists.
pub trait LedgerStore {
    fn list_rows(&mut self) -> SyncResult<Vec<LedgerRow>>;
    fn append(&mut self, tx: &Transaction) -> SyncResult<()>;
    /// Sets the posted marker for exactly one data row. The flag is
    /// monotonic: nothing in this store ever clears it.
    fn mark_posted(&mut self, sheet_row: usize) -> SyncResult<()>;
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS ledger_rows (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    email_date TEXT NOT NULL,
    date_of_use TEXT NOT NULL DEFAULT '',
    amount INTEGER NOT NULL,
    store TEXT NOT NULL DEFAULT '',
    mf TEXT NOT NULL DEFAULT ''
);
"#;

/// SQLite-backed ledger.
pub struct SqliteLedger {
    conn: Connection,
}

impl SqliteLedger {
    pub fn open(path: &Path) -> SyncResult<SqliteLedger> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SyncError::store(format!("create ledger dir failed: {e}")))?;
        }
        let conn = Connection::open(path)
            .map_err(|e| SyncError::store(format!("open ledger db failed: {e}")))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| SyncError::store(format!("ensure ledger schema failed: {e}")))?;
        info!(path = %path.display(), "ledger store ready");
        Ok(SqliteLedger { conn })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> SyncResult<SqliteLedger> {
        let conn = Connection::open_in_memory()
            .map_err(|e| SyncError::store(format!("open in-memory ledger failed: {e}")))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| SyncError::store(format!("ensure ledger schema failed: {e}")))?;
        Ok(SqliteLedger { conn })
    }

    /// Maps a 1-based sheet row to the row id at that insertion-ordered
    /// position, or `None` when the position is past the end.
    fn row_id_at(&self, sheet_row: usize) -> SyncResult<Option<i64>> {
        if sheet_row < FIRST_DATA_ROW {
            return Ok(None);
        }
        let offset = (sheet_row - FIRST_DATA_ROW) as i64;
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM ledger_rows ORDER BY id ASC LIMIT 1 OFFSET ?1")
            .map_err(SyncError::store)?;
        let mut rows = stmt.query(params![offset]).map_err(SyncError::store)?;
        match rows.next().map_err(SyncError::store)? {
            Some(row) => Ok(Some(row.get::<_, i64>(0).map_err(SyncError::store)?)),
            None => Ok(None),
        }
    }
}

impl LedgerStore for SqliteLedger {
    fn list_rows(&mut self) -> SyncResult<Vec<LedgerRow>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT email_date, date_of_use, amount, store, mf \
                 FROM ledger_rows ORDER BY id ASC",
            )
            .map_err(SyncError::store)?;
        let mapped = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .map_err(SyncError::store)?;

        let mut out = Vec::new();
        for (idx, raw) in mapped.enumerate() {
            let (email_date, date_of_use, amount, store, mf) = raw.map_err(SyncError::store)?;
            let email_date = parse_sheet_datetime(&email_date).ok_or_else(|| {
                SyncError::store(format!("unparsable email_date in ledger: {email_date}"))
            })?;
            out.push(LedgerRow {
                sheet_row: idx + FIRST_DATA_ROW,
                email_date,
                date_of_use: parse_sheet_datetime(&date_of_use),
                amount,
                store,
                posted: mf == POSTED_MARKER,
            });
        }
        Ok(out)
    }

    fn append(&mut self, tx: &Transaction) -> SyncResult<()> {
        self.conn
            .execute(
                "INSERT INTO ledger_rows(email_date, date_of_use, amount, store, mf) \
                 VALUES (?1, ?2, ?3, ?4, '')",
                params![tx.email_date_str(), tx.date_of_use_str(), tx.amount, tx.store],
            )
            .map_err(|e| SyncError::store(format!("append ledger row failed: {e}")))?;
        Ok(())
    }

    fn mark_posted(&mut self, sheet_row: usize) -> SyncResult<()> {
        let id = self
            .row_id_at(sheet_row)?
            .ok_or_else(|| SyncError::StoreConflict {
                sheet_row,
                reason: "no data row at this position".to_string(),
            })?;
        self.conn
            .execute(
                "UPDATE ledger_rows SET mf = ?1 WHERE id = ?2",
                params![POSTED_MARKER, id],
            )
            .map_err(|e| SyncError::store(format!("mark posted failed: {e}")))?;
        Ok(())
    }
}

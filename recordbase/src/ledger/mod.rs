use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

use crate::error::Result;

/// Lookup of patch ids that have already been applied.
pub trait AppliedPatches {
    fn is_applied(&self, id: &str) -> Result<bool>;
}

/// Applied-patch ledger kept in SQLite, so a retried `PATCH` request does
/// not apply the same patch twice.
pub struct PatchLedger {
    conn: Mutex<Connection>,
}

impl PatchLedger {
    /// Open or create the ledger at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        let ledger = PatchLedger {
            conn: Mutex::new(conn),
        };
        ledger.initialize_tables()?;
        Ok(ledger)
    }

    /// Open an in-memory ledger. Forgets everything on drop.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let ledger = PatchLedger {
            conn: Mutex::new(conn),
        };
        ledger.initialize_tables()?;
        Ok(ledger)
    }

    fn initialize_tables(&self) -> Result<()> {
        self.conn.lock().execute_batch(
            "
            CREATE TABLE IF NOT EXISTS applied_patches (
                id TEXT PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            ",
        )?;
        Ok(())
    }

    /// Record patch ids as applied. Ids already present are kept as they are.
    pub fn mark_applied(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for id in ids {
            tx.execute(
                "INSERT OR IGNORE INTO applied_patches (id) VALUES (?1)",
                params![id],
            )?;
        }
        tx.commit()?;
        log::debug!("marked {} patches applied", ids.len());
        Ok(())
    }

    /// When a patch id was recorded, as SQLite's `datetime('now')` text.
    pub fn applied_at(&self, id: &str) -> Result<Option<String>> {
        let result = self
            .conn
            .lock()
            .query_row(
                "SELECT applied_at FROM applied_patches WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(result)
    }
}

impl AppliedPatches for PatchLedger {
    fn is_applied(&self, id: &str) -> Result<bool> {
        Ok(self.applied_at(id)?.is_some())
    }
}

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{Connection, Transaction, TransactionBehavior};
use tracing::debug;

use crate::error::StoreResult;

/// SQLite-backed store shared by every worker, supervisor and the CLI.
///
/// Several processes may open the same file. Every read-then-write operation
/// runs inside `BEGIN IMMEDIATE`, so the database write lock is taken before the
/// read and two claimants can never both observe a task as `pending`.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    path: PathBuf,
}

const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

impl SqliteStore {
    pub fn open(db_path: &Path) -> StoreResult<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let init_sql = include_str!("../migrations/0001_init.sql");
        conn.execute_batch(init_sql)?;
        debug!(path = %db_path.display(), "opened store");
        Ok(Self { conn: Mutex::new(conn), path: db_path.to_path_buf() })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panic mid-statement leaves SQLite consistent; the guard is still usable.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `f` inside an IMMEDIATE transaction. An `Err` from `f` rolls back.
    pub(crate) fn write_tx<T>(&self, f: impl FnOnce(&Transaction<'_>) -> StoreResult<T>) -> StoreResult<T> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }
}

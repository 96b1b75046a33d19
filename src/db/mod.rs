use std::path::Path;
use tokio::sync::{Mutex, MutexGuard};
use turso::{Builder, Connection};

// Custom error type for database operations
pub(crate) type DbResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

pub mod transfers;
pub mod users;

pub use transfers::{Statistics, TransferRecord};
pub use users::UserRecord;

/// User/quota store.
///
/// One connection wrapped in a Mutex so every statement is serialized; turso's
/// page cache is not safe under concurrent access.
pub struct Database {
    conn: Mutex<Connection>,
}

// ============ Connection and Initialization ============

impl Database {
    /// Open (or create) the database file and make sure all tables exist
    pub async fn open(db_path: &Path) -> DbResult<Self> {
        let path = db_path
            .to_str()
            .ok_or("Database path is not valid UTF-8")?;
        let db = Builder::new_local(path).build().await?;
        let conn = db.connect()?;

        // Enable foreign keys
        conn.execute("PRAGMA foreign_keys = ON;", ()).await?;

        conn.execute_batch(&format!(
            "{}{}",
            users::get_table_sql(),
            transfers::get_table_sql()
        ))
        .await?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub(crate) async fn connection(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().await
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

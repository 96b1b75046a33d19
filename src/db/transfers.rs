use super::{Database, DbResult};
use crate::transfer::Destination;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransferRecord {
    pub id: i64,
    pub user_id: i64,
    pub file_name: String,
    pub file_size: u64,
    pub destination: Destination,
    pub created_at: i64,
}

/// Totals shown in the admin panel
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Statistics {
    pub user_count: u64,
    pub transfer_count: u64,
    pub total_bytes: u64,
}

/// Get SQL for creating the transfer history table
pub fn get_table_sql() -> &'static str {
    "
    -- Append-only transfer history
    CREATE TABLE IF NOT EXISTS transfers (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL REFERENCES users(user_id),
        file_name TEXT NOT NULL,
        file_size INTEGER NOT NULL,
        destination TEXT NOT NULL,
        created_at INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_transfers_user ON transfers(user_id, created_at);
    "
}

// ============ Transfer History Functions ============

impl Database {
    /// Append a completed transfer to the history
    pub async fn record_transfer(
        &self,
        user_id: i64,
        file_name: &str,
        file_size: u64,
        destination: Destination,
    ) -> DbResult<i64> {
        let size = i64::try_from(file_size)?;
        let conn = self.connection().await;
        let now = chrono::Utc::now().timestamp();
        conn.execute(
            "INSERT INTO transfers (user_id, file_name, file_size, destination, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            turso::params![user_id, file_name, size, destination.as_str(), now],
        )
        .await?;
        Ok(conn.last_insert_rowid())
    }

    /// Most recent transfers of a user
    pub async fn list_user_transfers(
        &self,
        user_id: i64,
        limit: i64,
    ) -> DbResult<Vec<TransferRecord>> {
        let conn = self.connection().await;
        let mut rows = conn
            .query(
                "SELECT id, user_id, file_name, file_size, destination, created_at
                 FROM transfers WHERE user_id = ?1
                 ORDER BY created_at DESC, id DESC
                 LIMIT ?2",
                turso::params![user_id, limit],
            )
            .await?;

        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            let file_size: i64 = row.get(3)?;
            let destination: String = row.get(4)?;
            records.push(TransferRecord {
                id: row.get(0)?,
                user_id: row.get(1)?,
                file_name: row.get(2)?,
                file_size: file_size.max(0) as u64,
                destination: destination.into(),
                created_at: row.get(5)?,
            });
        }
        Ok(records)
    }

    /// User count, transfer count and total bytes relayed
    pub async fn aggregate_statistics(&self) -> DbResult<Statistics> {
        let conn = self.connection().await;

        let mut rows = conn.query("SELECT COUNT(*) FROM users", ()).await?;
        let user_count: i64 = match rows.next().await? {
            Some(row) => row.get(0)?,
            None => 0,
        };
        drop(rows);

        let mut rows = conn
            .query(
                "SELECT COUNT(*), COALESCE(SUM(file_size), 0) FROM transfers",
                (),
            )
            .await?;
        let (transfer_count, total_bytes): (i64, i64) = match rows.next().await? {
            Some(row) => (row.get(0)?, row.get(1)?),
            None => (0, 0),
        };

        Ok(Statistics {
            user_count: user_count.max(0) as u64,
            transfer_count: transfer_count.max(0) as u64,
            total_bytes: total_bytes.max(0) as u64,
        })
    }
}

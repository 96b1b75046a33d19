use super::{Database, DbResult};
use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};

// ============ User Struct ============

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserRecord {
    pub user_id: i64,
    pub name: String,
    pub plan: String,
    pub monthly_used: u64,
    /// Serialized cloud credential, `None` when no account is linked
    pub drive_credential: Option<String>,
    pub created_at: i64,
    pub last_reset: i64,
}

/// Get SQL for creating the users table
pub fn get_table_sql() -> &'static str {
    "
    CREATE TABLE IF NOT EXISTS users (
        user_id INTEGER PRIMARY KEY,
        name TEXT NOT NULL,
        plan TEXT NOT NULL DEFAULT 'free',
        monthly_used INTEGER NOT NULL DEFAULT 0,
        drive_credential TEXT,
        created_at INTEGER NOT NULL,
        last_reset INTEGER NOT NULL
    );
    "
}

const USER_COLUMNS: &str =
    "user_id, name, plan, monthly_used, drive_credential, created_at, last_reset";

fn user_from_row(row: &turso::Row) -> DbResult<UserRecord> {
    let monthly_used: i64 = row.get(3)?;
    Ok(UserRecord {
        user_id: row.get(0)?,
        name: row.get(1)?,
        plan: row.get(2)?,
        monthly_used: monthly_used.max(0) as u64,
        drive_credential: row.get(4)?,
        created_at: row.get(5)?,
        last_reset: row.get(6)?,
    })
}

// ============ User CRUD Functions ============

impl Database {
    /// Get a user by ID
    pub async fn get_user(&self, user_id: i64) -> DbResult<Option<UserRecord>> {
        let conn = self.connection().await;
        let mut rows = conn
            .query(
                &format!("SELECT {} FROM users WHERE user_id = ?1", USER_COLUMNS),
                turso::params![user_id],
            )
            .await?;

        if let Some(row) = rows.next().await? {
            Ok(Some(user_from_row(&row)?))
        } else {
            Ok(None)
        }
    }

    /// Register a user; returns false if the user already exists
    pub async fn create_user(&self, user_id: i64, name: &str, plan: &str) -> DbResult<bool> {
        let conn = self.connection().await;
        let mut rows = conn
            .query(
                "SELECT user_id FROM users WHERE user_id = ?1",
                turso::params![user_id],
            )
            .await?;
        if rows.next().await?.is_some() {
            return Ok(false);
        }
        drop(rows);

        let now = Utc::now().timestamp();
        conn.execute(
            "INSERT INTO users (user_id, name, plan, monthly_used, drive_credential, created_at, last_reset)
             VALUES (?1, ?2, ?3, 0, NULL, ?4, ?5)",
            turso::params![user_id, name, plan, now, now],
        )
        .await?;
        Ok(true)
    }

    /// All users, newest first
    pub async fn list_users(&self) -> DbResult<Vec<UserRecord>> {
        let conn = self.connection().await;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {} FROM users ORDER BY created_at DESC, user_id DESC",
                    USER_COLUMNS
                ),
                (),
            )
            .await?;

        let mut users = Vec::new();
        while let Some(row) = rows.next().await? {
            users.push(user_from_row(&row)?);
        }
        Ok(users)
    }

    /// Change a user's plan; returns false if the user does not exist
    pub async fn set_plan(&self, user_id: i64, plan: &str) -> DbResult<bool> {
        let conn = self.connection().await;
        let changed = conn
            .execute(
                "UPDATE users SET plan = ?1 WHERE user_id = ?2",
                turso::params![plan, user_id],
            )
            .await?;
        Ok(changed > 0)
    }

    /// Add bytes to the monthly usage counter
    pub async fn add_usage(&self, user_id: i64, delta_bytes: u64) -> DbResult<()> {
        let delta = i64::try_from(delta_bytes)?;
        let conn = self.connection().await;
        conn.execute(
            "UPDATE users SET monthly_used = monthly_used + ?1 WHERE user_id = ?2",
            turso::params![delta, user_id],
        )
        .await?;
        Ok(())
    }

    /// Zero the usage counter of one user, or of everyone when `user_id` is `None`
    pub async fn reset_usage(&self, user_id: Option<i64>) -> DbResult<u64> {
        let conn = self.connection().await;
        let now = Utc::now().timestamp();
        let changed = match user_id {
            Some(id) => {
                conn.execute(
                    "UPDATE users SET monthly_used = 0, last_reset = ?1 WHERE user_id = ?2",
                    turso::params![now, id],
                )
                .await?
            }
            None => {
                conn.execute(
                    "UPDATE users SET monthly_used = 0, last_reset = ?1",
                    turso::params![now],
                )
                .await?
            }
        };
        Ok(changed)
    }

    /// Store or clear the cloud credential
    pub async fn set_credential(&self, user_id: i64, credential: Option<&str>) -> DbResult<()> {
        let conn = self.connection().await;
        conn.execute(
            "UPDATE users SET drive_credential = ?1 WHERE user_id = ?2",
            turso::params![credential, user_id],
        )
        .await?;
        Ok(())
    }

    /// Reset every user whose last reset happened in an earlier calendar month
    pub async fn reset_stale_usage(&self, now: DateTime<Utc>) -> DbResult<usize> {
        let conn = self.connection().await;
        let mut rows = conn
            .query("SELECT user_id, last_reset FROM users", ())
            .await?;

        let mut stale: Vec<i64> = Vec::new();
        while let Some(row) = rows.next().await? {
            let user_id: i64 = row.get(0)?;
            let last_reset: i64 = row.get(1)?;
            let same_month = DateTime::<Utc>::from_timestamp(last_reset, 0)
                .map(|t| t.year() == now.year() && t.month() == now.month())
                .unwrap_or(false);
            if !same_month {
                stale.push(user_id);
            }
        }
        drop(rows);

        for user_id in &stale {
            conn.execute(
                "UPDATE users SET monthly_used = 0, last_reset = ?1 WHERE user_id = ?2",
                turso::params![now.timestamp(), *user_id],
            )
            .await?;
        }
        Ok(stale.len())
    }

    #[cfg(test)]
    pub(crate) async fn set_last_reset(&self, user_id: i64, timestamp: i64) -> DbResult<()> {
        let conn = self.connection().await;
        conn.execute(
            "UPDATE users SET last_reset = ?1 WHERE user_id = ?2",
            turso::params![timestamp, user_id],
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    async fn open_db(dir: &tempfile::TempDir) -> Database {
        Database::open(&dir.path().join("users.db")).await.unwrap()
    }

    #[test]
    fn users_sql_contains_table() {
        let sql = get_table_sql();
        assert!(sql.contains("CREATE TABLE IF NOT EXISTS users"));
        assert!(sql.contains("drive_credential TEXT"));
    }

    #[tokio::test]
    async fn create_user_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir).await;

        assert!(db.create_user(5, "Rin", "free").await.unwrap());
        assert!(!db.create_user(5, "Rin again", "pro").await.unwrap());

        let user = db.get_user(5).await.unwrap().unwrap();
        assert_eq!(user.name, "Rin");
        assert_eq!(user.plan, "free");
        assert_eq!(user.monthly_used, 0);
        assert_eq!(user.drive_credential, None);
        assert!(db.get_user(6).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn usage_plan_and_credential_updates() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir).await;
        db.create_user(1, "a", "free").await.unwrap();
        db.create_user(2, "b", "free").await.unwrap();

        db.add_usage(1, 100).await.unwrap();
        db.add_usage(1, 50).await.unwrap();
        db.add_usage(2, 7).await.unwrap();
        assert!(db.set_plan(1, "pro").await.unwrap());
        assert!(!db.set_plan(99, "pro").await.unwrap());
        db.set_credential(1, Some("{\"access_token\":\"x\"}"))
            .await
            .unwrap();

        let a = db.get_user(1).await.unwrap().unwrap();
        assert_eq!(a.monthly_used, 150);
        assert_eq!(a.plan, "pro");
        assert!(a.drive_credential.is_some());

        db.set_credential(1, None).await.unwrap();
        assert_eq!(db.get_user(1).await.unwrap().unwrap().drive_credential, None);

        assert_eq!(db.reset_usage(Some(1)).await.unwrap(), 1);
        assert_eq!(db.get_user(1).await.unwrap().unwrap().monthly_used, 0);
        assert_eq!(db.get_user(2).await.unwrap().unwrap().monthly_used, 7);

        db.reset_usage(None).await.unwrap();
        assert_eq!(db.get_user(2).await.unwrap().unwrap().monthly_used, 0);
        assert_eq!(db.list_users().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn monthly_rollover_only_touches_earlier_months() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir).await;
        db.create_user(1, "old", "free").await.unwrap();
        db.create_user(2, "current", "free").await.unwrap();
        db.add_usage(1, 10).await.unwrap();
        db.add_usage(2, 20).await.unwrap();

        let now = Utc.with_ymd_and_hms(2026, 10, 17, 12, 0, 0).unwrap();
        let last_month = Utc.with_ymd_and_hms(2026, 9, 30, 23, 0, 0).unwrap();
        let this_month = Utc.with_ymd_and_hms(2026, 10, 1, 0, 5, 0).unwrap();
        db.set_last_reset(1, last_month.timestamp()).await.unwrap();
        db.set_last_reset(2, this_month.timestamp()).await.unwrap();

        assert_eq!(db.reset_stale_usage(now).await.unwrap(), 1);
        assert_eq!(db.get_user(1).await.unwrap().unwrap().monthly_used, 0);
        assert_eq!(db.get_user(2).await.unwrap().unwrap().monthly_used, 20);
    }
}

use std::time::{SystemTime, UNIX_EPOCH};

use {
    serde::{Deserialize, Serialize},
    tracing::{debug, warn},
};

/// Durable fields of one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    /// Identity requested at creation. Defaults to the session id.
    pub phone: String,
    /// Identity resolved by the network after pairing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_phone: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub position: i64,
    /// Empty means no webhook.
    #[serde(default)]
    pub webhook_url: String,
    /// Unix seconds.
    pub created_at: i64,
}

impl SessionRecord {
    pub fn new(id: impl Into<String>, name: impl Into<String>, webhook_url: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            phone: id.clone(),
            id,
            actual_phone: None,
            name: name.into(),
            position: 0,
            webhook_url: webhook_url.into(),
            created_at: now_secs(),
        }
    }

    /// Resolved identity if known, otherwise the requested one.
    pub fn best_phone(&self) -> &str {
        self.actual_phone.as_deref().unwrap_or(&self.phone)
    }
}

pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

// ── SQLite-backed session metadata ──────────────────────────────────

/// SQLite-backed session metadata store.
#[derive(Clone)]
pub struct SqliteSessionMetadata {
    pool: sqlx::SqlitePool,
}

#[derive(sqlx::FromRow)]
struct SessionRow {
    id: String,
    phone: String,
    actual_phone: Option<String>,
    name: String,
    position: i64,
    webhook_url: String,
    created_at: i64,
}

impl From<SessionRow> for SessionRecord {
    fn from(r: SessionRow) -> Self {
        Self {
            id: r.id,
            phone: r.phone,
            actual_phone: r.actual_phone.filter(|p| !p.is_empty()),
            name: r.name,
            position: r.position,
            webhook_url: r.webhook_url,
            created_at: r.created_at,
        }
    }
}

impl SqliteSessionMetadata {
    pub fn new(pool: sqlx::SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &sqlx::SqlitePool {
        &self.pool
    }

    /// Create the `session_metadata` table if it doesn't exist.
    pub async fn init(pool: &sqlx::SqlitePool) -> sqlx::Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS session_metadata (
                id           TEXT PRIMARY KEY,
                phone        TEXT NOT NULL,
                actual_phone TEXT,
                name         TEXT NOT NULL DEFAULT '',
                position     INTEGER NOT NULL DEFAULT 0,
                webhook_url  TEXT NOT NULL DEFAULT '',
                created_at   INTEGER NOT NULL
            )"#,
        )
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> sqlx::Result<Option<SessionRecord>> {
        let row = sqlx::query_as::<_, SessionRow>("SELECT * FROM session_metadata WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Into::into))
    }

    /// Insert or replace the mutable fields of a row. `created_at` is kept
    /// from the first insert, and a known `actual_phone` is never cleared.
    pub async fn upsert(&self, record: &SessionRecord) -> sqlx::Result<()> {
        sqlx::query(
            r#"INSERT INTO session_metadata
                 (id, phone, actual_phone, name, position, webhook_url, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 phone = excluded.phone,
                 actual_phone = COALESCE(excluded.actual_phone, session_metadata.actual_phone),
                 name = excluded.name,
                 position = excluded.position,
                 webhook_url = excluded.webhook_url"#,
        )
        .bind(&record.id)
        .bind(&record.phone)
        .bind(&record.actual_phone)
        .bind(&record.name)
        .bind(record.position)
        .bind(&record.webhook_url)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;
        debug!(id = %record.id, "session metadata saved");
        Ok(())
    }

    pub async fn set_actual_phone(&self, id: &str, actual_phone: &str) -> sqlx::Result<bool> {
        self.update_column("actual_phone", id, actual_phone).await
    }

    pub async fn set_name(&self, id: &str, name: &str) -> sqlx::Result<bool> {
        self.update_column("name", id, name).await
    }

    pub async fn set_webhook_url(&self, id: &str, webhook_url: &str) -> sqlx::Result<bool> {
        self.update_column("webhook_url", id, webhook_url).await
    }

    pub async fn set_position(&self, id: &str, position: i64) -> sqlx::Result<bool> {
        let result = sqlx::query("UPDATE session_metadata SET position = ? WHERE id = ?")
            .bind(position)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_column(&self, column: &'static str, id: &str, value: &str) -> sqlx::Result<bool> {
        let sql = format!("UPDATE session_metadata SET {column} = ? WHERE id = ?");
        let result = sqlx::query(&sql)
            .bind(value)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            warn!(id, column, "no session metadata row to update");
        }
        Ok(result.rows_affected() > 0)
    }

    /// One past the highest position in use.
    pub async fn next_position(&self) -> sqlx::Result<i64> {
        let max: Option<i64> = sqlx::query_scalar("SELECT MAX(position) FROM session_metadata")
            .fetch_one(&self.pool)
            .await?;
        Ok(max.map_or(0, |m| m + 1))
    }

    /// Returns whether a row was removed.
    pub async fn remove(&self, id: &str) -> sqlx::Result<bool> {
        let result = sqlx::query("DELETE FROM session_metadata WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list(&self) -> sqlx::Result<Vec<SessionRecord>> {
        let rows = sqlx::query_as::<_, SessionRow>(
            "SELECT * FROM session_metadata ORDER BY position ASC, created_at ASC, id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}

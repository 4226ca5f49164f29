use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use tracing::info;

use super::{CacheEntry, CallEvent, SessionRecord, Storage};
use crate::config::DatabaseConfig;
use crate::error::{StorageError, StorageResult};
use crate::registry::NodeId;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS sessions (
        id TEXT PRIMARY KEY,
        label TEXT,
        created_at TEXT NOT NULL,
        metadata TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS call_events (
        session_id TEXT NOT NULL,
        node_id INTEGER NOT NULL,
        endpoint TEXT NOT NULL,
        fingerprint TEXT NOT NULL,
        input TEXT NOT NULL,
        output TEXT,
        error TEXT,
        label TEXT,
        color TEXT,
        created_at TEXT NOT NULL,
        PRIMARY KEY (session_id, node_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS cache_entries (
        session_id TEXT NOT NULL,
        fingerprint TEXT NOT NULL,
        input TEXT NOT NULL,
        input_override TEXT,
        output TEXT,
        output_override TEXT,
        executed_fingerprint TEXT,
        created_at TEXT NOT NULL,
        PRIMARY KEY (session_id, fingerprint)
    )
    "#,
];

/// SQLite-backed storage implementation
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Create a new SQLite storage instance backed by a file
    pub async fn new(config: &DatabaseConfig) -> StorageResult<Self> {
        // Ensure parent directory exists
        if let Some(parent) = config.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Connection {
                message: format!("Failed to create database directory: {}", e),
            })?;
        }

        let database_url = format!("sqlite://{}?mode=rwc", config.path.display());

        let options = SqliteConnectOptions::from_str(&database_url)
            .map_err(|e| StorageError::Connection {
                message: format!("Invalid database URL: {}", e),
            })?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection {
                message: format!("Failed to connect to database: {}", e),
            })?;

        let storage = Self { pool };
        storage.init_schema().await?;

        Ok(storage)
    }

    /// Create an in-memory storage instance for tests.
    ///
    /// The pool is capped at one connection: an in-memory SQLite database is
    /// per-connection, so additional connections would see an empty schema.
    pub async fn new_in_memory() -> StorageResult<Self> {
        let options =
            SqliteConnectOptions::from_str("sqlite::memory:").map_err(|e| {
                StorageError::Connection {
                    message: format!("Invalid database URL: {}", e),
                }
            })?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection {
                message: format!("Failed to connect to database: {}", e),
            })?;

        let storage = Self { pool };
        storage.init_schema().await?;

        Ok(storage)
    }

    /// Create the schema if it does not exist yet
    async fn init_schema(&self) -> StorageResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!("Database schema ready");
        Ok(())
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn create_session(&self, session: &SessionRecord) -> StorageResult<()> {
        let metadata = session
            .metadata
            .as_ref()
            .map(|m| serde_json::to_string(m).unwrap_or_default());

        sqlx::query(
            r#"
            INSERT INTO sessions (id, label, created_at, metadata)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&session.id)
        .bind(&session.label)
        .bind(session.created_at.to_rfc3339())
        .bind(&metadata)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_session(&self, id: &str) -> StorageResult<Option<SessionRecord>> {
        let row: Option<SessionRow> = sqlx::query_as(
            r#"
            SELECT id, label, created_at, metadata
            FROM sessions
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.into()))
    }

    async fn create_call_event(&self, event: &CallEvent) -> StorageResult<()> {
        let input = serde_json::to_string(&event.input).unwrap_or_default();
        let output = event
            .output
            .as_ref()
            .map(|o| serde_json::to_string(o).unwrap_or_default());

        sqlx::query(
            r#"
            INSERT INTO call_events
                (session_id, node_id, endpoint, fingerprint, input, output, error, label, color, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (session_id, node_id) DO UPDATE SET
                endpoint = excluded.endpoint,
                fingerprint = excluded.fingerprint,
                input = excluded.input,
                output = excluded.output,
                error = excluded.error,
                label = excluded.label,
                color = excluded.color,
                created_at = excluded.created_at
            "#,
        )
        .bind(&event.session_id)
        .bind(event.node_id.0 as i64)
        .bind(&event.endpoint)
        .bind(&event.fingerprint)
        .bind(&input)
        .bind(&output)
        .bind(&event.error)
        .bind(&event.label)
        .bind(&event.color)
        .bind(event.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_call_event(
        &self,
        session_id: &str,
        node_id: NodeId,
    ) -> StorageResult<Option<CallEvent>> {
        let row: Option<CallEventRow> = sqlx::query_as(
            r#"
            SELECT session_id, node_id, endpoint, fingerprint, input, output, error, label, color, created_at
            FROM call_events
            WHERE session_id = ? AND node_id = ?
            "#,
        )
        .bind(session_id)
        .bind(node_id.0 as i64)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.into()))
    }

    async fn get_session_events(&self, session_id: &str) -> StorageResult<Vec<CallEvent>> {
        let rows: Vec<CallEventRow> = sqlx::query_as(
            r#"
            SELECT session_id, node_id, endpoint, fingerprint, input, output, error, label, color, created_at
            FROM call_events
            WHERE session_id = ?
            ORDER BY node_id ASC
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }

    async fn reserve_cache_entry(
        &self,
        session_id: &str,
        fingerprint: &str,
        input: &serde_json::Value,
    ) -> StorageResult<CacheEntry> {
        let input_text = serde_json::to_string(input).unwrap_or_default();

        // Atomic placeholder insert; a concurrent reserve for the same key
        // leaves exactly one entry in place.
        sqlx::query(
            r#"
            INSERT INTO cache_entries (session_id, fingerprint, input, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (session_id, fingerprint) DO NOTHING
            "#,
        )
        .bind(session_id)
        .bind(fingerprint)
        .bind(&input_text)
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        self.get_cache_entry(session_id, fingerprint)
            .await?
            .ok_or_else(|| StorageError::EntryNotFound {
                session_id: session_id.to_string(),
                fingerprint: fingerprint.to_string(),
            })
    }

    async fn get_cache_entry(
        &self,
        session_id: &str,
        fingerprint: &str,
    ) -> StorageResult<Option<CacheEntry>> {
        let row: Option<CacheEntryRow> = sqlx::query_as(
            r#"
            SELECT session_id, fingerprint, input, input_override, output, output_override,
                   executed_fingerprint, created_at
            FROM cache_entries
            WHERE session_id = ? AND fingerprint = ?
            "#,
        )
        .bind(session_id)
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.into()))
    }

    async fn fill_cache_output(
        &self,
        session_id: &str,
        fingerprint: &str,
        output: &serde_json::Value,
        executed_fingerprint: &str,
    ) -> StorageResult<()> {
        let output_text = serde_json::to_string(output).unwrap_or_default();

        let result = sqlx::query(
            r#"
            UPDATE cache_entries
            SET output = ?, executed_fingerprint = ?
            WHERE session_id = ? AND fingerprint = ?
            "#,
        )
        .bind(&output_text)
        .bind(executed_fingerprint)
        .bind(session_id)
        .bind(fingerprint)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::EntryNotFound {
                session_id: session_id.to_string(),
                fingerprint: fingerprint.to_string(),
            });
        }

        Ok(())
    }

    async fn set_input_override(
        &self,
        session_id: &str,
        fingerprint: &str,
        input: &serde_json::Value,
    ) -> StorageResult<()> {
        let input_text = serde_json::to_string(input).unwrap_or_default();

        let result = sqlx::query(
            r#"
            UPDATE cache_entries
            SET input_override = ?
            WHERE session_id = ? AND fingerprint = ?
            "#,
        )
        .bind(&input_text)
        .bind(session_id)
        .bind(fingerprint)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::EntryNotFound {
                session_id: session_id.to_string(),
                fingerprint: fingerprint.to_string(),
            });
        }

        Ok(())
    }

    async fn set_output_override(
        &self,
        session_id: &str,
        fingerprint: &str,
        output: &serde_json::Value,
    ) -> StorageResult<()> {
        let output_text = serde_json::to_string(output).unwrap_or_default();

        let result = sqlx::query(
            r#"
            UPDATE cache_entries
            SET output_override = ?
            WHERE session_id = ? AND fingerprint = ?
            "#,
        )
        .bind(&output_text)
        .bind(session_id)
        .bind(fingerprint)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::EntryNotFound {
                session_id: session_id.to_string(),
                fingerprint: fingerprint.to_string(),
            });
        }

        Ok(())
    }
}

// Internal row types for SQLx mapping

#[derive(sqlx::FromRow)]
struct SessionRow {
    id: String,
    label: Option<String>,
    created_at: String,
    metadata: Option<String>,
}

impl From<SessionRow> for SessionRecord {
    fn from(row: SessionRow) -> Self {
        Self {
            id: row.id,
            label: row.label,
            created_at: parse_timestamp(&row.created_at),
            metadata: row.metadata.and_then(|s| serde_json::from_str(&s).ok()),
        }
    }
}

#[derive(sqlx::FromRow)]
struct CallEventRow {
    session_id: String,
    node_id: i64,
    endpoint: String,
    fingerprint: String,
    input: String,
    output: Option<String>,
    error: Option<String>,
    label: Option<String>,
    color: Option<String>,
    created_at: String,
}

impl From<CallEventRow> for CallEvent {
    fn from(row: CallEventRow) -> Self {
        Self {
            session_id: row.session_id,
            node_id: NodeId(row.node_id as u64),
            endpoint: row.endpoint,
            fingerprint: row.fingerprint,
            input: serde_json::from_str(&row.input).unwrap_or(serde_json::Value::Null),
            output: row.output.and_then(|s| serde_json::from_str(&s).ok()),
            error: row.error,
            label: row.label,
            color: row.color,
            created_at: parse_timestamp(&row.created_at),
        }
    }
}

#[derive(sqlx::FromRow)]
struct CacheEntryRow {
    session_id: String,
    fingerprint: String,
    input: String,
    input_override: Option<String>,
    output: Option<String>,
    output_override: Option<String>,
    executed_fingerprint: Option<String>,
    created_at: String,
}

impl From<CacheEntryRow> for CacheEntry {
    fn from(row: CacheEntryRow) -> Self {
        Self {
            session_id: row.session_id,
            fingerprint: row.fingerprint,
            input: serde_json::from_str(&row.input).unwrap_or(serde_json::Value::Null),
            input_override: row.input_override.and_then(|s| serde_json::from_str(&s).ok()),
            output: row.output.and_then(|s| serde_json::from_str(&s).ok()),
            output_override: row
                .output_override
                .and_then(|s| serde_json::from_str(&s).ok()),
            executed_fingerprint: row.executed_fingerprint,
            created_at: parse_timestamp(&row.created_at),
        }
    }
}

fn parse_timestamp(text: &str) -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .unwrap_or_else(|_| chrono::Utc::now())
}

//! Task status storage using `PostgreSQL` or process memory
//!
//! Every task has one record keyed by its id. Updates are compare-free
//! upserts: a patch overwrites the fields it sets and leaves the rest.

use crate::{StorageError, StorageResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tokio_postgres::{Client, NoTls, Row};
use video_track_common::{StatusPatch, TaskState, TaskStatus};

/// `PostgreSQL` configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PostgresConfig {
    /// Database host
    pub host: String,

    /// Database port
    pub port: u16,

    /// Database name
    pub database: String,

    /// Database user
    pub user: String,

    /// Database password
    pub password: String,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            host: std::env::var("POSTGRES_HOST").unwrap_or_else(|_| "localhost".to_string()),
            port: std::env::var("POSTGRES_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(5432),
            database: std::env::var("POSTGRES_DB").unwrap_or_else(|_| "video_track".to_string()),
            user: std::env::var("POSTGRES_USER").unwrap_or_else(|_| "postgres".to_string()),
            password: std::env::var("POSTGRES_PASSWORD").unwrap_or_default(),
        }
    }
}

impl PostgresConfig {
    /// Build connection string
    #[must_use]
    pub fn connection_string(&self) -> String {
        format!(
            "host={} port={} dbname={} user={} password={}",
            self.host, self.port, self.database, self.user, self.password
        )
    }
}

/// Status recorder trait
#[async_trait::async_trait]
pub trait StatusRecorder: Send + Sync {
    /// Insert or replace a whole record
    async fn create(&self, status: &TaskStatus) -> StorageResult<()>;

    /// Apply a partial update, creating the record if it does not exist
    async fn update(&self, task_id: &str, patch: &StatusPatch) -> StorageResult<()>;

    /// Fetch a record
    async fn get(&self, task_id: &str) -> StorageResult<Option<TaskStatus>>;
}

/// `PostgreSQL` status recorder (table `task_status`)
pub struct PostgresStatusRecorder {
    client: Client,
}

impl PostgresStatusRecorder {
    /// Connect and create the schema if needed
    pub async fn new(config: PostgresConfig) -> StorageResult<Self> {
        let (client, connection) = tokio_postgres::connect(&config.connection_string(), NoTls)
            .await
            .map_err(|e| StorageError::PostgresError(e.to_string()))?;

        // Spawn connection in background
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!("PostgreSQL connection error: {}", e);
            }
        });

        let recorder = Self { client };
        recorder.init_schema().await?;
        Ok(recorder)
    }

    /// Create the `task_status` table if it does not exist
    pub async fn init_schema(&self) -> StorageResult<()> {
        self.client
            .execute(
                r"
                CREATE TABLE IF NOT EXISTS task_status (
                    task_id TEXT PRIMARY KEY,
                    status TEXT NOT NULL,
                    progress SMALLINT NOT NULL DEFAULT 0,
                    bucket TEXT,
                    key TEXT,
                    result_key TEXT,
                    report_key TEXT,
                    error_message TEXT,
                    updated_at TIMESTAMP WITH TIME ZONE NOT NULL
                )
                ",
                &[],
            )
            .await
            .map_err(|e| StorageError::PostgresError(e.to_string()))?;

        tracing::info!("PostgreSQL task_status schema initialized");
        Ok(())
    }

    fn row_to_status(row: &Row) -> StorageResult<TaskStatus> {
        let status: String = row.get(1);
        let status = TaskState::parse(&status)
            .ok_or_else(|| StorageError::PostgresError(format!("unknown task state {status}")))?;

        Ok(TaskStatus {
            task_id: row.get(0),
            status,
            progress: row.get::<_, i16>(2).clamp(0, 100) as u8,
            bucket: row.get(3),
            key: row.get(4),
            result_video_key: row.get(5),
            report_key: row.get(6),
            error_message: row.get(7),
            updated_at: row.get(8),
        })
    }
}

#[async_trait::async_trait]
impl StatusRecorder for PostgresStatusRecorder {
    async fn create(&self, status: &TaskStatus) -> StorageResult<()> {
        self.client
            .execute(
                r"
                INSERT INTO task_status
                (task_id, status, progress, bucket, key, result_key, report_key,
                 error_message, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (task_id) DO UPDATE SET
                    status = EXCLUDED.status,
                    progress = EXCLUDED.progress,
                    bucket = EXCLUDED.bucket,
                    key = EXCLUDED.key,
                    result_key = EXCLUDED.result_key,
                    report_key = EXCLUDED.report_key,
                    error_message = EXCLUDED.error_message,
                    updated_at = EXCLUDED.updated_at
                ",
                &[
                    &status.task_id,
                    &status.status.as_str(),
                    &i16::from(status.progress),
                    &status.bucket,
                    &status.key,
                    &status.result_video_key,
                    &status.report_key,
                    &status.error_message,
                    &status.updated_at,
                ],
            )
            .await
            .map_err(|e| StorageError::PostgresError(e.to_string()))?;

        Ok(())
    }

    async fn update(&self, task_id: &str, patch: &StatusPatch) -> StorageResult<()> {
        let status = patch.status.map(|s| s.as_str());
        let progress = patch.progress.map(i16::from);

        self.client
            .execute(
                r"
                INSERT INTO task_status
                (task_id, status, progress, result_key, report_key, error_message, updated_at)
                VALUES ($1, COALESCE($2::TEXT, 'Pending'), COALESCE($3::SMALLINT, 0), $4, $5, $6, $7)
                ON CONFLICT (task_id) DO UPDATE SET
                    status = COALESCE($2::TEXT, task_status.status),
                    progress = COALESCE($3::SMALLINT, task_status.progress),
                    result_key = COALESCE($4, task_status.result_key),
                    report_key = COALESCE($5, task_status.report_key),
                    error_message = COALESCE($6, task_status.error_message),
                    updated_at = $7
                ",
                &[
                    &task_id,
                    &status,
                    &progress,
                    &patch.result_video_key,
                    &patch.report_key,
                    &patch.error_message,
                    &chrono::Utc::now(),
                ],
            )
            .await
            .map_err(|e| StorageError::PostgresError(e.to_string()))?;

        Ok(())
    }

    async fn get(&self, task_id: &str) -> StorageResult<Option<TaskStatus>> {
        let row = self
            .client
            .query_opt(
                r"
                SELECT task_id, status, progress, bucket, key, result_key, report_key,
                       error_message, updated_at
                FROM task_status
                WHERE task_id = $1
                ",
                &[&task_id],
            )
            .await
            .map_err(|e| StorageError::PostgresError(e.to_string()))?;

        row.as_ref().map(Self::row_to_status).transpose()
    }
}

/// Status recorder kept in process memory
#[derive(Default)]
pub struct InMemoryStatusRecorder {
    records: RwLock<HashMap<String, TaskStatus>>,
}

impl InMemoryStatusRecorder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every record
    pub async fn all(&self) -> Vec<TaskStatus> {
        self.records.read().await.values().cloned().collect()
    }
}

#[async_trait::async_trait]
impl StatusRecorder for InMemoryStatusRecorder {
    async fn create(&self, status: &TaskStatus) -> StorageResult<()> {
        self.records
            .write()
            .await
            .insert(status.task_id.clone(), status.clone());
        Ok(())
    }

    async fn update(&self, task_id: &str, patch: &StatusPatch) -> StorageResult<()> {
        let mut records = self.records.write().await;
        records
            .entry(task_id.to_string())
            .or_insert_with(|| TaskStatus::empty(task_id))
            .apply(patch);
        Ok(())
    }

    async fn get(&self, task_id: &str) -> StorageResult<Option<TaskStatus>> {
        Ok(self.records.read().await.get(task_id).cloned())
    }
}

//! Database backup: export tables as one JSON document and store it as an artifact.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value as JsonValue, json};
use sqlx::{PgPool, Row};
use tracing::{debug, info};

use pricekeep_core::{ExecutionError, JobPayload, JobType, JsonMap, ProgressStatus, ProgressUpdate};

use crate::jobs::{JobHandler, JobOutput, ProgressReporter};

/// Where backup data comes from.
#[async_trait]
pub trait BackupSource: Send + Sync {
    /// Tables included in a backup, in export order.
    async fn tables(&self) -> Result<Vec<String>, ExecutionError>;

    /// All rows of `table` as a JSON array.
    async fn export_table(&self, table: &str) -> Result<JsonValue, ExecutionError>;
}

/// Where finished backups go.
#[async_trait]
pub trait ArtifactStorage: Send + Sync {
    /// Store `bytes` under `name`; returns a location string for the audit trail.
    async fn put(&self, name: &str, bytes: Vec<u8>) -> Result<String, ExecutionError>;
}

pub struct BackupHandler {
    source: Arc<dyn BackupSource>,
    storage: Arc<dyn ArtifactStorage>,
}

impl BackupHandler {
    pub fn new(source: Arc<dyn BackupSource>, storage: Arc<dyn ArtifactStorage>) -> Self {
        Self { source, storage }
    }

    fn artifact_name(label: Option<&str>) -> String {
        let stamp = Utc::now().format("%Y%m%dT%H%M%SZ");
        match label {
            Some(label) => format!("backup-{stamp}-{label}.json"),
            None => format!("backup-{stamp}.json"),
        }
    }
}

#[async_trait]
impl JobHandler for BackupHandler {
    fn job_type(&self) -> JobType {
        JobType::Backup
    }

    async fn execute(
        &self,
        payload: &JsonMap,
        report: &ProgressReporter,
    ) -> Result<JobOutput, ExecutionError> {
        let JobPayload::Backup(payload) = JobPayload::parse(JobType::Backup, payload)
            .map_err(|e| ExecutionError::fatal(e.to_string()))?
        else {
            return Err(ExecutionError::fatal("payload does not describe a backup"));
        };

        report.running(2, "listing tables");
        let tables = self.source.tables().await?;
        let total = tables.len();
        let started = Instant::now();

        let mut exported = BTreeMap::new();
        let mut rows = 0usize;
        for (i, table) in tables.iter().enumerate() {
            report.report(
                ProgressUpdate::new()
                    .status(ProgressStatus::Running)
                    .step(format!("exporting {table}")),
            );

            let data = self.source.export_table(table).await?;
            rows += data.as_array().map_or(0, Vec::len);
            exported.insert(table.clone(), data);

            let done = i + 1;
            let mut update = ProgressUpdate::new().percent((5 + 75 * done / total.max(1)) as u8);
            if done < total {
                update = update.estimated(started.elapsed() / done as u32 * (total - done) as u32);
            }
            report.report(update);
            debug!(table = %table, done, total, "table exported");
        }

        let document = json!({
            "createdAt": Utc::now(),
            "label": payload.label,
            "tables": exported,
        });
        let bytes = serde_json::to_vec_pretty(&document)
            .map_err(|e| ExecutionError::fatal(format!("failed to encode backup: {e}")))?;
        let size = bytes.len();

        report.finalizing(85, "uploading artifact");
        let name = Self::artifact_name(payload.label.as_deref());
        let location = self.storage.put(&name, bytes).await?;
        report.finalizing(100, "done");

        info!(artifact = %location, tables = total, rows, bytes = size, "backup stored");
        Ok(JobOutput::new(format!("exported {total} tables ({rows} rows) to {location}"))
            .with_info("artifact", location)
            .with_info("tables", total)
            .with_info("rows", rows)
            .with_info("bytes", size))
    }
}

/// Exports tables from Postgres with `json_agg`.
#[derive(Debug, Clone)]
pub struct PostgresBackupSource {
    pool: PgPool,
    tables: Vec<String>,
}

impl PostgresBackupSource {
    /// `tables` empty means every base table in the `public` schema.
    pub fn new(pool: PgPool, tables: Vec<String>) -> Self {
        Self { pool, tables }
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[async_trait]
impl BackupSource for PostgresBackupSource {
    async fn tables(&self) -> Result<Vec<String>, ExecutionError> {
        if !self.tables.is_empty() {
            return Ok(self.tables.clone());
        }

        let rows = sqlx::query(
            r#"
            SELECT table_name
            FROM information_schema.tables
            WHERE table_schema = 'public' AND table_type = 'BASE TABLE'
            ORDER BY table_name
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ExecutionError::retryable(format!("failed to list tables: {e}")))?;

        rows.iter()
            .map(|r| {
                r.try_get::<String, _>("table_name")
                    .map_err(|e| ExecutionError::fatal(format!("bad table_name column: {e}")))
            })
            .collect()
    }

    async fn export_table(&self, table: &str) -> Result<JsonValue, ExecutionError> {
        let sql = format!(
            "SELECT COALESCE(json_agg(t), '[]'::json) AS rows FROM {} t",
            quote_ident(table)
        );
        let row = sqlx::query(&sql)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| ExecutionError::retryable(format!("failed to export {table}: {e}")))?;

        row.try_get::<JsonValue, _>("rows")
            .map_err(|e| ExecutionError::fatal(format!("bad export of {table}: {e}")))
    }
}

/// Fixed tables held in memory (single-process mode and tests).
#[derive(Debug, Default)]
pub struct InMemoryBackupSource {
    tables: BTreeMap<String, JsonValue>,
}

impl InMemoryBackupSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, name: impl Into<String>, rows: JsonValue) -> Self {
        self.tables.insert(name.into(), rows);
        self
    }
}

#[async_trait]
impl BackupSource for InMemoryBackupSource {
    async fn tables(&self) -> Result<Vec<String>, ExecutionError> {
        Ok(self.tables.keys().cloned().collect())
    }

    async fn export_table(&self, table: &str) -> Result<JsonValue, ExecutionError> {
        self.tables
            .get(table)
            .cloned()
            .ok_or_else(|| ExecutionError::fatal(format!("unknown table {table}")))
    }
}

/// Writes artifacts into a local directory.
#[derive(Debug, Clone)]
pub struct FilesystemArtifactStorage {
    dir: PathBuf,
}

impl FilesystemArtifactStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl ArtifactStorage for FilesystemArtifactStorage {
    async fn put(&self, name: &str, bytes: Vec<u8>) -> Result<String, ExecutionError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| ExecutionError::retryable(format!("cannot create {}: {e}", self.dir.display())))?;

        // Write then rename so readers never see a partial artifact.
        let path = self.dir.join(name);
        let partial = self.dir.join(format!("{name}.partial"));
        tokio::fs::write(&partial, bytes)
            .await
            .map_err(|e| ExecutionError::retryable(format!("cannot write {}: {e}", partial.display())))?;
        tokio::fs::rename(&partial, &path)
            .await
            .map_err(|e| ExecutionError::retryable(format!("cannot finalize {}: {e}", path.display())))?;

        Ok(path.display().to_string())
    }
}

/// Keeps artifacts in memory (tests).
#[derive(Debug, Default)]
pub struct InMemoryArtifactStorage {
    artifacts: Mutex<Vec<(String, Vec<u8>)>>,
}

impl InMemoryArtifactStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn artifacts(&self) -> Vec<(String, Vec<u8>)> {
        self.artifacts.lock().map(|a| a.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ArtifactStorage for InMemoryArtifactStorage {
    async fn put(&self, name: &str, bytes: Vec<u8>) -> Result<String, ExecutionError> {
        self.artifacts
            .lock()
            .map_err(|_| ExecutionError::fatal("artifact store lock poisoned"))?
            .push((name.to_string(), bytes));
        Ok(format!("memory://{name}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pricekeep_core::JobId;

    struct BrokenStorage;

    #[async_trait]
    impl ArtifactStorage for BrokenStorage {
        async fn put(&self, _name: &str, _bytes: Vec<u8>) -> Result<String, ExecutionError> {
            Err(ExecutionError::retryable("bucket unreachable"))
        }
    }

    fn source() -> Arc<InMemoryBackupSource> {
        Arc::new(
            InMemoryBackupSource::new()
                .with_table("products", json!([{"id": 1}, {"id": 2}]))
                .with_table("brands", json!([{"id": 7}])),
        )
    }

    #[tokio::test]
    async fn exports_every_table_into_one_artifact() {
        let storage = Arc::new(InMemoryArtifactStorage::new());
        let handler = BackupHandler::new(source(), storage.clone());

        let mut payload = JsonMap::new();
        payload.insert("label".into(), json!("nightly"));
        let (reporter, mut rx) = ProgressReporter::channel(JobId::new());

        let output = handler.execute(&payload, &reporter).await.unwrap();
        assert_eq!(output.info["tables"], 2);
        assert_eq!(output.info["rows"], 3);

        let artifacts = storage.artifacts();
        assert_eq!(artifacts.len(), 1);
        assert!(artifacts[0].0.ends_with("-nightly.json"));
        let doc: JsonValue = serde_json::from_slice(&artifacts[0].1).unwrap();
        assert_eq!(doc["tables"]["products"].as_array().unwrap().len(), 2);

        drop(reporter);
        let mut percents = Vec::new();
        while let Some(update) = rx.recv().await {
            percents.extend(update.percent);
        }
        assert!(percents.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(percents.last(), Some(&100));
    }

    #[tokio::test]
    async fn storage_failure_is_retryable() {
        let handler = BackupHandler::new(source(), Arc::new(BrokenStorage));
        let err = handler
            .execute(&JsonMap::new(), &ProgressReporter::detached(JobId::new()))
            .await
            .unwrap_err();
        assert!(err.retryable);
        assert_eq!(err.reason, "bucket unreachable");
    }

    #[tokio::test]
    async fn filesystem_storage_writes_the_file() {
        let dir = std::env::temp_dir().join(format!("pricekeep-backup-{}", JobId::new()));
        let storage = FilesystemArtifactStorage::new(&dir);

        let location = storage.put("b.json", b"{}".to_vec()).await.unwrap();
        assert_eq!(tokio::fs::read(&location).await.unwrap(), b"{}");
        assert!(!dir.join("b.json.partial").exists());

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[test]
    fn identifiers_are_quoted() {
        assert_eq!(quote_ident("products"), "\"products\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }
}

//! Postgres-backed job record store.
//!
//! ## Concurrency guard
//!
//! `try_start` locks the target row, checks for another running record of the
//! same type and flips the status inside one transaction. A partial unique
//! index on `job_type WHERE status = 'running'` backs this up: if two workers
//! race past the check, the second `UPDATE` fails with `23505` and is reported
//! as [`StartOutcome::Busy`].
//!
//! ## Leases
//!
//! `heartbeat_at` is stamped on start and renewed by the running worker. A
//! `running` row is only handed to another worker once `heartbeat_at` is
//! older than the caller's lease; until then its redelivery is `Busy`.
//!
//! ## Error mapping
//!
//! | SQLx error | Code | JobStoreError |
//! |------------|------|---------------|
//! | Database (check violation) | `23514` | `InvalidTransition` |
//! | Database (other) | any | `Storage` |
//! | PoolClosed / IO / other | n/a | `Storage` |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{Span, instrument};

use pricekeep_core::{JobId, JobRecord, JobStatus, JobType};

use super::store::{JobRecordStore, JobStoreError, RecordFilter, StartOutcome, lease_expired};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS job_records (
    id              UUID PRIMARY KEY,
    job_type        TEXT NOT NULL,
    status          TEXT NOT NULL
                    CHECK (status IN ('pending', 'running', 'succeeded', 'failed')),
    created_at      TIMESTAMPTZ NOT NULL,
    started_at      TIMESTAMPTZ,
    finished_at     TIMESTAMPTZ,
    payload_summary TEXT,
    result_summary  TEXT,
    error_message   TEXT,
    heartbeat_at    TIMESTAMPTZ,
    CONSTRAINT job_records_finished_after_started
        CHECK (finished_at IS NULL OR started_at IS NULL OR finished_at >= started_at)
);

ALTER TABLE job_records ADD COLUMN IF NOT EXISTS heartbeat_at TIMESTAMPTZ;

CREATE UNIQUE INDEX IF NOT EXISTS job_records_one_running_per_type
    ON job_records (job_type)
    WHERE status = 'running';

CREATE INDEX IF NOT EXISTS job_records_type_created
    ON job_records (job_type, created_at DESC);
"#;

const RECORD_COLUMNS: &str = "id, job_type, status, created_at, started_at, finished_at, \
                              payload_summary, result_summary, error_message";

#[derive(Debug, Clone)]
pub struct PostgresJobRecordStore {
    pool: Arc<PgPool>,
}

impl PostgresJobRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the `job_records` table and its indexes (idempotent).
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), JobStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    async fn running_other_than(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        job_type: JobType,
        id: JobId,
    ) -> Result<Option<JobId>, JobStoreError> {
        let row = sqlx::query(
            r#"
            SELECT id
            FROM job_records
            WHERE job_type = $1 AND status = 'running' AND id <> $2
            LIMIT 1
            "#,
        )
        .bind(job_type.as_str())
        .bind(id.as_uuid())
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("running_other_than", e))?;

        row.map(|r| {
            r.try_get::<uuid::Uuid, _>("id")
                .map(JobId::from)
                .map_err(|e| JobStoreError::Storage(format!("failed to read id: {e}")))
        })
        .transpose()
    }

    async fn current_runner(&self, job_type: JobType) -> Result<Option<JobId>, JobStoreError> {
        let row = sqlx::query(
            "SELECT id FROM job_records WHERE job_type = $1 AND status = 'running' LIMIT 1",
        )
        .bind(job_type.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("current_runner", e))?;

        Ok(row
            .and_then(|r| r.try_get::<uuid::Uuid, _>("id").ok())
            .map(JobId::from))
    }
}

#[async_trait]
impl JobRecordStore for PostgresJobRecordStore {
    #[instrument(skip(self, record), fields(job_id = %record.id, job_type = %record.job_type), err)]
    async fn ensure_pending(&self, record: JobRecord) -> Result<JobRecord, JobStoreError> {
        sqlx::query(
            r#"
            INSERT INTO job_records (id, job_type, status, created_at, payload_summary)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(record.id.as_uuid())
        .bind(record.job_type.as_str())
        .bind(record.status.as_str())
        .bind(record.created_at)
        .bind(&record.payload_summary)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("ensure_pending", e))?;

        self.get(record.id)
            .await?
            .ok_or(JobStoreError::NotFound(record.id))
    }

    #[instrument(
        skip_all,
        fields(job_id = %id, job_type = %job_type, busy = tracing::field::Empty),
        err
    )]
    async fn try_start(
        &self,
        id: JobId,
        job_type: JobType,
        at: DateTime<Utc>,
        lease: Duration,
    ) -> Result<StartOutcome, JobStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let row = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS}, heartbeat_at FROM job_records WHERE id = $1 FOR UPDATE"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("lock_record", e))?;

        let (current, heartbeat_at) = match row {
            Some(row) => {
                let heartbeat_at: Option<DateTime<Utc>> = row
                    .try_get("heartbeat_at")
                    .map_err(|e| JobStoreError::Storage(format!("failed to read heartbeat_at: {e}")))?;
                (record_from_row(&row)?, heartbeat_at)
            }
            None => {
                tx.rollback()
                    .await
                    .map_err(|e| map_sqlx_error("rollback", e))?;
                return Err(JobStoreError::NotFound(id));
            }
        };

        match current.status {
            JobStatus::Pending => {}
            JobStatus::Running => {
                let last = heartbeat_at.or(current.started_at);
                if !lease_expired(last, at, lease) {
                    tx.rollback()
                        .await
                        .map_err(|e| map_sqlx_error("rollback", e))?;
                    Span::current().record("busy", true);
                    return Ok(StartOutcome::Busy { running: Some(id) });
                }
                sqlx::query("UPDATE job_records SET heartbeat_at = $2 WHERE id = $1")
                    .bind(id.as_uuid())
                    .bind(at)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| map_sqlx_error("take_over_record", e))?;
                tx.commit()
                    .await
                    .map_err(|e| map_sqlx_error("commit_transaction", e))?;
                return Ok(StartOutcome::Resumed(current));
            }
            JobStatus::Succeeded | JobStatus::Failed => {
                tx.rollback()
                    .await
                    .map_err(|e| map_sqlx_error("rollback", e))?;
                return Ok(StartOutcome::Finished(current));
            }
        }

        if let Some(running) = self.running_other_than(&mut tx, job_type, id).await? {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            Span::current().record("busy", true);
            return Ok(StartOutcome::Busy {
                running: Some(running),
            });
        }

        let updated = sqlx::query(&format!(
            r#"
            UPDATE job_records
            SET status = 'running', started_at = $2, heartbeat_at = $2
            WHERE id = $1 AND status = 'pending'
            RETURNING {RECORD_COLUMNS}
            "#
        ))
        .bind(id.as_uuid())
        .bind(at)
        .fetch_one(&mut *tx)
        .await;

        let row = match updated {
            Ok(row) => row,
            Err(e) if is_unique_violation(&e) => {
                // Lost the race against another worker of the same type.
                tx.rollback()
                    .await
                    .map_err(|e| map_sqlx_error("rollback", e))?;
                let running = self.current_runner(job_type).await?;
                Span::current().record("busy", true);
                return Ok(StartOutcome::Busy { running });
            }
            Err(e) => return Err(map_sqlx_error("start_record", e)),
        };

        let started = record_from_row(&row)?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Ok(StartOutcome::Started(started))
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn heartbeat(&self, id: JobId, at: DateTime<Utc>) -> Result<bool, JobStoreError> {
        let result = sqlx::query(
            "UPDATE job_records SET heartbeat_at = $2 WHERE id = $1 AND status = 'running'",
        )
        .bind(id.as_uuid())
        .bind(at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("heartbeat", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, record), fields(job_id = %record.id, status = %record.status), err)]
    async fn finish(&self, record: &JobRecord) -> Result<(), JobStoreError> {
        if !record.status.is_terminal() {
            return Err(JobStoreError::InvalidTransition(format!(
                "job {} finished with non-terminal status {}",
                record.id, record.status
            )));
        }

        let result = sqlx::query(
            r#"
            UPDATE job_records
            SET status = $2,
                finished_at = $3,
                result_summary = $4,
                error_message = $5
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(record.id.as_uuid())
        .bind(record.status.as_str())
        .bind(record.finished_at)
        .bind(&record.result_summary)
        .bind(&record.error_message)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("finish", e))?;

        if result.rows_affected() == 0 {
            return match self.get(record.id).await? {
                Some(stored) => Err(JobStoreError::InvalidTransition(format!(
                    "job {} is {}, not running",
                    record.id, stored.status
                ))),
                None => Err(JobStoreError::NotFound(record.id)),
            };
        }
        Ok(())
    }

    #[instrument(skip_all, fields(job_id = %id), err)]
    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
        let row = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM job_records WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get", e))?;

        row.as_ref().map(record_from_row).transpose()
    }

    #[instrument(skip(self), fields(record_count = tracing::field::Empty), err)]
    async fn list(&self, filter: &RecordFilter) -> Result<Vec<JobRecord>, JobStoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {RECORD_COLUMNS}
            FROM job_records
            WHERE ($1::text IS NULL OR job_type = $1)
                AND ($2::text IS NULL OR status = $2)
            ORDER BY created_at DESC, id DESC
            LIMIT $3
            "#
        ))
        .bind(filter.job_type.map(|t| t.as_str()))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list", e))?;

        Span::current().record("record_count", rows.len());
        rows.iter().map(record_from_row).collect()
    }
}

fn record_from_row(row: &sqlx::postgres::PgRow) -> Result<JobRecord, JobStoreError> {
    let read = |e: sqlx::Error| JobStoreError::Storage(format!("failed to read job record row: {e}"));

    let job_type: String = row.try_get("job_type").map_err(read)?;
    let status: String = row.try_get("status").map_err(read)?;

    Ok(JobRecord {
        id: JobId::from(row.try_get::<uuid::Uuid, _>("id").map_err(read)?),
        job_type: job_type
            .parse()
            .map_err(|e| JobStoreError::Storage(format!("bad job_type column: {e}")))?,
        status: status
            .parse()
            .map_err(|e| JobStoreError::Storage(format!("bad status column: {e}")))?,
        created_at: row.try_get("created_at").map_err(read)?,
        started_at: row.try_get("started_at").map_err(read)?,
        finished_at: row.try_get("finished_at").map_err(read)?,
        payload_summary: row.try_get("payload_summary").map_err(read)?,
        result_summary: row.try_get("result_summary").map_err(read)?,
        error_message: row.try_get("error_message").map_err(read)?,
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23514") => JobStoreError::InvalidTransition(msg),
                _ => JobStoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {operation}"))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

/// Run against a scratch database named by `PRICEKEEP_TEST_DATABASE_URL`;
/// each test returns early when it is unset.
#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Mutex;

    use chrono::TimeDelta;
    use tracing::field::{Field, Visit};
    use tracing::instrument::WithSubscriber;
    use tracing::span::{Id, Record};
    use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

    use super::*;

    const LEASE: Duration = Duration::from_secs(60);

    /// Each test owns one job type, so clearing it leaves the others alone.
    async fn store(job_type: JobType) -> Option<PostgresJobRecordStore> {
        let url = std::env::var("PRICEKEEP_TEST_DATABASE_URL").ok()?;
        let pool = PgPool::connect(&url).await.unwrap();
        let store = PostgresJobRecordStore::new(pool);
        store.migrate().await.unwrap();
        sqlx::query("DELETE FROM job_records WHERE job_type = $1")
            .bind(job_type.as_str())
            .execute(&*store.pool)
            .await
            .unwrap();
        Some(store)
    }

    async fn pending(store: &PostgresJobRecordStore, job_type: JobType) -> JobRecord {
        store
            .ensure_pending(JobRecord::pending(JobId::new(), job_type, Utc::now(), None))
            .await
            .unwrap()
    }

    /// Names of span fields recorded after the span was created.
    #[derive(Clone, Default)]
    struct RecordedFields(Arc<Mutex<HashSet<String>>>);

    impl Visit for RecordedFields {
        fn record_debug(&mut self, field: &Field, _value: &dyn std::fmt::Debug) {
            self.0.lock().unwrap().insert(field.name().to_string());
        }
    }

    impl<S: tracing::Subscriber> Layer<S> for RecordedFields {
        fn on_record(&self, _span: &Id, values: &Record<'_>, _ctx: Context<'_, S>) {
            values.record(&mut self.clone());
        }
    }

    impl RecordedFields {
        fn contains(&self, name: &str) -> bool {
            self.0.lock().unwrap().contains(name)
        }
    }

    #[tokio::test]
    async fn live_running_row_is_busy_until_its_lease_lapses() {
        let Some(store) = store(JobType::PriceSync).await else { return };
        let rec = pending(&store, JobType::PriceSync).await;
        let started = Utc::now();
        assert!(matches!(
            store.try_start(rec.id, rec.job_type, started, LEASE).await.unwrap(),
            StartOutcome::Started(_)
        ));

        assert_eq!(
            store
                .try_start(rec.id, rec.job_type, started + TimeDelta::seconds(30), LEASE)
                .await
                .unwrap(),
            StartOutcome::Busy {
                running: Some(rec.id)
            }
        );

        assert!(store
            .heartbeat(rec.id, started + TimeDelta::seconds(50))
            .await
            .unwrap());
        assert!(matches!(
            store
                .try_start(rec.id, rec.job_type, started + TimeDelta::seconds(100), LEASE)
                .await
                .unwrap(),
            StartOutcome::Busy { .. }
        ));
        assert!(matches!(
            store
                .try_start(rec.id, rec.job_type, started + TimeDelta::seconds(200), LEASE)
                .await
                .unwrap(),
            StartOutcome::Resumed(_)
        ));
    }

    #[tokio::test]
    async fn finished_row_is_reported_as_finished() {
        let Some(store) = store(JobType::Backup).await else { return };
        let rec = pending(&store, JobType::Backup).await;
        store.try_start(rec.id, rec.job_type, Utc::now(), LEASE).await.unwrap();
        let mut done = store.get(rec.id).await.unwrap().unwrap();
        done.succeed(Utc::now(), "ok").unwrap();
        store.finish(&done).await.unwrap();

        assert!(matches!(
            store.try_start(rec.id, rec.job_type, Utc::now(), LEASE).await.unwrap(),
            StartOutcome::Finished(r) if r.status == JobStatus::Succeeded
        ));
        assert!(!store.heartbeat(rec.id, Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn busy_and_record_count_land_on_their_spans() {
        let Some(store) = store(JobType::EmailSend).await else { return };
        let first = pending(&store, JobType::EmailSend).await;
        let second = pending(&store, JobType::EmailSend).await;
        store.try_start(first.id, first.job_type, Utc::now(), LEASE).await.unwrap();

        let fields = RecordedFields::default();
        let subscriber = tracing_subscriber::registry().with(fields.clone());
        async {
            assert!(matches!(
                store.try_start(second.id, second.job_type, Utc::now(), LEASE).await.unwrap(),
                StartOutcome::Busy { .. }
            ));
            store.list(&RecordFilter::default()).await.unwrap();
        }
        .with_subscriber(subscriber)
        .await;

        assert!(fields.contains("busy"));
        assert!(fields.contains("record_count"));
    }
}

//! SQLite-backed metadata store for projects, jobs and records.
//!
//! ## Write discipline
//!
//! SQLite admits one writer at a time and answers concurrent writers with
//! `SQLITE_BUSY`/`SQLITE_LOCKED`. Every write therefore goes through
//! [`SqliteMetadataStore::write`], which holds a single async writer lock and retries
//! busy errors with bounded exponential backoff ([`WriteRetry`]). Reads use the pool
//! directly and are not serialized.
//!
//! ## Error mapping
//!
//! | SQLx error | StorageError |
//! |------------|--------------|
//! | Database, code `5`/`6`/`261`/`262`/`517` (busy/locked) after retries | `Busy` |
//! | Any other database error | `Database` |
//! | Decode / ColumnNotFound | `InvalidData` |
//! | Anything else (io, pool) | `Database` |

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::{Row, Sqlite};
use tokio::sync::Mutex;
use tracing::{instrument, warn};

use batchforge_core::{
    ExecutionJob, ExecutionJobId, JobTotals, MasterJob, MasterJobId, MasterJobStatus, Project,
    ProjectId, Record, RecordCounts, RecordId, RecordStatus,
};

use crate::store::{MasterJobFilter, Pagination, RecordFilter, StorageError};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS projects (
        id          TEXT PRIMARY KEY,
        name        TEXT NOT NULL,
        description TEXT NULL,
        created_at  TEXT NOT NULL,
        updated_at  TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS master_jobs (
        id                 TEXT PRIMARY KEY,
        project_id         TEXT NOT NULL REFERENCES projects(id),
        name               TEXT NOT NULL,
        status             TEXT NOT NULL,
        request_config_ref TEXT NOT NULL,
        target_count       INTEGER NOT NULL,
        completed_count    INTEGER NOT NULL DEFAULT 0,
        filtered_count     INTEGER NOT NULL DEFAULT 0,
        duplicate_count    INTEGER NOT NULL DEFAULT 0,
        failed_count       INTEGER NOT NULL DEFAULT 0,
        dead_letter_count  INTEGER NOT NULL DEFAULT 0,
        total_attempted    INTEGER NOT NULL DEFAULT 0,
        creation_time      TEXT NOT NULL,
        start_time         TEXT NULL,
        end_time           TEXT NULL,
        update_time        TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_master_jobs_project ON master_jobs (project_id, status)",
    r#"
    CREATE TABLE IF NOT EXISTS execution_jobs (
        id                     TEXT PRIMARY KEY,
        master_job_id          TEXT NOT NULL REFERENCES master_jobs(id),
        status                 TEXT NOT NULL,
        run_config             TEXT NOT NULL,
        run_config_hash        TEXT NOT NULL,
        input_index            INTEGER NOT NULL,
        worker_id              TEXT NOT NULL,
        attempt                INTEGER NOT NULL,
        completed_record_count INTEGER NOT NULL DEFAULT 0,
        filtered_record_count  INTEGER NOT NULL DEFAULT 0,
        duplicate_record_count INTEGER NOT NULL DEFAULT 0,
        failed_record_count    INTEGER NOT NULL DEFAULT 0,
        error_message          TEXT NULL,
        creation_time          TEXT NOT NULL,
        start_time             TEXT NULL,
        end_time               TEXT NULL,
        update_time            TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_execution_jobs_master_hash ON execution_jobs (master_job_id, run_config_hash, status)",
    r#"
    CREATE TABLE IF NOT EXISTS records (
        id            TEXT PRIMARY KEY,
        job_id        TEXT NOT NULL REFERENCES execution_jobs(id),
        master_job_id TEXT NOT NULL REFERENCES master_jobs(id),
        status        TEXT NOT NULL,
        output_ref    TEXT NULL,
        error_message TEXT NULL,
        created_at    TEXT NOT NULL,
        updated_at    TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_records_master_status ON records (master_job_id, status)",
    "CREATE INDEX IF NOT EXISTS idx_records_job ON records (job_id)",
];

/// Retry policy for writes rejected because the database is busy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteRetry {
    /// Total attempts per write, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for WriteRetry {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            base_delay: Duration::from_millis(20),
            max_delay: Duration::from_secs(1),
        }
    }
}

impl WriteRetry {
    /// Delay after failed attempt `attempt` (1-indexed): base * 2^(attempt-1), capped.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// SQLite metadata store. Shared behind an `Arc`; owns the writer lock.
#[derive(Debug)]
pub struct SqliteMetadataStore {
    pool: SqlitePool,
    write_lock: Mutex<()>,
    retry: WriteRetry,
}

impl SqliteMetadataStore {
    /// Open (creating if missing) the database file at `path` in WAL mode.
    pub async fn connect(path: &Path, retry: WriteRetry) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::Io {
                    path: parent.display().to_string(),
                    message: e.to_string(),
                })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_millis(250));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;

        Ok(Self {
            pool,
            write_lock: Mutex::new(()),
            retry,
        })
    }

    /// Open a private in-memory database (single connection).
    pub async fn connect_in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| map_sqlx_error("connect", e))?
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;

        Ok(Self {
            pool,
            write_lock: Mutex::new(()),
            retry: WriteRetry::default(),
        })
    }

    /// Create tables and indexes.
    #[instrument(skip(self), err)]
    pub async fn setup(&self) -> Result<(), StorageError> {
        let pool = &self.pool;
        self.write("setup", || async move {
            for statement in SCHEMA {
                sqlx::query(*statement).execute(pool).await?;
            }
            Ok(())
        })
        .await
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Run a write under the writer lock, retrying while the database is busy.
    async fn write<T, F, Fut>(&self, op: &'static str, mut f: F) -> Result<T, StorageError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, sqlx::Error>>,
    {
        let _guard = self.write_lock.lock().await;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match f().await {
                Ok(value) => return Ok(value),
                Err(e) if is_busy(&e) => {
                    if attempt >= self.retry.max_attempts {
                        return Err(StorageError::Busy {
                            op,
                            attempts: attempt,
                        });
                    }
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(
                        op,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "sqlite busy; retrying write"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(map_sqlx_error(op, e)),
            }
        }
    }

    #[instrument(skip(self, project), fields(project_id = %project.id), err)]
    pub async fn save_project(&self, project: &Project) -> Result<(), StorageError> {
        let pool = &self.pool;
        self.write("save_project", || async move {
            sqlx::query(
                r#"
                INSERT INTO projects (id, name, description, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    description = excluded.description,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(project.id.to_string())
            .bind(&project.name)
            .bind(project.description.as_deref())
            .bind(project.created_at)
            .bind(project.updated_at)
            .execute(pool)
            .await?;
            Ok(())
        })
        .await
    }

    pub async fn get_project(&self, id: ProjectId) -> Result<Option<Project>, StorageError> {
        let row = sqlx::query("SELECT * FROM projects WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_project", e))?;
        row.as_ref().map(project_from_row).transpose()
    }

    pub async fn list_projects(&self, pagination: Pagination) -> Result<Vec<Project>, StorageError> {
        let rows = sqlx::query("SELECT * FROM projects ORDER BY created_at ASC, id ASC LIMIT ?1 OFFSET ?2")
            .bind(pagination.limit as i64)
            .bind(pagination.offset as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_projects", e))?;
        rows.iter().map(project_from_row).collect()
    }

    #[instrument(skip(self, job), fields(master_job_id = %job.id), err)]
    pub async fn log_master_job_start(&self, job: &MasterJob) -> Result<(), StorageError> {
        let pool = &self.pool;
        self.write("log_master_job_start", || async move {
            sqlx::query(
                r#"
                INSERT INTO master_jobs (
                    id, project_id, name, status, request_config_ref, target_count,
                    completed_count, filtered_count, duplicate_count, failed_count,
                    dead_letter_count, total_attempted,
                    creation_time, start_time, end_time, update_time
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, NULL, ?15)
                ON CONFLICT(id) DO UPDATE SET
                    status = excluded.status,
                    start_time = COALESCE(master_jobs.start_time, excluded.start_time),
                    end_time = NULL,
                    update_time = excluded.update_time
                "#,
            )
            .bind(job.id.to_string())
            .bind(job.project_id.to_string())
            .bind(&job.name)
            .bind(job.status.as_str())
            .bind(&job.request_config_ref)
            .bind(job.target_count as i64)
            .bind(job.totals.completed as i64)
            .bind(job.totals.filtered as i64)
            .bind(job.totals.duplicate as i64)
            .bind(job.totals.failed as i64)
            .bind(job.totals.dead_lettered as i64)
            .bind(job.totals.total_attempted as i64)
            .bind(job.creation_time)
            .bind(job.start_time)
            .bind(job.update_time)
            .execute(pool)
            .await?;
            Ok(())
        })
        .await
    }

    #[instrument(skip(self, id, status, totals), fields(master_job_id = %id, status = %status), err)]
    pub async fn log_master_job_end(
        &self,
        id: MasterJobId,
        status: MasterJobStatus,
        totals: &JobTotals,
        end_time: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let pool = &self.pool;
        let affected = self
            .write("log_master_job_end", || async move {
                let result = sqlx::query(
                    r#"
                    UPDATE master_jobs SET
                        status = ?2,
                        completed_count = ?3,
                        filtered_count = ?4,
                        duplicate_count = ?5,
                        failed_count = ?6,
                        dead_letter_count = ?7,
                        total_attempted = ?8,
                        end_time = ?9,
                        update_time = ?9
                    WHERE id = ?1
                    "#,
                )
                .bind(id.to_string())
                .bind(status.as_str())
                .bind(totals.completed as i64)
                .bind(totals.filtered as i64)
                .bind(totals.duplicate as i64)
                .bind(totals.failed as i64)
                .bind(totals.dead_lettered as i64)
                .bind(totals.total_attempted as i64)
                .bind(end_time)
                .execute(pool)
                .await?;
                Ok(result.rows_affected())
            })
            .await?;

        if affected == 0 {
            return Err(StorageError::NotFound(format!("master job {id}")));
        }
        Ok(())
    }

    pub async fn update_master_job_status(
        &self,
        id: MasterJobId,
        status: MasterJobStatus,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let pool = &self.pool;
        let affected = self
            .write("update_master_job_status", || async move {
                let result =
                    sqlx::query("UPDATE master_jobs SET status = ?2, update_time = ?3 WHERE id = ?1")
                        .bind(id.to_string())
                        .bind(status.as_str())
                        .bind(at)
                        .execute(pool)
                        .await?;
                Ok(result.rows_affected())
            })
            .await?;

        if affected == 0 {
            return Err(StorageError::NotFound(format!("master job {id}")));
        }
        Ok(())
    }

    pub async fn get_master_job(&self, id: MasterJobId) -> Result<Option<MasterJob>, StorageError> {
        let row = sqlx::query("SELECT * FROM master_jobs WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_master_job", e))?;
        row.as_ref().map(master_job_from_row).transpose()
    }

    pub async fn list_master_jobs(
        &self,
        filter: &MasterJobFilter,
    ) -> Result<Vec<MasterJob>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM master_jobs
            WHERE (?1 IS NULL OR project_id = ?1)
              AND (?2 IS NULL OR status = ?2)
            ORDER BY creation_time DESC, id DESC
            LIMIT ?3 OFFSET ?4
            "#,
        )
        .bind(filter.project_id.map(|id| id.to_string()))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.pagination.limit as i64)
        .bind(filter.pagination.offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_master_jobs", e))?;
        rows.iter().map(master_job_from_row).collect()
    }

    #[instrument(
        skip(self, job),
        fields(execution_job_id = %job.id, master_job_id = %job.master_job_id),
        err
    )]
    pub async fn log_execution_job_start(&self, job: &ExecutionJob) -> Result<(), StorageError> {
        let pool = &self.pool;
        let run_config = serde_json::to_string(&job.run_config)?;
        let run_config = run_config.as_str();
        self.write("log_execution_job_start", || async move {
            insert_execution_job(pool, job, run_config).await
        })
        .await
    }

    #[instrument(skip(self, jobs), fields(count = jobs.len()), err)]
    pub async fn log_execution_jobs_start_batch(
        &self,
        jobs: &[ExecutionJob],
    ) -> Result<(), StorageError> {
        if jobs.is_empty() {
            return Ok(());
        }
        let encoded = jobs
            .iter()
            .map(|job| serde_json::to_string(&job.run_config))
            .collect::<Result<Vec<_>, _>>()?;

        let pool = &self.pool;
        let encoded = encoded.as_slice();
        self.write("log_execution_jobs_start_batch", || async move {
            let mut tx = pool.begin().await?;
            for (job, run_config) in jobs.iter().zip(encoded) {
                insert_execution_job(&mut *tx, job, run_config).await?;
            }
            tx.commit().await?;
            Ok(())
        })
        .await
    }

    #[instrument(
        skip(self, id, status, counts, error_message),
        fields(execution_job_id = %id, status = %status),
        err
    )]
    pub async fn log_execution_job_end(
        &self,
        id: ExecutionJobId,
        status: RecordStatus,
        counts: &RecordCounts,
        error_message: Option<&str>,
        end_time: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let pool = &self.pool;
        let affected = self
            .write("log_execution_job_end", || async move {
                let result = sqlx::query(
                    r#"
                    UPDATE execution_jobs SET
                        status = ?2,
                        completed_record_count = ?3,
                        filtered_record_count = ?4,
                        duplicate_record_count = ?5,
                        failed_record_count = ?6,
                        error_message = ?7,
                        end_time = ?8,
                        update_time = ?8
                    WHERE id = ?1
                    "#,
                )
                .bind(id.to_string())
                .bind(status.as_str())
                .bind(counts.completed as i64)
                .bind(counts.filtered as i64)
                .bind(counts.duplicate as i64)
                .bind(counts.failed as i64)
                .bind(error_message)
                .bind(end_time)
                .execute(pool)
                .await?;
                Ok(result.rows_affected())
            })
            .await?;

        if affected == 0 {
            return Err(StorageError::NotFound(format!("execution job {id}")));
        }
        Ok(())
    }

    pub async fn get_execution_job(
        &self,
        id: ExecutionJobId,
    ) -> Result<Option<ExecutionJob>, StorageError> {
        let row = sqlx::query("SELECT * FROM execution_jobs WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_execution_job", e))?;
        row.as_ref().map(execution_job_from_row).transpose()
    }

    pub async fn list_execution_jobs(
        &self,
        master_job_id: MasterJobId,
    ) -> Result<Vec<ExecutionJob>, StorageError> {
        let rows = sqlx::query(
            "SELECT * FROM execution_jobs WHERE master_job_id = ?1 ORDER BY creation_time ASC, id ASC",
        )
        .bind(master_job_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_execution_jobs", e))?;
        rows.iter().map(execution_job_from_row).collect()
    }

    pub async fn list_execution_jobs_by_hash(
        &self,
        master_job_id: MasterJobId,
        hash: &str,
        status: RecordStatus,
    ) -> Result<Vec<ExecutionJob>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM execution_jobs
            WHERE master_job_id = ?1 AND run_config_hash = ?2 AND status = ?3
            ORDER BY creation_time ASC, id ASC
            "#,
        )
        .bind(master_job_id.to_string())
        .bind(hash)
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_execution_jobs_by_hash", e))?;
        rows.iter().map(execution_job_from_row).collect()
    }

    pub async fn log_record_metadata(&self, record: &Record) -> Result<(), StorageError> {
        let pool = &self.pool;
        self.write("log_record_metadata", || async move { upsert_record(pool, record).await })
            .await
    }

    #[instrument(skip(self, records), fields(count = records.len()), err)]
    pub async fn log_records_batch(&self, records: &[Record]) -> Result<(), StorageError> {
        if records.is_empty() {
            return Ok(());
        }
        let pool = &self.pool;
        self.write("log_records_batch", || async move {
            let mut tx = pool.begin().await?;
            for record in records {
                upsert_record(&mut *tx, record).await?;
            }
            tx.commit().await?;
            Ok(())
        })
        .await
    }

    pub async fn get_record_metadata(&self, id: RecordId) -> Result<Option<Record>, StorageError> {
        let row = sqlx::query("SELECT * FROM records WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_record_metadata", e))?;
        row.as_ref().map(record_from_row).transpose()
    }

    pub async fn list_records(
        &self,
        master_job_id: MasterJobId,
        filter: &RecordFilter,
    ) -> Result<Vec<Record>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM records
            WHERE master_job_id = ?1
              AND (?2 IS NULL OR status = ?2)
            ORDER BY created_at ASC, id ASC
            LIMIT ?3 OFFSET ?4
            "#,
        )
        .bind(master_job_id.to_string())
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.pagination.limit as i64)
        .bind(filter.pagination.offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_records", e))?;
        rows.iter().map(record_from_row).collect()
    }

    pub async fn list_records_by_execution_job(
        &self,
        job_id: ExecutionJobId,
    ) -> Result<Vec<Record>, StorageError> {
        let rows = sqlx::query("SELECT * FROM records WHERE job_id = ?1 ORDER BY created_at ASC, id ASC")
            .bind(job_id.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_records_by_execution_job", e))?;
        rows.iter().map(record_from_row).collect()
    }

    pub async fn count_records_by_status(
        &self,
        master_job_id: MasterJobId,
    ) -> Result<HashMap<RecordStatus, u64>, StorageError> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS total FROM records WHERE master_job_id = ?1 GROUP BY status",
        )
        .bind(master_job_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("count_records_by_status", e))?;

        let mut counts = HashMap::with_capacity(rows.len());
        for row in &rows {
            let status: RecordStatus = col::<String>(row, "status")?.parse()?;
            let total: i64 = col(row, "total")?;
            counts.insert(status, total.max(0) as u64);
        }
        Ok(counts)
    }
}

async fn insert_execution_job<'e, E>(
    executor: E,
    job: &ExecutionJob,
    run_config: &str,
) -> Result<(), sqlx::Error>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO execution_jobs (
            id, master_job_id, status, run_config, run_config_hash, input_index,
            worker_id, attempt,
            completed_record_count, filtered_record_count, duplicate_record_count,
            failed_record_count, error_message,
            creation_time, start_time, end_time, update_time
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
        "#,
    )
    .bind(job.id.to_string())
    .bind(job.master_job_id.to_string())
    .bind(job.status.as_str())
    .bind(run_config)
    .bind(&job.run_config_hash)
    .bind(job.input_index as i64)
    .bind(&job.worker_id)
    .bind(job.attempt as i64)
    .bind(job.counts.completed as i64)
    .bind(job.counts.filtered as i64)
    .bind(job.counts.duplicate as i64)
    .bind(job.counts.failed as i64)
    .bind(job.error_message.as_deref())
    .bind(job.creation_time)
    .bind(job.start_time)
    .bind(job.end_time)
    .bind(job.update_time)
    .execute(executor)
    .await?;
    Ok(())
}

async fn upsert_record<'e, E>(executor: E, record: &Record) -> Result<(), sqlx::Error>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO records (
            id, job_id, master_job_id, status, output_ref, error_message, created_at, updated_at
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        ON CONFLICT(id) DO UPDATE SET
            status = excluded.status,
            output_ref = excluded.output_ref,
            error_message = excluded.error_message,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(record.id.to_string())
    .bind(record.job_id.to_string())
    .bind(record.master_job_id.to_string())
    .bind(record.status.as_str())
    .bind(record.output_ref.as_deref())
    .bind(record.error_message.as_deref())
    .bind(record.created_at)
    .bind(record.updated_at)
    .execute(executor)
    .await?;
    Ok(())
}

fn col<'r, T>(row: &'r SqliteRow, name: &str) -> Result<T, StorageError>
where
    T: sqlx::Decode<'r, Sqlite> + sqlx::Type<Sqlite>,
{
    row.try_get(name).map_err(|e| map_sqlx_error("decode_row", e))
}

fn count(row: &SqliteRow, name: &str) -> Result<u64, StorageError> {
    Ok(col::<i64>(row, name)?.max(0) as u64)
}

fn project_from_row(row: &SqliteRow) -> Result<Project, StorageError> {
    Ok(Project {
        id: col::<String>(row, "id")?.parse()?,
        name: col(row, "name")?,
        description: col(row, "description")?,
        created_at: col(row, "created_at")?,
        updated_at: col(row, "updated_at")?,
    })
}

fn master_job_from_row(row: &SqliteRow) -> Result<MasterJob, StorageError> {
    Ok(MasterJob {
        id: col::<String>(row, "id")?.parse()?,
        project_id: col::<String>(row, "project_id")?.parse()?,
        name: col(row, "name")?,
        status: col::<String>(row, "status")?.parse()?,
        request_config_ref: col(row, "request_config_ref")?,
        target_count: count(row, "target_count")?,
        totals: JobTotals {
            completed: count(row, "completed_count")?,
            filtered: count(row, "filtered_count")?,
            duplicate: count(row, "duplicate_count")?,
            failed: count(row, "failed_count")?,
            dead_lettered: count(row, "dead_letter_count")?,
            total_attempted: count(row, "total_attempted")?,
        },
        creation_time: col(row, "creation_time")?,
        start_time: col(row, "start_time")?,
        end_time: col(row, "end_time")?,
        update_time: col(row, "update_time")?,
    })
}

fn execution_job_from_row(row: &SqliteRow) -> Result<ExecutionJob, StorageError> {
    let run_config: String = col(row, "run_config")?;
    Ok(ExecutionJob {
        id: col::<String>(row, "id")?.parse()?,
        master_job_id: col::<String>(row, "master_job_id")?.parse()?,
        status: col::<String>(row, "status")?.parse()?,
        run_config: serde_json::from_str(&run_config)?,
        run_config_hash: col(row, "run_config_hash")?,
        input_index: count(row, "input_index")?,
        worker_id: col(row, "worker_id")?,
        attempt: count(row, "attempt")? as u32,
        counts: RecordCounts {
            completed: count(row, "completed_record_count")?,
            filtered: count(row, "filtered_record_count")?,
            duplicate: count(row, "duplicate_record_count")?,
            failed: count(row, "failed_record_count")?,
        },
        error_message: col(row, "error_message")?,
        creation_time: col(row, "creation_time")?,
        start_time: col(row, "start_time")?,
        end_time: col(row, "end_time")?,
        update_time: col(row, "update_time")?,
    })
}

fn record_from_row(row: &SqliteRow) -> Result<Record, StorageError> {
    Ok(Record {
        id: col::<String>(row, "id")?.parse()?,
        job_id: col::<String>(row, "job_id")?.parse()?,
        master_job_id: col::<String>(row, "master_job_id")?.parse()?,
        status: col::<String>(row, "status")?.parse()?,
        output_ref: col(row, "output_ref")?,
        error_message: col(row, "error_message")?,
        created_at: col(row, "created_at")?,
        updated_at: col(row, "updated_at")?,
    })
}

fn is_busy(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            matches!(
                db.code().as_deref(),
                Some("5") | Some("6") | Some("261") | Some("262") | Some("517")
            ) || db.message().contains("database is locked")
        }
        _ => false,
    }
}

fn map_sqlx_error(op: &'static str, err: sqlx::Error) -> StorageError {
    match err {
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::ColumnNotFound(_) | sqlx::Error::Decode(_) => {
            StorageError::InvalidData(format!("{op}: {err}"))
        }
        other => StorageError::Database {
            op,
            message: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn store() -> SqliteMetadataStore {
        let store = SqliteMetadataStore::connect_in_memory().await.unwrap();
        store.setup().await.unwrap();
        store
    }

    async fn seeded_master(store: &SqliteMetadataStore) -> MasterJob {
        let project = Project::new("cities").with_description("city facts");
        store.save_project(&project).await.unwrap();
        let mut master = MasterJob::new(MasterJobId::new(), project.id, "run", "configs/x.json", 5);
        master.mark_running();
        store.log_master_job_start(&master).await.unwrap();
        master
    }

    #[test]
    fn write_retry_backs_off_exponentially_with_cap() {
        let retry = WriteRetry {
            max_attempts: 10,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
        };
        assert_eq!(retry.delay_for_attempt(1), Duration::from_millis(10));
        assert_eq!(retry.delay_for_attempt(2), Duration::from_millis(20));
        assert_eq!(retry.delay_for_attempt(3), Duration::from_millis(40));
        assert_eq!(retry.delay_for_attempt(4), Duration::from_millis(50));
    }

    #[tokio::test]
    async fn setup_is_idempotent() {
        let store = store().await;
        store.setup().await.unwrap();
        assert!(store.list_projects(Pagination::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn project_round_trip() {
        let store = store().await;
        let project = Project::new("p1").with_description("first");
        store.save_project(&project).await.unwrap();

        let loaded = store.get_project(project.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "p1");
        assert_eq!(loaded.description.as_deref(), Some("first"));
        assert!(store.get_project(ProjectId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn master_job_end_persists_totals_and_keeps_target() {
        let store = store().await;
        let master = seeded_master(&store).await;

        let totals = JobTotals {
            completed: 4,
            failed: 1,
            total_attempted: 6,
            dead_lettered: 1,
            ..Default::default()
        };
        store
            .log_master_job_end(master.id, MasterJobStatus::CompletedWithErrors, &totals, Utc::now())
            .await
            .unwrap();

        let loaded = store.get_master_job(master.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, MasterJobStatus::CompletedWithErrors);
        assert_eq!(loaded.totals, totals);
        assert_eq!(loaded.target_count, 5);
        assert!(loaded.end_time.is_some());

        // A resumed start keeps the original start time and clears the end time.
        store.log_master_job_start(&loaded).await.unwrap();
        let restarted = store.get_master_job(master.id).await.unwrap().unwrap();
        assert_eq!(restarted.start_time, master.start_time);
        assert!(restarted.end_time.is_none());
    }

    #[tokio::test]
    async fn ending_unknown_master_job_is_not_found() {
        let store = store().await;
        let err = store
            .log_master_job_end(MasterJobId::new(), MasterJobStatus::Failed, &JobTotals::default(), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn list_master_jobs_filters_by_status() {
        let store = store().await;
        let master = seeded_master(&store).await;
        let filter = MasterJobFilter {
            status: Some(MasterJobStatus::Running),
            ..Default::default()
        };
        assert_eq!(store.list_master_jobs(&filter).await.unwrap().len(), 1);

        store
            .update_master_job_status(master.id, MasterJobStatus::Cancelled, Utc::now())
            .await
            .unwrap();
        assert!(store.list_master_jobs(&filter).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn execution_jobs_are_found_by_hash_and_status() {
        let store = store().await;
        let master = seeded_master(&store).await;

        let mut done = ExecutionJob::new(master.id, 0, json!({"x": 1}), "hash-a", "w-0", 1);
        let pending = ExecutionJob::new(master.id, 1, json!({"x": 2}), "hash-b", "w-1", 1);
        store
            .log_execution_jobs_start_batch(&[done.clone(), pending.clone()])
            .await
            .unwrap();

        let counts = RecordCounts::uniform(RecordStatus::Completed, 2);
        store
            .log_execution_job_end(done.id, RecordStatus::Completed, &counts, None, Utc::now())
            .await
            .unwrap();
        done.mark_finished(RecordStatus::Completed, counts, None);

        let hits = store
            .list_execution_jobs_by_hash(master.id, "hash-a", RecordStatus::Completed)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, done.id);
        assert_eq!(hits[0].counts.completed, 2);
        assert_eq!(hits[0].run_config, json!({"x": 1}));

        let misses = store
            .list_execution_jobs_by_hash(master.id, "hash-b", RecordStatus::Completed)
            .await
            .unwrap();
        assert!(misses.is_empty());
        assert_eq!(store.list_execution_jobs(master.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn records_batch_counts_and_pages() {
        let store = store().await;
        let master = seeded_master(&store).await;
        let job = ExecutionJob::new(master.id, 0, json!({}), "h", "w-0", 1);
        store.log_execution_job_start(&job).await.unwrap();

        let records: Vec<Record> = (0..3)
            .map(|i| Record::for_job(&job, RecordStatus::Completed).with_output_ref(format!("data/{i}.json")))
            .chain(std::iter::once(Record::for_job(&job, RecordStatus::Duplicate)))
            .collect();
        store.log_records_batch(&records).await.unwrap();

        let counts = store.count_records_by_status(master.id).await.unwrap();
        assert_eq!(counts.get(&RecordStatus::Completed), Some(&3));
        assert_eq!(counts.get(&RecordStatus::Duplicate), Some(&1));

        let completed = store
            .list_records(master.id, &RecordFilter::with_status(RecordStatus::Completed))
            .await
            .unwrap();
        assert_eq!(completed.len(), 3);
        assert!(completed.iter().all(|r| r.master_job_id == master.id));

        let page = RecordFilter {
            status: None,
            pagination: Pagination::new(Some(2), Some(2)),
        };
        assert_eq!(store.list_records(master.id, &page).await.unwrap().len(), 2);
        assert_eq!(store.list_records_by_execution_job(job.id).await.unwrap().len(), 4);

        let one = store.get_record_metadata(records[0].id).await.unwrap().unwrap();
        assert_eq!(one.output_ref.as_deref(), Some("data/0.json"));
    }

    #[tokio::test]
    async fn concurrent_writers_are_serialized() {
        let store = std::sync::Arc::new(store().await);
        let master_id = seeded_master(&store).await.id;

        let mut handles = Vec::new();
        for i in 0..16u64 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let job = ExecutionJob::new(master_id, i, json!({"i": i}), format!("h{i}"), "w", 1);
                store.log_execution_job_start(&job).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(store.list_execution_jobs(master_id).await.unwrap().len(), 16);
    }
}

//! Postgres-backed job store.
//!
//! ## Concurrency
//!
//! - `create` takes a transaction-scoped advisory lock on the reference id
//!   (`pg_advisory_xact_lock(hashtext(reference_id))`) before looking for an
//!   active duplicate, so two concurrent submissions of the same reference
//!   id cannot both insert.
//! - Every mutation loads the row with `SELECT … FOR UPDATE`, applies the
//!   state machine in Rust, and writes the row back in the same transaction.
//!
//! ## Error Mapping
//!
//! | SQLx Error | JobStoreError |
//! |------------|---------------|
//! | `RowNotFound` on a keyed lookup | `NotFound` |
//! | Database / pool / io errors | `Storage` |
//! | Undecodable status or job type | `Storage` |

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{instrument, Span};

use corejobs_core::{JobId, JobRecord, JobStatus, JobType, NewJob, StatusUpdate};

use super::{
    check_fence, chrono_window, CreateOutcome, JobStats, JobStore, JobStoreError,
    DEFAULT_DUPLICATE_WINDOW,
};
use crate::config::StoreConfig;
use crate::query::JobQuery;

const SCHEMA: &str = include_str!("schema.sql");

const SELECT_COLUMNS: &str = r#"
    id, reference_id, job_type, payload, job_description, status, message,
    attempts, created_at, updated_at, started_at, finished_at, version
"#;

/// Postgres-backed job store.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
    duplicate_window: Duration,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            duplicate_window: DEFAULT_DUPLICATE_WINDOW,
        }
    }

    /// Open a pool for `config.database_url`.
    pub async fn connect(config: &StoreConfig) -> Result<Self, JobStoreError> {
        let url = config
            .database_url
            .as_deref()
            .ok_or_else(|| JobStoreError::Storage("database_url is not configured".to_string()))?;
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    pub fn with_duplicate_window(mut self, window: Duration) -> Self {
        self.duplicate_window = window;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled schema (idempotent).
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), JobStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    /// Lock the row, apply `f`, write it back.
    async fn mutate<F>(&self, operation: &'static str, id: JobId, f: F) -> Result<JobRecord, JobStoreError>
    where
        F: FnOnce(&mut JobRecord) -> Result<(), JobStoreError> + Send,
    {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let row = sqlx::query(&format!("SELECT {SELECT_COLUMNS} FROM core_jobs WHERE id = $1 FOR UPDATE"))
            .bind(id.get())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?
            .ok_or(JobStoreError::NotFound(id))?;

        let mut record = record_from_row(&row)?;
        // Dropping `tx` on error rolls back and releases the row lock.
        f(&mut record)?;
        write_back(&mut tx, operation, &record).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(record)
    }
}

#[async_trait::async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(
        skip(self, job),
        fields(
            reference_id = %job.reference_id,
            job_type = %job.job_type,
            duplicate = tracing::field::Empty
        ),
        err
    )]
    async fn create(&self, job: NewJob) -> Result<CreateOutcome, JobStoreError> {
        let now = Utc::now();
        let window = chrono_window(self.duplicate_window);

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(&job.reference_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("advisory_lock", e))?;

        let latest = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM core_jobs WHERE reference_id = $1 ORDER BY id DESC LIMIT 1"
        ))
        .bind(&job.reference_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("find_by_reference", e))?;

        if let Some(row) = latest {
            let existing = record_from_row(&row)?;
            if existing.blocks_resubmission(window, now) {
                tx.commit()
                    .await
                    .map_err(|e| map_sqlx_error("commit_transaction", e))?;
                Span::current().record("duplicate", true);
                return Ok(CreateOutcome::Existing(existing));
            }
        }

        let message = "Job created";
        let row = sqlx::query(
            r#"
            INSERT INTO core_jobs (
                reference_id, job_type, payload, job_description, status, message,
                attempts, created_at, updated_at, version
            )
            VALUES ($1, $2, $3, $4, $5, $6, 0, $7, $7, 1)
            RETURNING id
            "#,
        )
        .bind(&job.reference_id)
        .bind(job.job_type.as_str())
        .bind(&job.payload)
        .bind(&job.description)
        .bind(JobStatus::Pending.code())
        .bind(message)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_job", e))?;

        let id: i64 = row
            .try_get("id")
            .map_err(|e| JobStoreError::Storage(format!("failed to read id: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Ok(CreateOutcome::Created(JobRecord::new(JobId::new(id), job, now)))
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn get(&self, id: JobId) -> Result<JobRecord, JobStoreError> {
        let row = sqlx::query(&format!("SELECT {SELECT_COLUMNS} FROM core_jobs WHERE id = $1"))
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?
            .ok_or(JobStoreError::NotFound(id))?;
        record_from_row(&row)
    }

    #[instrument(skip(self, update), fields(job_id = %id, status = %update.status), err)]
    async fn update_status(&self, id: JobId, update: StatusUpdate) -> Result<JobRecord, JobStoreError> {
        self.mutate("update_status", id, move |record| {
            check_fence(record, &update)?;
            record.transition(update.status, update.message, Utc::now())?;
            Ok(())
        })
        .await
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn begin_attempt(&self, id: JobId) -> Result<JobRecord, JobStoreError> {
        self.mutate("begin_attempt", id, |record| Ok(record.begin_attempt(Utc::now())?))
            .await
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn fail_undelivered(&self, id: JobId, reason: &str) -> Result<JobRecord, JobStoreError> {
        let reason = reason.to_string();
        self.mutate("fail_undelivered", id, move |record| {
            Ok(record.fail_undelivered(reason, Utc::now())?)
        })
        .await
    }

    #[instrument(skip(self, query), fields(limit = query.limit, offset = query.offset), err)]
    async fn list(&self, query: &JobQuery) -> Result<(Vec<JobRecord>, u64), JobStoreError> {
        let f = &query.filter;
        let status = f.status.map(|s| s.code());
        let job_type = f.job_type.map(|t| t.as_str());
        let reference_like = f.reference_id_contains.as_deref().map(like_pattern);
        let description_like = f.description_contains.as_deref().map(like_pattern);
        let search_like = f.search.as_deref().map(like_pattern);

        // Optional filters collapse to TRUE when their parameter is NULL.
        const WHERE: &str = r#"
            WHERE ($1::smallint IS NULL OR status = $1)
                AND ($2::text IS NULL OR job_type = $2)
                AND ($3::text IS NULL OR reference_id = $3)
                AND ($4::text IS NULL OR reference_id ILIKE $4)
                AND ($5::text IS NULL OR job_description ILIKE $5)
                AND ($6::timestamptz IS NULL OR created_at >= $6)
                AND ($7::timestamptz IS NULL OR created_at <= $7)
                AND ($8::text IS NULL OR reference_id ILIKE $8 OR job_description ILIKE $8)
        "#;

        let count_row = sqlx::query(&format!("SELECT COUNT(*) AS total FROM core_jobs {WHERE}"))
            .bind(status)
            .bind(job_type)
            .bind(f.reference_id.as_deref())
            .bind(reference_like.as_deref())
            .bind(description_like.as_deref())
            .bind(f.created_from)
            .bind(f.created_to)
            .bind(search_like.as_deref())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("count_jobs", e))?;

        let total: i64 = count_row
            .try_get("total")
            .map_err(|e| JobStoreError::Storage(format!("failed to read count: {e}")))?;

        // The sort column comes from the SortField allow-list, never from input.
        let order = if query.sort_by.column() == "id" {
            format!("ORDER BY id {}", query.direction.as_sql())
        } else {
            format!(
                "ORDER BY {} {}, id ASC",
                query.sort_by.column(),
                query.direction.as_sql()
            )
        };

        let rows = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM core_jobs {WHERE} {order} LIMIT $9 OFFSET $10"
        ))
        .bind(status)
        .bind(job_type)
        .bind(f.reference_id.as_deref())
        .bind(reference_like.as_deref())
        .bind(description_like.as_deref())
        .bind(f.created_from)
        .bind(f.created_to)
        .bind(search_like.as_deref())
        .bind(i64::from(query.limit))
        .bind(i64::try_from(query.offset).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_jobs", e))?;

        let items = rows.iter().map(record_from_row).collect::<Result<Vec<_>, _>>()?;
        Ok((items, total.max(0) as u64))
    }

    #[instrument(skip(self), err)]
    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM core_jobs GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("job_stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let code: i16 = row
                .try_get("status")
                .map_err(|e| JobStoreError::Storage(format!("failed to read status: {e}")))?;
            let n: i64 = row
                .try_get("n")
                .map_err(|e| JobStoreError::Storage(format!("failed to read count: {e}")))?;
            let status = JobStatus::from_code(code)
                .ok_or_else(|| JobStoreError::Storage(format!("unknown status code {code}")))?;
            stats.add(status, n.max(0) as u64);
        }
        Ok(stats)
    }
}

async fn write_back(
    tx: &mut Transaction<'_, Postgres>,
    operation: &'static str,
    record: &JobRecord,
) -> Result<(), JobStoreError> {
    sqlx::query(
        r#"
        UPDATE core_jobs
        SET status = $2,
            message = $3,
            attempts = $4,
            updated_at = $5,
            started_at = $6,
            finished_at = $7,
            version = $8
        WHERE id = $1
        "#,
    )
    .bind(record.id.get())
    .bind(record.status.code())
    .bind(&record.message)
    .bind(i32::try_from(record.attempts).unwrap_or(i32::MAX))
    .bind(record.updated_at)
    .bind(record.started_at)
    .bind(record.finished_at)
    .bind(i64::try_from(record.version).unwrap_or(i64::MAX))
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error(operation, e))?;
    Ok(())
}

/// `%needle%` with LIKE metacharacters escaped.
fn like_pattern(needle: &str) -> String {
    let mut escaped = String::with_capacity(needle.len() + 2);
    escaped.push('%');
    for ch in needle.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped.push('%');
    escaped
}

// SQLx row mapping

fn record_from_row(row: &PgRow) -> Result<JobRecord, JobStoreError> {
    let decode = |e: sqlx::Error| JobStoreError::Storage(format!("failed to decode job row: {e}"));

    let status_code: i16 = row.try_get("status").map_err(decode)?;
    let status = JobStatus::from_code(status_code)
        .ok_or_else(|| JobStoreError::Storage(format!("unknown status code {status_code}")))?;
    let job_type: String = row.try_get("job_type").map_err(decode)?;
    let job_type: JobType = job_type
        .parse()
        .map_err(|e| JobStoreError::Storage(format!("unknown job type in row: {e}")))?;
    let attempts: i32 = row.try_get("attempts").map_err(decode)?;
    let version: i64 = row.try_get("version").map_err(decode)?;
    let created_at: DateTime<Utc> = row.try_get("created_at").map_err(decode)?;

    Ok(JobRecord {
        id: JobId::new(row.try_get("id").map_err(decode)?),
        reference_id: row.try_get("reference_id").map_err(decode)?,
        job_type,
        payload: row.try_get("payload").map_err(decode)?,
        description: row.try_get("job_description").map_err(decode)?,
        status,
        message: row.try_get("message").map_err(decode)?,
        attempts: attempts.max(0) as u32,
        created_at,
        updated_at: row.try_get("updated_at").map_err(decode)?,
        started_at: row.try_get("started_at").map_err(decode)?,
        finished_at: row.try_get("finished_at").map_err(decode)?,
        version: version.max(0) as u64,
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.to_string()).unwrap_or_default();
            JobStoreError::Storage(format!(
                "database error in {operation} ({code}): {}",
                db_err.message()
            ))
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::PoolTimedOut => {
            JobStoreError::Storage(format!("timed out acquiring a connection in {operation}"))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn like_pattern_escapes_metacharacters() {
        assert_eq!(like_pattern("test"), "%test%");
        assert_eq!(like_pattern("50%_off"), "%50\\%\\_off%");
    }

    #[test]
    fn schema_declares_the_jobs_table() {
        assert!(SCHEMA.contains("CREATE TABLE IF NOT EXISTS core_jobs"));
        assert!(SCHEMA.contains("reference_id     VARCHAR(50)"));
    }
}

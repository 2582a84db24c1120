//! Postgres-backed job store.
//!
//! Claims lock rows with `FOR UPDATE` (`SKIP LOCKED` when polling) inside one
//! short transaction that commits before execution starts. Write-backs are
//! plain `UPDATE`s guarded by `status = 'processing' AND attempts = $lease`.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError |
//! |------------|----------------------|---------------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / Io / other | N/A | `Storage` |
//! | ColumnDecode / row conversion | N/A | `Decode` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::{Span, instrument};

use coachq_core::{JobId, OwnerId, SessionRef};

use super::claim::{self, ClaimDecision, LEASE_EXPIRED_ERROR, LeaseTerms};
use super::store::{ClaimOutcome, JobStore, JobStoreError};
use super::types::{EnqueueRequest, Job, JobKind, JobKindTag, JobLease, JobStats, JobStatus, WriteBack};

const SCHEMA: &str = include_str!("../../migrations/0001_coach_jobs.sql");

macro_rules! select_jobs {
    ($($tail:literal),* $(,)?) => {
        concat!(
            "SELECT id, owner_id, kind, session_ref, period_start, period_end, status, attempts, \
             next_run_at, last_error, result, notification_sent, notification_ref, \
             created_at, updated_at, completed_at FROM coach_jobs ",
            $($tail),*
        )
    };
}

const RETURNING_JOB: &str = "RETURNING id, owner_id, kind, session_ref, period_start, period_end, status, \
     attempts, next_run_at, last_error, result, notification_sent, notification_ref, \
     created_at, updated_at, completed_at";

/// Postgres-backed job store.
///
/// ## Thread Safety
///
/// Uses SQLx connection pool which is thread-safe (Arc + Send + Sync). Any
/// number of worker processes may share one database.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    /// Create a new PostgresJobStore with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the `coach_jobs` table and its indexes if missing.
    pub async fn migrate(&self) -> Result<(), JobStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    async fn enqueue_session(
        &self,
        owner_id: OwnerId,
        session_ref: &SessionRef,
        now: DateTime<Utc>,
    ) -> Result<JobId, JobStoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO coach_jobs
                (id, owner_id, kind, session_ref, status, attempts, next_run_at,
                 notification_sent, created_at, updated_at)
            VALUES ($1, $2, 'session', $3, 'pending', 0, $4, FALSE, $4, $4)
            ON CONFLICT (session_ref) WHERE kind = 'session'
            DO UPDATE SET updated_at = EXCLUDED.updated_at
            RETURNING id
            "#,
        )
        .bind(*JobId::new().as_uuid())
        .bind(owner_id.as_uuid())
        .bind(session_ref.as_str())
        .bind(now)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("enqueue_session", e))?;

        let id: uuid::Uuid = row.try_get("id").map_err(|e| map_sqlx_error("enqueue_session", e))?;
        Ok(JobId::from_uuid(id))
    }

    async fn enqueue_period(
        &self,
        owner_id: OwnerId,
        period_start: Option<NaiveDate>,
        period_end: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<JobId, JobStoreError> {
        if let Some(id) = self.find_period_id(owner_id, period_end).await? {
            return Ok(id);
        }

        let id = JobId::new();
        let inserted = sqlx::query(
            r#"
            INSERT INTO coach_jobs
                (id, owner_id, kind, period_start, period_end, status, attempts, next_run_at,
                 notification_sent, created_at, updated_at)
            VALUES ($1, $2, 'period', $3, $4, 'pending', 0, $5, FALSE, $5, $5)
            "#,
        )
        .bind(id.as_uuid())
        .bind(owner_id.as_uuid())
        .bind(period_start)
        .bind(period_end)
        .bind(now)
        .execute(&*self.pool)
        .await;

        match inserted {
            Ok(_) => Ok(id),
            Err(e) if is_unique_violation(&e) => {
                tracing::debug!(owner_id = %owner_id, %period_end, "lost period enqueue race; reusing existing job");
                self.find_period_id(owner_id, period_end).await?.ok_or_else(|| {
                    JobStoreError::Conflict(format!(
                        "period job for {owner_id}/{period_end} vanished after unique violation"
                    ))
                })
            }
            Err(e) => Err(map_sqlx_error("enqueue_period", e)),
        }
    }

    async fn find_period_id(&self, owner_id: OwnerId, period_end: NaiveDate) -> Result<Option<JobId>, JobStoreError> {
        let row = sqlx::query("SELECT id FROM coach_jobs WHERE owner_id = $1 AND kind = 'period' AND period_end = $2")
            .bind(owner_id.as_uuid())
            .bind(period_end)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_period_id", e))?;

        row.map(|r| r.try_get::<uuid::Uuid, _>("id").map(JobId::from_uuid))
            .transpose()
            .map_err(|e| map_sqlx_error("find_period_id", e))
    }

    async fn write_back(
        &self,
        operation: &str,
        query: sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<WriteBack, JobStoreError> {
        let result = query
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        Ok(if result.rows_affected() == 0 {
            WriteBack::Superseded
        } else {
            WriteBack::Applied
        })
    }
}

async fn mark_processing(
    tx: &mut Transaction<'_, Postgres>,
    job_id: uuid::Uuid,
    terms: &LeaseTerms,
    now: DateTime<Utc>,
) -> Result<Job, JobStoreError> {
    let sql = format!(
        "UPDATE coach_jobs SET status = 'processing', attempts = LEAST(attempts + 1, $2), updated_at = $3 \
         WHERE id = $1 {RETURNING_JOB}"
    );
    let row = sqlx::query(&sql)
        .bind(job_id)
        .bind(to_db_attempts(terms.max_attempts))
        .bind(now)
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("mark_processing", e))?;
    decode_job(&row)
}

async fn mark_expired(
    tx: &mut Transaction<'_, Postgres>,
    job_id: uuid::Uuid,
    now: DateTime<Utc>,
) -> Result<Job, JobStoreError> {
    let sql = format!(
        "UPDATE coach_jobs SET status = 'failed', last_error = $2, updated_at = $3, completed_at = $3 \
         WHERE id = $1 {RETURNING_JOB}"
    );
    let row = sqlx::query(&sql)
        .bind(job_id)
        .bind(LEASE_EXPIRED_ERROR)
        .bind(now)
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("mark_expired", e))?;
    decode_job(&row)
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(
        skip_all,
        fields(owner_id = %request.owner_id, kind = %request.kind.tag(), job_id = tracing::field::Empty),
        err
    )]
    async fn enqueue(&self, request: &EnqueueRequest, now: DateTime<Utc>) -> Result<JobId, JobStoreError> {
        let id = match &request.kind {
            JobKind::Session { session_ref } => self.enqueue_session(request.owner_id, session_ref, now).await?,
            JobKind::Period {
                period_start,
                period_end,
            } => {
                self.enqueue_period(request.owner_id, *period_start, *period_end, now)
                    .await?
            }
        };
        Span::current().record("job_id", tracing::field::display(id));
        Ok(id)
    }

    #[instrument(skip_all, fields(owner_id = %owner_id, job_id = %job_id), err)]
    async fn get(&self, owner_id: OwnerId, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(select_jobs!("WHERE id = $1 AND owner_id = $2"))
            .bind(job_id.as_uuid())
            .bind(owner_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;
        row.as_ref().map(decode_job).transpose()
    }

    #[instrument(skip_all, fields(owner_id = %owner_id), err)]
    async fn find_by_session(&self, owner_id: OwnerId, session_ref: &SessionRef) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(select_jobs!("WHERE owner_id = $1 AND kind = 'session' AND session_ref = $2"))
            .bind(owner_id.as_uuid())
            .bind(session_ref.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_by_session", e))?;
        row.as_ref().map(decode_job).transpose()
    }

    #[instrument(skip_all, fields(owner_id = %owner_id), err)]
    async fn find_latest_by_period(&self, owner_id: OwnerId) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(select_jobs!(
            "WHERE owner_id = $1 AND kind = 'period' ",
            "ORDER BY period_end DESC, created_at DESC LIMIT 1"
        ))
        .bind(owner_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_latest_by_period", e))?;
        row.as_ref().map(decode_job).transpose()
    }

    #[instrument(skip_all, fields(job_id = %job_id, force = force), err)]
    async fn claim_by_id(
        &self,
        job_id: JobId,
        force: bool,
        terms: &LeaseTerms,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome, JobStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("claim_by_id", e))?;

        let row = sqlx::query(select_jobs!("WHERE id = $1 FOR UPDATE"))
            .bind(job_id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("claim_by_id", e))?;

        let Some(row) = row else {
            tx.rollback().await.map_err(|e| map_sqlx_error("claim_by_id", e))?;
            return Ok(ClaimOutcome::NotFound);
        };
        let job = decode_job(&row)?;

        let outcome = match claim::decide(&job, force, terms, now) {
            ClaimDecision::Claim => ClaimOutcome::Claimed(mark_processing(&mut tx, *job.id.as_uuid(), terms, now).await?),
            ClaimDecision::Expire => ClaimOutcome::Terminal(mark_expired(&mut tx, *job.id.as_uuid(), now).await?),
            ClaimDecision::Terminal => ClaimOutcome::Terminal(job),
            ClaimDecision::InFlight => ClaimOutcome::InFlight(job),
            ClaimDecision::NotDue => ClaimOutcome::NotDue(job),
        };

        tx.commit().await.map_err(|e| map_sqlx_error("claim_by_id", e))?;
        Ok(outcome)
    }

    #[instrument(skip_all, err)]
    async fn claim_next(&self, terms: &LeaseTerms, now: DateTime<Utc>) -> Result<Option<Job>, JobStoreError> {
        let stale_before = terms.stale_before(now);
        let max_attempts = to_db_attempts(terms.max_attempts);

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("claim_next", e))?;

        let expired = sqlx::query(
            r#"
            UPDATE coach_jobs
            SET status = 'failed', last_error = $1, updated_at = $2, completed_at = $2
            WHERE id IN (
                SELECT id FROM coach_jobs
                WHERE status = 'processing' AND updated_at < $3 AND attempts >= $4
                FOR UPDATE SKIP LOCKED
            )
            "#,
        )
        .bind(LEASE_EXPIRED_ERROR)
        .bind(now)
        .bind(stale_before)
        .bind(max_attempts)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("claim_next", e))?;
        if expired.rows_affected() > 0 {
            tracing::warn!(count = expired.rows_affected(), "expired stale jobs on their final attempt");
        }

        let candidate = sqlx::query(
            r#"
            SELECT id FROM coach_jobs
            WHERE ((status = 'pending' AND next_run_at <= $1)
                OR (status = 'processing' AND updated_at < $2))
              AND attempts < $3
            ORDER BY created_at ASC, id ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(now)
        .bind(stale_before)
        .bind(max_attempts)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("claim_next", e))?;

        let claimed = match candidate {
            Some(row) => {
                let id: uuid::Uuid = row.try_get("id").map_err(|e| map_sqlx_error("claim_next", e))?;
                Some(mark_processing(&mut tx, id, terms, now).await?)
            }
            None => None,
        };

        tx.commit().await.map_err(|e| map_sqlx_error("claim_next", e))?;
        Ok(claimed)
    }

    #[instrument(skip_all, fields(job_id = %lease.job_id, attempts = lease.attempts), err)]
    async fn complete(
        &self,
        lease: JobLease,
        result: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<WriteBack, JobStoreError> {
        let query = sqlx::query(
            r#"
            UPDATE coach_jobs
            SET status = 'done', result = $3, last_error = NULL, updated_at = $4, completed_at = $4
            WHERE id = $1 AND status = 'processing' AND attempts = $2
            "#,
        )
        .bind(*lease.job_id.as_uuid())
        .bind(to_db_attempts(lease.attempts))
        .bind(result.clone())
        .bind(now);
        self.write_back("complete", query).await
    }

    #[instrument(skip_all, fields(job_id = %lease.job_id, attempts = lease.attempts), err)]
    async fn reschedule(
        &self,
        lease: JobLease,
        error: &str,
        next_run_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<WriteBack, JobStoreError> {
        let query = sqlx::query(
            r#"
            UPDATE coach_jobs
            SET status = 'pending', next_run_at = $3, last_error = $4, updated_at = $5
            WHERE id = $1 AND status = 'processing' AND attempts = $2
            "#,
        )
        .bind(*lease.job_id.as_uuid())
        .bind(to_db_attempts(lease.attempts))
        .bind(next_run_at)
        .bind(error.to_string())
        .bind(now);
        self.write_back("reschedule", query).await
    }

    #[instrument(skip_all, fields(job_id = %lease.job_id, attempts = lease.attempts), err)]
    async fn fail(&self, lease: JobLease, error: &str, now: DateTime<Utc>) -> Result<WriteBack, JobStoreError> {
        let query = sqlx::query(
            r#"
            UPDATE coach_jobs
            SET status = 'failed', last_error = $3, updated_at = $4, completed_at = $4
            WHERE id = $1 AND status = 'processing' AND attempts = $2
            "#,
        )
        .bind(*lease.job_id.as_uuid())
        .bind(to_db_attempts(lease.attempts))
        .bind(error.to_string())
        .bind(now);
        self.write_back("fail", query).await
    }

    #[instrument(skip_all, fields(job_id = %job_id), err)]
    async fn record_notification(
        &self,
        job_id: JobId,
        reference: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<WriteBack, JobStoreError> {
        let query = sqlx::query(
            r#"
            UPDATE coach_jobs
            SET notification_sent = TRUE, notification_ref = $2, updated_at = $3
            WHERE id = $1 AND status = 'done'
            "#,
        )
        .bind(*job_id.as_uuid())
        .bind(reference.map(str::to_string))
        .bind(now);
        self.write_back("record_notification", query).await
    }

    #[instrument(skip_all, err)]
    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM coach_jobs GROUP BY status")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(|e| map_sqlx_error("stats", e))?;
            let n: i64 = row.try_get("n").map_err(|e| map_sqlx_error("stats", e))?;
            let n = u64::try_from(n).unwrap_or(0);
            match status.parse::<JobStatus>().map_err(JobStoreError::Decode)? {
                JobStatus::Pending => stats.pending = n,
                JobStatus::Processing => stats.processing = n,
                JobStatus::Done => stats.done = n,
                JobStatus::Failed => stats.failed = n,
            }
        }
        Ok(stats)
    }
}

fn to_db_attempts(attempts: u32) -> i32 {
    i32::try_from(attempts).unwrap_or(i32::MAX)
}

/// Map SQLx errors to JobStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code() {
                Some(code) if code.as_ref() == "23505" => JobStoreError::Conflict(msg),
                _ => JobStoreError::Storage(msg),
            }
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::ColumnNotFound(_) => {
            JobStoreError::Decode(format!("{} in {}", err, operation))
        }
        sqlx::Error::PoolClosed => JobStoreError::Storage(format!("connection pool closed in {}", operation)),
        _ => JobStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

/// Check if an error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

fn decode_job(row: &PgRow) -> Result<Job, JobStoreError> {
    let raw = JobRow::from_row(row).map_err(|e| map_sqlx_error("decode_job", e))?;
    Job::try_from(raw)
}

// SQLx row types

#[derive(Debug)]
struct JobRow {
    id: uuid::Uuid,
    owner_id: uuid::Uuid,
    kind: String,
    session_ref: Option<String>,
    period_start: Option<NaiveDate>,
    period_end: Option<NaiveDate>,
    status: String,
    attempts: i32,
    next_run_at: DateTime<Utc>,
    last_error: Option<String>,
    result: Option<serde_json::Value>,
    notification_sent: bool,
    notification_ref: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl<'r> FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            owner_id: row.try_get("owner_id")?,
            kind: row.try_get("kind")?,
            session_ref: row.try_get("session_ref")?,
            period_start: row.try_get("period_start")?,
            period_end: row.try_get("period_end")?,
            status: row.try_get("status")?,
            attempts: row.try_get("attempts")?,
            next_run_at: row.try_get("next_run_at")?,
            last_error: row.try_get("last_error")?,
            result: row.try_get("result")?,
            notification_sent: row.try_get("notification_sent")?,
            notification_ref: row.try_get("notification_ref")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let kind = match row.kind.parse::<JobKindTag>().map_err(JobStoreError::Decode)? {
            JobKindTag::Session => {
                let raw = row
                    .session_ref
                    .ok_or_else(|| JobStoreError::Decode(format!("session job {} has no session_ref", row.id)))?;
                JobKind::Session {
                    session_ref: SessionRef::parse(raw).map_err(|e| JobStoreError::Decode(e.to_string()))?,
                }
            }
            JobKindTag::Period => JobKind::Period {
                period_start: row.period_start,
                period_end: row
                    .period_end
                    .ok_or_else(|| JobStoreError::Decode(format!("period job {} has no period_end", row.id)))?,
            },
        };

        Ok(Job {
            id: JobId::from_uuid(row.id),
            owner_id: OwnerId::from_uuid(row.owner_id),
            kind,
            status: row.status.parse().map_err(JobStoreError::Decode)?,
            attempts: u32::try_from(row.attempts)
                .map_err(|_| JobStoreError::Decode(format!("negative attempts on job {}", row.id)))?,
            next_run_at: row.next_run_at,
            last_error: row.last_error,
            result: row.result,
            notification_sent: row.notification_sent,
            notification_ref: row.notification_ref,
            created_at: row.created_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
        })
    }
}

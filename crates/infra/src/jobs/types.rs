//! Core job types.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use coachq_core::{JobId, OwnerId, SessionRef};

/// What a job generates feedback for. Doubles as its dedup key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobKind {
    /// One completed session. Deduplicated on `session_ref`.
    Session { session_ref: SessionRef },
    /// A period of activity. Deduplicated on `(owner_id, period_end)`.
    Period {
        period_start: Option<NaiveDate>,
        period_end: NaiveDate,
    },
}

impl JobKind {
    pub fn tag(&self) -> JobKindTag {
        match self {
            JobKind::Session { .. } => JobKindTag::Session,
            JobKind::Period { .. } => JobKindTag::Period,
        }
    }

    pub fn session_ref(&self) -> Option<&SessionRef> {
        match self {
            JobKind::Session { session_ref } => Some(session_ref),
            JobKind::Period { .. } => None,
        }
    }

    pub fn period_end(&self) -> Option<NaiveDate> {
        match self {
            JobKind::Session { .. } => None,
            JobKind::Period { period_end, .. } => Some(*period_end),
        }
    }
}

/// Field-less discriminant of [`JobKind`], as stored in the `kind` column.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKindTag {
    Session,
    Period,
}

impl JobKindTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKindTag::Session => "session",
            JobKindTag::Period => "period",
        }
    }
}

impl std::fmt::Display for JobKindTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobKindTag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "session" => Ok(JobKindTag::Session),
            "period" => Ok(JobKindTag::Period),
            other => Err(format!("unknown job kind: {other}")),
        }
    }
}

/// Job execution status.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for `next_run_at`
    Pending,
    /// Claimed; a lease holder is executing it
    Processing,
    /// Result persisted
    Done,
    /// Attempts exhausted
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "done" => Ok(JobStatus::Done),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// A coach job row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub owner_id: OwnerId,
    pub kind: JobKind,
    pub status: JobStatus,
    /// Number of claims so far. Never exceeds the configured maximum.
    pub attempts: u32,
    pub next_run_at: DateTime<Utc>,
    pub last_error: Option<String>,
    /// Pipeline output; present iff `status == Done`.
    pub result: Option<serde_json::Value>,
    pub notification_sent: bool,
    pub notification_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Also the lease clock while `status == Processing`.
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// A fresh pending job, due immediately.
    pub fn new(owner_id: OwnerId, kind: JobKind, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            owner_id,
            kind,
            status: JobStatus::Pending,
            attempts: 0,
            next_run_at: now,
            last_error: None,
            result: None,
            notification_sent: false,
            notification_ref: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Claim token for compare-and-swap write-back.
    pub fn lease(&self) -> JobLease {
        JobLease {
            job_id: self.id,
            attempts: self.attempts,
        }
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot::from(self)
    }
}

/// Identifies one specific claim of a job.
///
/// A write-back is only applied while the row is still `processing` with the
/// same `attempts`; a stale reclaim bumps `attempts` and invalidates older leases.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobLease {
    pub job_id: JobId,
    pub attempts: u32,
}

/// Result of a compare-and-swap write-back.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WriteBack {
    Applied,
    /// The row moved on (reclaimed or finished by someone else); nothing was written.
    Superseded,
}

/// Caller-facing view of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: JobId,
    pub kind: JobKind,
    pub status: JobStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub result: Option<serde_json::Value>,
    pub notification_sent: bool,
    pub notification_ref: Option<String>,
    pub next_run_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&Job> for JobSnapshot {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            kind: job.kind.clone(),
            status: job.status,
            attempts: job.attempts,
            last_error: job.last_error.clone(),
            result: job.result.clone(),
            notification_sent: job.notification_sent,
            notification_ref: job.notification_ref.clone(),
            next_run_at: job.next_run_at,
            updated_at: job.updated_at,
            completed_at: job.completed_at,
        }
    }
}

/// Counts per status, for operators.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    pub pending: u64,
    pub processing: u64,
    pub done: u64,
    pub failed: u64,
}

impl JobStats {
    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.done + self.failed
    }

    pub(crate) fn count(&mut self, status: JobStatus) {
        match status {
            JobStatus::Pending => self.pending += 1,
            JobStatus::Processing => self.processing += 1,
            JobStatus::Done => self.done += 1,
            JobStatus::Failed => self.failed += 1,
        }
    }
}

/// Rejected enqueue input.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EnqueueError {
    #[error("session-scoped jobs require a session reference")]
    MissingSessionRef,

    #[error("period-scoped jobs require a period end")]
    MissingPeriodEnd,

    #[error("invalid period: start {start} is after end {end}")]
    InvalidPeriod { start: NaiveDate, end: NaiveDate },

    #[error(transparent)]
    Domain(#[from] coachq_core::DomainError),
}

/// Validated request to create (or find) a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueRequest {
    pub owner_id: OwnerId,
    pub kind: JobKind,
}

impl EnqueueRequest {
    pub fn session(owner_id: OwnerId, session_ref: SessionRef) -> Self {
        Self {
            owner_id,
            kind: JobKind::Session { session_ref },
        }
    }

    pub fn period(
        owner_id: OwnerId,
        period_start: Option<NaiveDate>,
        period_end: NaiveDate,
    ) -> Result<Self, EnqueueError> {
        if let Some(start) = period_start {
            if start > period_end {
                return Err(EnqueueError::InvalidPeriod {
                    start,
                    end: period_end,
                });
            }
        }
        Ok(Self {
            owner_id,
            kind: JobKind::Period {
                period_start,
                period_end,
            },
        })
    }

    /// Build from loosely-typed caller input, enforcing the per-kind requirements.
    pub fn from_parts(
        owner_id: OwnerId,
        kind: JobKindTag,
        session_ref: Option<&str>,
        period_start: Option<NaiveDate>,
        period_end: Option<NaiveDate>,
    ) -> Result<Self, EnqueueError> {
        match kind {
            JobKindTag::Session => {
                let raw = session_ref.ok_or(EnqueueError::MissingSessionRef)?;
                Ok(Self::session(owner_id, SessionRef::parse(raw)?))
            }
            JobKindTag::Period => {
                let end = period_end.ok_or(EnqueueError::MissingPeriodEnd)?;
                Self::period(owner_id, period_start, end)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
    }

    #[test]
    fn new_job_is_pending_and_due() {
        let now = Utc::now();
        let job = Job::new(OwnerId::new(), JobKind::Period { period_start: None, period_end: day(7) }, now);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);
        assert!(job.next_run_at <= now);
        assert!(job.result.is_none());
        assert!(!job.notification_sent);
    }

    #[test]
    fn terminal_statuses() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
        assert!(JobStatus::Done.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
    }

    #[test]
    fn status_round_trips_through_column_text() {
        for status in [JobStatus::Pending, JobStatus::Processing, JobStatus::Done, JobStatus::Failed] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("running".parse::<JobStatus>().is_err());
    }

    #[test]
    fn from_parts_enforces_kind_requirements() {
        let owner = OwnerId::new();
        assert_eq!(
            EnqueueRequest::from_parts(owner, JobKindTag::Session, None, None, None),
            Err(EnqueueError::MissingSessionRef)
        );
        assert_eq!(
            EnqueueRequest::from_parts(owner, JobKindTag::Period, None, Some(day(1)), None),
            Err(EnqueueError::MissingPeriodEnd)
        );
        assert!(matches!(
            EnqueueRequest::from_parts(owner, JobKindTag::Session, Some("  "), None, None),
            Err(EnqueueError::Domain(_))
        ));

        let req = EnqueueRequest::from_parts(owner, JobKindTag::Session, Some("s-1"), None, None).unwrap();
        assert_eq!(req.kind.session_ref().map(|s| s.as_str()), Some("s-1"));
    }

    #[test]
    fn inverted_period_is_rejected() {
        let err = EnqueueRequest::period(OwnerId::new(), Some(day(8)), day(7)).unwrap_err();
        assert_eq!(err, EnqueueError::InvalidPeriod { start: day(8), end: day(7) });
    }

    #[test]
    fn lease_captures_attempts() {
        let mut job = Job::new(OwnerId::new(), JobKind::Session { session_ref: SessionRef::parse("s").unwrap() }, Utc::now());
        job.attempts = 2;
        assert_eq!(job.lease(), JobLease { job_id: job.id, attempts: 2 });
    }
}

//! Job storage abstraction and the in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use coachq_core::{JobId, OwnerId, SessionRef};

use super::claim::{self, ClaimDecision, LeaseTerms};
use super::types::{EnqueueRequest, Job, JobKind, JobLease, JobStats, JobStatus, WriteBack};

/// Outcome of claiming one specific job.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// Now `processing` under a new lease.
    Claimed(Job),
    /// Already `done` or `failed` (including a lease that just expired on its final attempt).
    Terminal(Job),
    /// Someone holds a live lease.
    InFlight(Job),
    /// `pending` with `next_run_at` in the future.
    NotDue(Job),
    NotFound,
}

/// Durable job storage; the single source of truth for job state.
///
/// Every claim is one short committed transaction. Write-backs are
/// compare-and-swap on the [`JobLease`] and report [`WriteBack::Superseded`]
/// instead of overwriting a newer claim.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Create a job, or return the id of the live job sharing its dedup key.
    async fn enqueue(&self, request: &EnqueueRequest, now: DateTime<Utc>) -> Result<JobId, JobStoreError>;

    /// Get a job by id, scoped to its owner.
    async fn get(&self, owner_id: OwnerId, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    async fn find_by_session(&self, owner_id: OwnerId, session_ref: &SessionRef) -> Result<Option<Job>, JobStoreError>;

    /// Period job with the latest `period_end` for this owner.
    async fn find_latest_by_period(&self, owner_id: OwnerId) -> Result<Option<Job>, JobStoreError>;

    /// Lock one job and claim it if the claim rules allow.
    async fn claim_by_id(
        &self,
        job_id: JobId,
        force: bool,
        terms: &LeaseTerms,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome, JobStoreError>;

    /// Claim the oldest eligible job, skipping rows other claimers hold locked.
    async fn claim_next(&self, terms: &LeaseTerms, now: DateTime<Utc>) -> Result<Option<Job>, JobStoreError>;

    /// `processing → done`.
    async fn complete(
        &self,
        lease: JobLease,
        result: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<WriteBack, JobStoreError>;

    /// `processing → pending`, due again at `next_run_at`.
    async fn reschedule(
        &self,
        lease: JobLease,
        error: &str,
        next_run_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<WriteBack, JobStoreError>;

    /// `processing → failed`.
    async fn fail(&self, lease: JobLease, error: &str, now: DateTime<Utc>) -> Result<WriteBack, JobStoreError>;

    /// Record a delivered notification on a `done` job.
    async fn record_notification(
        &self,
        job_id: JobId,
        reference: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<WriteBack, JobStoreError>;

    /// Get job statistics.
    async fn stats(&self) -> Result<JobStats, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("corrupt job row: {0}")]
    Decode(String),
}

/// In-memory job store for tests/dev.
///
/// A single write lock stands in for row locking: claims are atomic and two
/// claimers can never receive the same job.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of stored rows.
    pub fn len(&self) -> usize {
        self.jobs.read().map(|jobs| jobs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Overwrite a stored row. Test hook for simulating crashed claimants.
    pub fn put(&self, job: Job) -> Result<(), JobStoreError> {
        self.write()?.insert(job.id, job);
        Ok(())
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<JobId, Job>>, JobStoreError> {
        self.jobs
            .write()
            .map_err(|_| JobStoreError::Storage("job map lock poisoned".to_string()))
    }

    fn read_with<T>(&self, f: impl FnOnce(&HashMap<JobId, Job>) -> T) -> Result<T, JobStoreError> {
        let jobs = self
            .jobs
            .read()
            .map_err(|_| JobStoreError::Storage("job map lock poisoned".to_string()))?;
        Ok(f(&jobs))
    }

    fn write_back(
        &self,
        lease: JobLease,
        apply: impl FnOnce(&mut Job),
    ) -> Result<WriteBack, JobStoreError> {
        let mut jobs = self.write()?;
        let Some(job) = jobs.get_mut(&lease.job_id) else {
            return Ok(WriteBack::Superseded);
        };
        if job.status != JobStatus::Processing || job.attempts != lease.attempts {
            return Ok(WriteBack::Superseded);
        }
        apply(job);
        Ok(WriteBack::Applied)
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, request: &EnqueueRequest, now: DateTime<Utc>) -> Result<JobId, JobStoreError> {
        let mut jobs = self.write()?;

        let existing = jobs.values_mut().find(|job| match (&job.kind, &request.kind) {
            (JobKind::Session { session_ref: a }, JobKind::Session { session_ref: b }) => a == b,
            (JobKind::Period { period_end: a, .. }, JobKind::Period { period_end: b, .. }) => {
                job.owner_id == request.owner_id && a == b
            }
            _ => false,
        });

        if let Some(job) = existing {
            if matches!(job.kind, JobKind::Session { .. }) {
                job.updated_at = now;
            }
            return Ok(job.id);
        }

        let job = Job::new(request.owner_id, request.kind.clone(), now);
        let id = job.id;
        jobs.insert(id, job);
        Ok(id)
    }

    async fn get(&self, owner_id: OwnerId, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        self.read_with(|jobs| jobs.get(&job_id).filter(|job| job.owner_id == owner_id).cloned())
    }

    async fn find_by_session(&self, owner_id: OwnerId, session_ref: &SessionRef) -> Result<Option<Job>, JobStoreError> {
        self.read_with(|jobs| {
            jobs.values()
                .find(|job| job.owner_id == owner_id && job.kind.session_ref() == Some(session_ref))
                .cloned()
        })
    }

    async fn find_latest_by_period(&self, owner_id: OwnerId) -> Result<Option<Job>, JobStoreError> {
        self.read_with(|jobs| {
            jobs.values()
                .filter(|job| job.owner_id == owner_id)
                .filter_map(|job| job.kind.period_end().map(|end| (end, job)))
                .max_by_key(|(end, job)| (*end, job.created_at))
                .map(|(_, job)| job.clone())
        })
    }

    async fn claim_by_id(
        &self,
        job_id: JobId,
        force: bool,
        terms: &LeaseTerms,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome, JobStoreError> {
        let mut jobs = self.write()?;
        let Some(job) = jobs.get_mut(&job_id) else {
            return Ok(ClaimOutcome::NotFound);
        };

        Ok(match claim::decide(job, force, terms, now) {
            ClaimDecision::Claim => {
                claim::apply_claim(job, terms, now);
                ClaimOutcome::Claimed(job.clone())
            }
            ClaimDecision::Expire => {
                claim::apply_expire(job, now);
                ClaimOutcome::Terminal(job.clone())
            }
            ClaimDecision::Terminal => ClaimOutcome::Terminal(job.clone()),
            ClaimDecision::InFlight => ClaimOutcome::InFlight(job.clone()),
            ClaimDecision::NotDue => ClaimOutcome::NotDue(job.clone()),
        })
    }

    async fn claim_next(&self, terms: &LeaseTerms, now: DateTime<Utc>) -> Result<Option<Job>, JobStoreError> {
        let mut jobs = self.write()?;

        for job in jobs.values_mut() {
            if job.status == JobStatus::Processing && claim::decide(job, false, terms, now) == ClaimDecision::Expire {
                claim::apply_expire(job, now);
            }
        }

        let next = jobs
            .values_mut()
            .filter(|job| claim::is_eligible_for_poll(job, terms, now))
            .min_by_key(|job| (job.created_at, job.id));

        Ok(next.map(|job| {
            claim::apply_claim(job, terms, now);
            job.clone()
        }))
    }

    async fn complete(
        &self,
        lease: JobLease,
        result: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<WriteBack, JobStoreError> {
        self.write_back(lease, |job| {
            job.status = JobStatus::Done;
            job.result = Some(result.clone());
            job.last_error = None;
            job.updated_at = now;
            job.completed_at = Some(now);
        })
    }

    async fn reschedule(
        &self,
        lease: JobLease,
        error: &str,
        next_run_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<WriteBack, JobStoreError> {
        self.write_back(lease, |job| {
            job.status = JobStatus::Pending;
            job.next_run_at = next_run_at;
            job.last_error = Some(error.to_string());
            job.updated_at = now;
        })
    }

    async fn fail(&self, lease: JobLease, error: &str, now: DateTime<Utc>) -> Result<WriteBack, JobStoreError> {
        self.write_back(lease, |job| {
            job.status = JobStatus::Failed;
            job.last_error = Some(error.to_string());
            job.updated_at = now;
            job.completed_at = Some(now);
        })
    }

    async fn record_notification(
        &self,
        job_id: JobId,
        reference: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<WriteBack, JobStoreError> {
        let mut jobs = self.write()?;
        let Some(job) = jobs.get_mut(&job_id) else {
            return Ok(WriteBack::Superseded);
        };
        if job.status != JobStatus::Done {
            return Ok(WriteBack::Superseded);
        }
        job.notification_sent = true;
        job.notification_ref = reference.map(str::to_string);
        job.updated_at = now;
        Ok(WriteBack::Applied)
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        self.read_with(|jobs| {
            let mut stats = JobStats::default();
            for job in jobs.values() {
                stats.count(job.status);
            }
            stats
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::collections::HashSet;
    use std::time::Duration;

    fn terms() -> LeaseTerms {
        LeaseTerms {
            stale_after: Duration::from_secs(600),
            max_attempts: 3,
        }
    }

    fn session(owner: OwnerId, r: &str) -> EnqueueRequest {
        EnqueueRequest::session(owner, SessionRef::parse(r).unwrap())
    }

    fn week(owner: OwnerId) -> EnqueueRequest {
        EnqueueRequest::period(owner, None, NaiveDate::from_ymd_opt(2024, 1, 7).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn enqueue_then_get_is_pending_and_due() {
        let store = InMemoryJobStore::new();
        let owner = OwnerId::new();
        let now = Utc::now();
        let id = store.enqueue(&session(owner, "s1"), now).await.unwrap();

        let job = store.get(owner, id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);
        assert!(job.next_run_at <= now);
    }

    #[tokio::test]
    async fn get_is_owner_scoped() {
        let store = InMemoryJobStore::new();
        let id = store.enqueue(&session(OwnerId::new(), "s1"), Utc::now()).await.unwrap();
        assert!(store.get(OwnerId::new(), id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn session_enqueue_is_idempotent_and_only_touches_updated_at() {
        let store = InMemoryJobStore::new();
        let owner = OwnerId::new();
        let t0 = Utc::now();
        let id = store.enqueue(&session(owner, "s1"), t0).await.unwrap();
        let claimed = store.claim_next(&terms(), t0).await.unwrap().unwrap();
        assert_eq!(claimed.id, id);

        let t1 = t0 + chrono::Duration::seconds(5);
        let again = store.enqueue(&session(owner, "s1"), t1).await.unwrap();
        assert_eq!(again, id);

        let job = store.get(owner, id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.updated_at, t1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn period_enqueue_dedupes_per_owner() {
        let store = InMemoryJobStore::new();
        let owner = OwnerId::new();
        let now = Utc::now();
        let a = store.enqueue(&week(owner), now).await.unwrap();
        let b = store.enqueue(&week(owner), now).await.unwrap();
        let other = store.enqueue(&week(OwnerId::new()), now).await.unwrap();
        assert_eq!(a, b);
        assert_ne!(a, other);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn claim_next_is_fifo_and_skips_not_due() {
        let store = InMemoryJobStore::new();
        let owner = OwnerId::new();
        let t0 = Utc::now();
        let first = store.enqueue(&session(owner, "a"), t0).await.unwrap();
        let second = store.enqueue(&session(owner, "b"), t0 + chrono::Duration::seconds(1)).await.unwrap();

        let now = t0 + chrono::Duration::seconds(2);
        assert_eq!(store.claim_next(&terms(), now).await.unwrap().unwrap().id, first);
        assert_eq!(store.claim_next(&terms(), now).await.unwrap().unwrap().id, second);
        assert!(store.claim_next(&terms(), now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn live_lease_is_never_returned_by_claim_next() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        store.enqueue(&session(OwnerId::new(), "a"), now).await.unwrap();
        store.claim_next(&terms(), now).await.unwrap().unwrap();

        let later = now + chrono::Duration::seconds(599);
        assert!(store.claim_next(&terms(), later).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stale_lease_is_reclaimed_with_attempt_increment() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let id = store.enqueue(&session(OwnerId::new(), "a"), now).await.unwrap();
        let first = store.claim_next(&terms(), now).await.unwrap().unwrap();

        let later = now + chrono::Duration::seconds(601);
        let reclaimed = store.claim_next(&terms(), later).await.unwrap().unwrap();
        assert_eq!(reclaimed.id, id);
        assert_eq!(reclaimed.attempts, 2);

        let stale_write = store.complete(first.lease(), &serde_json::json!({}), later).await.unwrap();
        assert_eq!(stale_write, WriteBack::Superseded);
        let fresh_write = store.complete(reclaimed.lease(), &serde_json::json!({"ok": true}), later).await.unwrap();
        assert_eq!(fresh_write, WriteBack::Applied);
    }

    #[tokio::test]
    async fn stale_lease_on_last_attempt_is_expired_not_reclaimed() {
        let store = InMemoryJobStore::new();
        let owner = OwnerId::new();
        let now = Utc::now();
        let id = store.enqueue(&session(owner, "a"), now).await.unwrap();
        let mut job = store.get(owner, id).await.unwrap().unwrap();
        job.status = JobStatus::Processing;
        job.attempts = 3;
        store.put(job).unwrap();

        let later = now + chrono::Duration::hours(1);
        assert!(store.claim_next(&terms(), later).await.unwrap().is_none());
        let job = store.get(owner, id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 3);
    }

    #[tokio::test]
    async fn claim_by_id_reports_each_state() {
        let store = InMemoryJobStore::new();
        let owner = OwnerId::new();
        let now = Utc::now();
        let id = store.enqueue(&session(owner, "a"), now).await.unwrap();

        assert!(matches!(
            store.claim_by_id(JobId::new(), true, &terms(), now).await.unwrap(),
            ClaimOutcome::NotFound
        ));

        let claimed = match store.claim_by_id(id, false, &terms(), now).await.unwrap() {
            ClaimOutcome::Claimed(job) => job,
            other => panic!("expected claim, got {other:?}"),
        };
        assert!(matches!(
            store.claim_by_id(id, true, &terms(), now).await.unwrap(),
            ClaimOutcome::InFlight(_)
        ));

        let retry_at = now + chrono::Duration::seconds(30);
        store.reschedule(claimed.lease(), "boom", retry_at, now).await.unwrap();
        assert!(matches!(
            store.claim_by_id(id, false, &terms(), now).await.unwrap(),
            ClaimOutcome::NotDue(_)
        ));

        let forced = match store.claim_by_id(id, true, &terms(), now).await.unwrap() {
            ClaimOutcome::Claimed(job) => job,
            other => panic!("expected forced claim, got {other:?}"),
        };
        assert_eq!(forced.attempts, 2);
        store.complete(forced.lease(), &serde_json::json!({"x": 1}), now).await.unwrap();

        match store.claim_by_id(id, true, &terms(), now).await.unwrap() {
            ClaimOutcome::Terminal(job) => assert_eq!(job.status, JobStatus::Done),
            other => panic!("expected terminal, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn notification_is_recorded_only_on_done_jobs() {
        let store = InMemoryJobStore::new();
        let owner = OwnerId::new();
        let now = Utc::now();
        let id = store.enqueue(&session(owner, "a"), now).await.unwrap();
        assert_eq!(store.record_notification(id, Some("m1"), now).await.unwrap(), WriteBack::Superseded);

        let job = store.claim_next(&terms(), now).await.unwrap().unwrap();
        store.complete(job.lease(), &serde_json::json!({}), now).await.unwrap();
        assert_eq!(store.record_notification(id, Some("m1"), now).await.unwrap(), WriteBack::Applied);

        let job = store.get(owner, id).await.unwrap().unwrap();
        assert!(job.notification_sent);
        assert_eq!(job.notification_ref.as_deref(), Some("m1"));
    }

    #[tokio::test]
    async fn latest_period_lookup_picks_latest_end() {
        let store = InMemoryJobStore::new();
        let owner = OwnerId::new();
        let now = Utc::now();
        let d = |day| NaiveDate::from_ymd_opt(2024, 1, day).unwrap();
        store.enqueue(&EnqueueRequest::period(owner, None, d(14)).unwrap(), now).await.unwrap();
        store.enqueue(&EnqueueRequest::period(owner, None, d(7)).unwrap(), now).await.unwrap();
        store.enqueue(&session(owner, "s"), now).await.unwrap();

        let latest = store.find_latest_by_period(owner).await.unwrap().unwrap();
        assert_eq!(latest.kind.period_end(), Some(d(14)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claimers_never_share_a_job() {
        let store = InMemoryJobStore::arc();
        let owner = OwnerId::new();
        let now = Utc::now();
        for i in 0..50 {
            store.enqueue(&session(owner, &format!("s{i}")), now).await.unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let mut mine = Vec::new();
                while let Some(job) = store.claim_next(&terms(), now).await.unwrap() {
                    mine.push(job.id);
                }
                mine
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.await.unwrap() {
                assert!(seen.insert(id), "job {id} claimed twice");
            }
        }
        assert_eq!(seen.len(), 50);
        assert_eq!(store.stats().await.unwrap().processing, 50);
    }
}

//! Caller-facing API: enqueue, lookups, and synchronous processing.

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, instrument};

use coachq_core::{JobId, OwnerId, SessionRef};

use super::claim::LeaseTerms;
use super::executor::{Executor, JobOutcome};
use super::store::{ClaimOutcome, JobStore, JobStoreError};
use super::types::{EnqueueError, EnqueueRequest, JobSnapshot, JobStats};

#[derive(Debug, Clone, Error)]
pub enum JobServiceError {
    #[error(transparent)]
    InvalidRequest(#[from] EnqueueError),
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

/// Result of [`JobService::process_job`].
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    /// Claimed and executed inline.
    Executed(JobOutcome),
    AlreadyTerminal(JobSnapshot),
    /// Another claimant holds a live lease.
    InFlight(JobSnapshot),
    /// Not reachable with a forced claim; kept so the mapping stays total.
    NotDue(JobSnapshot),
}

/// Facade over the store and executor for request-path callers.
#[derive(Clone)]
pub struct JobService {
    store: Arc<dyn JobStore>,
    executor: Arc<Executor>,
    terms: LeaseTerms,
}

impl JobService {
    pub fn new(executor: Arc<Executor>, terms: LeaseTerms) -> Self {
        Self {
            store: executor.store().clone(),
            executor,
            terms,
        }
    }

    /// Create the job, or return the id of the one already sharing its dedup key.
    #[instrument(skip_all, fields(owner_id = %request.owner_id, kind = %request.kind.tag()), err)]
    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<JobId, JobServiceError> {
        let id = self.store.enqueue(&request, self.executor.clock().now()).await?;
        info!(job_id = %id, "job enqueued");
        Ok(id)
    }

    /// Owner-scoped lookup; another owner's job reads as not found.
    pub async fn get_job(&self, owner_id: OwnerId, job_id: JobId) -> Result<JobSnapshot, JobServiceError> {
        self.store
            .get(owner_id, job_id)
            .await?
            .map(|job| job.snapshot())
            .ok_or(JobServiceError::NotFound(job_id))
    }

    pub async fn get_by_session(
        &self,
        owner_id: OwnerId,
        session_ref: &SessionRef,
    ) -> Result<Option<JobSnapshot>, JobServiceError> {
        Ok(self
            .store
            .find_by_session(owner_id, session_ref)
            .await?
            .map(|job| job.snapshot()))
    }

    pub async fn get_latest_by_period(&self, owner_id: OwnerId) -> Result<Option<JobSnapshot>, JobServiceError> {
        Ok(self
            .store
            .find_latest_by_period(owner_id)
            .await?
            .map(|job| job.snapshot()))
    }

    /// Force-claim a job and execute it inline.
    #[instrument(skip_all, fields(job_id = %job_id), err)]
    pub async fn process_job(&self, job_id: JobId) -> Result<ProcessOutcome, JobServiceError> {
        if !self.executor.is_ready() {
            return Err(JobServiceError::Configuration(
                "generator is not configured".to_string(),
            ));
        }

        let now = self.executor.clock().now();
        match self.store.claim_by_id(job_id, true, &self.terms, now).await? {
            ClaimOutcome::Claimed(job) => Ok(ProcessOutcome::Executed(self.executor.execute(job).await)),
            ClaimOutcome::Terminal(job) => Ok(ProcessOutcome::AlreadyTerminal(job.snapshot())),
            ClaimOutcome::InFlight(job) => Ok(ProcessOutcome::InFlight(job.snapshot())),
            ClaimOutcome::NotDue(job) => Ok(ProcessOutcome::NotDue(job.snapshot())),
            ClaimOutcome::NotFound => Err(JobServiceError::NotFound(job_id)),
        }
    }

    pub async fn stats(&self) -> Result<JobStats, JobServiceError> {
        Ok(self.store.stats().await?)
    }
}

//! Job executor: runs the kind-specific pipeline for a claimed job and records
//! the outcome through the retry policy.
//!
//! Every per-job failure is converted into a status transition here; nothing
//! escapes to the worker loop.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use coachq_ai::{AiError, FeedbackGenerator};
use coachq_core::JobId;

use crate::context::{ContextError, ContextProvider};
use crate::notify::{Notifier, OutboundMessage};

use super::clock::{Clock, SystemClock};
use super::pipelines::PipelineOutput;
use super::retry::{RetryDecision, RetryPolicy};
use super::store::JobStore;
use super::types::{Job, JobKind, JobLease, WriteBack};

/// Executor tuning, taken from configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorSettings {
    /// Bound on a single generation call, independent of the lease.
    pub generation_timeout: Duration,
    /// Activities a period needs before feedback is generated for it.
    pub min_period_sessions: usize,
    /// Fail precondition errors immediately instead of retrying them.
    pub precondition_is_terminal: bool,
    /// Days of history before a session included as context.
    pub recent_activity_days: u64,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            generation_timeout: Duration::from_secs(60),
            min_period_sessions: 2,
            precondition_is_terminal: false,
            recent_activity_days: 7,
        }
    }
}

/// Why a pipeline run failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecutionError {
    /// A collaborator credential is missing.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The job refers to data that is missing or insufficient.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// A collaborator call failed or timed out.
    #[error("collaborator error: {0}")]
    Collaborator(String),

    /// The generator's output could not be repaired.
    #[error("validation error: {0}")]
    Validation(String),
}

impl ExecutionError {
    pub fn kind(&self) -> &'static str {
        match self {
            ExecutionError::Configuration(_) => "configuration",
            ExecutionError::Precondition(_) => "precondition",
            ExecutionError::Collaborator(_) => "collaborator",
            ExecutionError::Validation(_) => "validation",
        }
    }
}

impl From<ContextError> for ExecutionError {
    fn from(err: ContextError) -> Self {
        ExecutionError::Collaborator(err.to_string())
    }
}

impl From<AiError> for ExecutionError {
    fn from(err: AiError) -> Self {
        match err {
            AiError::NotConfigured(_) => ExecutionError::Configuration(err.to_string()),
            AiError::InvalidInput(_) => ExecutionError::Precondition(err.to_string()),
            AiError::InferenceFailed(_) => ExecutionError::Collaborator(err.to_string()),
            AiError::MalformedOutput(_) => ExecutionError::Validation(err.to_string()),
        }
    }
}

/// What happened to a claimed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// `done`; `notified` is whether a notification was delivered and recorded.
    Completed { job_id: JobId, attempts: u32, notified: bool },
    /// Back to `pending` until `next_run_at`.
    Retrying {
        job_id: JobId,
        attempts: u32,
        next_run_at: DateTime<Utc>,
        error: String,
    },
    /// `failed` (terminal).
    Failed { job_id: JobId, attempts: u32, error: String },
    /// The lease was lost to a reclaim; the result was discarded.
    Superseded { job_id: JobId },
    /// The outcome could not be written; the lease will expire and the job be reclaimed.
    Unrecorded { job_id: JobId, error: String },
}

impl JobOutcome {
    pub fn job_id(&self) -> JobId {
        match self {
            JobOutcome::Completed { job_id, .. }
            | JobOutcome::Retrying { job_id, .. }
            | JobOutcome::Failed { job_id, .. }
            | JobOutcome::Superseded { job_id }
            | JobOutcome::Unrecorded { job_id, .. } => *job_id,
        }
    }
}

/// Runs claimed jobs.
pub struct Executor {
    pub(super) store: Arc<dyn JobStore>,
    pub(super) context: Arc<dyn ContextProvider>,
    pub(super) generator: Arc<dyn FeedbackGenerator>,
    notifier: Option<Arc<dyn Notifier>>,
    retry: RetryPolicy,
    pub(super) settings: ExecutorSettings,
    pub(super) clock: Arc<dyn Clock>,
}

impl Executor {
    pub fn new(
        store: Arc<dyn JobStore>,
        context: Arc<dyn ContextProvider>,
        generator: Arc<dyn FeedbackGenerator>,
        retry: RetryPolicy,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            store,
            context,
            generator,
            notifier: None,
            retry,
            settings,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Whether the generator can be called at all.
    pub fn is_ready(&self) -> bool {
        self.generator.is_configured()
    }

    /// Execute a job previously claimed from the store.
    #[instrument(skip_all, fields(job_id = %job.id, kind = %job.kind.tag(), attempts = job.attempts))]
    pub async fn execute(&self, job: Job) -> JobOutcome {
        let lease = job.lease();
        match self.run_pipeline(&job).await {
            Ok(output) => self.finish(&job, lease, output).await,
            Err(err) => self.handle_failure(&job, lease, err).await,
        }
    }

    async fn run_pipeline(&self, job: &Job) -> Result<PipelineOutput, ExecutionError> {
        if !self.generator.is_configured() {
            return Err(ExecutionError::Configuration(format!(
                "generator {} has no credentials",
                self.generator.name()
            )));
        }
        match &job.kind {
            JobKind::Session { session_ref } => self.session_pipeline(job, session_ref).await,
            JobKind::Period {
                period_start,
                period_end,
            } => self.period_pipeline(job, *period_start, *period_end).await,
        }
    }

    async fn finish(&self, job: &Job, lease: JobLease, output: PipelineOutput) -> JobOutcome {
        let now = self.clock.now();
        match self.store.complete(lease, &output.result, now).await {
            Ok(WriteBack::Applied) => {
                info!(job_id = %job.id, owner_id = %job.owner_id, attempts = job.attempts, "job completed");
                let notified = match output.notification {
                    Some(message) => self.notify(job, &message).await,
                    None => {
                        debug!(job_id = %job.id, "no messaging destination; skipping notification");
                        false
                    }
                };
                JobOutcome::Completed {
                    job_id: job.id,
                    attempts: job.attempts,
                    notified,
                }
            }
            Ok(WriteBack::Superseded) => {
                warn!(job_id = %job.id, attempts = job.attempts, "lease superseded; discarding result");
                JobOutcome::Superseded { job_id: job.id }
            }
            Err(e) => {
                error!(job_id = %job.id, error = %e, "failed to record job result");
                JobOutcome::Unrecorded {
                    job_id: job.id,
                    error: e.to_string(),
                }
            }
        }
    }

    /// Best effort. Returns whether delivery was acknowledged and recorded.
    async fn notify(&self, job: &Job, message: &OutboundMessage) -> bool {
        let Some(notifier) = &self.notifier else {
            return false;
        };

        let delivery = match notifier.send(message).await {
            Ok(delivery) => delivery,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "notification failed");
                return false;
            }
        };

        match self
            .store
            .record_notification(job.id, delivery.reference.as_deref(), self.clock.now())
            .await
        {
            Ok(WriteBack::Applied) => true,
            Ok(WriteBack::Superseded) => false,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "notification sent but not recorded");
                false
            }
        }
    }

    async fn handle_failure(&self, job: &Job, lease: JobLease, err: ExecutionError) -> JobOutcome {
        let now = self.clock.now();
        let message = err.to_string();

        // The attempt was spent at claim time, so every kind goes through the
        // policy; a pending row at the attempt limit could never be claimed again.
        let decision = match &err {
            ExecutionError::Precondition(_) if self.settings.precondition_is_terminal => RetryDecision::Exhausted,
            _ => self.retry.decide(job.attempts),
        };

        let written = match decision {
            RetryDecision::Retry { delay } => {
                let next_run_at = add_delay(now, delay);
                let written = self.store.reschedule(lease, &message, next_run_at, now).await;
                if matches!(written, Ok(WriteBack::Applied)) {
                    warn!(
                        job_id = %job.id,
                        attempts = job.attempts,
                        error_kind = err.kind(),
                        error = %err,
                        %next_run_at,
                        "job failed; retry scheduled"
                    );
                }
                written.map(|w| {
                    (
                        w,
                        JobOutcome::Retrying {
                            job_id: job.id,
                            attempts: job.attempts,
                            next_run_at,
                            error: message.clone(),
                        },
                    )
                })
            }
            RetryDecision::Exhausted => {
                let written = self.store.fail(lease, &message, now).await;
                if matches!(written, Ok(WriteBack::Applied)) {
                    error!(
                        job_id = %job.id,
                        attempts = job.attempts,
                        error_kind = err.kind(),
                        error = %err,
                        "job failed permanently"
                    );
                }
                written.map(|w| {
                    (
                        w,
                        JobOutcome::Failed {
                            job_id: job.id,
                            attempts: job.attempts,
                            error: message.clone(),
                        },
                    )
                })
            }
        };

        match written {
            Ok((WriteBack::Applied, outcome)) => outcome,
            Ok((WriteBack::Superseded, _)) => {
                warn!(job_id = %job.id, attempts = job.attempts, error = %err, "lease superseded; failure not recorded");
                JobOutcome::Superseded { job_id: job.id }
            }
            Err(e) => {
                error!(job_id = %job.id, error = %e, "failed to record job failure");
                JobOutcome::Unrecorded {
                    job_id: job.id,
                    error: e.to_string(),
                }
            }
        }
    }
}

fn add_delay(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn ai_errors_map_onto_execution_kinds() {
        let cases = [
            (AiError::NotConfigured("no key".into()), "configuration"),
            (AiError::InvalidInput("empty context".into()), "precondition"),
            (AiError::InferenceFailed("503".into()), "collaborator"),
            (AiError::malformed("not json"), "validation"),
        ];
        for (err, kind) in cases {
            assert_eq!(ExecutionError::from(err).kind(), kind);
        }
    }

    #[test]
    fn context_errors_are_collaborator_failures() {
        let err = ExecutionError::from(ContextError::Unavailable("pool timed out".into()));
        assert!(matches!(err, ExecutionError::Collaborator(msg) if msg.contains("pool timed out")));
    }

    #[test]
    fn add_delay_saturates_instead_of_overflowing() {
        let now = Utc.with_ymd_and_hms(2024, 1, 8, 6, 0, 0).unwrap();
        assert_eq!(add_delay(now, Duration::from_secs(30)), now + chrono::Duration::seconds(30));
        assert_eq!(add_delay(now, Duration::MAX), DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn outcome_reports_its_job() {
        let job_id = JobId::new();
        let outcome = JobOutcome::Failed {
            job_id,
            attempts: 3,
            error: "boom".to_string(),
        };
        assert_eq!(outcome.job_id(), job_id);
    }
}

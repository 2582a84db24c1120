//! Background worker loop.
//!
//! Sleeps `interval ± jitter`, then claims and executes up to `batch_size` jobs,
//! stopping early when nothing is eligible. Workers hold no queue state, so any
//! number of them can poll the same store.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::claim::LeaseTerms;
use super::executor::{Executor, JobOutcome};

/// Worker loop configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSettings {
    /// Name for logging
    pub name: String,
    /// Base sleep between ticks
    pub interval: Duration,
    /// Symmetric jitter applied to `interval`, in percent (0-100)
    pub jitter_pct: u8,
    /// Max jobs claimed per tick
    pub batch_size: usize,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            name: "coach-worker".to_string(),
            interval: Duration::from_secs(15),
            jitter_pct: 20,
            batch_size: 5,
        }
    }
}

impl WorkerSettings {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// `base` scaled by a uniform factor in `[1 - pct, 1 + pct]`.
pub fn jittered_interval<R: Rng + ?Sized>(base: Duration, jitter_pct: u8, rng: &mut R) -> Duration {
    let spread = f64::from(jitter_pct.min(100)) / 100.0;
    if spread == 0.0 {
        return base;
    }
    let factor = 1.0 + rng.gen_range(-spread..=spread);
    Duration::try_from_secs_f64(base.as_secs_f64() * factor).unwrap_or(base)
}

fn saturating_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    /// The generator was unconfigured, so nothing was claimed.
    pub skipped: bool,
    pub claimed: usize,
    pub completed: usize,
    pub retried: usize,
    pub failed: usize,
    pub superseded: usize,
    pub unrecorded: usize,
    /// The claim step itself failed (e.g. store unavailable).
    pub claim_error: bool,
}

impl TickReport {
    fn record(&mut self, outcome: &JobOutcome) {
        match outcome {
            JobOutcome::Completed { .. } => self.completed += 1,
            JobOutcome::Retrying { .. } => self.retried += 1,
            JobOutcome::Failed { .. } => self.failed += 1,
            JobOutcome::Superseded { .. } => self.superseded += 1,
            JobOutcome::Unrecorded { .. } => self.unrecorded += 1,
        }
    }
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub ticks: u64,
    pub skipped_ticks: u64,
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_retried: u64,
    pub jobs_failed: u64,
    pub claim_errors: u64,
}

impl WorkerStats {
    fn absorb(&mut self, report: &TickReport) {
        self.ticks += 1;
        if report.skipped {
            self.skipped_ticks += 1;
        }
        self.jobs_processed += report.claimed as u64;
        self.jobs_succeeded += report.completed as u64;
        self.jobs_retried += report.retried as u64;
        self.jobs_failed += report.failed as u64;
        if report.claim_error {
            self.claim_errors += 1;
        }
    }
}

/// Handle to control a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: CancellationToken,
    join: JoinHandle<()>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerHandle {
    /// Request graceful shutdown. A tick in progress runs to completion.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.join.await {
            error!(error = %e, "worker task ended abnormally");
        }
    }

    /// Get current worker statistics.
    pub fn stats(&self) -> WorkerStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

pub struct Worker {
    executor: Arc<Executor>,
    terms: LeaseTerms,
    settings: WorkerSettings,
    stats: Arc<Mutex<WorkerStats>>,
}

impl Worker {
    pub fn new(executor: Arc<Executor>, terms: LeaseTerms, settings: WorkerSettings) -> Self {
        Self {
            executor,
            terms,
            settings,
            stats: Arc::new(Mutex::new(WorkerStats::default())),
        }
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Claim and execute up to `batch_size` jobs.
    pub async fn tick(&self) -> TickReport {
        let mut report = TickReport::default();
        let name = self.settings.name.as_str();

        if !self.executor.is_ready() {
            debug!(worker = name, "generator not configured; skipping tick");
            report.skipped = true;
            self.absorb(&report);
            return report;
        }

        for _ in 0..self.settings.batch_size {
            let now = self.executor.clock().now();
            let job = match self.executor.store().claim_next(&self.terms, now).await {
                Ok(Some(job)) => job,
                Ok(None) => break,
                Err(e) => {
                    error!(worker = name, error = %e, "failed to claim job");
                    report.claim_error = true;
                    break;
                }
            };

            report.claimed += 1;
            let job_id = job.id;
            debug!(worker = name, job_id = %job_id, kind = %job.kind.tag(), attempts = job.attempts, "claimed job");

            // Run on its own task so a panicking pipeline cannot take the loop down.
            let executor = self.executor.clone();
            match tokio::spawn(async move { executor.execute(job).await }).await {
                Ok(outcome) => report.record(&outcome),
                Err(e) => {
                    error!(worker = name, job_id = %job_id, error = %e, "job execution aborted");
                    report.unrecorded += 1;
                }
            }
        }

        debug!(
            worker = name,
            claimed = report.claimed,
            completed = report.completed,
            retried = report.retried,
            failed = report.failed,
            "tick finished"
        );
        self.absorb(&report);
        report
    }

    fn absorb(&self, report: &TickReport) {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).absorb(report);
    }

    /// Run until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            worker = %self.settings.name,
            interval_ms = saturating_millis(self.settings.interval),
            batch_size = self.settings.batch_size,
            "coach worker started"
        );

        loop {
            let delay = {
                let mut rng = rand::thread_rng();
                jittered_interval(self.settings.interval, self.settings.jitter_pct, &mut rng)
            };
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            self.tick().await;
        }

        info!(worker = %self.settings.name, "coach worker stopped");
    }

    /// Spawn the loop on the current tokio runtime.
    pub fn spawn(self) -> WorkerHandle {
        let shutdown = CancellationToken::new();
        let stats = self.stats.clone();
        let token = shutdown.clone();
        let join = tokio::spawn(async move { self.run(token).await });
        WorkerHandle { shutdown, join, stats }
    }
}

//! Durable coach job queue.
//!
//! ## Design
//!
//! - The store is the single source of truth; there is no in-process queue
//! - Idempotent enqueue keyed on the job's dedup key
//! - Claims are short committed transactions using skip-locked row locks
//! - Leases expire after a configured staleness window and can be reclaimed
//! - Write-backs are compare-and-swap on `(status, attempts)`
//! - Exponential backoff with a ceiling; exhaustion is terminal
//!
//! ## Components
//!
//! - `Job`: row model, status machine, and caller snapshot
//! - `JobStore`: persistence (in-memory or Postgres)
//! - `Executor`: kind-specific pipelines and outcome recording
//! - `Worker`: jittered polling loop
//! - `JobService`: request-path API

pub mod claim;
pub mod clock;
pub mod executor;
pub mod pipelines;
pub mod postgres;
pub mod retry;
pub mod service;
pub mod store;
pub mod types;
pub mod worker;

pub use claim::{ClaimDecision, LeaseTerms};
pub use clock::{Clock, ManualClock, SystemClock};
pub use executor::{ExecutionError, Executor, ExecutorSettings, JobOutcome};
pub use pipelines::PipelineOutput;
pub use postgres::PostgresJobStore;
pub use retry::{RetryDecision, RetryPolicy};
pub use service::{JobService, JobServiceError, ProcessOutcome};
pub use store::{ClaimOutcome, InMemoryJobStore, JobStore, JobStoreError};
pub use types::{
    EnqueueError, EnqueueRequest, Job, JobKind, JobKindTag, JobLease, JobSnapshot, JobStats, JobStatus, WriteBack,
};
pub use worker::{TickReport, Worker, WorkerHandle, WorkerSettings, WorkerStats};

//! Claim rules shared by every [`JobStore`](super::JobStore) implementation.
//!
//! A store locks the candidate row, asks [`decide`] what to do with it, applies
//! the transition, and commits, all before any execution starts.

use std::time::Duration;

use chrono::{DateTime, Utc};

use super::types::{Job, JobStatus};

/// Last error recorded on a job whose final lease ran out.
pub const LEASE_EXPIRED_ERROR: &str = "lease expired after final attempt";

/// Lease parameters, taken from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseTerms {
    /// A `processing` row untouched for this long may be reclaimed.
    pub stale_after: Duration,
    pub max_attempts: u32,
}

impl LeaseTerms {
    /// Rows with `updated_at` strictly before this instant hold a stale lease.
    pub fn stale_before(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let stale_after = chrono::Duration::from_std(self.stale_after).unwrap_or(chrono::Duration::MAX);
        now.checked_sub_signed(stale_after).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    pub fn is_stale(&self, job: &Job, now: DateTime<Utc>) -> bool {
        job.status == JobStatus::Processing && job.updated_at < self.stale_before(now)
    }
}

/// What a claimer should do with a locked row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimDecision {
    /// Move to `processing` and bump `attempts`.
    Claim,
    /// Out of attempts with nobody holding it; move to `failed`.
    Expire,
    /// Already `done` or `failed`.
    Terminal,
    /// `processing` under a live lease.
    InFlight,
    /// `pending` but `next_run_at` is in the future.
    NotDue,
}

pub fn decide(job: &Job, force: bool, terms: &LeaseTerms, now: DateTime<Utc>) -> ClaimDecision {
    match job.status {
        JobStatus::Done | JobStatus::Failed => ClaimDecision::Terminal,
        JobStatus::Processing if !terms.is_stale(job, now) => ClaimDecision::InFlight,
        JobStatus::Processing => claim_or_expire(job, terms),
        JobStatus::Pending if job.next_run_at > now && !force => ClaimDecision::NotDue,
        JobStatus::Pending => claim_or_expire(job, terms),
    }
}

fn claim_or_expire(job: &Job, terms: &LeaseTerms) -> ClaimDecision {
    if job.attempts >= terms.max_attempts {
        ClaimDecision::Expire
    } else {
        ClaimDecision::Claim
    }
}

/// Whether a background poller may pick this row up right now.
pub fn is_eligible_for_poll(job: &Job, terms: &LeaseTerms, now: DateTime<Utc>) -> bool {
    decide(job, false, terms, now) == ClaimDecision::Claim
}

/// Apply [`ClaimDecision::Claim`] to an in-memory row.
pub fn apply_claim(job: &mut Job, terms: &LeaseTerms, now: DateTime<Utc>) {
    job.status = JobStatus::Processing;
    job.attempts = (job.attempts + 1).min(terms.max_attempts);
    job.updated_at = now;
}

/// Apply [`ClaimDecision::Expire`] to an in-memory row.
pub fn apply_expire(job: &mut Job, now: DateTime<Utc>) {
    job.status = JobStatus::Failed;
    job.last_error = Some(LEASE_EXPIRED_ERROR.to_string());
    job.updated_at = now;
    job.completed_at = Some(now);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::JobKind;
    use chrono::NaiveDate;
    use coachq_core::OwnerId;

    fn terms() -> LeaseTerms {
        LeaseTerms {
            stale_after: Duration::from_secs(600),
            max_attempts: 3,
        }
    }

    fn job(now: DateTime<Utc>) -> Job {
        let end = NaiveDate::from_ymd_opt(2024, 1, 7).unwrap();
        Job::new(OwnerId::new(), JobKind::Period { period_start: None, period_end: end }, now)
    }

    #[test]
    fn terminal_rows_are_never_claimed() {
        let now = Utc::now();
        for status in [JobStatus::Done, JobStatus::Failed] {
            let mut j = job(now);
            j.status = status;
            assert_eq!(decide(&j, true, &terms(), now), ClaimDecision::Terminal);
        }
    }

    #[test]
    fn live_lease_is_in_flight_even_when_forced() {
        let now = Utc::now();
        let mut j = job(now);
        j.status = JobStatus::Processing;
        j.attempts = 1;
        j.updated_at = now - chrono::Duration::seconds(599);
        assert_eq!(decide(&j, true, &terms(), now), ClaimDecision::InFlight);
    }

    #[test]
    fn stale_lease_is_reclaimable() {
        let now = Utc::now();
        let mut j = job(now);
        j.status = JobStatus::Processing;
        j.attempts = 1;
        j.updated_at = now - chrono::Duration::seconds(601);
        assert_eq!(decide(&j, false, &terms(), now), ClaimDecision::Claim);
        assert!(is_eligible_for_poll(&j, &terms(), now));
    }

    #[test]
    fn stale_lease_on_final_attempt_expires() {
        let now = Utc::now();
        let mut j = job(now);
        j.status = JobStatus::Processing;
        j.attempts = 3;
        j.updated_at = now - chrono::Duration::hours(1);
        assert_eq!(decide(&j, false, &terms(), now), ClaimDecision::Expire);
        assert!(!is_eligible_for_poll(&j, &terms(), now));

        apply_expire(&mut j, now);
        assert_eq!(j.status, JobStatus::Failed);
        assert_eq!(j.last_error.as_deref(), Some(LEASE_EXPIRED_ERROR));
        assert_eq!(j.completed_at, Some(now));
    }

    #[test]
    fn future_pending_is_not_due_unless_forced() {
        let now = Utc::now();
        let mut j = job(now);
        j.next_run_at = now + chrono::Duration::seconds(30);
        assert_eq!(decide(&j, false, &terms(), now), ClaimDecision::NotDue);
        assert_eq!(decide(&j, true, &terms(), now), ClaimDecision::Claim);
    }

    #[test]
    fn claim_bumps_attempts_and_refreshes_lease() {
        let now = Utc::now();
        let mut j = job(now - chrono::Duration::minutes(5));
        apply_claim(&mut j, &terms(), now);
        assert_eq!(j.status, JobStatus::Processing);
        assert_eq!(j.attempts, 1);
        assert_eq!(j.updated_at, now);
    }

    #[test]
    fn huge_stale_window_does_not_overflow() {
        let terms = LeaseTerms {
            stale_after: Duration::from_secs(u64::MAX),
            max_attempts: 3,
        };
        let now = Utc::now();
        assert_eq!(terms.stale_before(now), DateTime::<Utc>::MIN_UTC);
    }
}

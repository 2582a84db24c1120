//! Read-only context the job pipelines gather before calling the generator.
//!
//! The scheduler treats snapshot contents as opaque JSON; only the keys it
//! needs for routing (owner, session, dates, messaging destination) are typed.

pub mod postgres;

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use coachq_core::{OwnerId, SessionRef};

pub use postgres::PostgresContextProvider;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileSnapshot {
    pub owner_id: OwnerId,
    /// Where notifications go (e.g. a chat id). `None` disables notification.
    pub messaging_destination: Option<String>,
    pub attributes: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivitySnapshot {
    pub session_ref: SessionRef,
    pub owner_id: OwnerId,
    pub performed_on: NaiveDate,
    pub attributes: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckInSnapshot {
    pub owner_id: OwnerId,
    pub recorded_at: DateTime<Utc>,
    pub attributes: JsonValue,
}

#[derive(Debug, Clone, Error)]
pub enum ContextError {
    #[error("context source unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt context record: {0}")]
    Decode(String),
}

/// Read-only queries keyed by owner/session. "Not found" is `Ok(None)`, not an error.
#[async_trait]
pub trait ContextProvider: Send + Sync {
    async fn profile(&self, owner_id: OwnerId) -> Result<Option<ProfileSnapshot>, ContextError>;

    async fn session(&self, owner_id: OwnerId, session_ref: &SessionRef) -> Result<Option<ActivitySnapshot>, ContextError>;

    /// Activity with `start <= performed_on <= end`, oldest first.
    async fn activity_between(
        &self,
        owner_id: OwnerId,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<ActivitySnapshot>, ContextError>;

    async fn latest_check_in(&self, owner_id: OwnerId) -> Result<Option<CheckInSnapshot>, ContextError>;
}

/// In-memory context for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryContextProvider {
    profiles: RwLock<HashMap<OwnerId, ProfileSnapshot>>,
    activities: RwLock<Vec<ActivitySnapshot>>,
    check_ins: RwLock<Vec<CheckInSnapshot>>,
}

impl InMemoryContextProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_profile(&self, profile: ProfileSnapshot) {
        if let Ok(mut profiles) = self.profiles.write() {
            profiles.insert(profile.owner_id, profile);
        }
    }

    pub fn put_activity(&self, activity: ActivitySnapshot) {
        if let Ok(mut activities) = self.activities.write() {
            activities.push(activity);
        }
    }

    pub fn put_check_in(&self, check_in: CheckInSnapshot) {
        if let Ok(mut check_ins) = self.check_ins.write() {
            check_ins.push(check_in);
        }
    }
}

fn poisoned() -> ContextError {
    ContextError::Unavailable("context lock poisoned".to_string())
}

#[async_trait]
impl ContextProvider for InMemoryContextProvider {
    async fn profile(&self, owner_id: OwnerId) -> Result<Option<ProfileSnapshot>, ContextError> {
        let profiles = self.profiles.read().map_err(|_| poisoned())?;
        Ok(profiles.get(&owner_id).cloned())
    }

    async fn session(&self, owner_id: OwnerId, session_ref: &SessionRef) -> Result<Option<ActivitySnapshot>, ContextError> {
        let activities = self.activities.read().map_err(|_| poisoned())?;
        Ok(activities
            .iter()
            .find(|a| a.owner_id == owner_id && &a.session_ref == session_ref)
            .cloned())
    }

    async fn activity_between(
        &self,
        owner_id: OwnerId,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<ActivitySnapshot>, ContextError> {
        let activities = self.activities.read().map_err(|_| poisoned())?;
        let mut found: Vec<_> = activities
            .iter()
            .filter(|a| a.owner_id == owner_id && a.performed_on >= start && a.performed_on <= end)
            .cloned()
            .collect();
        found.sort_by_key(|a| a.performed_on);
        Ok(found)
    }

    async fn latest_check_in(&self, owner_id: OwnerId) -> Result<Option<CheckInSnapshot>, ContextError> {
        let check_ins = self.check_ins.read().map_err(|_| poisoned())?;
        Ok(check_ins
            .iter()
            .filter(|c| c.owner_id == owner_id)
            .max_by_key(|c| c.recorded_at)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn activity(owner: OwnerId, r: &str, day: u32) -> ActivitySnapshot {
        ActivitySnapshot {
            session_ref: SessionRef::parse(r).unwrap(),
            owner_id: owner,
            performed_on: NaiveDate::from_ymd_opt(2024, 1, day).unwrap(),
            attributes: json!({}),
        }
    }

    #[tokio::test]
    async fn activity_window_is_inclusive_and_owner_scoped() {
        let ctx = InMemoryContextProvider::new();
        let owner = OwnerId::new();
        ctx.put_activity(activity(owner, "a", 7));
        ctx.put_activity(activity(owner, "b", 1));
        ctx.put_activity(activity(owner, "c", 8));
        ctx.put_activity(activity(OwnerId::new(), "d", 3));

        let d = |day| NaiveDate::from_ymd_opt(2024, 1, day).unwrap();
        let found = ctx.activity_between(owner, d(1), d(7)).await.unwrap();
        let refs: Vec<_> = found.iter().map(|a| a.session_ref.as_str()).collect();
        assert_eq!(refs, vec!["b", "a"]);
    }

    #[tokio::test]
    async fn latest_check_in_wins() {
        let ctx = InMemoryContextProvider::new();
        let owner = OwnerId::new();
        let now = Utc::now();
        ctx.put_check_in(CheckInSnapshot { owner_id: owner, recorded_at: now, attributes: json!({"mood": "ok"}) });
        ctx.put_check_in(CheckInSnapshot {
            owner_id: owner,
            recorded_at: now - chrono::Duration::days(1),
            attributes: json!({"mood": "tired"}),
        });
        let latest = ctx.latest_check_in(owner).await.unwrap().unwrap();
        assert_eq!(latest.attributes["mood"], "ok");
        assert!(ctx.latest_check_in(OwnerId::new()).await.unwrap().is_none());
    }
}

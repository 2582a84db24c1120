//! Context provider reading the application's profile, activity, and check-in tables.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::instrument;

use coachq_core::{OwnerId, SessionRef};

use super::{ActivitySnapshot, CheckInSnapshot, ContextError, ContextProvider, ProfileSnapshot};

const SCHEMA: &str = include_str!("../../migrations/0002_coach_context.sql");

#[derive(Debug, Clone)]
pub struct PostgresContextProvider {
    pool: Arc<PgPool>,
}

impl PostgresContextProvider {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the context tables if missing. Deployments that own these tables elsewhere can skip this.
    pub async fn migrate(&self) -> Result<(), ContextError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> ContextError {
    match err {
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::ColumnNotFound(_) => {
            ContextError::Decode(format!("{} in {}", err, operation))
        }
        _ => ContextError::Unavailable(format!("sqlx error in {}: {}", operation, err)),
    }
}

fn decode_activity(row: &PgRow) -> Result<ActivitySnapshot, ContextError> {
    let session_ref: String = row.try_get("session_ref").map_err(|e| map_sqlx_error("decode_activity", e))?;
    let owner_id: uuid::Uuid = row.try_get("owner_id").map_err(|e| map_sqlx_error("decode_activity", e))?;
    Ok(ActivitySnapshot {
        session_ref: SessionRef::parse(session_ref).map_err(|e| ContextError::Decode(e.to_string()))?,
        owner_id: OwnerId::from_uuid(owner_id),
        performed_on: row.try_get("performed_on").map_err(|e| map_sqlx_error("decode_activity", e))?,
        attributes: row.try_get("attributes").map_err(|e| map_sqlx_error("decode_activity", e))?,
    })
}

#[async_trait]
impl ContextProvider for PostgresContextProvider {
    #[instrument(skip_all, fields(owner_id = %owner_id), err)]
    async fn profile(&self, owner_id: OwnerId) -> Result<Option<ProfileSnapshot>, ContextError> {
        let row = sqlx::query("SELECT messaging_destination, attributes FROM coach_profiles WHERE owner_id = $1")
            .bind(*owner_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("profile", e))?;

        row.map(|row| -> Result<ProfileSnapshot, ContextError> {
            Ok(ProfileSnapshot {
                owner_id,
                messaging_destination: row
                    .try_get("messaging_destination")
                    .map_err(|e| map_sqlx_error("profile", e))?,
                attributes: row.try_get("attributes").map_err(|e| map_sqlx_error("profile", e))?,
            })
        })
        .transpose()
    }

    #[instrument(skip_all, fields(owner_id = %owner_id, session_ref = %session_ref), err)]
    async fn session(&self, owner_id: OwnerId, session_ref: &SessionRef) -> Result<Option<ActivitySnapshot>, ContextError> {
        let row = sqlx::query(
            "SELECT session_ref, owner_id, performed_on, attributes FROM coach_activities \
             WHERE owner_id = $1 AND session_ref = $2",
        )
        .bind(*owner_id.as_uuid())
        .bind(session_ref.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("session", e))?;

        row.as_ref().map(decode_activity).transpose()
    }

    #[instrument(skip_all, fields(owner_id = %owner_id, start = %start, end = %end), err)]
    async fn activity_between(
        &self,
        owner_id: OwnerId,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<ActivitySnapshot>, ContextError> {
        let rows = sqlx::query(
            "SELECT session_ref, owner_id, performed_on, attributes FROM coach_activities \
             WHERE owner_id = $1 AND performed_on BETWEEN $2 AND $3 \
             ORDER BY performed_on ASC",
        )
        .bind(*owner_id.as_uuid())
        .bind(start)
        .bind(end)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("activity_between", e))?;

        rows.iter().map(decode_activity).collect()
    }

    #[instrument(skip_all, fields(owner_id = %owner_id), err)]
    async fn latest_check_in(&self, owner_id: OwnerId) -> Result<Option<CheckInSnapshot>, ContextError> {
        let row = sqlx::query(
            "SELECT recorded_at, attributes FROM coach_check_ins \
             WHERE owner_id = $1 ORDER BY recorded_at DESC LIMIT 1",
        )
        .bind(*owner_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("latest_check_in", e))?;

        row.map(|row| -> Result<CheckInSnapshot, ContextError> {
            Ok(CheckInSnapshot {
                owner_id,
                recorded_at: row.try_get("recorded_at").map_err(|e| map_sqlx_error("latest_check_in", e))?,
                attributes: row.try_get("attributes").map_err(|e| map_sqlx_error("latest_check_in", e))?,
            })
        })
        .transpose()
    }
}

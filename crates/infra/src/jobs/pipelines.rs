//! The two feedback pipelines. [`Executor::run_pipeline`](super::Executor) is
//! the only dispatch point; adding a [`JobKind`](super::JobKind) variant fails
//! to compile until it has a pipeline here.

use chrono::{Days, NaiveDate};
use serde_json::{Value as JsonValue, json};

use coachq_ai::{
    FeedbackTask, GenerationRequest, GenerationResponse, PeriodFeedback, SessionFeedback, validate_period_feedback,
    validate_session_feedback,
};
use coachq_core::SessionRef;

use crate::context::{ActivitySnapshot, CheckInSnapshot, ProfileSnapshot};
use crate::notify::OutboundMessage;

use super::executor::{ExecutionError, Executor};
use super::types::Job;

/// What a successful pipeline hands back to the executor.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOutput {
    /// Stored verbatim as the job's `result`.
    pub result: JsonValue,
    pub notification: Option<OutboundMessage>,
}

impl Executor {
    pub(super) async fn session_pipeline(
        &self,
        job: &Job,
        session_ref: &SessionRef,
    ) -> Result<PipelineOutput, ExecutionError> {
        let profile = self.require_profile(job).await?;
        let session = self
            .context
            .session(job.owner_id, session_ref)
            .await?
            .ok_or_else(|| ExecutionError::Precondition(format!("session {session_ref} not found")))?;

        let window_start = session
            .performed_on
            .checked_sub_days(Days::new(self.settings.recent_activity_days))
            .unwrap_or(NaiveDate::MIN);
        let recent: Vec<_> = self
            .context
            .activity_between(job.owner_id, window_start, session.performed_on)
            .await?
            .into_iter()
            .filter(|a| &a.session_ref != session_ref)
            .collect();
        let check_in = self.context.latest_check_in(job.owner_id).await?;

        let request = GenerationRequest::new(
            FeedbackTask::Session,
            json!({
                "profile": profile.attributes,
                "session": activity_json(&session),
                "recent_activity": recent.iter().map(activity_json).collect::<Vec<_>>(),
                "check_in": check_in.as_ref().map(check_in_json),
            }),
            SessionFeedback::response_shape(),
        );
        let response = self.generate(&request).await?;
        let feedback = validate_session_feedback(&response.fields)?;

        let notification = notification_for(
            &profile,
            format!("{}\n\n{}", feedback.headline, feedback.summary),
            format!("session:{session_ref}"),
        );
        let result = self.result_document(&response, &feedback, json!({ "session_ref": session_ref }))?;
        Ok(PipelineOutput { result, notification })
    }

    pub(super) async fn period_pipeline(
        &self,
        job: &Job,
        period_start: Option<NaiveDate>,
        period_end: NaiveDate,
    ) -> Result<PipelineOutput, ExecutionError> {
        let start = period_start.unwrap_or_else(|| default_period_start(period_end));
        let profile = self.require_profile(job).await?;

        let activity = self.context.activity_between(job.owner_id, start, period_end).await?;
        if activity.len() < self.settings.min_period_sessions {
            return Err(ExecutionError::Precondition(format!(
                "{} session(s) between {start} and {period_end}; need at least {}",
                activity.len(),
                self.settings.min_period_sessions
            )));
        }
        let check_in = self.context.latest_check_in(job.owner_id).await?;

        let request = GenerationRequest::new(
            FeedbackTask::Period,
            json!({
                "profile": profile.attributes,
                "period": { "start": start, "end": period_end },
                "activity": activity.iter().map(activity_json).collect::<Vec<_>>(),
                "check_in": check_in.as_ref().map(check_in_json),
            }),
            PeriodFeedback::response_shape(),
        );
        let response = self.generate(&request).await?;
        let feedback: PeriodFeedback = validate_period_feedback(&response.fields)?;

        let notification = notification_for(
            &profile,
            format!("{}\n\n{}", feedback.headline, feedback.summary),
            format!("period:{period_end}"),
        );
        let result = self.result_document(
            &response,
            &feedback,
            json!({ "period_start": start, "period_end": period_end, "sessions": activity.len() }),
        )?;
        Ok(PipelineOutput { result, notification })
    }

    async fn require_profile(&self, job: &Job) -> Result<ProfileSnapshot, ExecutionError> {
        self.context
            .profile(job.owner_id)
            .await?
            .ok_or_else(|| ExecutionError::Precondition(format!("no profile for owner {}", job.owner_id)))
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse, ExecutionError> {
        let timeout = self.settings.generation_timeout;
        match tokio::time::timeout(timeout, self.generator.generate(request)).await {
            Ok(response) => Ok(response?),
            Err(_) => Err(ExecutionError::Collaborator(format!(
                "generation timed out after {}ms",
                timeout.as_millis()
            ))),
        }
    }

    fn result_document(
        &self,
        response: &GenerationResponse,
        feedback: &impl serde::Serialize,
        subject: JsonValue,
    ) -> Result<JsonValue, ExecutionError> {
        let feedback = serde_json::to_value(feedback)
            .map_err(|e| ExecutionError::Validation(format!("feedback not serializable: {e}")))?;
        Ok(json!({
            "feedback": feedback,
            "subject": subject,
            "generated_by": self.generator.name(),
            "model": response.model,
            "generated_at": self.clock.now(),
        }))
    }
}

/// A week ending on `period_end`.
pub fn default_period_start(period_end: NaiveDate) -> NaiveDate {
    period_end.checked_sub_days(Days::new(6)).unwrap_or(period_end)
}

fn notification_for(profile: &ProfileSnapshot, text: String, action_ref: String) -> Option<OutboundMessage> {
    profile
        .messaging_destination
        .as_ref()
        .filter(|d| !d.trim().is_empty())
        .map(|destination| OutboundMessage {
            destination: destination.clone(),
            text,
            action_ref: Some(action_ref),
        })
}

fn activity_json(activity: &ActivitySnapshot) -> JsonValue {
    json!({
        "session_ref": activity.session_ref,
        "performed_on": activity.performed_on,
        "details": activity.attributes,
    })
}

fn check_in_json(check_in: &CheckInSnapshot) -> JsonValue {
    json!({
        "recorded_at": check_in.recorded_at,
        "details": check_in.attributes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_period_is_a_week_ending_on_end() {
        let end = NaiveDate::from_ymd_opt(2024, 1, 7).unwrap();
        assert_eq!(default_period_start(end), NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
    }

    #[test]
    fn blank_destination_means_no_notification() {
        let profile = ProfileSnapshot {
            owner_id: coachq_core::OwnerId::new(),
            messaging_destination: Some("  ".to_string()),
            attributes: json!({}),
        };
        assert!(notification_for(&profile, "t".into(), "a".into()).is_none());
    }
}

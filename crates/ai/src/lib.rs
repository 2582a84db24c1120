//! `coachq-ai`
//!
//! **Responsibility:** boundary to the remote feedback-generation service.
//!
//! This crate is intentionally **not** part of the scheduler:
//! - It knows nothing about job rows, leases, or retries.
//! - It turns a structured context into validated feedback documents.
//! - Every failure is reported as an [`AiError`]; callers decide whether to retry.

pub mod feedback;
pub mod generator;
pub mod openai;
pub mod result;
pub mod scripted;

pub use feedback::{PeriodFeedback, SessionFeedback, validate_period_feedback, validate_session_feedback};
pub use generator::{FeedbackGenerator, FeedbackTask, GenerationRequest, GenerationResponse};
pub use openai::{OpenAiCompatibleGenerator, OpenAiSettings};
pub use result::AiError;
pub use scripted::ScriptedGenerator;

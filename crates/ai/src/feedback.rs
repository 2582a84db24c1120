//! Feedback documents and the validation/repair applied to generator output.
//!
//! Generators are treated as untrusted: strings are trimmed and length-capped,
//! list items that are not non-blank strings are dropped, a bare string where a
//! list was expected is wrapped, and lists over their bound are truncated.
//! Output is rejected only when a required field is still empty afterwards.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue, json};

use crate::result::AiError;

pub const MAX_HIGHLIGHTS: usize = 5;
pub const MAX_WINS: usize = 5;
pub const MAX_FOCUS_AREAS: usize = 3;
pub const MAX_TEXT_CHARS: usize = 1200;

/// Feedback on one completed session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionFeedback {
    pub headline: String,
    pub summary: String,
    pub highlights: Vec<String>,
    pub next_focus: String,
}

impl SessionFeedback {
    /// Shape the generator is asked to answer with.
    pub fn response_shape() -> JsonValue {
        json!({
            "headline": "string, required",
            "summary": "string, required",
            "highlights": format!("array of 1-{MAX_HIGHLIGHTS} strings"),
            "next_focus": "string, required",
        })
    }
}

/// Summary feedback over a period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodFeedback {
    pub headline: String,
    pub summary: String,
    pub wins: Vec<String>,
    pub focus_areas: Vec<String>,
}

impl PeriodFeedback {
    pub fn response_shape() -> JsonValue {
        json!({
            "headline": "string, required",
            "summary": "string, required",
            "wins": format!("array of 0-{MAX_WINS} strings"),
            "focus_areas": format!("array of 1-{MAX_FOCUS_AREAS} strings"),
        })
    }
}

pub fn validate_session_feedback(fields: &JsonValue) -> Result<SessionFeedback, AiError> {
    let obj = as_object(fields)?;
    Ok(SessionFeedback {
        headline: required_text(obj, "headline")?,
        summary: required_text(obj, "summary")?,
        highlights: required_list(obj, "highlights", MAX_HIGHLIGHTS)?,
        next_focus: required_text(obj, "next_focus")?,
    })
}

pub fn validate_period_feedback(fields: &JsonValue) -> Result<PeriodFeedback, AiError> {
    let obj = as_object(fields)?;
    Ok(PeriodFeedback {
        headline: required_text(obj, "headline")?,
        summary: required_text(obj, "summary")?,
        wins: text_list(obj, "wins", MAX_WINS),
        focus_areas: required_list(obj, "focus_areas", MAX_FOCUS_AREAS)?,
    })
}

fn as_object(fields: &JsonValue) -> Result<&Map<String, JsonValue>, AiError> {
    fields
        .as_object()
        .ok_or_else(|| AiError::malformed(format!("expected a JSON object, got {}", kind_of(fields))))
}

fn required_text(obj: &Map<String, JsonValue>, key: &str) -> Result<String, AiError> {
    obj.get(key)
        .and_then(clean_text)
        .ok_or_else(|| AiError::malformed(format!("`{key}` is missing or empty")))
}

fn required_list(obj: &Map<String, JsonValue>, key: &str, max: usize) -> Result<Vec<String>, AiError> {
    let items = text_list(obj, key, max);
    if items.is_empty() {
        return Err(AiError::malformed(format!("`{key}` has no usable items")));
    }
    Ok(items)
}

fn text_list(obj: &Map<String, JsonValue>, key: &str, max: usize) -> Vec<String> {
    match obj.get(key) {
        Some(JsonValue::Array(items)) => items.iter().filter_map(clean_text).take(max).collect(),
        Some(single @ JsonValue::String(_)) => clean_text(single).into_iter().collect(),
        _ => Vec::new(),
    }
}

fn clean_text(value: &JsonValue) -> Option<String> {
    let text = value.as_str()?.trim();
    if text.is_empty() {
        return None;
    }
    Some(text.chars().take(MAX_TEXT_CHARS).collect())
}

fn kind_of(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn well_formed_session_feedback_passes_through() {
        let fields = json!({
            "headline": "Strong finish",
            "summary": "Pace held through the last interval.",
            "highlights": ["negative split", "steady cadence"],
            "next_focus": "Longer warm-up",
        });
        let feedback = validate_session_feedback(&fields).unwrap();
        assert_eq!(feedback.headline, "Strong finish");
        assert_eq!(feedback.highlights.len(), 2);
    }

    #[test]
    fn session_feedback_is_repaired() {
        let fields = json!({
            "headline": "  Good work  ",
            "summary": "Solid.",
            "highlights": ["a", "", 7, "b", "c", "d", "e", "f", "g"],
            "next_focus": "Rest",
        });
        let feedback = validate_session_feedback(&fields).unwrap();
        assert_eq!(feedback.headline, "Good work");
        assert_eq!(feedback.highlights, vec!["a", "b", "c", "d", "e"]);
    }

    #[test]
    fn bare_string_is_wrapped_into_list() {
        let fields = json!({
            "headline": "h",
            "summary": "s",
            "highlights": "only one",
            "next_focus": "n",
        });
        let feedback = validate_session_feedback(&fields).unwrap();
        assert_eq!(feedback.highlights, vec!["only one"]);
    }

    #[test]
    fn missing_required_field_is_rejected() {
        let fields = json!({ "headline": "h", "summary": "   ", "highlights": ["x"], "next_focus": "n" });
        let err = validate_session_feedback(&fields).unwrap_err();
        assert!(matches!(err, AiError::MalformedOutput(msg) if msg.contains("summary")));
    }

    #[test]
    fn non_object_output_is_rejected() {
        let err = validate_period_feedback(&json!(["nope"])).unwrap_err();
        assert_eq!(err, AiError::malformed("expected a JSON object, got an array"));
    }

    #[test]
    fn period_feedback_allows_no_wins_but_needs_focus() {
        let ok = json!({ "headline": "h", "summary": "s", "focus_areas": ["sleep", "mobility", "volume", "extra"] });
        let feedback = validate_period_feedback(&ok).unwrap();
        assert!(feedback.wins.is_empty());
        assert_eq!(feedback.focus_areas.len(), MAX_FOCUS_AREAS);

        let missing = json!({ "headline": "h", "summary": "s", "wins": ["w"], "focus_areas": [] });
        assert!(validate_period_feedback(&missing).is_err());
    }

    #[test]
    fn overlong_text_is_capped() {
        let long = "x".repeat(MAX_TEXT_CHARS + 50);
        let fields = json!({ "headline": long, "summary": "s", "highlights": ["x"], "next_focus": "n" });
        let feedback = validate_session_feedback(&fields).unwrap();
        assert_eq!(feedback.headline.chars().count(), MAX_TEXT_CHARS);
    }
}

//! Blob key layout and identifier hygiene.
//!
//! Every asset the pipeline touches lives under a deterministic key derived
//! from the project slug and floor id. Both segments come from external input,
//! so each helper validates them before splicing them into a key.

use chrono::{DateTime, SecondsFormat, Utc};

use crate::errors::EngineError;

/// Validates a single path/key segment.
///
/// Accepts ASCII alphanumerics, `_`, and `-` only; anything that could change
/// the key structure (slashes, `..`, whitespace, unicode) is rejected.
pub fn safe_id<'a>(name: &str, value: &'a str) -> Result<&'a str, EngineError> {
    if value.is_empty() {
        return Err(EngineError::input_validation(format!(
            "{name} must be a non-empty string"
        )));
    }
    if value.contains('/') || value.contains('\\') || value.contains("..") {
        return Err(EngineError::input_validation(format!(
            "{name} contains path separators"
        )));
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(EngineError::input_validation(format!(
            "{name} contains unsupported characters: {value}"
        )));
    }
    Ok(value)
}

/// Key of the live legacy editor-state JSON for a floor.
pub fn editor_latest_path(project_slug: &str, floor_id: &str) -> Result<String, EngineError> {
    let slug = safe_id("projectSlug", project_slug)?;
    let floor = safe_id("floorId", floor_id)?;
    Ok(format!("projects/{slug}/editor/{floor}/latest.json"))
}

/// Key of a timestamped history copy of the legacy editor state.
pub fn editor_history_path(
    project_slug: &str,
    floor_id: &str,
    at: DateTime<Utc>,
) -> Result<String, EngineError> {
    let slug = safe_id("projectSlug", project_slug)?;
    let floor = safe_id("floorId", floor_id)?;
    Ok(format!(
        "projects/{slug}/editor/{floor}/history/{}.json",
        filename_stamp(at)
    ))
}

/// Key where the verbatim inference response for a floor is persisted.
pub fn raw_inference_path(project_slug: &str, floor_id: &str) -> Result<String, EngineError> {
    let slug = safe_id("projectSlug", project_slug)?;
    let floor = safe_id("floorId", floor_id)?;
    Ok(format!("projects/{slug}/inference/{floor}/score.raw.json"))
}

/// Prefix under which raw inference outputs for a whole run are grouped.
pub fn raw_outputs_prefix(project_slug: &str) -> Result<String, EngineError> {
    let slug = safe_id("projectSlug", project_slug)?;
    Ok(format!("projects/{slug}/inference/"))
}

/// ISO-8601 timestamp flattened into a filename-safe form.
///
/// `:` and `.` become `-`, e.g. `2026-08-22T10-30-00-000Z`.
#[must_use]
pub fn filename_stamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
        .replace([':', '.'], "-")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_safe_id_accepts_plain_identifiers() {
        assert_eq!(safe_id("slug", "lakeside-tower_2").ok(), Some("lakeside-tower_2"));
    }

    #[test]
    fn test_safe_id_rejects_traversal() {
        assert!(safe_id("slug", "").is_err());
        assert!(safe_id("slug", "a/b").is_err());
        assert!(safe_id("slug", "a\\b").is_err());
        assert!(safe_id("slug", "..").is_err());
        assert!(safe_id("slug", "floor 1").is_err());
        assert!(safe_id("slug", "floor#1").is_err());
    }

    #[test]
    fn test_key_layout() {
        assert_eq!(
            editor_latest_path("tower", "f1").ok().as_deref(),
            Some("projects/tower/editor/f1/latest.json")
        );
        assert_eq!(
            raw_inference_path("tower", "f1").ok().as_deref(),
            Some("projects/tower/inference/f1/score.raw.json")
        );
        assert_eq!(
            raw_outputs_prefix("tower").ok().as_deref(),
            Some("projects/tower/inference/")
        );
    }

    #[test]
    fn test_history_path_uses_flattened_stamp() {
        let at = Utc.with_ymd_and_hms(2026, 3, 5, 10, 30, 0).single().unwrap();
        let key = editor_history_path("tower", "f1", at).unwrap();
        assert_eq!(key, "projects/tower/editor/f1/history/2026-03-05T10-30-00-000Z.json");
    }

    #[test]
    fn test_invalid_segment_rejected_everywhere() {
        assert!(editor_latest_path("tower", "../f1").is_err());
        assert!(raw_inference_path("to/wer", "f1").is_err());
    }
}

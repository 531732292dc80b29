//! Durable step history, the backbone of resumable execution.
//!
//! Every side-effecting step of a run appends one record here. On resume the
//! engine replays the records in order instead of re-executing the steps, so
//! external effects happen at most once per recorded success.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Outcome class a history record captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StepStatus {
    /// The step finished; the payload is its serialized result.
    Completed,
    /// An attempt failed with a retryable error; the payload carries the
    /// error text and the backoff that was scheduled after it.
    TransientFailure,
}

/// One recorded step execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    /// Position in the run's history, starting at 0.
    pub index: u64,
    /// Step name; replay verifies it against the step being executed.
    pub name: String,
    /// What the record captures.
    pub status: StepStatus,
    /// Result (Completed) or failure details (TransientFailure).
    pub payload: Value,
    /// When the record was written.
    pub recorded_at: DateTime<Utc>,
}

impl StepRecord {
    /// Record for a step that ran to completion.
    #[must_use]
    pub fn completed(index: u64, name: impl Into<String>, payload: Value, at: DateTime<Utc>) -> Self {
        Self {
            index,
            name: name.into(),
            status: StepStatus::Completed,
            payload,
            recorded_at: at,
        }
    }

    /// Record for a retryable attempt failure and its scheduled backoff.
    #[must_use]
    pub fn transient_failure(
        index: u64,
        name: impl Into<String>,
        error: &str,
        delay: Duration,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            index,
            name: name.into(),
            status: StepStatus::TransientFailure,
            payload: json!({
                "error": error,
                "delayMs": u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            }),
            recorded_at: at,
        }
    }

    /// Backoff stored on a transient-failure record.
    #[must_use]
    pub fn recorded_delay(&self) -> Option<Duration> {
        self.payload
            .get("delayMs")
            .and_then(Value::as_u64)
            .map(Duration::from_millis)
    }

    /// Error text stored on a transient-failure record.
    #[must_use]
    pub fn recorded_error(&self) -> Option<&str> {
        self.payload.get("error").and_then(Value::as_str)
    }
}

//! Error types for the inferflow engine.
//!
//! Two taxonomies live here: [`InferenceError`] describes a single failed call
//! to the external detection service (and carries the status information the
//! retry classifier needs), while [`EngineError`] is the crate-wide error for
//! everything the orchestration, guard, and merge paths can raise.

use std::time::Duration;
use thiserror::Error;

/// The main error type for engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Input failed validation before any work started. Never retried.
    #[error("invalid input: {0}")]
    InputValidation(String),

    /// A referenced record does not exist. Never retried.
    #[error("not found: {0}")]
    NotFound(String),

    /// A conditional write lost to a concurrent writer of the same document.
    #[error("version conflict on document '{document_id}'")]
    VersionConflict {
        /// The contended document.
        document_id: String,
    },

    /// The merge loop ran out of attempts under sustained contention.
    #[error("merge gave up on document '{document_id}' after {attempts} attempts")]
    ConcurrencyExhausted {
        /// The contended document.
        document_id: String,
        /// How many read-merge-write rounds were tried.
        attempts: u32,
    },

    /// A create targeted an id that already exists.
    #[error("record already exists: {0}")]
    ConflictOnCreate(String),

    /// A single call to the inference service failed.
    #[error("inference call failed: {0}")]
    Inference(#[from] InferenceError),

    /// The durable retry budget for an inference call ran out.
    #[error(
        "inference retries exhausted after {attempts} attempts ({elapsed:?} cumulative backoff): {last_error}"
    )]
    RetryExhausted {
        /// Attempts made, including the first.
        attempts: u32,
        /// Total backoff delay accumulated across the attempts.
        elapsed: Duration,
        /// Rendered form of the final failure.
        last_error: String,
    },

    /// A storage backend failed in a way the engine cannot interpret.
    #[error("storage error: {0}")]
    Storage(String),

    /// A durable payload could not be serialized or deserialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Recorded step history disagrees with the code being replayed.
    #[error("replay mismatch at step {index}: history recorded '{recorded}', engine executed '{executed}'")]
    ReplayMismatch {
        /// Position in the step history.
        index: u64,
        /// Step name the history holds at that position.
        recorded: String,
        /// Step name the engine tried to run.
        executed: String,
    },
}

impl EngineError {
    /// Creates an input-validation error.
    #[must_use]
    pub fn input_validation(message: impl Into<String>) -> Self {
        Self::InputValidation(message.into())
    }

    /// Creates a not-found error for the given record description.
    #[must_use]
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Creates a storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    /// HTTP-style status for surfacing through a trigger layer.
    #[must_use]
    pub const fn http_status(&self) -> u16 {
        match self {
            Self::InputValidation(_) => 400,
            Self::NotFound(_) => 404,
            Self::VersionConflict { .. } | Self::ConflictOnCreate(_) => 409,
            Self::Inference(_) => 502,
            Self::ConcurrencyExhausted { .. } | Self::RetryExhausted { .. } => 503,
            Self::Storage(_) | Self::Serialization(_) | Self::ReplayMismatch { .. } => 500,
        }
    }
}

/// Failure modes of a single inference service call.
///
/// `Clone` so scripted test clients can replay canned failures and so the
/// engine can stash the final error text when a retry budget runs out.
#[derive(Debug, Clone, Error)]
pub enum InferenceError {
    /// The request exceeded its deadline.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The connection could not be established or was dropped mid-flight.
    #[error("connection failed: {message}")]
    Connect {
        /// Transport-level detail.
        message: String,
    },

    /// The service answered with a non-success HTTP status.
    #[error("service returned status {status}: {message}")]
    Http {
        /// The HTTP status code.
        status: u16,
        /// Response body snippet or status text.
        message: String,
    },

    /// The response body was not the JSON the contract promises.
    #[error("response could not be decoded: {message}")]
    Decode {
        /// Parser detail.
        message: String,
    },
}

impl InferenceError {
    /// Creates a connection failure.
    #[must_use]
    pub fn connect(message: impl Into<String>) -> Self {
        Self::Connect {
            message: message.into(),
        }
    }

    /// Creates an HTTP-status failure.
    #[must_use]
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::Http {
            status,
            message: message.into(),
        }
    }

    /// Creates a decode failure.
    #[must_use]
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    /// The HTTP status carried by the failure, when one exists.
    #[must_use]
    pub const fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(EngineError::input_validation("x").http_status(), 400);
        assert_eq!(EngineError::not_found("run").http_status(), 404);
        assert_eq!(
            EngineError::ConflictOnCreate("run::a::b".to_string()).http_status(),
            409
        );
        assert_eq!(
            EngineError::ConcurrencyExhausted {
                document_id: "editor::a:b:c".to_string(),
                attempts: 4,
            }
            .http_status(),
            503
        );
        assert_eq!(
            EngineError::Inference(InferenceError::http(500, "boom")).http_status(),
            502
        );
    }

    #[test]
    fn test_inference_error_status() {
        assert_eq!(InferenceError::http(429, "slow down").status(), Some(429));
        assert_eq!(InferenceError::connect("refused").status(), None);
        assert_eq!(
            InferenceError::Timeout(Duration::from_secs(120)).status(),
            None
        );
    }

    #[test]
    fn test_retry_exhausted_display_names_budget() {
        let err = EngineError::RetryExhausted {
            attempts: 4,
            elapsed: Duration::from_secs(14),
            last_error: "service returned status 503: busy".to_string(),
        };
        let rendered = err.to_string();
        assert!(rendered.contains("4 attempts"));
        assert!(rendered.contains("status 503"));
    }
}

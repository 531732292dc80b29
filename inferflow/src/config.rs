//! Engine configuration, loadable from the process environment.

use std::env;
use std::time::Duration;

use crate::errors::EngineError;
use crate::merge::MergeConfig;
use crate::retry::RetryPolicy;

/// Connection settings for the external inference service.
///
/// Deliberately not serializable; the key stays out of logs and payloads.
#[derive(Debug, Clone)]
pub struct InferenceConfig {
    /// Scoring endpoint URL.
    pub endpoint: String,
    /// API key sent with every request.
    pub api_key: String,
    /// Deployment or model label, stamped onto merged features when set.
    pub deployment: Option<String>,
    /// Per-request deadline.
    pub timeout: Duration,
    /// Client-side attempts per engine-level attempt.
    pub max_attempts: u32,
    /// First client-side backoff.
    pub backoff_base: Duration,
    /// Client-side backoff ceiling.
    pub backoff_cap: Duration,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            api_key: String::new(),
            deployment: None,
            timeout: Duration::from_millis(120_000),
            max_attempts: 1,
            backoff_base: Duration::from_millis(1_000),
            backoff_cap: Duration::from_millis(15_000),
        }
    }
}

/// Top-level engine settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// External service settings.
    pub inference: InferenceConfig,
    /// Durable retry policy for the per-floor inference step.
    pub retry: RetryPolicy,
    /// Merge loop tuning.
    pub merge: MergeConfig,
    /// TTL on issued plan-image read URLs.
    pub read_url_ttl: Duration,
    /// Ceiling on client-side times engine-side attempts for one floor.
    pub max_attempt_product: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            inference: InferenceConfig::default(),
            retry: RetryPolicy::default(),
            merge: MergeConfig::default(),
            read_url_ttl: Duration::from_secs(300),
            max_attempt_product: 8,
        }
    }
}

impl EngineConfig {
    /// Loads configuration from the environment.
    ///
    /// `INFER_ENDPOINT` and `INFER_API_KEY` are required; everything else
    /// falls back to production defaults. The result is validated.
    pub fn from_env() -> Result<Self, EngineError> {
        let inference = InferenceConfig {
            endpoint: require_env("INFER_ENDPOINT")?,
            api_key: require_env("INFER_API_KEY")?,
            deployment: optional_env("INFER_DEPLOYMENT"),
            timeout: Duration::from_millis(env_u64("INFER_TIMEOUT_MS", 120_000)?),
            max_attempts: env_u32("INFER_MAX_ATTEMPTS", 1)?,
            backoff_base: Duration::from_millis(env_u64("INFER_BACKOFF_BASE_MS", 1_000)?),
            backoff_cap: Duration::from_millis(env_u64("INFER_BACKOFF_CAP_MS", 15_000)?),
        };
        let retry = RetryPolicy::default()
            .with_max_attempts(env_u32("RETRY_MAX_ATTEMPTS", 4)?)
            .with_first_delay(Duration::from_millis(env_u64("RETRY_FIRST_DELAY_MS", 2_000)?))
            .with_max_delay(Duration::from_millis(env_u64("RETRY_MAX_DELAY_MS", 30_000)?))
            .with_retry_timeout(Duration::from_secs(env_u64("RETRY_TIMEOUT_SECONDS", 300)?));
        let merge = MergeConfig::default()
            .with_max_attempts(env_u32("MERGE_MAX_ATTEMPTS", 4)?)
            .with_write_legacy(env_bool("WRITE_LEGACY_EDITOR_JSON", false)?)
            .with_write_history(env_bool("WRITE_EDITOR_HISTORY", true)?);

        let config = Self {
            inference,
            retry,
            merge,
            read_url_ttl: Duration::from_secs(env_u64("READ_URL_TTL_SECONDS", 300)?),
            max_attempt_product: env_u32("MAX_TOTAL_ATTEMPTS", 8)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks the settings for internal consistency.
    ///
    /// The client-side and engine-side retry loops multiply; their product is
    /// capped so a misconfiguration cannot hammer a struggling service with
    /// dozens of calls per floor.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.inference.max_attempts == 0 {
            return Err(EngineError::input_validation(
                "INFER_MAX_ATTEMPTS must be at least 1",
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(EngineError::input_validation(
                "RETRY_MAX_ATTEMPTS must be at least 1",
            ));
        }
        if self.merge.max_attempts == 0 {
            return Err(EngineError::input_validation(
                "MERGE_MAX_ATTEMPTS must be at least 1",
            ));
        }
        if self.inference.timeout.is_zero() {
            return Err(EngineError::input_validation(
                "INFER_TIMEOUT_MS must be positive",
            ));
        }
        let product = self
            .inference
            .max_attempts
            .saturating_mul(self.retry.max_attempts);
        if product > self.max_attempt_product {
            return Err(EngineError::input_validation(format!(
                "retry layers multiply to {product} calls per floor (cap {}); \
                 lower INFER_MAX_ATTEMPTS or RETRY_MAX_ATTEMPTS",
                self.max_attempt_product
            )));
        }
        Ok(())
    }
}

fn require_env(name: &str) -> Result<String, EngineError> {
    env::var(name)
        .ok()
        .filter(|value| !value.is_empty())
        .ok_or_else(|| EngineError::input_validation(format!("missing required env var: {name}")))
}

fn optional_env(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.is_empty())
}

fn env_u64(name: &str, default: u64) -> Result<u64, EngineError> {
    match optional_env(name) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|_| {
            EngineError::input_validation(format!("env var {name} must be an integer (got: {raw})"))
        }),
    }
}

fn env_u32(name: &str, default: u32) -> Result<u32, EngineError> {
    match optional_env(name) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|_| {
            EngineError::input_validation(format!("env var {name} must be an integer (got: {raw})"))
        }),
    }
}

fn env_bool(name: &str, default: bool) -> Result<bool, EngineError> {
    match optional_env(name) {
        None => Ok(default),
        Some(raw) => match raw.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => Err(EngineError::input_validation(format!(
                "env var {name} must be a boolean (got: {raw})"
            ))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.inference.max_attempts, 1);
        assert_eq!(config.retry.max_attempts, 4);
        assert_eq!(config.merge.max_attempts, 4);
        assert_eq!(config.read_url_ttl, Duration::from_secs(300));
    }

    #[test]
    fn test_attempt_product_is_capped() {
        let mut config = EngineConfig::default();
        config.inference.max_attempts = 3;
        // 3 * 4 = 12 calls per floor, past the cap of 8
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("12 calls"));

        config.retry = config.retry.with_max_attempts(2);
        config.validate().unwrap();
    }

    #[test]
    fn test_zero_budgets_rejected() {
        let mut config = EngineConfig::default();
        config.inference.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.retry = config.retry.with_max_attempts(0);
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.merge = config.merge.with_max_attempts(0);
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.inference.timeout = Duration::ZERO;
        assert!(config.validate().is_err());
    }
}

//! reqwest-backed client for the scoring endpoint.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, warn};

use crate::config::InferenceConfig;
use crate::errors::{EngineError, InferenceError};
use crate::retry::{bounded_backoff, classify, ErrorClass};

use super::{DetectionBatch, InferenceClient, InferenceRequest};

/// Longest response-body snippet carried into an error message.
const BODY_SNIPPET_MAX: usize = 300;

/// HTTP client for the scoring endpoint.
///
/// Runs a small un-jittered retry loop of its own for transport blips; the
/// default budget is a single attempt, leaving retrying to the durable layer.
/// Fatal classifications surface immediately either way.
pub struct HttpInferenceClient {
    http: Client,
    config: InferenceConfig,
}

impl HttpInferenceClient {
    /// Builds a client from connection settings.
    pub fn new(config: InferenceConfig) -> Result<Self, EngineError> {
        if config.endpoint.is_empty() {
            return Err(EngineError::input_validation(
                "inference endpoint must be set",
            ));
        }
        if config.api_key.is_empty() {
            return Err(EngineError::input_validation(
                "inference api key must be set",
            ));
        }
        Ok(Self {
            http: Client::new(),
            config,
        })
    }

    async fn call_once(
        &self,
        request: &InferenceRequest,
    ) -> Result<DetectionBatch, InferenceError> {
        let mut builder = self
            .http
            .post(&self.config.endpoint)
            .timeout(self.config.timeout)
            .bearer_auth(&self.config.api_key)
            .json(request);
        if let Some(deployment) = &self.config.deployment {
            builder = builder.header("x-model-deployment", deployment);
        }

        let response = builder
            .send()
            .await
            .map_err(map_transport_error(self.config.timeout))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(InferenceError::http(status.as_u16(), snippet(&body)));
        }

        let body = response
            .text()
            .await
            .map_err(map_transport_error(self.config.timeout))?;
        let payload = serde_json::from_str(&body)
            .map_err(|error| InferenceError::decode(format!("{error}: {}", snippet(&body))))?;
        Ok(DetectionBatch::new(payload))
    }
}

#[async_trait]
impl InferenceClient for HttpInferenceClient {
    async fn infer(&self, request: &InferenceRequest) -> Result<DetectionBatch, InferenceError> {
        let mut last_error: Option<InferenceError> = None;
        for attempt in 0..self.config.max_attempts {
            if attempt > 0 {
                let delay = bounded_backoff(
                    self.config.backoff_base,
                    self.config.backoff_cap,
                    attempt - 1,
                );
                debug!(
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "inference client backing off"
                );
                tokio::time::sleep(delay).await;
            }
            match self.call_once(request).await {
                Ok(batch) => return Ok(batch),
                Err(error) => {
                    if classify(&error) == ErrorClass::Fatal {
                        return Err(error);
                    }
                    warn!(
                        attempt = attempt + 1,
                        max_attempts = self.config.max_attempts,
                        error = %error,
                        "inference call failed"
                    );
                    last_error = Some(error);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| InferenceError::connect("no attempts were made")))
    }
}

fn map_transport_error(timeout: Duration) -> impl Fn(reqwest::Error) -> InferenceError {
    move |error| {
        if error.is_timeout() {
            InferenceError::Timeout(timeout)
        } else if let Some(status) = error.status() {
            InferenceError::http(status.as_u16(), error.to_string())
        } else {
            InferenceError::connect(error.to_string())
        }
    }
}

fn snippet(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.len() <= BODY_SNIPPET_MAX {
        return trimmed.to_string();
    }
    let mut end = BODY_SNIPPET_MAX;
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &trimmed[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_requires_endpoint_and_key() {
        let config = InferenceConfig::default();
        assert!(HttpInferenceClient::new(config).is_err());

        let config = InferenceConfig {
            endpoint: "https://score.example/v1".to_string(),
            ..InferenceConfig::default()
        };
        assert!(HttpInferenceClient::new(config).is_err());

        let config = InferenceConfig {
            endpoint: "https://score.example/v1".to_string(),
            api_key: "k".to_string(),
            ..InferenceConfig::default()
        };
        assert!(HttpInferenceClient::new(config).is_ok());
    }

    #[test]
    fn test_snippet_truncates_long_bodies() {
        let long = "x".repeat(2_000);
        let cut = snippet(&long);
        assert!(cut.len() <= BODY_SNIPPET_MAX + 3);
        assert!(cut.ends_with("..."));
        assert_eq!(snippet("  short  "), "short");
    }

    #[test]
    fn test_request_body_shape() {
        let request = InferenceRequest {
            image_url: "https://signed.example/plan.png".to_string(),
            meta: crate::inference::RequestMeta {
                client_name: "acme".to_string(),
                slug: "tower".to_string(),
                floor_id: "f1".to_string(),
                plan_key: "plans/f1.png".to_string(),
            },
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["image_url"], "https://signed.example/plan.png");
        assert_eq!(value["meta"]["client_name"], "acme");
        assert_eq!(value["meta"]["floorId"], "f1");
        assert_eq!(value["meta"]["planUrl"], "plans/f1.png");
    }
}

//! Deterministic stand-ins for the external service and contended stores.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use crate::errors::{EngineError, InferenceError};
use crate::inference::{DetectionBatch, InferenceClient, InferenceRequest};
use crate::merge::{Feature, FeatureSource, Geometry, Vec2};
use crate::stores::{AssetStore, DocVersion, DocumentStore, InMemoryDocumentStore, VersionedDocument};

/// Inference client driven by a script of canned outcomes.
///
/// Outcomes are consumed in order; when the script runs dry the last entry
/// repeats. Every request is captured for assertions.
pub struct ScriptedInferenceClient {
    script: Vec<Result<Value, InferenceError>>,
    cursor: AtomicUsize,
    requests: Mutex<Vec<InferenceRequest>>,
}

impl ScriptedInferenceClient {
    /// Client that plays back the given script.
    #[must_use]
    pub fn new(script: Vec<Result<Value, InferenceError>>) -> Self {
        Self {
            script,
            cursor: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Client that answers every call with the same payload.
    #[must_use]
    pub fn always_ok(payload: Value) -> Self {
        Self::new(vec![Ok(payload)])
    }

    /// How many calls were made.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.cursor.load(Ordering::SeqCst)
    }

    /// Requests received so far, oldest first.
    #[must_use]
    pub fn requests(&self) -> Vec<InferenceRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl InferenceClient for ScriptedInferenceClient {
    async fn infer(&self, request: &InferenceRequest) -> Result<DetectionBatch, InferenceError> {
        self.requests.lock().push(request.clone());
        let position = self.cursor.fetch_add(1, Ordering::SeqCst);
        let Some(entry) = self.script.get(position.min(self.script.len().saturating_sub(1)))
        else {
            return Err(InferenceError::connect("script is empty"));
        };
        match entry {
            Ok(payload) => Ok(DetectionBatch::new(payload.clone())),
            Err(error) => Err(error.clone()),
        }
    }
}

/// Document store that makes the caller lose its first `rounds` conditional
/// replaces by slipping a competing user edit in between read and write.
pub struct ContentiousDocumentStore {
    inner: Arc<InMemoryDocumentStore>,
    remaining: AtomicU32,
    injected: AtomicU32,
}

impl ContentiousDocumentStore {
    /// Wraps `inner`, injecting a competing write before each of the first
    /// `rounds` replace calls.
    #[must_use]
    pub fn new(inner: Arc<InMemoryDocumentStore>, rounds: u32) -> Self {
        Self {
            inner,
            remaining: AtomicU32::new(rounds),
            injected: AtomicU32::new(0),
        }
    }

    /// How many competing writes were injected.
    #[must_use]
    pub fn injected(&self) -> u32 {
        self.injected.load(Ordering::SeqCst)
    }

    async fn inject_competing_edit(&self, document_id: &str) -> Result<(), EngineError> {
        let Some(fresh) = self.inner.read_document(document_id).await? else {
            return Ok(());
        };
        let ordinal = self.injected.fetch_add(1, Ordering::SeqCst);
        let mut document = fresh.document;
        let id = format!("user-injected-{ordinal}");
        document.features.insert(
            id.clone(),
            Feature {
                id,
                feature_type: "column".to_string(),
                geometry: Geometry::Point {
                    position: Vec2 {
                        x: 900.0 + f64::from(ordinal),
                        y: 900.0,
                    },
                },
                source: FeatureSource::User,
                audit: None,
                ml: None,
            },
        );
        document.revision += 1;
        self.inner.replace_document(document, fresh.version).await?;
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for ContentiousDocumentStore {
    async fn read_document(
        &self,
        document_id: &str,
    ) -> Result<Option<VersionedDocument>, EngineError> {
        self.inner.read_document(document_id).await
    }

    async fn create_document(
        &self,
        document: crate::merge::EditorDocument,
    ) -> Result<VersionedDocument, EngineError> {
        self.inner.create_document(document).await
    }

    async fn replace_document(
        &self,
        document: crate::merge::EditorDocument,
        expected: DocVersion,
    ) -> Result<VersionedDocument, EngineError> {
        if self.remaining.load(Ordering::SeqCst) > 0 {
            self.remaining.fetch_sub(1, Ordering::SeqCst);
            self.inject_competing_edit(&document.id).await?;
        }
        self.inner.replace_document(document, expected).await
    }
}

/// Document store whose nth conditional replace never returns.
///
/// Models a process dying mid-step: the driving task gets aborted while
/// parked here, and every later call passes straight through.
pub struct StallingDocumentStore {
    inner: Arc<InMemoryDocumentStore>,
    passes_left: AtomicU32,
    stalled: AtomicBool,
}

impl StallingDocumentStore {
    /// Wraps `inner`, stalling the first replace.
    #[must_use]
    pub fn new(inner: Arc<InMemoryDocumentStore>) -> Self {
        Self::after_passes(inner, 0)
    }

    /// Wraps `inner`, letting `passes` replaces through before the stall.
    #[must_use]
    pub fn after_passes(inner: Arc<InMemoryDocumentStore>, passes: u32) -> Self {
        Self {
            inner,
            passes_left: AtomicU32::new(passes),
            stalled: AtomicBool::new(false),
        }
    }

    /// True once a caller has hit the stall.
    #[must_use]
    pub fn has_stalled(&self) -> bool {
        self.stalled.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DocumentStore for StallingDocumentStore {
    async fn read_document(
        &self,
        document_id: &str,
    ) -> Result<Option<VersionedDocument>, EngineError> {
        self.inner.read_document(document_id).await
    }

    async fn create_document(
        &self,
        document: crate::merge::EditorDocument,
    ) -> Result<VersionedDocument, EngineError> {
        self.inner.create_document(document).await
    }

    async fn replace_document(
        &self,
        document: crate::merge::EditorDocument,
        expected: DocVersion,
    ) -> Result<VersionedDocument, EngineError> {
        if self.passes_left.load(Ordering::SeqCst) > 0 {
            self.passes_left.fetch_sub(1, Ordering::SeqCst);
        } else if !self.stalled.swap(true, Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.inner.replace_document(document, expected).await
    }
}

/// Asset store whose every call fails, modeling a blob backend outage.
#[derive(Debug, Default)]
pub struct FailingAssetStore;

impl FailingAssetStore {
    /// Store that rejects everything.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AssetStore for FailingAssetStore {
    async fn issue_read_url(
        &self,
        key: &str,
        _ttl: std::time::Duration,
    ) -> Result<String, EngineError> {
        Err(EngineError::storage(format!(
            "asset backend unavailable (read url for '{key}')"
        )))
    }

    async fn write_text(
        &self,
        key: &str,
        _content: &str,
        _content_type: &str,
    ) -> Result<(), EngineError> {
        Err(EngineError::storage(format!(
            "asset backend unavailable (write '{key}')"
        )))
    }

    async fn read_text(&self, key: &str) -> Result<Option<String>, EngineError> {
        Err(EngineError::storage(format!(
            "asset backend unavailable (read '{key}')"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::RequestMeta;
    use crate::testing::sample_payload;

    fn request() -> InferenceRequest {
        InferenceRequest {
            image_url: "memory://plans/f1.png".to_string(),
            meta: RequestMeta {
                client_name: "acme".to_string(),
                slug: "tower".to_string(),
                floor_id: "f1".to_string(),
                plan_key: "plans/f1.png".to_string(),
            },
        }
    }

    #[tokio::test]
    async fn test_script_plays_in_order_and_repeats_the_tail() {
        let client = ScriptedInferenceClient::new(vec![
            Err(InferenceError::http(503, "busy")),
            Ok(sample_payload(1, 0)),
        ]);
        assert!(client.infer(&request()).await.is_err());
        assert!(client.infer(&request()).await.is_ok());
        assert!(client.infer(&request()).await.is_ok());
        assert_eq!(client.call_count(), 3);
        assert_eq!(client.requests().len(), 3);
    }
}

//! In-memory store implementations.
//!
//! Test- and embedding-grade backends with the same observable semantics the
//! engine expects from production stores: duplicate-key conflicts on create,
//! version tokens that move on every replace, stable floor ordering.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use crate::errors::EngineError;
use crate::merge::{ChangeEvent, ChangeEventType, EditorDocument};
use crate::run::{DetectionCounts, Floor, Project, RunPatch, RunRecord, RunTarget, StepRecord};

use super::{
    AssetStore, DocVersion, DocumentStore, EventStore, HistoryStore, ProjectStore, RunStore,
    VersionedDocument,
};

fn target_key(target: &RunTarget) -> String {
    format!("{}:{}", target.client_name, target.slug)
}

#[derive(Default)]
struct ProjectState {
    projects: HashMap<String, Project>,
    floors: HashMap<String, Vec<Floor>>,
    metrics: HashMap<String, DetectionCounts>,
}

/// In-memory project and floor store.
#[derive(Default)]
pub struct InMemoryProjectStore {
    state: Mutex<ProjectState>,
}

impl InMemoryProjectStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a project for a target and returns its id.
    pub fn add_project(&self, target: &RunTarget) -> String {
        let id = format!("proj::{}::{}", target.client_name, target.slug);
        let project = Project {
            id: id.clone(),
            client_name: target.client_name.clone(),
            slug: target.slug.clone(),
            name: None,
        };
        self.state
            .lock()
            .projects
            .insert(target_key(target), project);
        id
    }

    /// Seeds a floor under a target. Floors list in insertion order.
    pub fn add_floor(&self, target: &RunTarget, floor: Floor) {
        self.state
            .lock()
            .floors
            .entry(target_key(target))
            .or_default()
            .push(floor);
    }

    /// Latest metrics written for a floor, if any.
    #[must_use]
    pub fn floor_metrics(&self, target: &RunTarget, floor_id: &str) -> Option<DetectionCounts> {
        self.state
            .lock()
            .metrics
            .get(&format!("{}:{floor_id}", target_key(target)))
            .copied()
    }
}

#[async_trait]
impl ProjectStore for InMemoryProjectStore {
    async fn find_project(&self, target: &RunTarget) -> Result<Project, EngineError> {
        self.state
            .lock()
            .projects
            .get(&target_key(target))
            .cloned()
            .ok_or_else(|| {
                EngineError::not_found(format!(
                    "project '{}/{}'",
                    target.client_name, target.slug
                ))
            })
    }

    async fn list_floors(&self, target: &RunTarget) -> Result<Vec<Floor>, EngineError> {
        Ok(self
            .state
            .lock()
            .floors
            .get(&target_key(target))
            .cloned()
            .unwrap_or_default())
    }

    async fn update_floor_metrics(
        &self,
        target: &RunTarget,
        floor_id: &str,
        counts: DetectionCounts,
    ) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        let key = target_key(target);
        let known = state
            .floors
            .get(&key)
            .is_some_and(|floors| floors.iter().any(|f| f.id == floor_id));
        if !known {
            return Err(EngineError::not_found(format!("floor '{floor_id}'")));
        }
        state.metrics.insert(format!("{key}:{floor_id}"), counts);
        Ok(())
    }
}

/// In-memory run record store.
#[derive(Default)]
pub struct InMemoryRunStore {
    runs: Mutex<HashMap<String, RunRecord>>,
}

impl InMemoryRunStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.runs.lock().len()
    }

    /// True when no records exist.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.runs.lock().is_empty()
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn read_run(&self, run_id: &str) -> Result<Option<RunRecord>, EngineError> {
        Ok(self.runs.lock().get(run_id).cloned())
    }

    async fn create_run(&self, record: RunRecord) -> Result<RunRecord, EngineError> {
        let mut runs = self.runs.lock();
        if runs.contains_key(&record.id) {
            return Err(EngineError::ConflictOnCreate(record.id));
        }
        runs.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn update_run(&self, run_id: &str, patch: RunPatch) -> Result<RunRecord, EngineError> {
        let mut runs = self.runs.lock();
        let record = runs
            .get_mut(run_id)
            .ok_or_else(|| EngineError::not_found(format!("run '{run_id}'")))?;
        record.apply(&patch, Utc::now())?;
        Ok(record.clone())
    }
}

/// In-memory versioned document store.
#[derive(Default)]
pub struct InMemoryDocumentStore {
    docs: Mutex<HashMap<String, (EditorDocument, u64)>>,
}

impl InMemoryDocumentStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn read_document(
        &self,
        document_id: &str,
    ) -> Result<Option<VersionedDocument>, EngineError> {
        Ok(self
            .docs
            .lock()
            .get(document_id)
            .map(|(doc, version)| VersionedDocument {
                document: doc.clone(),
                version: DocVersion(*version),
            }))
    }

    async fn create_document(
        &self,
        document: EditorDocument,
    ) -> Result<VersionedDocument, EngineError> {
        let mut docs = self.docs.lock();
        if docs.contains_key(&document.id) {
            return Err(EngineError::ConflictOnCreate(document.id));
        }
        docs.insert(document.id.clone(), (document.clone(), 1));
        Ok(VersionedDocument {
            document,
            version: DocVersion(1),
        })
    }

    async fn replace_document(
        &self,
        document: EditorDocument,
        expected: DocVersion,
    ) -> Result<VersionedDocument, EngineError> {
        let mut docs = self.docs.lock();
        let Some((stored, version)) = docs.get_mut(&document.id) else {
            return Err(EngineError::not_found(format!(
                "document '{}'",
                document.id
            )));
        };
        if *version != expected.0 {
            return Err(EngineError::VersionConflict {
                document_id: document.id,
            });
        }
        *version += 1;
        *stored = document.clone();
        let next = DocVersion(*version);
        Ok(VersionedDocument {
            document,
            version: next,
        })
    }
}

/// In-memory append-only change event store.
#[derive(Default)]
pub struct InMemoryEventStore {
    events: RwLock<Vec<ChangeEvent>>,
}

impl InMemoryEventStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All appended events, oldest first.
    #[must_use]
    pub fn events(&self) -> Vec<ChangeEvent> {
        self.events.read().clone()
    }

    /// Events of one type, oldest first.
    #[must_use]
    pub fn events_of_type(&self, event_type: ChangeEventType) -> Vec<ChangeEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }

    /// Number of appended events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// True when nothing was appended.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append_event(&self, event: ChangeEvent) -> Result<(), EngineError> {
        self.events.write().push(event);
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct StoredAsset {
    content: String,
    content_type: String,
}

/// In-memory blob-style asset store.
#[derive(Default)]
pub struct InMemoryAssetStore {
    blobs: DashMap<String, StoredAsset>,
}

impl InMemoryAssetStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// True when an asset exists under the key.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.blobs.contains_key(key)
    }

    /// All stored keys, unordered.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.blobs.iter().map(|e| e.key().clone()).collect()
    }

    /// Content type recorded for a key, if present.
    #[must_use]
    pub fn content_type(&self, key: &str) -> Option<String> {
        self.blobs.get(key).map(|a| a.content_type.clone())
    }
}

#[async_trait]
impl AssetStore for InMemoryAssetStore {
    async fn issue_read_url(&self, key: &str, ttl: Duration) -> Result<String, EngineError> {
        // Signing does not verify existence; a missing blob fails at fetch
        // time, which is the caller's retryable problem.
        Ok(format!("memory://{key}?ttl={}s", ttl.as_secs()))
    }

    async fn write_text(
        &self,
        key: &str,
        content: &str,
        content_type: &str,
    ) -> Result<(), EngineError> {
        self.blobs.insert(
            key.to_string(),
            StoredAsset {
                content: content.to_string(),
                content_type: content_type.to_string(),
            },
        );
        Ok(())
    }

    async fn read_text(&self, key: &str) -> Result<Option<String>, EngineError> {
        Ok(self.blobs.get(key).map(|a| a.content.clone()))
    }
}

/// In-memory step history store.
#[derive(Default)]
pub struct InMemoryHistoryStore {
    histories: Mutex<HashMap<String, Vec<StepRecord>>>,
}

impl InMemoryHistoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records held for a run.
    #[must_use]
    pub fn len(&self, run_id: &str) -> usize {
        self.histories
            .lock()
            .get(run_id)
            .map_or(0, Vec::len)
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn load_history(&self, run_id: &str) -> Result<Vec<StepRecord>, EngineError> {
        let mut records = self
            .histories
            .lock()
            .get(run_id)
            .cloned()
            .unwrap_or_default();
        records.sort_by_key(|r| r.index);
        Ok(records)
    }

    async fn append_step(&self, run_id: &str, record: StepRecord) -> Result<(), EngineError> {
        self.histories
            .lock()
            .entry(run_id.to_string())
            .or_default()
            .push(record);
        Ok(())
    }

    async fn clear_history(&self, run_id: &str) -> Result<(), EngineError> {
        self.histories.lock().remove(run_id);
        Ok(())
    }
}

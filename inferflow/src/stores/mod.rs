//! Collaborator traits for every store the pipeline touches.
//!
//! The engine, guard, and merge loop are written against these traits and
//! receive implementations by constructor injection. The in-memory
//! implementations in this module back the test suite and embedded use;
//! production bindings live outside this crate.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::EngineError;
use crate::merge::{ChangeEvent, EditorDocument};
use crate::run::{DetectionCounts, Floor, Project, RunPatch, RunRecord, RunTarget, StepRecord};

mod memory;

pub use memory::{
    InMemoryAssetStore, InMemoryDocumentStore, InMemoryEventStore, InMemoryHistoryStore,
    InMemoryProjectStore, InMemoryRunStore,
};

/// Opaque optimistic-concurrency token for a stored document.
///
/// The engine never interprets the value; it only hands back the token it
/// read to prove the document did not move underneath it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocVersion(pub u64);

/// A document together with the version token it was read at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedDocument {
    /// The document contents.
    pub document: EditorDocument,
    /// Token to pass back on a conditional replace.
    pub version: DocVersion,
}

/// Read access to projects, their floors, and the denormalized per-floor
/// metric counters.
#[async_trait]
pub trait ProjectStore: Send + Sync {
    /// Looks up the project for a target.
    async fn find_project(&self, target: &RunTarget) -> Result<Project, EngineError>;

    /// Lists the target's floors in creation order.
    ///
    /// The order must be stable across calls: a resumed run walks the same
    /// sequence it recorded.
    async fn list_floors(&self, target: &RunTarget) -> Result<Vec<Floor>, EngineError>;

    /// Writes the latest detection counters onto a floor.
    async fn update_floor_metrics(
        &self,
        target: &RunTarget,
        floor_id: &str,
        counts: DetectionCounts,
    ) -> Result<(), EngineError>;
}

/// Durable run records keyed by run id.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Reads a run record, `None` when absent.
    async fn read_run(&self, run_id: &str) -> Result<Option<RunRecord>, EngineError>;

    /// Creates a fresh record; [`EngineError::ConflictOnCreate`] when the id
    /// already exists.
    async fn create_run(&self, record: RunRecord) -> Result<RunRecord, EngineError>;

    /// Applies a patch read-modify-replace style and returns the updated
    /// record; [`EngineError::NotFound`] when absent.
    async fn update_run(&self, run_id: &str, patch: RunPatch) -> Result<RunRecord, EngineError>;
}

/// Versioned editor documents with conditional replace.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Reads a document with its current version token.
    async fn read_document(
        &self,
        document_id: &str,
    ) -> Result<Option<VersionedDocument>, EngineError>;

    /// Creates a document; [`EngineError::ConflictOnCreate`] when the id
    /// already exists.
    async fn create_document(
        &self,
        document: EditorDocument,
    ) -> Result<VersionedDocument, EngineError>;

    /// Replaces a document only while `expected` still matches its stored
    /// version; [`EngineError::VersionConflict`] otherwise.
    async fn replace_document(
        &self,
        document: EditorDocument,
        expected: DocVersion,
    ) -> Result<VersionedDocument, EngineError>;
}

/// Append-only audit trail of document changes.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Appends one change event.
    async fn append_event(&self, event: ChangeEvent) -> Result<(), EngineError>;
}

/// Blob-style assets: plan images, raw inference outputs, legacy mirrors.
#[async_trait]
pub trait AssetStore: Send + Sync {
    /// Issues a time-limited read URL for an asset.
    async fn issue_read_url(&self, key: &str, ttl: Duration) -> Result<String, EngineError>;

    /// Writes a text asset, overwriting any previous content.
    async fn write_text(
        &self,
        key: &str,
        content: &str,
        content_type: &str,
    ) -> Result<(), EngineError>;

    /// Reads a text asset back, `None` when absent.
    async fn read_text(&self, key: &str) -> Result<Option<String>, EngineError>;
}

/// Append-only step history per run.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Loads a run's history ordered by record index.
    async fn load_history(&self, run_id: &str) -> Result<Vec<StepRecord>, EngineError>;

    /// Appends one record.
    async fn append_step(&self, run_id: &str, record: StepRecord) -> Result<(), EngineError>;

    /// Drops a run's history. Only called when a Failed run is re-admitted
    /// and starts a fresh attempt.
    async fn clear_history(&self, run_id: &str) -> Result<(), EngineError>;
}

/// The full store set the pipeline runs over, cloned cheaply by `Arc`.
#[derive(Clone)]
pub struct Collaborators {
    /// Projects and floors.
    pub projects: Arc<dyn ProjectStore>,
    /// Run records.
    pub runs: Arc<dyn RunStore>,
    /// Versioned editor documents.
    pub documents: Arc<dyn DocumentStore>,
    /// Change events.
    pub events: Arc<dyn EventStore>,
    /// Blob assets.
    pub assets: Arc<dyn AssetStore>,
    /// Step histories.
    pub history: Arc<dyn HistoryStore>,
}

impl Collaborators {
    /// An all-in-memory set for tests and embedded use.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            projects: Arc::new(InMemoryProjectStore::new()),
            runs: Arc::new(InMemoryRunStore::new()),
            documents: Arc::new(InMemoryDocumentStore::new()),
            events: Arc::new(InMemoryEventStore::new()),
            assets: Arc::new(InMemoryAssetStore::new()),
            history: Arc::new(InMemoryHistoryStore::new()),
        }
    }
}

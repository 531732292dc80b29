//! Convergent merge of machine features into versioned editor documents.
//!
//! The merge runs against live documents that human editors write to at the
//! same time. Writes go through conditional replacement: every round reads a
//! fresh snapshot, computes an immutable candidate from it, and replaces only
//! if nobody else wrote in between. A lost round discards the candidate
//! entirely, so state from a stale snapshot can never leak into the next one.

mod document;
mod events;
mod features;
mod legacy;

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::errors::EngineError;
use crate::inference::DetectionBatch;
use crate::run::DetectionCounts;
use crate::stores::{AssetStore, DocVersion, DocumentStore, EventStore};

pub use document::{
    editor_doc_id, floor_key, Actor, BBox, Basemap, DeclaredScale, DocMeta, DocumentKey,
    EditorDocument, Feature, FeatureAudit, FeatureSource, Geometry, InferenceStamp, LegacyMeta,
    MlProvenance, Transform, Vec2, FEATURE_TYPE_COLUMN, FEATURE_TYPE_FLOOR_PLATE_OPENING,
    FEATURE_TYPE_STAIRCASE_OPENING,
};
pub use events::{event_id, ChangeEvent, ChangeEventType};
pub use features::{build_machine_features, class_feature_type, BuiltFeatures};

/// Tuning for the merge loop.
#[derive(Debug, Clone)]
pub struct MergeConfig {
    /// Read-merge-write rounds before the merge gives up.
    pub max_attempts: u32,
    /// Feature types whose machine-provenance instances are owned by the
    /// pipeline and replaced wholesale on every merge.
    pub machine_owned_types: HashSet<String>,
    /// Mirror successful merges into the legacy editor-state JSON.
    pub write_legacy: bool,
    /// Also keep a timestamped history copy next to the mirror.
    pub write_history: bool,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            machine_owned_types: [
                FEATURE_TYPE_COLUMN,
                FEATURE_TYPE_STAIRCASE_OPENING,
                FEATURE_TYPE_FLOOR_PLATE_OPENING,
            ]
            .into_iter()
            .map(str::to_string)
            .collect(),
            write_legacy: false,
            write_history: true,
        }
    }
}

impl MergeConfig {
    /// Sets the round budget.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Replaces the machine-owned type set.
    #[must_use]
    pub fn with_machine_owned_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.machine_owned_types = types.into_iter().map(Into::into).collect();
        self
    }

    /// Enables or disables the legacy mirror.
    #[must_use]
    pub const fn with_write_legacy(mut self, enabled: bool) -> Self {
        self.write_legacy = enabled;
        self
    }

    /// Enables or disables the timestamped history copy.
    #[must_use]
    pub const fn with_write_history(mut self, enabled: bool) -> Self {
        self.write_history = enabled;
        self
    }
}

/// Run identity a merge stamps onto the document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunMeta {
    /// Run id.
    pub run_id: String,
    /// Model or deployment label, when configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// What a completed merge produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeOutcome {
    /// Document that was written.
    pub document_id: String,
    /// Partition key of the floor.
    pub floor_key: String,
    /// Counts of the features merged in.
    pub counts: DetectionCounts,
    /// Version token after the write.
    pub version: DocVersion,
    /// Rounds it took, 1 when uncontended.
    pub attempts: u32,
    /// True when the document was created by this merge.
    pub created: bool,
}

/// Computes the next document state from a snapshot, without touching it.
///
/// Machine-provenance features of machine-owned types are dropped, the
/// incoming set is inserted by id, and the inference stamp, audit actor, and
/// write time are refreshed. User features always survive, as do machine
/// features of types outside the owned set. `revision` counts human edits
/// and is left alone.
#[must_use]
pub fn merge_into(
    snapshot: &EditorDocument,
    incoming: &[Feature],
    machine_owned: &HashSet<String>,
    meta: &RunMeta,
    actor: &Actor,
    now: DateTime<Utc>,
) -> EditorDocument {
    let mut next = snapshot.clone();
    next.features.retain(|_, feature| {
        !(feature.source == FeatureSource::Machine
            && machine_owned.contains(feature.feature_type.as_str()))
    });
    for feature in incoming {
        next.features.insert(feature.id.clone(), feature.clone());
    }
    next.meta.inference = Some(InferenceStamp {
        last_run_id: meta.run_id.clone(),
        model: meta.model.clone().or_else(|| {
            snapshot
                .meta
                .inference
                .as_ref()
                .and_then(|stamp| stamp.model.clone())
        }),
        run_at: now,
        source: "machine".to_string(),
    });
    next.updated_at = now;
    next.updated_by = actor.clone();
    next
}

/// Merges detection batches into editor documents.
pub struct MergeEngine {
    documents: Arc<dyn DocumentStore>,
    events: Arc<dyn EventStore>,
    assets: Arc<dyn AssetStore>,
    config: MergeConfig,
}

impl MergeEngine {
    /// Wires a merge engine over its stores.
    #[must_use]
    pub fn new(
        documents: Arc<dyn DocumentStore>,
        events: Arc<dyn EventStore>,
        assets: Arc<dyn AssetStore>,
        config: MergeConfig,
    ) -> Self {
        Self {
            documents,
            events,
            assets,
            config,
        }
    }

    /// Folds a detection batch into the floor's document.
    ///
    /// Reads or lazily creates the document, then runs the bounded
    /// conditional-write loop. On success the change events are appended
    /// (their failure fails the merge) and the legacy mirror is written
    /// (its failure never does).
    pub async fn merge_features(
        &self,
        key: &DocumentKey,
        batch: &DetectionBatch,
        meta: &RunMeta,
    ) -> Result<MergeOutcome, EngineError> {
        let built = build_machine_features(batch, &meta.run_id, meta.model.as_deref(), Utc::now());
        let actor = Actor::system();
        let (mut current, mut version, created) = self.read_or_create(key, &actor).await?;

        for attempt in 1..=self.config.max_attempts {
            let candidate = merge_into(
                &current,
                &built.features,
                &self.config.machine_owned_types,
                meta,
                &actor,
                Utc::now(),
            );
            match self.documents.replace_document(candidate, version).await {
                Ok(saved) => {
                    self.append_events(&saved.document, current.revision, created, built.counts, meta)
                        .await?;
                    if self.config.write_legacy {
                        legacy::write_legacy_mirror(
                            self.assets.as_ref(),
                            &saved.document,
                            built.counts,
                            &meta.run_id,
                            self.config.write_history,
                        )
                        .await;
                    }
                    info!(
                        floor_key = %saved.document.floor_key,
                        attempts = attempt,
                        created,
                        columns = built.counts.columns_detected,
                        polygons = built.counts.polygons_detected,
                        "machine features merged"
                    );
                    return Ok(MergeOutcome {
                        document_id: saved.document.id,
                        floor_key: key.floor_key(),
                        counts: built.counts,
                        version: saved.version,
                        attempts: attempt,
                        created,
                    });
                }
                Err(EngineError::VersionConflict { document_id }) => {
                    warn!(
                        document_id = %document_id,
                        attempt,
                        max_attempts = self.config.max_attempts,
                        "merge lost a concurrency round, rereading"
                    );
                    let fresh = self
                        .documents
                        .read_document(&document_id)
                        .await?
                        .ok_or_else(|| {
                            EngineError::not_found(format!("document '{document_id}'"))
                        })?;
                    current = fresh.document;
                    version = fresh.version;
                }
                Err(other) => return Err(other),
            }
        }

        Err(EngineError::ConcurrencyExhausted {
            document_id: key.document_id(),
            attempts: self.config.max_attempts,
        })
    }

    /// Reads the document for a key, creating it when absent.
    ///
    /// Losing the creation race is not an error: the winner's document is
    /// adopted and the merge proceeds against it.
    async fn read_or_create(
        &self,
        key: &DocumentKey,
        actor: &Actor,
    ) -> Result<(EditorDocument, DocVersion, bool), EngineError> {
        let document_id = key.document_id();
        if let Some(found) = self.documents.read_document(&document_id).await? {
            return Ok((found.document, found.version, false));
        }

        let fresh = EditorDocument::create(key, actor.clone(), Utc::now())?;
        match self.documents.create_document(fresh).await {
            Ok(created) => Ok((created.document, created.version, true)),
            Err(EngineError::ConflictOnCreate(_)) => {
                let found = self
                    .documents
                    .read_document(&document_id)
                    .await?
                    .ok_or_else(|| {
                        EngineError::not_found(format!("document '{document_id}'"))
                    })?;
                Ok((found.document, found.version, false))
            }
            Err(other) => Err(other),
        }
    }

    async fn append_events(
        &self,
        after: &EditorDocument,
        revision_before: u64,
        created: bool,
        counts: DetectionCounts,
        meta: &RunMeta,
    ) -> Result<(), EngineError> {
        let actor = Actor::system();
        let now = Utc::now();
        if created {
            self.events
                .append_event(ChangeEvent::doc_init(after, actor.clone(), now))
                .await?;
        }
        // Offset keeps the pair's ids distinct within one millisecond.
        let import_at = if created {
            now + ChronoDuration::milliseconds(1)
        } else {
            now
        };
        self.events
            .append_event(ChangeEvent::ml_import_features(
                after,
                revision_before,
                &meta.run_id,
                counts,
                actor,
                import_at,
            ))
            .await
    }
}

/// Document seeded for store and merge tests.
#[cfg(test)]
pub(crate) fn test_document(client: &str, slug: &str, floor: &str) -> EditorDocument {
    let key = DocumentKey {
        client_name: client.to_string(),
        project_slug: slug.to_string(),
        floor_id: floor.to_string(),
        basemap: Some(Basemap {
            key: format!("plans/{floor}.png"),
            width: 2000,
            height: 1500,
        }),
        paper_scale_denominator: Some(50.0),
        legacy_editor_state_url: None,
    };
    EditorDocument::create(&key, Actor::system(), Utc::now()).unwrap()
}

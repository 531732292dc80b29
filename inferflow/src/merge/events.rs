//! Append-only change events emitted alongside document writes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::run::DetectionCounts;

use super::document::{Actor, EditorDocument};

/// Kinds of change event the merge path emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeEventType {
    /// A document was created.
    #[serde(rename = "doc.init")]
    DocInit,
    /// Machine features were merged in.
    #[serde(rename = "ml.importFeatures")]
    MlImportFeatures,
}

/// One change event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    /// Event id, `evt::{floorKey}::{tsMs}::{suffix}`.
    pub id: String,
    /// Client account.
    pub client_name: String,
    /// Project slug.
    pub project_slug: String,
    /// Floor id.
    pub floor_id: String,
    /// Partition key.
    pub floor_key: String,
    /// What happened.
    #[serde(rename = "type")]
    pub event_type: ChangeEventType,
    /// Who did it.
    pub actor: Actor,
    /// When it happened.
    pub timestamp: DateTime<Utc>,
    /// Type-specific details.
    pub payload: Value,
    /// Document revision before the write; absent for creation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_revision_before: Option<u64>,
    /// Document revision after the write.
    pub doc_revision_after: u64,
    /// Run that caused the event, when one did.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
}

/// Event id for a floor at a millisecond timestamp. The suffix only breaks
/// same-millisecond collisions.
#[must_use]
pub fn event_id(floor_key: &str, ts_ms: i64) -> String {
    let suffix: String = Uuid::new_v4().simple().to_string().chars().take(6).collect();
    format!("evt::{floor_key}::{ts_ms}::{suffix}")
}

impl ChangeEvent {
    /// Creation event for a just-created document.
    #[must_use]
    pub fn doc_init(document: &EditorDocument, actor: Actor, at: DateTime<Utc>) -> Self {
        Self {
            id: event_id(&document.floor_key, at.timestamp_millis()),
            client_name: document.client_name.clone(),
            project_slug: document.project_slug.clone(),
            floor_id: document.floor_id.clone(),
            floor_key: document.floor_key.clone(),
            event_type: ChangeEventType::DocInit,
            actor,
            timestamp: at,
            payload: json!({}),
            doc_revision_before: None,
            doc_revision_after: document.revision,
            run_id: None,
        }
    }

    /// Import event for a merge that replaced the document.
    #[must_use]
    pub fn ml_import_features(
        after: &EditorDocument,
        revision_before: u64,
        run_id: &str,
        counts: DetectionCounts,
        actor: Actor,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: event_id(&after.floor_key, at.timestamp_millis()),
            client_name: after.client_name.clone(),
            project_slug: after.project_slug.clone(),
            floor_id: after.floor_id.clone(),
            floor_key: after.floor_key.clone(),
            event_type: ChangeEventType::MlImportFeatures,
            actor,
            timestamp: at,
            payload: json!({
                "runId": run_id,
                "counts": counts,
            }),
            doc_revision_before: Some(revision_before),
            doc_revision_after: after.revision,
            run_id: Some(run_id.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::test_document;

    #[test]
    fn test_event_id_shape() {
        let id = event_id("acme:tower:f1", 1_700_000_000_123);
        let parts: Vec<&str> = id.split("::").collect();
        assert_eq!(parts[0], "evt");
        assert_eq!(parts[1], "acme:tower:f1");
        assert_eq!(parts[2], "1700000000123");
        assert_eq!(parts[3].len(), 6);
    }

    #[test]
    fn test_import_event_wire_shape() {
        let doc = test_document("acme", "tower", "f1");
        let counts = DetectionCounts {
            columns_detected: 3,
            beams_detected: 0,
            polygons_detected: 1,
        };
        let event = ChangeEvent::ml_import_features(
            &doc,
            7,
            "infer::acme::tower",
            counts,
            Actor::system(),
            Utc::now(),
        );
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "ml.importFeatures");
        assert_eq!(value["docRevisionBefore"], 7);
        assert_eq!(value["payload"]["counts"]["columnsDetected"], 3);
        assert_eq!(value["runId"], "infer::acme::tower");
    }

    #[test]
    fn test_init_event_has_no_prior_revision() {
        let doc = test_document("acme", "tower", "f1");
        let event = ChangeEvent::doc_init(&doc, Actor::system(), Utc::now());
        assert_eq!(event.doc_revision_before, None);
        assert_eq!(event.doc_revision_after, doc.revision);
        let value = serde_json::to_value(&event).unwrap();
        assert!(value.get("docRevisionBefore").is_none());
        assert_eq!(value["type"], "doc.init");
        assert_eq!(value["payload"], json!({}));
    }
}

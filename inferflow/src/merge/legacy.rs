//! Best-effort mirror of the document into the legacy editor-state JSON.
//!
//! Older viewers read a flat `latest.json` per floor. The mirror is written
//! after a successful merge and is advisory: any failure here is logged and
//! swallowed, the merged document is already the source of truth.

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::paths::{editor_history_path, editor_latest_path};
use crate::run::DetectionCounts;
use crate::stores::AssetStore;

use super::document::{
    EditorDocument, FeatureSource, Geometry, FEATURE_TYPE_COLUMN,
};

const LEGACY_COLUMN_SIZE: f64 = 60.0;

/// Writes `latest.json` (and optionally a timestamped history copy) for the
/// floor a document belongs to. Never fails.
pub(crate) async fn write_legacy_mirror(
    assets: &dyn AssetStore,
    document: &EditorDocument,
    counts: DetectionCounts,
    run_id: &str,
    write_history: bool,
) {
    let state = legacy_state(document, counts, run_id);
    let content = match serde_json::to_string_pretty(&state) {
        Ok(content) => content,
        Err(error) => {
            warn!(floor_key = %document.floor_key, error = %error, "legacy mirror serialization failed");
            return;
        }
    };

    let latest = match editor_latest_path(&document.project_slug, &document.floor_id) {
        Ok(key) => key,
        Err(error) => {
            warn!(floor_key = %document.floor_key, error = %error, "legacy mirror path rejected");
            return;
        }
    };
    if let Err(error) = assets.write_text(&latest, &content, "application/json").await {
        warn!(key = %latest, error = %error, "legacy mirror write failed");
        return;
    }
    debug!(key = %latest, "legacy mirror written");

    if !write_history {
        return;
    }
    match editor_history_path(&document.project_slug, &document.floor_id, Utc::now()) {
        Ok(key) => {
            if let Err(error) = assets.write_text(&key, &content, "application/json").await {
                warn!(key = %key, error = %error, "legacy history copy failed");
            }
        }
        Err(error) => {
            warn!(floor_key = %document.floor_key, error = %error, "legacy history path rejected");
        }
    }
}

/// Flattens a document into the legacy editor-state shape.
fn legacy_state(document: &EditorDocument, counts: DetectionCounts, run_id: &str) -> Value {
    let mut columns = Vec::new();
    let mut polygons = Vec::new();

    let mut features: Vec<_> = document
        .features
        .values()
        .filter(|f| f.source == FeatureSource::Machine)
        .collect();
    features.sort_by(|a, b| a.id.cmp(&b.id));

    for feature in features {
        match &feature.geometry {
            Geometry::Point { position } if feature.feature_type == FEATURE_TYPE_COLUMN => {
                columns.push(json!({
                    "id": feature.id,
                    "x": position.x,
                    "y": position.y,
                    "size": LEGACY_COLUMN_SIZE,
                    "userEdited": false,
                    "sourceBBox": feature.ml.as_ref().map(|ml| ml.source_bbox),
                }));
            }
            Geometry::Polygon { points, .. } => {
                polygons.push(json!({
                    "id": feature.id,
                    "kind": "opening",
                    "points": points,
                    "userEdited": false,
                }));
            }
            Geometry::Point { .. } => {}
        }
    }

    let model = document
        .meta
        .inference
        .as_ref()
        .and_then(|stamp| stamp.model.as_deref());
    json!({
        "schemaVersion": 1,
        "mode": "columns",
        "basemaps": [{
            "id": "bm1",
            "url": "",
            "width": document.basemap.width,
            "height": document.basemap.height,
        }],
        "activeBasemap": 0,
        "columns": columns,
        "beams": [],
        "polygons": polygons,
        "meta": {
            "inference": {
                "runId": run_id,
                "model": model,
                "timestamp": Utc::now().to_rfc3339(),
                "classLabels": {
                    "0": "column",
                    "1": "staircase-opening",
                    "2": "floor-plate-opening",
                },
                "counts": counts,
                "rawSummary": {},
            },
        },
        "comments": [],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::test_document;
    use crate::merge::{build_machine_features, BuiltFeatures};
    use crate::inference::DetectionBatch;
    use crate::stores::InMemoryAssetStore;

    fn document_with_features() -> (EditorDocument, DetectionCounts) {
        let mut doc = test_document("acme", "tower", "f1");
        let BuiltFeatures { features, counts } = build_machine_features(
            &DetectionBatch::new(json!({
                "results": [{"detections": [
                    {"cls": 0, "score": 0.9, "box": [10, 10, 30, 30]},
                    {"cls": 1, "score": 0.8, "box": [0, 0, 100, 200]}
                ]}]
            })),
            "infer::acme::tower",
            None,
            Utc::now(),
        );
        for feature in features {
            doc.features.insert(feature.id.clone(), feature);
        }
        (doc, counts)
    }

    #[tokio::test]
    async fn test_mirror_writes_latest_and_history() {
        let assets = InMemoryAssetStore::new();
        let (doc, counts) = document_with_features();
        write_legacy_mirror(&assets, &doc, counts, "infer::acme::tower", true).await;

        let latest = assets
            .read_text("projects/tower/editor/f1/latest.json")
            .await
            .unwrap()
            .unwrap();
        let state: Value = serde_json::from_str(&latest).unwrap();
        assert_eq!(state["mode"], "columns");
        assert_eq!(state["columns"].as_array().unwrap().len(), 1);
        assert_eq!(state["columns"][0]["x"], 20.0);
        assert_eq!(state["columns"][0]["size"], 60.0);
        assert_eq!(state["polygons"][0]["kind"], "opening");
        assert_eq!(state["meta"]["inference"]["model"], Value::Null);
        assert_eq!(
            state["meta"]["inference"]["counts"]["columnsDetected"],
            1
        );

        let history: Vec<String> = assets
            .keys()
            .into_iter()
            .filter(|k| k.starts_with("projects/tower/editor/f1/history/"))
            .collect();
        assert_eq!(history.len(), 1);
        assert_eq!(
            assets.read_text(&history[0]).await.unwrap().as_deref(),
            Some(latest.as_str())
        );
    }

    #[tokio::test]
    async fn test_history_copy_can_be_disabled() {
        let assets = InMemoryAssetStore::new();
        let (doc, counts) = document_with_features();
        write_legacy_mirror(&assets, &doc, counts, "r", false).await;
        assert!(assets.contains("projects/tower/editor/f1/latest.json"));
        assert_eq!(assets.keys().len(), 1);
    }

    #[tokio::test]
    async fn test_mirror_takes_the_model_label_from_the_document() {
        let assets = InMemoryAssetStore::new();
        let (mut doc, counts) = document_with_features();
        doc.meta.inference = Some(crate::merge::InferenceStamp {
            last_run_id: "infer::acme::tower".to_string(),
            model: Some("detector-v3".to_string()),
            run_at: Utc::now(),
            source: "machine".to_string(),
        });
        write_legacy_mirror(&assets, &doc, counts, "infer::acme::tower", false).await;

        let latest = assets
            .read_text("projects/tower/editor/f1/latest.json")
            .await
            .unwrap()
            .unwrap();
        let state: Value = serde_json::from_str(&latest).unwrap();
        assert_eq!(state["meta"]["inference"]["model"], "detector-v3");
    }

    #[tokio::test]
    async fn test_user_features_stay_out_of_the_mirror() {
        let assets = InMemoryAssetStore::new();
        let (mut doc, counts) = document_with_features();
        if let Some(feature) = doc.features.values_mut().next() {
            feature.source = FeatureSource::User;
        }
        write_legacy_mirror(&assets, &doc, counts, "r", false).await;
        let latest = assets
            .read_text("projects/tower/editor/f1/latest.json")
            .await
            .unwrap()
            .unwrap();
        let state: Value = serde_json::from_str(&latest).unwrap();
        let total = state["columns"].as_array().unwrap().len()
            + state["polygons"].as_array().unwrap().len();
        assert_eq!(total, 1);
    }
}

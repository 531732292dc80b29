//! Detection-to-feature mapping.

use chrono::{DateTime, Utc};

use crate::inference::DetectionBatch;
use crate::run::DetectionCounts;

use super::document::{
    Actor, BBox, Feature, FeatureAudit, FeatureSource, Geometry, MlProvenance,
    FEATURE_TYPE_COLUMN, FEATURE_TYPE_FLOOR_PLATE_OPENING, FEATURE_TYPE_STAIRCASE_OPENING,
};

/// Feature type for a raw model class id, if the class maps to one.
#[must_use]
pub const fn class_feature_type(class_id: i64) -> Option<&'static str> {
    match class_id {
        0 => Some(FEATURE_TYPE_COLUMN),
        1 => Some(FEATURE_TYPE_STAIRCASE_OPENING),
        2 => Some(FEATURE_TYPE_FLOOR_PLATE_OPENING),
        _ => None,
    }
}

/// Machine features plus their counts, built from one detection batch.
#[derive(Debug, Clone)]
pub struct BuiltFeatures {
    /// Features in detection order.
    pub features: Vec<Feature>,
    /// How many of each kind were produced.
    pub counts: DetectionCounts,
}

/// Maps a detection batch onto editor features.
///
/// Columns become points at the box center; openings become closed
/// four-corner polygons. Ids are deterministic per run: columns count on
/// their own, the two opening types share a counter. Detections with an
/// unmapped class are dropped.
#[must_use]
pub fn build_machine_features(
    batch: &DetectionBatch,
    run_id: &str,
    model: Option<&str>,
    now: DateTime<Utc>,
) -> BuiltFeatures {
    let actor = Actor::system();
    let mut features = Vec::new();
    let mut columns: u64 = 0;
    let mut polygons: u64 = 0;

    for detection in batch.detections() {
        let Some(feature_type) = class_feature_type(detection.class_id) else {
            continue;
        };
        let bbox = BBox::from_xyxy(detection.bbox_xyxy);
        let (id, geometry) = if feature_type == FEATURE_TYPE_COLUMN {
            let id = format!("ml::{run_id}::column::{columns}");
            columns += 1;
            (
                id,
                Geometry::Point {
                    position: bbox.center(),
                },
            )
        } else {
            let id = format!("ml::{run_id}::{feature_type}::{polygons}");
            polygons += 1;
            (
                id,
                Geometry::Polygon {
                    points: bbox.corners().to_vec(),
                    closed: true,
                },
            )
        };
        features.push(Feature {
            id,
            feature_type: feature_type.to_string(),
            geometry,
            source: FeatureSource::Machine,
            audit: Some(FeatureAudit {
                created_by: actor.clone(),
                created_at: now,
            }),
            ml: Some(MlProvenance {
                run_id: run_id.to_string(),
                model: model.map(str::to_string),
                class_id: detection.class_id,
                score: detection.score,
                source_bbox: bbox,
            }),
        });
    }

    BuiltFeatures {
        features,
        counts: DetectionCounts {
            columns_detected: columns,
            beams_detected: 0,
            polygons_detected: polygons,
        },
    }
}

//! The versioned editor document and its feature model.
//!
//! Documents are shared between human editors and machine merges, so the
//! serialized shape is a contract: camelCase keys, `kind`-tagged geometry,
//! `mode`-tagged transform. `revision` counts human edits only; machine
//! merges never advance it.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::EngineError;
use crate::run::{Floor, RunTarget};

/// Feature type emitted for detected columns.
pub const FEATURE_TYPE_COLUMN: &str = "column";
/// Feature type emitted for detected staircase openings.
pub const FEATURE_TYPE_STAIRCASE_OPENING: &str = "staircaseOpening";
/// Feature type emitted for detected floor-plate openings.
pub const FEATURE_TYPE_FLOOR_PLATE_OPENING: &str = "floorPlateOpening";

/// Partition key for everything belonging to one floor.
#[must_use]
pub fn floor_key(client_name: &str, project_slug: &str, floor_id: &str) -> String {
    format!("{client_name}:{project_slug}:{floor_id}")
}

/// Editor document id for a floor key.
#[must_use]
pub fn editor_doc_id(floor_key: &str) -> String {
    format!("editor::{floor_key}")
}

/// 2D point in plan pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Vec2 {
    /// Horizontal position.
    pub x: f64,
    /// Vertical position.
    pub y: f64,
}

/// Axis-aligned bounding box in plan pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    /// Left edge.
    pub x: f64,
    /// Top edge.
    pub y: f64,
    /// Width.
    pub w: f64,
    /// Height.
    pub h: f64,
}

impl BBox {
    /// Normalizes an `[x1, y1, x2, y2]` pair into origin plus size,
    /// regardless of corner ordering.
    #[must_use]
    pub fn from_xyxy(coords: [f64; 4]) -> Self {
        let [x1, y1, x2, y2] = coords;
        Self {
            x: x1.min(x2),
            y: y1.min(y2),
            w: (x2 - x1).abs(),
            h: (y2 - y1).abs(),
        }
    }

    /// Center point of the box.
    #[must_use]
    pub fn center(&self) -> Vec2 {
        Vec2 {
            x: self.x + self.w / 2.0,
            y: self.y + self.h / 2.0,
        }
    }

    /// The four corners, clockwise from the origin.
    #[must_use]
    pub fn corners(&self) -> [Vec2; 4] {
        [
            Vec2 { x: self.x, y: self.y },
            Vec2 {
                x: self.x + self.w,
                y: self.y,
            },
            Vec2 {
                x: self.x + self.w,
                y: self.y + self.h,
            },
            Vec2 {
                x: self.x,
                y: self.y + self.h,
            },
        ]
    }
}

/// Feature geometry, tagged by `kind` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Geometry {
    /// A single point.
    Point {
        /// Location.
        position: Vec2,
    },
    /// A polygon.
    Polygon {
        /// Vertices in drawing order.
        points: Vec<Vec2>,
        /// Whether the last vertex connects back to the first.
        closed: bool,
    },
}

/// Who (or what) a feature came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeatureSource {
    /// Drawn or edited by a person.
    User,
    /// Produced by an inference run.
    Machine,
}

/// A person or system writing to the document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Actor {
    /// Stable identifier.
    pub user_id: String,
    /// Contact address.
    pub email: String,
    /// Human-readable name.
    pub display_name: String,
}

impl Actor {
    /// The synthetic actor machine merges are attributed to.
    #[must_use]
    pub fn system() -> Self {
        Self {
            user_id: "system".to_string(),
            email: "system@inferflow".to_string(),
            display_name: "Inferflow Pipeline".to_string(),
        }
    }
}

/// Creation audit attached to machine features.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureAudit {
    /// Who created the feature.
    pub created_by: Actor,
    /// When it was created.
    pub created_at: DateTime<Utc>,
}

/// Model provenance attached to machine features.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MlProvenance {
    /// Run that produced the feature.
    pub run_id: String,
    /// Model or deployment label, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Raw model class id.
    pub class_id: i64,
    /// Confidence score, when reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    /// Detection bounding box the geometry was derived from.
    #[serde(rename = "sourceBBox")]
    pub source_bbox: BBox,
}

/// One drawable feature of the editor document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Feature {
    /// Feature id, unique within the document.
    pub id: String,
    /// Feature type (`column`, `staircaseOpening`, ...).
    #[serde(rename = "type")]
    pub feature_type: String,
    /// Geometry.
    pub geometry: Geometry,
    /// Provenance class.
    pub source: FeatureSource,
    /// Creation audit, when recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit: Option<FeatureAudit>,
    /// Model provenance; present on machine features.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ml: Option<MlProvenance>,
}

/// Raster the document draws over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Basemap {
    /// Asset key of the plan image.
    pub key: String,
    /// Raster width in pixels.
    pub width: u32,
    /// Raster height in pixels.
    pub height: u32,
}

/// Declared drawing scale.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeclaredScale {
    /// Denominator of the paper scale (50 for 1:50).
    pub scale_denominator: f64,
}

/// Pixel-to-world transform state, tagged by `mode` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum Transform {
    /// No scale information available.
    Unknown,
    /// A paper scale was declared for the plan.
    Declared {
        /// The declared scale.
        declared: DeclaredScale,
    },
}

/// Inference stamp kept on the document after each merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceStamp {
    /// Most recent run merged in.
    pub last_run_id: String,
    /// Model label of that run; earlier labels survive runs without one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// When the merge happened.
    pub run_at: DateTime<Utc>,
    /// Provenance class of the writer.
    pub source: String,
}

/// Pointer to a legacy editor state the document was seeded from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyMeta {
    /// Where the legacy state lives.
    pub editor_state_url: String,
}

/// Open metadata block of the document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DocMeta {
    /// Inference stamp, present after the first merge.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inference: Option<InferenceStamp>,
    /// Legacy seed pointer, when the floor was imported.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub legacy: Option<LegacyMeta>,
}

/// Identity and creation inputs for the document a merge targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentKey {
    /// Client account.
    pub client_name: String,
    /// Project slug.
    pub project_slug: String,
    /// Floor id.
    pub floor_id: String,
    /// Basemap for lazy creation; only consulted when the document does not
    /// exist yet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basemap: Option<Basemap>,
    /// Declared paper scale for lazy creation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paper_scale_denominator: Option<f64>,
    /// Legacy editor state pointer, carried onto created documents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub legacy_editor_state_url: Option<String>,
}

impl DocumentKey {
    /// Builds the key for a floor, wiring the plan image in as the basemap
    /// when the floor knows its raster dimensions.
    #[must_use]
    pub fn for_floor(target: &RunTarget, floor: &Floor) -> Self {
        let basemap = match (floor.image_width, floor.image_height) {
            (Some(width), Some(height)) => Some(Basemap {
                key: floor.plan_key.clone(),
                width,
                height,
            }),
            _ => None,
        };
        Self {
            client_name: target.client_name.clone(),
            project_slug: target.slug.clone(),
            floor_id: floor.id.clone(),
            basemap,
            paper_scale_denominator: floor.paper_scale_denominator,
            legacy_editor_state_url: floor.editor_state_url.clone(),
        }
    }

    /// Partition key of the floor.
    #[must_use]
    pub fn floor_key(&self) -> String {
        floor_key(&self.client_name, &self.project_slug, &self.floor_id)
    }

    /// Id of the document this key addresses.
    #[must_use]
    pub fn document_id(&self) -> String {
        editor_doc_id(&self.floor_key())
    }
}

/// The versioned editor document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditorDocument {
    /// Document id, `editor::{floorKey}`.
    pub id: String,
    /// Document schema version.
    pub schema_version: u32,
    /// Client account.
    pub client_name: String,
    /// Project slug.
    pub project_slug: String,
    /// Floor id.
    pub floor_id: String,
    /// Partition key.
    pub floor_key: String,
    /// Raster the features draw over.
    pub basemap: Basemap,
    /// Pixel-to-world transform state.
    pub transform: Transform,
    /// All features keyed by id.
    pub features: HashMap<String, Feature>,
    /// Open metadata block.
    #[serde(default)]
    pub meta: DocMeta,
    /// Human-edit counter. Machine merges leave it alone.
    pub revision: u64,
    /// Last write time.
    pub updated_at: DateTime<Utc>,
    /// Last writer.
    pub updated_by: Actor,
}

impl EditorDocument {
    /// Fresh document for a floor.
    ///
    /// Requires the key to carry a basemap: a document cannot exist without
    /// knowing what raster its features are drawn over.
    pub fn create(key: &DocumentKey, actor: Actor, now: DateTime<Utc>) -> Result<Self, EngineError> {
        let Some(basemap) = key.basemap.clone() else {
            return Err(EngineError::input_validation(format!(
                "editor document missing and cannot init (floorKey={}): basemap key/width/height required",
                key.floor_key()
            )));
        };
        let transform = match key.paper_scale_denominator {
            Some(denominator) if denominator > 0.0 => Transform::Declared {
                declared: DeclaredScale {
                    scale_denominator: denominator,
                },
            },
            _ => Transform::Unknown,
        };
        let floor_key = key.floor_key();
        Ok(Self {
            id: editor_doc_id(&floor_key),
            schema_version: 1,
            client_name: key.client_name.clone(),
            project_slug: key.project_slug.clone(),
            floor_id: key.floor_id.clone(),
            floor_key,
            basemap,
            transform,
            features: HashMap::new(),
            meta: DocMeta {
                inference: None,
                legacy: key
                    .legacy_editor_state_url
                    .clone()
                    .map(|url| LegacyMeta {
                        editor_state_url: url,
                    }),
            },
            revision: 0,
            updated_at: now,
            updated_by: actor,
        })
    }
}

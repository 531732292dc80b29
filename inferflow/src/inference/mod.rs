//! External inference service contract.
//!
//! The service scores one plan image per call and answers with a loosely
//! typed JSON payload. The payload is persisted verbatim, so
//! [`DetectionBatch`] keeps the raw value and exposes tolerant accessors
//! instead of a strict deserialization.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::InferenceError;

#[cfg(feature = "http")]
mod http;

#[cfg(feature = "http")]
pub use http::HttpInferenceClient;

/// Calls the external detection service.
#[async_trait]
pub trait InferenceClient: Send + Sync {
    /// Runs detection over one plan image.
    async fn infer(&self, request: &InferenceRequest) -> Result<DetectionBatch, InferenceError>;
}

/// Correlation metadata forwarded with every inference request.
///
/// Field names follow the service contract verbatim, mixed casing included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMeta {
    /// Client account.
    pub client_name: String,
    /// Project slug.
    pub slug: String,
    /// Floor being scored.
    #[serde(rename = "floorId")]
    pub floor_id: String,
    /// Asset key of the plan image.
    #[serde(rename = "planUrl")]
    pub plan_key: String,
}

/// Request body posted to the scoring endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferenceRequest {
    /// Time-limited URL the service fetches the plan image from.
    pub image_url: String,
    /// Correlation metadata echoed into service logs.
    pub meta: RequestMeta,
}

/// One usable detection row parsed out of a batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    /// Model class id (0 column, 1 staircase opening, 2 floor-plate opening).
    pub class_id: i64,
    /// Confidence score, when reported.
    pub score: Option<f64>,
    /// Bounding box as `[x1, y1, x2, y2]` plan pixels.
    pub bbox_xyxy: [f64; 4],
}

/// Verbatim response payload from the inference service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DetectionBatch {
    payload: Value,
}

impl DetectionBatch {
    /// Wraps a raw response payload.
    #[must_use]
    pub const fn new(payload: Value) -> Self {
        Self { payload }
    }

    /// The untouched payload, for verbatim persistence.
    #[must_use]
    pub const fn payload(&self) -> &Value {
        &self.payload
    }

    /// Flattens detection rows out of the payload.
    ///
    /// The primary shape is `results[].detections`; older service versions
    /// put a `detections` array at the top level, so that is the fallback
    /// when the primary yields nothing. Rows without a whole-number class or
    /// without a 4-entry box are dropped; malformed box entries coerce to 0.
    #[must_use]
    pub fn detections(&self) -> Vec<Detection> {
        let mut rows: Vec<&Value> = Vec::new();
        if let Some(results) = self.payload.get("results").and_then(Value::as_array) {
            for result in results {
                if let Some(dets) = result.get("detections").and_then(Value::as_array) {
                    rows.extend(dets.iter());
                }
            }
        }
        if rows.is_empty() {
            if let Some(dets) = self.payload.get("detections").and_then(Value::as_array) {
                rows.extend(dets.iter());
            }
        }
        rows.into_iter().filter_map(parse_detection).collect()
    }

    /// Image dimensions the service scored against, when reported.
    ///
    /// Each axis is read from `results[0].image_size` first and falls back
    /// to a top-level `image_size` independently.
    #[must_use]
    pub fn image_size(&self) -> Option<(f64, f64)> {
        let nested = self
            .payload
            .get("results")
            .and_then(Value::as_array)
            .and_then(|results| results.first());
        let axis = |field: &str| {
            nested
                .and_then(|result| result.get("image_size"))
                .and_then(|size| size.get(field))
                .and_then(as_number)
                .or_else(|| {
                    self.payload
                        .get("image_size")
                        .and_then(|size| size.get(field))
                        .and_then(as_number)
                })
        };
        match (axis("w"), axis("h")) {
            (Some(w), Some(h)) => Some((w, h)),
            _ => None,
        }
    }
}

fn parse_detection(row: &Value) -> Option<Detection> {
    let class_id = integral_class(row.get("cls")?)?;
    let bbox = row.get("box").and_then(Value::as_array)?;
    if bbox.len() < 4 {
        return None;
    }
    let mut xyxy = [0.0; 4];
    for (slot, value) in xyxy.iter_mut().zip(bbox.iter()) {
        *slot = as_number(value).unwrap_or(0.0);
    }
    Some(Detection {
        class_id,
        score: row.get("score").and_then(as_number),
        bbox_xyxy: xyxy,
    })
}

/// Numeric coercion matching the service's loose typing: numbers and
/// numeric strings both count.
fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64().filter(|f| f.is_finite()),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
        _ => None,
    }
}

fn integral_class(value: &Value) -> Option<i64> {
    let n = as_number(value)?;
    if n.fract().abs() < f64::EPSILON {
        Some(n as i64)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_detections_flatten_nested_results() {
        let batch = DetectionBatch::new(json!({
            "results": [
                {"detections": [
                    {"cls": 0, "score": 0.92, "box": [10, 20, 30, 40]},
                    {"cls": 1, "score": 0.81, "box": [0, 0, 100, 50]},
                ]},
                {"detections": [
                    {"cls": 2, "score": 0.7, "box": [5, 5, 25, 25]},
                ]},
            ]
        }));
        let dets = batch.detections();
        assert_eq!(dets.len(), 3);
        assert_eq!(dets[0].class_id, 0);
        assert_eq!(dets[2].class_id, 2);
        assert_eq!(dets[1].bbox_xyxy, [0.0, 0.0, 100.0, 50.0]);
    }

    #[test]
    fn test_detections_fall_back_to_top_level() {
        let batch = DetectionBatch::new(json!({
            "detections": [{"cls": 0, "score": 0.5, "box": [1, 2, 3, 4]}]
        }));
        assert_eq!(batch.detections().len(), 1);
    }

    #[test]
    fn test_detections_coerce_strings_and_skip_malformed() {
        let batch = DetectionBatch::new(json!({
            "detections": [
                {"cls": "1", "score": "0.66", "box": ["10", "20", "30", "40"]},
                {"cls": 0, "box": [1, 2, 3]},            // short box
                {"cls": "round", "box": [1, 2, 3, 4]},   // non-numeric class
                {"cls": 0.5, "box": [1, 2, 3, 4]},       // fractional class
                {"score": 0.9, "box": [1, 2, 3, 4]},     // missing class
                {"cls": 2, "box": [1, null, 3, 4]},      // entry coerces to 0
            ]
        }));
        let dets = batch.detections();
        assert_eq!(dets.len(), 2);
        assert_eq!(dets[0].class_id, 1);
        assert_eq!(dets[0].score, Some(0.66));
        assert_eq!(dets[0].bbox_xyxy, [10.0, 20.0, 30.0, 40.0]);
        assert_eq!(dets[1].bbox_xyxy, [1.0, 0.0, 3.0, 4.0]);
    }

    #[test]
    fn test_empty_payload_yields_no_detections() {
        assert!(DetectionBatch::new(json!({})).detections().is_empty());
        assert!(DetectionBatch::new(json!({"results": []}))
            .detections()
            .is_empty());
    }

    #[test]
    fn test_image_size_prefers_nested_then_top_level() {
        let nested = DetectionBatch::new(json!({
            "results": [{"detections": [], "image_size": {"w": 2000, "h": 1500}}]
        }));
        assert_eq!(nested.image_size(), Some((2000.0, 1500.0)));

        let top_level = DetectionBatch::new(json!({
            "results": [{"detections": []}],
            "image_size": {"w": "800", "h": 600}
        }));
        assert_eq!(top_level.image_size(), Some((800.0, 600.0)));

        assert_eq!(DetectionBatch::new(json!({})).image_size(), None);
        let partial = DetectionBatch::new(json!({"image_size": {"w": 800}}));
        assert_eq!(partial.image_size(), None);
    }

    #[test]
    fn test_request_wire_shape() {
        let request = InferenceRequest {
            image_url: "https://assets/plan.png?sig=abc".to_string(),
            meta: RequestMeta {
                client_name: "acme".to_string(),
                slug: "tower".to_string(),
                floor_id: "f1".to_string(),
                plan_key: "projects/tower/plans/f1.png".to_string(),
            },
        };
        let value = serde_json::to_value(&request).unwrap();
        assert!(value.get("image_url").is_some());
        assert_eq!(value["meta"]["client_name"], "acme");
        assert_eq!(value["meta"]["floorId"], "f1");
        assert_eq!(value["meta"]["planUrl"], "projects/tower/plans/f1.png");
    }
}

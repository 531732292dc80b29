//! Canned inputs for driving the pipeline in tests.

use serde_json::{json, Value};

use crate::run::{Floor, RunTarget};

/// The target most tests run against.
#[must_use]
pub fn sample_target() -> RunTarget {
    RunTarget::new("acme", "tower")
}

/// A floor with raster dimensions and a declared scale, ready for lazy
/// document creation.
#[must_use]
pub fn sample_floor(id: &str) -> Floor {
    Floor {
        id: id.to_string(),
        name: Some(format!("Floor {id}")),
        plan_key: format!("plans/{id}.png"),
        image_width: Some(2000),
        image_height: Some(1500),
        paper_scale_denominator: Some(50.0),
        paper_scale_text: Some("1:50".to_string()),
        editor_state_url: None,
    }
}

/// Service payload with `columns` class-0 rows and `openings` class-1 rows,
/// in the nested `results[].detections` shape.
#[must_use]
pub fn sample_payload(columns: usize, openings: usize) -> Value {
    let mut detections = Vec::new();
    for index in 0..columns {
        let offset = 40.0 * index as f64;
        detections.push(json!({
            "cls": 0,
            "score": 0.9,
            "box": [10.0 + offset, 10.0, 30.0 + offset, 30.0],
        }));
    }
    for index in 0..openings {
        let offset = 250.0 * index as f64;
        detections.push(json!({
            "cls": 1,
            "score": 0.8,
            "box": [0.0 + offset, 0.0, 100.0 + offset, 200.0],
        }));
    }
    json!({"results": [{"detections": detections}]})
}

//! Durable run records and the domain types a run operates over.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::EngineError;
use crate::paths::safe_id;

/// Logical target of a run: one project of one client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunTarget {
    /// Client account the project belongs to.
    pub client_name: String,
    /// Project slug, unique within the client.
    pub slug: String,
}

impl RunTarget {
    /// Creates a target from its two identifier segments.
    #[must_use]
    pub fn new(client_name: impl Into<String>, slug: impl Into<String>) -> Self {
        Self {
            client_name: client_name.into(),
            slug: slug.into(),
        }
    }

    /// Rejects targets whose segments are unsafe as keys or path parts.
    pub fn validate(&self) -> Result<(), EngineError> {
        safe_id("clientName", &self.client_name)?;
        safe_id("projectSlug", &self.slug)?;
        Ok(())
    }
}

/// A client project, the container floors belong to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    /// Store id of the project document.
    pub id: String,
    /// Owning client.
    pub client_name: String,
    /// Project slug.
    pub slug: String,
    /// Display name, when the store has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// One unit of work: a floor with a plan image to run detection over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Floor {
    /// Floor id, unique within the project.
    pub id: String,
    /// Display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Asset key of the plan image handed to the inference service.
    pub plan_key: String,
    /// Plan raster width in pixels, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_width: Option<u32>,
    /// Plan raster height in pixels, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_height: Option<u32>,
    /// Declared paper scale denominator (e.g. 50 for 1:50), when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paper_scale_denominator: Option<f64>,
    /// Free-text paper scale as drawn on the plan.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paper_scale_text: Option<String>,
    /// Location of a pre-existing legacy editor state, when one was imported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub editor_state_url: Option<String>,
}

/// Per-floor and per-run detection counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionCounts {
    /// Columns detected.
    pub columns_detected: u64,
    /// Beams detected (reserved; the current model emits none).
    pub beams_detected: u64,
    /// Opening polygons detected (staircase and floor-plate combined).
    pub polygons_detected: u64,
}

impl DetectionCounts {
    /// All counters at zero.
    pub const ZERO: Self = Self {
        columns_detected: 0,
        beams_detected: 0,
        polygons_detected: 0,
    };

    /// Component-wise sum.
    #[must_use]
    pub const fn add(self, other: Self) -> Self {
        Self {
            columns_detected: self.columns_detected.saturating_add(other.columns_detected),
            beams_detected: self.beams_detected.saturating_add(other.beams_detected),
            polygons_detected: self.polygons_detected.saturating_add(other.polygons_detected),
        }
    }

    /// True when every component of `self` is ≥ the matching one in `other`.
    #[must_use]
    pub const fn covers(self, other: Self) -> bool {
        self.columns_detected >= other.columns_detected
            && self.beams_detected >= other.beams_detected
            && self.polygons_detected >= other.polygons_detected
    }
}

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    /// Admitted and executing (or interrupted mid-execution).
    Running,
    /// All floors processed; the run will never execute again.
    Completed,
    /// Aborted by a fatal error; eligible for re-admission.
    Failed,
}

impl RunStatus {
    /// Terminal statuses never transition again on their own.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Durable record of one inference run over a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    /// Deterministic id, `infer::{client}::{slug}`. Doubles as the
    /// idempotency key and the resumable-instance id.
    pub id: String,
    /// Owning client.
    pub client_name: String,
    /// Project slug.
    pub slug: String,
    /// Store id of the admitted project.
    pub project_id: String,
    /// Lifecycle status.
    pub status: RunStatus,
    /// Who asked for the run, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_by: Option<String>,
    /// When the run was first admitted.
    pub started_at: DateTime<Utc>,
    /// First transition into a terminal status; never cleared afterwards.
    pub completed_at: Option<DateTime<Utc>>,
    /// Floor count, known once enumeration happened.
    pub total_floors: Option<u32>,
    /// Floors fully processed so far.
    pub processed_floors: u32,
    /// Cumulative detection counters over processed floors.
    pub totals: DetectionCounts,
    /// Asset prefix the run's raw inference outputs land under.
    pub raw_outputs_prefix: String,
    /// Record creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

impl RunRecord {
    /// Fresh record for a new admission: Running, counters zeroed.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        target: &RunTarget,
        project_id: impl Into<String>,
        requested_by: Option<String>,
        raw_outputs_prefix: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            client_name: target.client_name.clone(),
            slug: target.slug.clone(),
            project_id: project_id.into(),
            status: RunStatus::Running,
            requested_by,
            started_at: now,
            completed_at: None,
            total_floors: None,
            processed_floors: 0,
            totals: DetectionCounts::ZERO,
            raw_outputs_prefix: raw_outputs_prefix.into(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Applies a partial update under the run lifecycle rules.
    ///
    /// `completed_at` is set exactly once, on the first transition into a
    /// terminal status, and survives re-admission. Progress-only patches
    /// (no status) must keep `totals` component-wise non-decreasing; a
    /// status-bearing patch may replace them outright, which is how a rerun
    /// resets a Failed attempt.
    pub fn apply(&mut self, patch: &RunPatch, now: DateTime<Utc>) -> Result<(), EngineError> {
        if let Some(totals) = patch.totals {
            if patch.status.is_none() && !totals.covers(self.totals) {
                return Err(EngineError::input_validation(format!(
                    "totals for run '{}' must not decrease",
                    self.id
                )));
            }
            self.totals = totals;
        }
        if let Some(total_floors) = patch.total_floors {
            self.total_floors = Some(total_floors);
        }
        if let Some(processed_floors) = patch.processed_floors {
            self.processed_floors = processed_floors;
        }
        if let Some(status) = patch.status {
            self.status = status;
            if status.is_terminal() && self.completed_at.is_none() {
                self.completed_at = Some(now);
            }
        }
        self.updated_at = now;
        Ok(())
    }
}

/// Partial update applied to a run record via read-modify-replace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunPatch {
    /// New lifecycle status.
    pub status: Option<RunStatus>,
    /// Floor count discovered by enumeration.
    pub total_floors: Option<u32>,
    /// Floors fully processed.
    pub processed_floors: Option<u32>,
    /// Cumulative detection counters.
    pub totals: Option<DetectionCounts>,
}

impl RunPatch {
    /// Empty patch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the status.
    #[must_use]
    pub const fn with_status(mut self, status: RunStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Sets the total floor count.
    #[must_use]
    pub const fn with_total_floors(mut self, total_floors: u32) -> Self {
        self.total_floors = Some(total_floors);
        self
    }

    /// Sets the processed floor count.
    #[must_use]
    pub const fn with_processed_floors(mut self, processed_floors: u32) -> Self {
        self.processed_floors = Some(processed_floors);
        self
    }

    /// Sets the cumulative totals.
    #[must_use]
    pub const fn with_totals(mut self, totals: DetectionCounts) -> Self {
        self.totals = Some(totals);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> RunRecord {
        RunRecord::new(
            "infer::acme::tower",
            &RunTarget::new("acme", "tower"),
            "proj-1",
            Some("user-7".to_string()),
            "projects/tower/inference/",
            Utc::now(),
        )
    }

    fn counts(columns: u64, polygons: u64) -> DetectionCounts {
        DetectionCounts {
            columns_detected: columns,
            beams_detected: 0,
            polygons_detected: polygons,
        }
    }

    #[test]
    fn test_new_record_is_running_and_zeroed() {
        let rec = record();
        assert_eq!(rec.status, RunStatus::Running);
        assert_eq!(rec.processed_floors, 0);
        assert_eq!(rec.totals, DetectionCounts::ZERO);
        assert!(rec.completed_at.is_none());
        assert!(rec.total_floors.is_none());
    }

    #[test]
    fn test_completed_at_set_once() {
        let mut rec = record();
        let first = Utc::now();
        rec.apply(&RunPatch::new().with_status(RunStatus::Failed), first)
            .unwrap();
        assert_eq!(rec.completed_at, Some(first));

        // Rerun reset and a later completion must not move the original stamp.
        rec.apply(
            &RunPatch::new()
                .with_status(RunStatus::Running)
                .with_totals(DetectionCounts::ZERO),
            Utc::now(),
        )
        .unwrap();
        rec.apply(&RunPatch::new().with_status(RunStatus::Completed), Utc::now())
            .unwrap();
        assert_eq!(rec.completed_at, Some(first));
    }

    #[test]
    fn test_progress_totals_must_not_decrease() {
        let mut rec = record();
        rec.apply(
            &RunPatch::new()
                .with_processed_floors(1)
                .with_totals(counts(5, 2)),
            Utc::now(),
        )
        .unwrap();

        let err = rec
            .apply(
                &RunPatch::new()
                    .with_processed_floors(2)
                    .with_totals(counts(4, 2)),
                Utc::now(),
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::InputValidation(_)));
        assert_eq!(rec.totals, counts(5, 2));
    }

    #[test]
    fn test_status_patch_may_reset_totals() {
        let mut rec = record();
        rec.apply(
            &RunPatch::new()
                .with_processed_floors(2)
                .with_totals(counts(5, 2)),
            Utc::now(),
        )
        .unwrap();

        rec.apply(
            &RunPatch::new()
                .with_status(RunStatus::Running)
                .with_processed_floors(0)
                .with_totals(DetectionCounts::ZERO),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(rec.totals, DetectionCounts::ZERO);
        assert_eq!(rec.processed_floors, 0);
    }

    #[test]
    fn test_counts_add_and_covers() {
        let a = counts(3, 1);
        let b = counts(2, 4);
        let sum = a.add(b);
        assert_eq!(sum, counts(5, 5));
        assert!(sum.covers(a));
        assert!(sum.covers(b));
        assert!(!a.covers(b));
    }

    #[test]
    fn test_record_serializes_camel_case() {
        let value = serde_json::to_value(record()).unwrap();
        assert!(value.get("processedFloors").is_some());
        assert!(value.get("rawOutputsPrefix").is_some());
        assert_eq!(value["status"], "Running");
        assert_eq!(value["totals"]["columnsDetected"], 0);
    }

    #[test]
    fn test_target_validation() {
        assert!(RunTarget::new("acme", "tower-2").validate().is_ok());
        assert!(RunTarget::new("ac me", "tower").validate().is_err());
        assert!(RunTarget::new("acme", "to/wer").validate().is_err());
    }
}

//! Advisory progress projections and the sinks that receive them.
//!
//! Projections are observability only: the engine re-publishes them while
//! replaying history, and losing one changes nothing durable. The run record
//! is the source of truth.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::record::DetectionCounts;

/// Coarse stage of a run, as surfaced to status queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStage {
    /// Admitted; floors not yet enumerated.
    Starting,
    /// Working through floors.
    Processing,
    /// All floors done.
    Completed,
    /// Aborted by an error.
    Failed,
}

/// Point-in-time, advisory view of a run's progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunProjection {
    /// The run being described.
    pub run_id: String,
    /// Coarse stage.
    pub stage: RunStage,
    /// Floors fully processed.
    pub processed: u32,
    /// Floor count, once enumeration happened.
    pub total: Option<u32>,
    /// Cumulative detection counters.
    pub totals: DetectionCounts,
}

impl RunProjection {
    /// Projection for a freshly admitted run.
    #[must_use]
    pub fn starting(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            stage: RunStage::Starting,
            processed: 0,
            total: None,
            totals: DetectionCounts::ZERO,
        }
    }

    /// Projection after a floor checkpoint.
    #[must_use]
    pub fn processing(
        run_id: impl Into<String>,
        processed: u32,
        total: u32,
        totals: DetectionCounts,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            stage: RunStage::Processing,
            processed,
            total: Some(total),
            totals,
        }
    }

    /// Projection for a finished run.
    #[must_use]
    pub fn completed(
        run_id: impl Into<String>,
        processed: u32,
        total: u32,
        totals: DetectionCounts,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            stage: RunStage::Completed,
            processed,
            total: Some(total),
            totals,
        }
    }

    /// Projection for an aborted run, carrying the last known progress.
    #[must_use]
    pub fn failed(
        run_id: impl Into<String>,
        processed: u32,
        total: Option<u32>,
        totals: DetectionCounts,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            stage: RunStage::Failed,
            processed,
            total,
            totals,
        }
    }
}

/// Receives advisory projections.
///
/// Implementations must never fail the pipeline: errors are the sink's
/// problem to log and swallow.
pub trait ProgressSink: Send + Sync {
    /// Publishes the latest projection for a run.
    fn publish(&self, projection: &RunProjection);
}

/// A no-op sink that discards all projections.
///
/// Used as the default when no sink is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpProgressSink;

impl ProgressSink for NoOpProgressSink {
    fn publish(&self, _projection: &RunProjection) {
        // Intentionally empty - discards all projections
    }
}

/// A sink that logs projections through the tracing framework.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingProgressSink;

impl LoggingProgressSink {
    /// Creates a new logging sink.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl ProgressSink for LoggingProgressSink {
    fn publish(&self, projection: &RunProjection) {
        info!(
            run_id = %projection.run_id,
            stage = ?projection.stage,
            processed = projection.processed,
            total = ?projection.total,
            "run progress"
        );
    }
}

/// A collecting sink for testing purposes.
#[derive(Debug, Default)]
pub struct CollectingProgressSink {
    projections: parking_lot::RwLock<Vec<RunProjection>>,
}

impl CollectingProgressSink {
    /// Creates a new collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected projections.
    #[must_use]
    pub fn projections(&self) -> Vec<RunProjection> {
        self.projections.read().clone()
    }

    /// Returns the most recent projection, if any.
    #[must_use]
    pub fn latest(&self) -> Option<RunProjection> {
        self.projections.read().last().cloned()
    }

    /// Returns the number of collected projections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.projections.read().len()
    }

    /// Returns true if nothing was collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.projections.read().is_empty()
    }

    /// Returns projections at the given stage.
    #[must_use]
    pub fn at_stage(&self, stage: RunStage) -> Vec<RunProjection> {
        self.projections
            .read()
            .iter()
            .filter(|p| p.stage == stage)
            .cloned()
            .collect()
    }

    /// Clears all collected projections.
    pub fn clear(&self) {
        self.projections.write().clear();
    }
}

impl ProgressSink for CollectingProgressSink {
    fn publish(&self, projection: &RunProjection) {
        self.projections.write().push(projection.clone());
    }
}

/// Retains the latest projection per run for status queries.
#[derive(Debug, Default)]
pub struct StatusBoard {
    latest: DashMap<String, RunProjection>,
}

impl StatusBoard {
    /// Creates an empty board.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest projection published for a run, if any.
    #[must_use]
    pub fn latest(&self, run_id: &str) -> Option<RunProjection> {
        self.latest.get(run_id).map(|entry| entry.clone())
    }

    /// Drops the retained projection for a run.
    pub fn forget(&self, run_id: &str) {
        self.latest.remove(run_id);
    }
}

impl ProgressSink for StatusBoard {
    fn publish(&self, projection: &RunProjection) {
        self.latest
            .insert(projection.run_id.clone(), projection.clone());
    }
}

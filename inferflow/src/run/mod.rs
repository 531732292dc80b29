//! Run lifecycle: durable records, step history, advisory projections.
//!
//! A run is the unit of admission and resumption. Its durable state splits
//! into the [`RunRecord`] (status and progress counters, read by status
//! queries) and the step history (replayed by the engine to resume after an
//! interruption). Projections are the advisory, lossy view published while
//! the run executes.

mod history;
mod projection;
mod record;

pub use history::{StepRecord, StepStatus};
pub use projection::{
    CollectingProgressSink, LoggingProgressSink, NoOpProgressSink, ProgressSink, RunProjection,
    RunStage, StatusBoard,
};
pub use record::{DetectionCounts, Floor, Project, RunPatch, RunRecord, RunStatus, RunTarget};

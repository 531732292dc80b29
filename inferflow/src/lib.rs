//! # Inferflow
//!
//! Durable orchestration of ML inference runs over floor-plan projects, with
//! convergent merges of detected features into live editor documents.
//!
//! Inferflow drives one run per project through a fixed per-floor step chain
//! and makes every step survivable:
//!
//! - **Durable execution**: every side-effecting step is recorded in an
//!   append-only history; an interrupted run resumes by replaying it instead
//!   of repeating completed work
//! - **Durable retries**: transient inference failures are recorded with
//!   their backoff, so budgets hold across process restarts
//! - **Convergent merges**: machine detections land in editor documents via
//!   compare-and-swap rounds that preserve concurrent human edits
//! - **Idempotent admission**: one deterministic run id per project; repeat
//!   requests attach to the existing run or report it done
//! - **Swappable storage**: every external system sits behind an async trait,
//!   with in-memory implementations for embedding and tests
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use inferflow::prelude::*;
//!
//! // Wire the service over storage collaborators and an inference client.
//! let config = EngineConfig::from_env()?;
//! let client = Arc::new(HttpInferenceClient::new(config.inference.clone())?);
//! let service = PipelineService::new(collaborators, client, config)?;
//!
//! // Kick off a run; a repeat request attaches to the existing record.
//! let target = RunTarget::new("acme", "tower");
//! match service.start_run(&target, Some("reviewer@acme.test")).await? {
//!     StartRunOutcome::Started { run_id, .. } => println!("started {run_id}"),
//!     StartRunOutcome::AlreadyProcessed { run_id } => println!("{run_id} already done"),
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod api;
pub mod config;
pub mod engine;
pub mod errors;
pub mod guard;
pub mod inference;
pub mod merge;
pub mod observability;
pub mod paths;
pub mod retry;
pub mod run;
pub mod stores;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::api::{PipelineService, RunStatusView, StartRunOutcome};
    pub use crate::config::{EngineConfig, InferenceConfig};
    pub use crate::engine::{RunEngine, RunOutcome};
    pub use crate::errors::{EngineError, InferenceError};
    pub use crate::guard::{Admission, RunGuard};
    pub use crate::inference::{
        Detection, DetectionBatch, InferenceClient, InferenceRequest, RequestMeta,
    };
    #[cfg(feature = "http")]
    pub use crate::inference::HttpInferenceClient;
    pub use crate::merge::{
        ChangeEvent, ChangeEventType, EditorDocument, Feature, FeatureSource, MergeConfig,
        MergeEngine, MergeOutcome, RunMeta,
    };
    pub use crate::retry::{RetryDecision, RetryPolicy};
    pub use crate::run::{
        DetectionCounts, Floor, ProgressSink, Project, RunProjection, RunRecord, RunStage,
        RunStatus, RunTarget, StatusBoard,
    };
    pub use crate::stores::{
        AssetStore, Collaborators, DocumentStore, EventStore, HistoryStore, ProjectStore,
        RunStore,
    };
}

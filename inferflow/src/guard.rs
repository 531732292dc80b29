//! Run-once admission.
//!
//! One run record exists per target, under a deterministic id that doubles as
//! the idempotency key. Creation conflicts are the serialization point: two
//! concurrent admissions race on `create_run`, the loser adopts the winner's
//! record, and both end up agreeing on a single run.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use crate::errors::EngineError;
use crate::paths::raw_outputs_prefix;
use crate::run::{RunRecord, RunStatus, RunTarget};
use crate::stores::{ProjectStore, RunStore};

/// Deterministic run id for a target.
#[must_use]
pub fn run_id_for_target(target: &RunTarget) -> String {
    format!("infer::{}::{}", target.client_name, target.slug)
}

/// What admission concluded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    /// True when a Completed run already covers this target; nothing should
    /// be executed.
    pub already_processed: bool,
    /// The target's run id, existing or just created.
    pub run_id: String,
    /// Store id of the project.
    pub project_id: String,
}

/// Admits runs: at most one record per target, reruns only after failure.
pub struct RunGuard {
    projects: Arc<dyn ProjectStore>,
    runs: Arc<dyn RunStore>,
}

impl RunGuard {
    /// Wires a guard over its stores.
    #[must_use]
    pub fn new(projects: Arc<dyn ProjectStore>, runs: Arc<dyn RunStore>) -> Self {
        Self { projects, runs }
    }

    /// Admits a run for the target.
    ///
    /// A missing project is [`EngineError::NotFound`]. A `Completed` record
    /// short-circuits as already-processed. `Running` and `Failed` records
    /// hand back the existing id: resume and rerun both execute under it.
    /// Otherwise a fresh record is created; losing the creation race re-reads
    /// the winner and applies the same rules to it.
    pub async fn admit(
        &self,
        target: &RunTarget,
        requested_by: Option<&str>,
    ) -> Result<Admission, EngineError> {
        target.validate()?;
        let project = self.projects.find_project(target).await?;
        let run_id = run_id_for_target(target);

        if let Some(existing) = self.runs.read_run(&run_id).await? {
            return Ok(Self::admission_for(&existing, project.id));
        }

        let record = RunRecord::new(
            run_id.as_str(),
            target,
            project.id.as_str(),
            requested_by.map(str::to_string),
            raw_outputs_prefix(&target.slug)?,
            Utc::now(),
        );
        match self.runs.create_run(record).await {
            Ok(created) => {
                info!(run_id = %created.id, client = %target.client_name, slug = %target.slug, "run admitted");
                Ok(Admission {
                    already_processed: false,
                    run_id: created.id,
                    project_id: project.id,
                })
            }
            Err(EngineError::ConflictOnCreate(_)) => {
                let existing = self.runs.read_run(&run_id).await?.ok_or_else(|| {
                    EngineError::not_found(format!("run '{run_id}'"))
                })?;
                debug!(run_id = %existing.id, "lost the admission race, adopting the winner");
                Ok(Self::admission_for(&existing, project.id))
            }
            Err(other) => Err(other),
        }
    }

    fn admission_for(existing: &RunRecord, project_id: String) -> Admission {
        let already_processed = existing.status == RunStatus::Completed;
        if already_processed {
            debug!(run_id = %existing.id, "target already processed");
        } else {
            debug!(run_id = %existing.id, status = ?existing.status, "reusing existing run record");
        }
        Admission {
            already_processed,
            run_id: existing.id.clone(),
            project_id,
        }
    }
}

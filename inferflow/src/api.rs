//! Embedding surface: admission, launch, and status queries in one place.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use crate::config::EngineConfig;
use crate::engine::{RunEngine, RunOutcome};
use crate::errors::EngineError;
use crate::guard::RunGuard;
use crate::inference::InferenceClient;
use crate::run::{DetectionCounts, ProgressSink, RunStage, RunStatus, RunTarget, StatusBoard};
use crate::stores::{Collaborators, RunStore};

/// What [`PipelineService::start_run`] concluded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartRunOutcome {
    /// A run was admitted and handed to a background task.
    Started {
        /// The run executing in the background.
        run_id: String,
        /// Project it covers.
        project_id: String,
    },
    /// A Completed run already covers the target; nothing was started.
    AlreadyProcessed {
        /// The run that covered it.
        run_id: String,
    },
}

/// Durable run state enriched with the latest advisory stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStatusView {
    /// The run.
    pub run_id: String,
    /// Durable lifecycle status.
    pub status: RunStatus,
    /// Advisory stage from the progress stream, when one was published this
    /// process lifetime.
    pub stage: Option<RunStage>,
    /// Floors fully processed.
    pub processed_floors: u32,
    /// Floor count, once enumerated.
    pub total_floors: Option<u32>,
    /// Cumulative detection counters.
    pub totals: DetectionCounts,
    /// When the run was first admitted.
    pub started_at: DateTime<Utc>,
    /// When it reached a terminal status, if it has.
    pub completed_at: Option<DateTime<Utc>>,
    /// Who asked for it.
    pub requested_by: Option<String>,
    /// Project it covers.
    pub project_id: String,
}

/// Ties the guard, the engine, and a status board together.
pub struct PipelineService {
    guard: RunGuard,
    engine: Arc<RunEngine>,
    runs: Arc<dyn RunStore>,
    board: Arc<StatusBoard>,
}

impl PipelineService {
    /// Wires a service over a collaborator set and an inference client.
    ///
    /// The configuration is validated here so a bad attempt-budget product
    /// is rejected at startup, not at the first struggling run.
    pub fn new(
        collaborators: Collaborators,
        inference: Arc<dyn InferenceClient>,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let board = Arc::new(StatusBoard::new());
        let engine = RunEngine::new(collaborators.clone(), inference, config)
            .with_progress_sink(Arc::clone(&board) as Arc<dyn ProgressSink>);
        Ok(Self {
            guard: RunGuard::new(
                Arc::clone(&collaborators.projects),
                Arc::clone(&collaborators.runs),
            ),
            engine: Arc::new(engine),
            runs: collaborators.runs,
            board,
        })
    }

    /// Admits a run and launches it without waiting.
    ///
    /// The engine executes on a spawned task and persists its own terminal
    /// status; callers poll [`run_status`](Self::run_status). Admitting a
    /// target whose run is already `Completed` starts nothing.
    pub async fn start_run(
        &self,
        target: &RunTarget,
        requested_by: Option<&str>,
    ) -> Result<StartRunOutcome, EngineError> {
        let admission = self.guard.admit(target, requested_by).await?;
        if admission.already_processed {
            return Ok(StartRunOutcome::AlreadyProcessed {
                run_id: admission.run_id,
            });
        }

        let engine = Arc::clone(&self.engine);
        let target = target.clone();
        let run_id = admission.run_id.clone();
        tokio::spawn(async move {
            if let Err(error) = engine.run(&target, &run_id).await {
                warn!(%run_id, error = %error, "background run failed");
            }
        });

        Ok(StartRunOutcome::Started {
            run_id: admission.run_id,
            project_id: admission.project_id,
        })
    }

    /// Admits a run and drives it to completion inline.
    ///
    /// Idempotent at the result level: a target whose run is already
    /// `Completed` returns the recorded outcome without executing anything.
    pub async fn execute_run(
        &self,
        target: &RunTarget,
        requested_by: Option<&str>,
    ) -> Result<RunOutcome, EngineError> {
        let admission = self.guard.admit(target, requested_by).await?;
        if admission.already_processed {
            let record = self
                .runs
                .read_run(&admission.run_id)
                .await?
                .ok_or_else(|| EngineError::not_found(format!("run '{}'", admission.run_id)))?;
            return Ok(RunOutcome {
                run_id: record.id,
                project_id: record.project_id,
                floors_processed: record.processed_floors,
                totals: record.totals,
            });
        }
        self.engine.run(target, &admission.run_id).await
    }

    /// Status of a run: the durable record plus the latest advisory stage.
    pub async fn run_status(&self, run_id: &str) -> Result<RunStatusView, EngineError> {
        let record = self
            .runs
            .read_run(run_id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("run '{run_id}'")))?;
        let stage = self.board.latest(run_id).map(|projection| projection.stage);
        Ok(RunStatusView {
            run_id: record.id,
            status: record.status,
            stage,
            processed_floors: record.processed_floors,
            total_floors: record.total_floors,
            totals: record.totals,
            started_at: record.started_at,
            completed_at: record.completed_at,
            requested_by: record.requested_by,
            project_id: record.project_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::Floor;
    use crate::stores::{InMemoryAssetStore, InMemoryProjectStore};
    use crate::testing::{sample_payload, ScriptedInferenceClient};
    use std::time::Duration;

    fn target() -> RunTarget {
        RunTarget::new("acme", "tower")
    }

    fn floor(id: &str) -> Floor {
        Floor {
            id: id.to_string(),
            name: None,
            plan_key: format!("plans/{id}.png"),
            image_width: Some(2000),
            image_height: Some(1500),
            paper_scale_denominator: Some(50.0),
            paper_scale_text: None,
            editor_state_url: None,
        }
    }

    fn service_with_floors(floor_ids: &[&str]) -> (PipelineService, Arc<InMemoryProjectStore>) {
        let projects = Arc::new(InMemoryProjectStore::new());
        projects.add_project(&target());
        for id in floor_ids {
            projects.add_floor(&target(), floor(id));
        }
        let collaborators = Collaborators {
            projects: projects.clone(),
            runs: Arc::new(crate::stores::InMemoryRunStore::new()),
            documents: Arc::new(crate::stores::InMemoryDocumentStore::new()),
            events: Arc::new(crate::stores::InMemoryEventStore::new()),
            assets: Arc::new(InMemoryAssetStore::new()),
            history: Arc::new(crate::stores::InMemoryHistoryStore::new()),
        };
        let client = Arc::new(ScriptedInferenceClient::always_ok(sample_payload(2, 1)));
        let service =
            PipelineService::new(collaborators, client, EngineConfig::default()).unwrap();
        (service, projects)
    }

    #[tokio::test]
    async fn test_execute_run_processes_all_floors() {
        let (service, _projects) = service_with_floors(&["f1", "f2"]);
        let outcome = service.execute_run(&target(), Some("user-7")).await.unwrap();
        assert_eq!(outcome.run_id, "infer::acme::tower");
        assert_eq!(outcome.floors_processed, 2);
        assert_eq!(outcome.totals.columns_detected, 4);
        assert_eq!(outcome.totals.polygons_detected, 2);

        let status = service.run_status(&outcome.run_id).await.unwrap();
        assert_eq!(status.status, RunStatus::Completed);
        assert_eq!(status.stage, Some(RunStage::Completed));
        assert_eq!(status.processed_floors, 2);
        assert!(status.completed_at.is_some());
        assert_eq!(status.requested_by.as_deref(), Some("user-7"));
    }

    #[tokio::test]
    async fn test_execute_run_is_idempotent_at_the_result_level() {
        let (service, _projects) = service_with_floors(&["f1"]);
        let first = service.execute_run(&target(), None).await.unwrap();
        let second = service.execute_run(&target(), None).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_start_run_reports_already_processed() {
        let (service, _projects) = service_with_floors(&["f1"]);
        service.execute_run(&target(), None).await.unwrap();

        let outcome = service.start_run(&target(), None).await.unwrap();
        assert_eq!(
            outcome,
            StartRunOutcome::AlreadyProcessed {
                run_id: "infer::acme::tower".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_start_run_completes_in_the_background() {
        let (service, _projects) = service_with_floors(&["f1"]);
        let outcome = service.start_run(&target(), None).await.unwrap();
        let run_id = match outcome {
            StartRunOutcome::Started { run_id, .. } => run_id,
            other => panic!("expected Started, got {other:?}"),
        };

        let mut status = service.run_status(&run_id).await.unwrap();
        for _ in 0..200 {
            if status.status == RunStatus::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            status = service.run_status(&run_id).await.unwrap();
        }
        assert_eq!(status.status, RunStatus::Completed);
        assert_eq!(status.processed_floors, 1);
    }

    #[tokio::test]
    async fn test_status_of_unknown_run_is_not_found() {
        let (service, _projects) = service_with_floors(&[]);
        let err = service.run_status("infer::nope::nope").await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_service_rejects_invalid_config() {
        let projects = Arc::new(InMemoryProjectStore::new());
        projects.add_project(&target());
        let collaborators = Collaborators::in_memory();
        let client = Arc::new(ScriptedInferenceClient::always_ok(sample_payload(1, 0)));
        let mut config = EngineConfig::default();
        config.inference.max_attempts = 9;
        assert!(PipelineService::new(collaborators, client, config).is_err());
    }
}

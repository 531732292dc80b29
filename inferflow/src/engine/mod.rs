//! Durable, floor-by-floor execution of inference runs.
//!
//! Every side-effecting step goes through the [`StepRecorder`], so a run that
//! dies mid-flight resumes from its recorded history instead of repeating
//! completed work. Whether a start is a resume or a rerun is decided by the
//! run record: `Running` means the previous execution was interrupted and its
//! history replays; `Failed` means the history belongs to a dead attempt and
//! is cleared first.

mod recorder;


use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::errors::EngineError;
use crate::inference::{DetectionBatch, InferenceClient, InferenceRequest, RequestMeta};
use crate::merge::{DocumentKey, MergeEngine, MergeOutcome, RunMeta};
use crate::paths::raw_inference_path;
use crate::retry::RetryDecision;
use crate::run::{
    DetectionCounts, Floor, NoOpProgressSink, ProgressSink, Project, RunPatch, RunProjection,
    RunRecord, RunStatus, RunTarget,
};
use crate::stores::{
    AssetStore, Collaborators, DocumentStore, HistoryStore, ProjectStore, RunStore,
};

pub use recorder::{AttemptOutcome, StepRecorder};

/// What a finished run produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOutcome {
    /// The run.
    pub run_id: String,
    /// Project the run covered.
    pub project_id: String,
    /// Floors processed.
    pub floors_processed: u32,
    /// Cumulative detection counters.
    pub totals: DetectionCounts,
}

/// Recorded result of the project/floor enumeration step.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProjectFloors {
    project: Project,
    floors: Vec<Floor>,
}

/// Recorded result of the pre-inference document probe.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PriorDocumentState {
    exists: bool,
    revision: Option<u64>,
    feature_count: u64,
}

/// Recorded result of a run-record update step.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunCheckpoint {
    processed_floors: u32,
    totals: DetectionCounts,
}

impl From<&RunRecord> for RunCheckpoint {
    fn from(record: &RunRecord) -> Self {
        Self {
            processed_floors: record.processed_floors,
            totals: record.totals,
        }
    }
}

/// Executes admitted runs.
pub struct RunEngine {
    projects: Arc<dyn ProjectStore>,
    runs: Arc<dyn RunStore>,
    documents: Arc<dyn DocumentStore>,
    history: Arc<dyn HistoryStore>,
    assets: Arc<dyn AssetStore>,
    inference: Arc<dyn InferenceClient>,
    merge: MergeEngine,
    progress: Arc<dyn ProgressSink>,
    config: EngineConfig,
}

impl RunEngine {
    /// Wires an engine over a collaborator set.
    #[must_use]
    pub fn new(
        collaborators: Collaborators,
        inference: Arc<dyn InferenceClient>,
        config: EngineConfig,
    ) -> Self {
        let merge = MergeEngine::new(
            Arc::clone(&collaborators.documents),
            Arc::clone(&collaborators.events),
            Arc::clone(&collaborators.assets),
            config.merge.clone(),
        );
        Self {
            projects: collaborators.projects,
            runs: collaborators.runs,
            documents: collaborators.documents,
            history: collaborators.history,
            assets: collaborators.assets,
            inference,
            merge,
            progress: Arc::new(NoOpProgressSink),
            config,
        }
    }

    /// Replaces the progress sink.
    #[must_use]
    pub fn with_progress_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = sink;
        self
    }

    /// Drives an admitted run to a terminal status.
    ///
    /// On error the run record is moved to `Failed` (best effort) and the
    /// error propagates; the recorded history stays put so the failure can
    /// be inspected until a rerun clears it.
    pub async fn run(&self, target: &RunTarget, run_id: &str) -> Result<RunOutcome, EngineError> {
        target.validate()?;
        self.progress.publish(&RunProjection::starting(run_id));
        info!(
            %run_id,
            client = %target.client_name,
            slug = %target.slug,
            "run starting"
        );

        match self.drive(target, run_id).await {
            Ok(outcome) => {
                info!(
                    %run_id,
                    floors = outcome.floors_processed,
                    columns = outcome.totals.columns_detected,
                    polygons = outcome.totals.polygons_detected,
                    "run completed"
                );
                Ok(outcome)
            }
            Err(error) => {
                warn!(%run_id, error = %error, "run failed");
                self.mark_failed(run_id).await;
                Err(error)
            }
        }
    }

    async fn drive(&self, target: &RunTarget, run_id: &str) -> Result<RunOutcome, EngineError> {
        if let Some(existing) = self.runs.read_run(run_id).await? {
            if existing.status == RunStatus::Failed {
                // The recorded steps belong to the failed attempt; a rerun
                // starts from nothing.
                self.history.clear_history(run_id).await?;
                info!(%run_id, "rerunning a failed run from scratch");
            }
        }

        let mut recorder = StepRecorder::load(run_id, Arc::clone(&self.history)).await?;
        if recorder.is_replaying() {
            info!(
                %run_id,
                recorded_steps = recorder.record_count(),
                "resuming from recorded history"
            );
        }

        let bundle: ProjectFloors = recorder
            .step("fetch-project-floors", || async {
                let project = self.projects.find_project(target).await?;
                let floors = self.projects.list_floors(target).await?;
                Ok(ProjectFloors { project, floors })
            })
            .await?;

        let total = u32::try_from(bundle.floors.len()).unwrap_or(u32::MAX);
        recorder
            .step::<RunCheckpoint, _, _>("init-run", || async {
                let record = self
                    .runs
                    .update_run(
                        run_id,
                        RunPatch::new()
                            .with_status(RunStatus::Running)
                            .with_total_floors(total)
                            .with_processed_floors(0)
                            .with_totals(DetectionCounts::ZERO),
                    )
                    .await?;
                Ok(RunCheckpoint::from(&record))
            })
            .await?;
        self.progress
            .publish(&RunProjection::processing(run_id, 0, total, DetectionCounts::ZERO));

        let mut totals = DetectionCounts::ZERO;
        let mut processed: u32 = 0;
        for floor in &bundle.floors {
            let counts = self.process_floor(&mut recorder, target, run_id, floor).await?;
            totals = totals.add(counts);
            processed += 1;

            let checkpoint_step = format!("record-progress:{}", floor.id);
            recorder
                .step::<RunCheckpoint, _, _>(&checkpoint_step, || async {
                    let record = self
                        .runs
                        .update_run(
                            run_id,
                            RunPatch::new()
                                .with_processed_floors(processed)
                                .with_totals(totals),
                        )
                        .await?;
                    Ok(RunCheckpoint::from(&record))
                })
                .await?;
            self.progress
                .publish(&RunProjection::processing(run_id, processed, total, totals));
            debug!(%run_id, floor = %floor.id, processed, total, "floor checkpointed");
        }

        recorder
            .step::<RunCheckpoint, _, _>("finalize-run", || async {
                let record = self
                    .runs
                    .update_run(
                        run_id,
                        RunPatch::new()
                            .with_status(RunStatus::Completed)
                            .with_totals(totals),
                    )
                    .await?;
                Ok(RunCheckpoint::from(&record))
            })
            .await?;
        self.progress
            .publish(&RunProjection::completed(run_id, processed, total, totals));

        Ok(RunOutcome {
            run_id: run_id.to_string(),
            project_id: bundle.project.id,
            floors_processed: processed,
            totals,
        })
    }

    /// Runs the per-floor step chain and returns the floor's counts.
    async fn process_floor(
        &self,
        recorder: &mut StepRecorder,
        target: &RunTarget,
        run_id: &str,
        floor: &Floor,
    ) -> Result<DetectionCounts, EngineError> {
        let key = DocumentKey::for_floor(target, floor);

        let prior: PriorDocumentState = recorder
            .step(&format!("read-editor-state:{}", floor.id), || async {
                let found = self.documents.read_document(&key.document_id()).await?;
                Ok(found.map_or(
                    PriorDocumentState {
                        exists: false,
                        revision: None,
                        feature_count: 0,
                    },
                    |versioned| PriorDocumentState {
                        exists: true,
                        revision: Some(versioned.document.revision),
                        feature_count: versioned.document.features.len() as u64,
                    },
                ))
            })
            .await?;
        // The merge would fail the same way after the inference call; this
        // check fails before the expensive part.
        if !prior.exists && key.basemap.is_none() {
            return Err(EngineError::input_validation(format!(
                "floor '{}' has no editor document and no basemap dimensions to create one",
                floor.id
            )));
        }

        let image_url: String = recorder
            .step(&format!("issue-read-url:{}", floor.id), || async {
                self.assets
                    .issue_read_url(&floor.plan_key, self.config.read_url_ttl)
                    .await
            })
            .await?;

        let batch = self
            .call_inference(recorder, target, run_id, floor, &image_url)
            .await?;

        let raw_key = raw_inference_path(&target.slug, &floor.id)?;
        recorder
            .step::<String, _, _>(&format!("persist-raw:{}", floor.id), || async {
                let content = serde_json::to_string_pretty(batch.payload())?;
                self.assets
                    .write_text(&raw_key, &content, "application/json")
                    .await?;
                Ok(raw_key.clone())
            })
            .await?;

        let meta = RunMeta {
            run_id: run_id.to_string(),
            model: self.config.inference.deployment.clone(),
        };
        let outcome: MergeOutcome = recorder
            .step(&format!("merge-features:{}", floor.id), || async {
                self.merge.merge_features(&key, &batch, &meta).await
            })
            .await?;

        let counts = outcome.counts;
        recorder
            .step::<DetectionCounts, _, _>(&format!("update-floor-metrics:{}", floor.id), || async {
                self.projects
                    .update_floor_metrics(target, &floor.id, counts)
                    .await?;
                Ok(counts)
            })
            .await?;

        Ok(counts)
    }

    /// The durable retry loop around the external call.
    ///
    /// Each attempt is its own step. Retryable failures are recorded with
    /// their backoff before the sleep, so a resume replays the wait as
    /// already-served and re-executes only the attempt that never finished.
    /// Fatal and budget-exhausting failures are never recorded; the run
    /// fails and a rerun starts the loop fresh.
    async fn call_inference(
        &self,
        recorder: &mut StepRecorder,
        target: &RunTarget,
        run_id: &str,
        floor: &Floor,
        image_url: &str,
    ) -> Result<DetectionBatch, EngineError> {
        let request = InferenceRequest {
            image_url: image_url.to_string(),
            meta: RequestMeta {
                client_name: target.client_name.clone(),
                slug: target.slug.clone(),
                floor_id: floor.id.clone(),
                plan_key: floor.plan_key.clone(),
            },
        };
        let policy = &self.config.retry;
        let mut attempts: u32 = 0;
        let mut cumulative = Duration::ZERO;

        loop {
            attempts += 1;
            let step_name = format!("call-inference:{}:attempt-{attempts}", floor.id);
            let outcome = recorder
                .attempt(&step_name, || async { self.inference.infer(&request).await })
                .await?;
            match outcome {
                AttemptOutcome::Completed(batch) => {
                    if attempts > 1 {
                        info!(%run_id, floor = %floor.id, attempts, "inference succeeded after retries");
                    }
                    return Ok(batch);
                }
                AttemptOutcome::ReplayedFailure { error, delay } => {
                    cumulative = cumulative.saturating_add(delay);
                    debug!(%run_id, step = %step_name, error = %error, "replayed recorded attempt failure");
                    // Mirrors the live budget checks; a policy tightened
                    // between executions still cuts the loop off the same way.
                    if attempts >= policy.max_attempts || cumulative > policy.retry_timeout {
                        return Err(EngineError::RetryExhausted {
                            attempts,
                            elapsed: cumulative,
                            last_error: error,
                        });
                    }
                }
                AttemptOutcome::LiveFailure(error) => {
                    match policy.evaluate(&error, attempts, cumulative) {
                        RetryDecision::Retry(delay) => {
                            warn!(
                                %run_id,
                                floor = %floor.id,
                                attempt = attempts,
                                max_attempts = policy.max_attempts,
                                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                                error = %error,
                                "inference attempt failed, backing off"
                            );
                            recorder
                                .record_transient_failure(&step_name, &error, delay)
                                .await?;
                            cumulative = cumulative.saturating_add(delay);
                            tokio::time::sleep(delay).await;
                        }
                        RetryDecision::Fatal => {
                            warn!(%run_id, floor = %floor.id, error = %error, "inference failed fatally");
                            return Err(EngineError::Inference(error));
                        }
                        RetryDecision::Exhausted => {
                            warn!(
                                %run_id,
                                floor = %floor.id,
                                attempts,
                                error = %error,
                                "inference retry budget exhausted"
                            );
                            return Err(EngineError::RetryExhausted {
                                attempts,
                                elapsed: cumulative,
                                last_error: error.to_string(),
                            });
                        }
                    }
                }
            }
        }
    }

    /// Moves the run record to `Failed`. The original error propagates
    /// regardless of whether this write lands.
    async fn mark_failed(&self, run_id: &str) {
        match self
            .runs
            .update_run(run_id, RunPatch::new().with_status(RunStatus::Failed))
            .await
        {
            Ok(record) => {
                self.progress.publish(&RunProjection::failed(
                    run_id,
                    record.processed_floors,
                    record.total_floors,
                    record.totals,
                ));
            }
            Err(error) => {
                warn!(%run_id, error = %error, "could not persist Failed status");
                self.progress.publish(&RunProjection::failed(
                    run_id,
                    0,
                    None,
                    DetectionCounts::ZERO,
                ));
            }
        }
    }
}

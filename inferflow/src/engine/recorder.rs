//! Step recording and replay.
//!
//! The recorder is a cursor over a run's step history. While recorded steps
//! remain it replays them instead of executing; once the cursor passes the
//! end, steps execute live and append records as they finish. A record is
//! written only after its step's side effect completed, so replay never
//! resurrects an effect that did not happen.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::errors::{EngineError, InferenceError};
use crate::run::{StepRecord, StepStatus};
use crate::stores::HistoryStore;

/// What one [`StepRecorder::attempt`] produced.
#[derive(Debug)]
pub enum AttemptOutcome<T> {
    /// A result, fresh or replayed.
    Completed(T),
    /// A retryable failure replayed from history. The recorded backoff was
    /// already slept through before the crash; no sleep is owed.
    ReplayedFailure {
        /// Rendered error of the original failure.
        error: String,
        /// Backoff that was scheduled after it.
        delay: Duration,
    },
    /// The operation ran now and failed; not yet recorded or classified.
    LiveFailure(InferenceError),
}

/// Replay cursor plus append log for one run.
pub struct StepRecorder {
    run_id: String,
    history: Arc<dyn HistoryStore>,
    records: Vec<StepRecord>,
    cursor: usize,
}

impl StepRecorder {
    /// Loads the recorded history for a run and positions the cursor at the
    /// start.
    pub async fn load(
        run_id: impl Into<String>,
        history: Arc<dyn HistoryStore>,
    ) -> Result<Self, EngineError> {
        let run_id = run_id.into();
        let records = history.load_history(&run_id).await?;
        Ok(Self {
            run_id,
            history,
            records,
            cursor: 0,
        })
    }

    /// True while recorded steps remain to replay.
    #[must_use]
    pub fn is_replaying(&self) -> bool {
        self.cursor < self.records.len()
    }

    /// Number of records loaded from history.
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    /// Runs a step at most once.
    ///
    /// A recorded completion short-circuits to its stored result without
    /// executing `op`. Otherwise `op` runs and its result is recorded before
    /// this returns. A transient-failure record under this name means the
    /// history was written by the retrying variant; replaying it here is a
    /// mismatch.
    pub async fn step<T, F, Fut>(&mut self, name: &str, op: F) -> Result<T, EngineError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        if let Some(record) = self.replay_next(name)? {
            return match record.status {
                StepStatus::Completed => Ok(serde_json::from_value(record.payload.clone())?),
                StepStatus::TransientFailure => Err(EngineError::ReplayMismatch {
                    index: record.index,
                    recorded: format!("{} (transient failure)", record.name),
                    executed: name.to_string(),
                }),
            };
        }

        let value = op().await?;
        let record = StepRecord::completed(
            self.next_index(),
            name,
            serde_json::to_value(&value)?,
            Utc::now(),
        );
        self.append(record).await?;
        Ok(value)
    }

    /// Variant of [`step`](Self::step) for the durable retry loop.
    ///
    /// Completed records replay as results and transient-failure records as
    /// failures carrying their recorded backoff. A live failure comes back
    /// unrecorded: the caller classifies it and either records it via
    /// [`record_transient_failure`](Self::record_transient_failure) or lets
    /// the run fail with nothing written, keeping the final attempt of a
    /// budget re-executable.
    pub async fn attempt<T, F, Fut>(
        &mut self,
        name: &str,
        op: F,
    ) -> Result<AttemptOutcome<T>, EngineError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, InferenceError>>,
    {
        if let Some(record) = self.replay_next(name)? {
            return match record.status {
                StepStatus::Completed => Ok(AttemptOutcome::Completed(serde_json::from_value(
                    record.payload.clone(),
                )?)),
                StepStatus::TransientFailure => Ok(AttemptOutcome::ReplayedFailure {
                    error: record
                        .recorded_error()
                        .unwrap_or("transient failure")
                        .to_string(),
                    delay: record.recorded_delay().unwrap_or_default(),
                }),
            };
        }

        match op().await {
            Ok(value) => {
                let record = StepRecord::completed(
                    self.next_index(),
                    name,
                    serde_json::to_value(&value)?,
                    Utc::now(),
                );
                self.append(record).await?;
                Ok(AttemptOutcome::Completed(value))
            }
            Err(error) => Ok(AttemptOutcome::LiveFailure(error)),
        }
    }

    /// Records a retryable failure and the backoff scheduled after it.
    ///
    /// Called before the sleep, so a crash mid-backoff replays the failure
    /// instead of repeating the call.
    pub async fn record_transient_failure(
        &mut self,
        name: &str,
        error: &InferenceError,
        delay: Duration,
    ) -> Result<(), EngineError> {
        let record = StepRecord::transient_failure(
            self.next_index(),
            name,
            &error.to_string(),
            delay,
            Utc::now(),
        );
        self.append(record).await
    }

    fn replay_next(&mut self, name: &str) -> Result<Option<&StepRecord>, EngineError> {
        if self.cursor >= self.records.len() {
            return Ok(None);
        }
        let record = &self.records[self.cursor];
        if record.name != name {
            return Err(EngineError::ReplayMismatch {
                index: record.index,
                recorded: record.name.clone(),
                executed: name.to_string(),
            });
        }
        self.cursor += 1;
        Ok(Some(&self.records[self.cursor - 1]))
    }

    fn next_index(&self) -> u64 {
        self.records.len() as u64
    }

    async fn append(&mut self, record: StepRecord) -> Result<(), EngineError> {
        self.history.append_step(&self.run_id, record.clone()).await?;
        self.records.push(record);
        self.cursor = self.records.len();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::InMemoryHistoryStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    const RUN: &str = "infer::acme::tower";

    async fn recorder(history: &Arc<InMemoryHistoryStore>) -> StepRecorder {
        StepRecorder::load(RUN, history.clone() as Arc<dyn HistoryStore>)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_step_executes_once_then_replays() {
        let history = Arc::new(InMemoryHistoryStore::new());
        let calls = AtomicU32::new(0);

        let mut first = recorder(&history).await;
        let value: u32 = first
            .step("fetch-project-floors", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(42)
            })
            .await
            .unwrap();
        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let mut second = recorder(&history).await;
        assert!(second.is_replaying());
        let value: u32 = second
            .step("fetch-project-floors", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(7)
            })
            .await
            .unwrap();
        assert_eq!(value, 42, "replay returns the recorded result");
        assert_eq!(calls.load(Ordering::SeqCst), 1, "op must not re-execute");
        assert!(!second.is_replaying());
    }

    #[tokio::test]
    async fn test_replay_rejects_out_of_order_step() {
        let history = Arc::new(InMemoryHistoryStore::new());
        let mut first = recorder(&history).await;
        first
            .step("init-run", || async { Ok(1u32) })
            .await
            .unwrap();

        let mut second = recorder(&history).await;
        let err = second
            .step::<u32, _, _>("finalize-run", || async { Ok(2) })
            .await
            .unwrap_err();
        match err {
            EngineError::ReplayMismatch {
                recorded, executed, ..
            } => {
                assert_eq!(recorded, "init-run");
                assert_eq!(executed, "finalize-run");
            }
            other => panic!("expected ReplayMismatch, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_attempt_replays_failure_without_executing() {
        let history = Arc::new(InMemoryHistoryStore::new());
        let mut first = recorder(&history).await;
        first
            .record_transient_failure(
                "call-inference:f1:attempt-1",
                &InferenceError::http(503, "busy"),
                Duration::from_millis(2_100),
            )
            .await
            .unwrap();

        let calls = AtomicU32::new(0);
        let mut second = recorder(&history).await;
        let outcome: AttemptOutcome<u32> = second
            .attempt("call-inference:f1:attempt-1", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(9)
            })
            .await
            .unwrap();
        match outcome {
            AttemptOutcome::ReplayedFailure { error, delay } => {
                assert!(error.contains("503"));
                assert_eq!(delay, Duration::from_millis(2_100));
            }
            other => panic!("expected ReplayedFailure, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_live_failure_is_not_recorded() {
        let history = Arc::new(InMemoryHistoryStore::new());
        let mut recorder = recorder(&history).await;
        let outcome: AttemptOutcome<u32> = recorder
            .attempt("call-inference:f1:attempt-1", || async {
                Err(InferenceError::http(400, "bad request"))
            })
            .await
            .unwrap();
        assert!(matches!(outcome, AttemptOutcome::LiveFailure(_)));
        assert_eq!(history.len(RUN), 0);
    }

    #[tokio::test]
    async fn test_plain_step_over_failure_record_is_a_mismatch() {
        let history = Arc::new(InMemoryHistoryStore::new());
        let mut first = recorder(&history).await;
        first
            .record_transient_failure(
                "call-inference:f1:attempt-1",
                &InferenceError::connect("reset"),
                Duration::from_secs(2),
            )
            .await
            .unwrap();

        let mut second = recorder(&history).await;
        let err = second
            .step::<u32, _, _>("call-inference:f1:attempt-1", || async { Ok(0) })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ReplayMismatch { .. }));
    }

    #[tokio::test]
    async fn test_indices_continue_across_resume() {
        let history = Arc::new(InMemoryHistoryStore::new());
        let mut first = recorder(&history).await;
        first.step("a", || async { Ok(1u32) }).await.unwrap();
        first.step("b", || async { Ok(2u32) }).await.unwrap();

        let mut second = recorder(&history).await;
        let _: u32 = second.step("a", || async { Ok(0) }).await.unwrap();
        let _: u32 = second.step("b", || async { Ok(0) }).await.unwrap();
        second.step("c", || async { Ok(3u32) }).await.unwrap();

        let records = history.load_history(RUN).await.unwrap();
        let indices: Vec<u64> = records.iter().map(|r| r.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }
}

use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Value};

use crate::backoff;
use crate::error::QueueError;
use crate::job::{Job, JobState};
use crate::store::Store;
use crate::telemetry;
use crate::worker::{Outcome, Worker, WorkerRegistry};

/// Whether handler errors are swallowed after being recorded (normal
/// operation) or surfaced to the caller (tests).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Record,
    Propagate,
}

/// The recorded result of running a single job.
pub struct Execution {
    pub job_id: i64,
    pub state: JobState,
    /// The handler's error, present only under [`ExecutionMode::Propagate`].
    pub error: Option<anyhow::Error>,
}

/// Runs one fetched job: dispatches to the resolved worker, classifies the
/// outcome, records the transition, and emits `oban.job.*` telemetry.
///
/// Errors returned from [`Executor::execute`] are storage failures; handler
/// failures are recorded in the job itself and never propagate to the
/// producer.
pub struct Executor {
    job: Job,
    store: Store,
    registry: Arc<WorkerRegistry>,
    mode: ExecutionMode,
}

impl Executor {
    pub fn new(job: Job, store: Store, registry: Arc<WorkerRegistry>, mode: ExecutionMode) -> Self {
        Self {
            job,
            store,
            registry,
            mode,
        }
    }

    pub async fn execute(self) -> Result<Execution, QueueError> {
        let started = Instant::now();

        telemetry::execute(
            "oban.job.start",
            json!({
                "job": job_meta(&self.job),
                "monotonic_time": telemetry::monotonic_time_ns(),
            }),
        );

        let (result, worker) = match self.registry.resolve(&self.job.worker) {
            Ok(worker) => {
                let result = worker.process(&self.job).await;
                (result, Some(worker))
            }
            Err(resolve_error) => (Err(anyhow::Error::new(resolve_error)), None),
        };

        let (state, error) = self.record(result, worker.as_deref()).await?;

        self.report(started, state, error.as_ref());

        let error = match self.mode {
            ExecutionMode::Record => None,
            ExecutionMode::Propagate => error,
        };

        Ok(Execution {
            job_id: self.job.id,
            state,
            error,
        })
    }

    /// Apply the outcome's state transition and return the resulting state,
    /// along with the handler error when there was one.
    async fn record(
        &self,
        result: anyhow::Result<Outcome>,
        worker: Option<&dyn Worker>,
    ) -> Result<(JobState, Option<anyhow::Error>), QueueError> {
        match result {
            Ok(Outcome::Complete) => {
                self.store.complete_job(self.job.id).await?;

                Ok((JobState::Completed, None))
            }
            Ok(Outcome::Snooze(seconds)) => {
                self.store.snooze_job(self.job.id, seconds).await?;

                Ok((JobState::Scheduled, None))
            }
            Ok(Outcome::Cancel(reason)) => {
                self.store
                    .cancel_job(self.job.id, self.job.attempt, &reason)
                    .await?;

                Ok((JobState::Cancelled, None))
            }
            Err(error) => {
                let backoff_seconds = worker
                    .and_then(|worker| worker.backoff(&self.job))
                    .unwrap_or_else(|| {
                        backoff::jittery_clamped(self.job.attempt, self.job.max_attempts)
                    });

                self.store
                    .error_job(&self.job, &format!("{error:#}"), backoff_seconds)
                    .await?;

                let state = if self.job.attempt >= self.job.max_attempts {
                    JobState::Discarded
                } else {
                    JobState::Retryable
                };

                Ok((state, Some(error)))
            }
        }
    }

    fn report(&self, started: Instant, state: JobState, error: Option<&anyhow::Error>) {
        let elapsed = started.elapsed();
        let queue_time = self
            .job
            .queue_time()
            .and_then(|delta| delta.num_nanoseconds())
            .unwrap_or(0)
            .max(0);

        let mut meta = json!({
            "job": job_meta(&self.job),
            "monotonic_time": telemetry::monotonic_time_ns(),
            "duration": elapsed.as_nanos() as u64,
            "queue_time": queue_time,
            "state": state.as_str(),
        });

        let labels = [("queue", self.job.queue.clone())];

        match state {
            JobState::Completed => {
                metrics::counter!("oban_jobs_completed", &labels).increment(1)
            }
            JobState::Scheduled => metrics::counter!("oban_jobs_snoozed", &labels).increment(1),
            JobState::Cancelled => metrics::counter!("oban_jobs_cancelled", &labels).increment(1),
            JobState::Retryable => metrics::counter!("oban_jobs_retried", &labels).increment(1),
            JobState::Discarded => metrics::counter!("oban_jobs_discarded", &labels).increment(1),
            JobState::Available | JobState::Executing => {}
        }
        metrics::histogram!("oban_jobs_processing_duration_seconds", &labels)
            .record(elapsed.as_secs_f64());

        if let Some(error) = error {
            if let Value::Object(entries) = &mut meta {
                entries.insert("error_message".to_owned(), format!("{error:#}").into());
                entries.insert("traceback".to_owned(), format!("{error:?}").into());
            }

            telemetry::execute("oban.job.exception", meta);
        } else {
            telemetry::execute("oban.job.stop", meta);
        }
    }
}

fn job_meta(job: &Job) -> Value {
    serde_json::to_value(job).unwrap_or(Value::Null)
}

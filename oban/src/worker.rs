use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::QueueError;
use crate::job::Job;

/// The result of a successful `process` call.
///
/// Failure is signalled by returning an error from `process` instead; the
/// executor classifies it as a retry or a discard based on the attempt count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The job finished and should be marked completed.
    Complete,
    /// Defer the job for the given number of seconds without consuming an
    /// attempt.
    Snooze(u64),
    /// Stop the job permanently without treating it as a success.
    Cancel(String),
}

/// User-supplied code that processes jobs.
///
/// A fresh instance is constructed (via the registered factory) for every
/// execution, so implementations can hold per-run state.
#[async_trait]
pub trait Worker: Send + Sync {
    async fn process(&self, job: &Job) -> anyhow::Result<Outcome>;

    /// Custom retry delay in seconds. Returning `None` falls back to
    /// [`crate::backoff::jittery_clamped`].
    fn backoff(&self, job: &Job) -> Option<u64> {
        let _ = job;
        None
    }
}

type WorkerFactory = Arc<dyn Fn() -> Arc<dyn Worker> + Send + Sync>;

/// Maps fully-qualified worker names to factories. Owned by the instance and
/// frozen once the instance starts.
#[derive(Default)]
pub struct WorkerRegistry {
    factories: HashMap<String, WorkerFactory>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under a worker name, replacing any prior entry.
    pub fn register<F, W>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> W + Send + Sync + 'static,
        W: Worker + 'static,
    {
        self.factories.insert(
            name.into(),
            Arc::new(move || {
                let worker: Arc<dyn Worker> = Arc::new(factory());
                worker
            }),
        );
    }

    /// Construct a worker for the given name.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Worker>, QueueError> {
        self.factories
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| QueueError::UnknownWorker(name.to_owned()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

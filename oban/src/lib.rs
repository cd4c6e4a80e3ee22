//! # Oban
//!
//! A durable background job processing engine backed by a PostgreSQL table.
//!
//! Jobs are addressed to named workers, persisted, and dispatched to
//! per-queue producers under local concurrency limits. Failed jobs retry
//! with jittered exponential backoff until their attempts run out. A
//! leader-elected node rescues jobs orphaned by crashed producers and prunes
//! old terminal rows.

mod ops;

// We do this pattern (privately use a module, then re-export parts of it) so
// we can refactor the internals without breaking the public API.

mod job;
pub use job::ErrorEntry;
pub use job::Job;
pub use job::JobState;
pub use job::NewJob;
pub use job::DEFAULT_MAX_ATTEMPTS;
pub use job::DEFAULT_QUEUE;

mod error;
pub use error::ConfigError;
pub use error::QueueError;
pub use error::ValidationError;

mod backoff;
pub use backoff::jittery_clamped;

mod worker;
pub use worker::Outcome;
pub use worker::Worker;
pub use worker::WorkerRegistry;

mod executor;
pub use executor::Execution;
pub use executor::ExecutionMode;
pub use executor::Executor;

mod store;
pub use store::Store;

mod leader;
pub use leader::Leadership;

mod lifeline;
mod producer;
mod pruner;
mod stager;

pub mod cron;
pub mod telemetry;

mod instance;
pub use instance::get_instance;
pub use instance::Config;
pub use instance::Oban;

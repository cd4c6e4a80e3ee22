use thiserror::Error;

/// Enumeration of job validation failures raised at enqueue time, before any
/// row is written.
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("queue name must be between 1 and 128 characters, got {0}")]
    QueueLength(usize),
    #[error("worker name must be between 1 and 128 characters, got {0}")]
    WorkerLength(usize),
    #[error("priority must be between 0 and 9, got {0}")]
    Priority(i16),
    #[error("max_attempts must be positive, got {0}")]
    MaxAttempts(i32),
}

/// Enumeration of instance configuration failures raised from construction.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("queue '{queue}' limit must be positive")]
    QueueLimit { queue: String },
    #[error("stage_interval must be positive")]
    StageInterval,
    #[error("{field} must be positive")]
    NonPositive { field: &'static str },
}

/// Enumeration of errors for operations against the queue.
/// Errors that can originate from sqlx are wrapped to provide the failing
/// command as additional context.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("pool creation failed with: {error}")]
    PoolCreation {
        #[source]
        error: sqlx::Error,
    },
    #[error("{command} query failed with: {error}")]
    Query {
        command: &'static str,
        #[source]
        error: sqlx::Error,
    },
    #[error("could not serialize jsonb field: {error}")]
    Serialization {
        #[from]
        error: serde_json::Error,
    },
    #[error("{0} is not a valid job state")]
    ParseJobState(String),
    #[error("no worker registered as '{0}'")]
    UnknownWorker(String),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::types::Json;

use crate::error::{QueueError, ValidationError};

pub const DEFAULT_QUEUE: &str = "default";
pub const DEFAULT_MAX_ATTEMPTS: i32 = 20;

const NAME_MAX_LENGTH: usize = 128;
const PRIORITY_MAX: i16 = 9;

/// Enumeration of lifecycle states for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// A job scheduled to run at some point in the future.
    Scheduled,
    /// A job waiting to be picked up by a producer.
    Available,
    /// A job currently held by a producer and being worked on.
    Executing,
    /// A job that failed and is waiting for its backoff to elapse.
    Retryable,
    /// A job that finished successfully.
    Completed,
    /// A job that exhausted its attempts.
    Discarded,
    /// A job that was cancelled by its worker.
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Scheduled => "scheduled",
            JobState::Available => "available",
            JobState::Executing => "executing",
            JobState::Retryable => "retryable",
            JobState::Completed => "completed",
            JobState::Discarded => "discarded",
            JobState::Cancelled => "cancelled",
        }
    }

    /// Terminal states are never transitioned back to a runnable state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Discarded | JobState::Cancelled
        )
    }
}

impl FromStr for JobState {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(JobState::Scheduled),
            "available" => Ok(JobState::Available),
            "executing" => Ok(JobState::Executing),
            "retryable" => Ok(JobState::Retryable),
            "completed" => Ok(JobState::Completed),
            "discarded" => Ok(JobState::Discarded),
            "cancelled" => Ok(JobState::Cancelled),
            invalid => Err(QueueError::ParseJobState(invalid.to_owned())),
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single recorded execution failure, appended to a job's `errors` column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub at: DateTime<Utc>,
    pub attempt: i32,
    pub error: String,
}

/// A persisted job, as stored in and loaded from `oban_jobs`.
///
/// Timestamps are stored without a zone and treated as UTC; they are
/// re-attached to UTC when a row is loaded.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: i64,
    pub state: JobState,
    pub queue: String,
    pub worker: String,
    pub args: Value,
    pub meta: Value,
    pub tags: Vec<String>,
    pub errors: Vec<ErrorEntry>,
    /// Flattened `[node, producer_uuid]` pairs, one pair appended per attempt.
    pub attempted_by: Vec<String>,
    pub attempt: i32,
    pub max_attempts: i32,
    pub priority: i16,
    pub inserted_at: DateTime<Utc>,
    pub scheduled_at: DateTime<Utc>,
    pub attempted_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub discarded_at: Option<DateTime<Utc>>,
}

impl Job {
    /// The uuid of the producer that most recently fetched this job.
    pub fn last_attempted_by(&self) -> Option<&str> {
        self.attempted_by.last().map(String::as_str)
    }

    /// Time the job spent waiting between becoming runnable and being picked
    /// up, if it was ever attempted.
    pub fn queue_time(&self) -> Option<chrono::Duration> {
        self.attempted_at
            .map(|attempted_at| attempted_at - self.scheduled_at)
    }
}

/// The chunk of data needed to enqueue a job.
///
/// Tags are normalized on assignment; the remaining fields are validated when
/// the job is inserted, so an invalid job never reaches the database.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub worker: String,
    pub queue: String,
    pub args: Value,
    pub meta: Value,
    pub tags: Vec<String>,
    pub max_attempts: i32,
    pub priority: i16,
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl NewJob {
    pub fn new(worker: impl Into<String>, args: Value) -> Self {
        Self {
            worker: worker.into(),
            queue: DEFAULT_QUEUE.to_owned(),
            args,
            meta: Value::Object(serde_json::Map::new()),
            tags: Vec::new(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            priority: 0,
            scheduled_at: None,
        }
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_meta(mut self, meta: Value) -> Self {
        self.meta = meta;
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.tags = normalize_tags(tags);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_priority(mut self, priority: i16) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_scheduled_at(mut self, scheduled_at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(scheduled_at);
        self
    }

    /// Schedule the job to run after the given number of seconds.
    pub fn with_schedule_in(mut self, seconds: i64) -> Self {
        self.scheduled_at = Some(Utc::now() + chrono::Duration::seconds(seconds));
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.queue.is_empty() || self.queue.len() > NAME_MAX_LENGTH {
            return Err(ValidationError::QueueLength(self.queue.len()));
        }

        if self.worker.is_empty() || self.worker.len() > NAME_MAX_LENGTH {
            return Err(ValidationError::WorkerLength(self.worker.len()));
        }

        if self.priority < 0 || self.priority > PRIORITY_MAX {
            return Err(ValidationError::Priority(self.priority));
        }

        if self.max_attempts < 1 {
            return Err(ValidationError::MaxAttempts(self.max_attempts));
        }

        Ok(())
    }
}

fn normalize_tags<I, S>(tags: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut normalized: Vec<String> = tags
        .into_iter()
        .map(|tag| tag.as_ref().trim().to_lowercase())
        .filter(|tag| !tag.is_empty())
        .collect();

    normalized.sort();
    normalized.dedup();

    normalized
}

/// Raw row codec for `oban_jobs`. Reads naive timestamps and re-attaches UTC
/// when converting into a [`Job`].
#[derive(sqlx::FromRow)]
pub(crate) struct JobRow {
    pub id: i64,
    pub state: String,
    pub queue: String,
    pub worker: String,
    pub args: Json<Value>,
    pub meta: Json<Value>,
    pub tags: Vec<String>,
    pub errors: Json<Vec<ErrorEntry>>,
    pub attempted_by: Vec<String>,
    pub attempt: i32,
    pub max_attempts: i32,
    pub priority: i16,
    pub inserted_at: NaiveDateTime,
    pub scheduled_at: NaiveDateTime,
    pub attempted_at: Option<NaiveDateTime>,
    pub completed_at: Option<NaiveDateTime>,
    pub cancelled_at: Option<NaiveDateTime>,
    pub discarded_at: Option<NaiveDateTime>,
}

fn utc(naive: NaiveDateTime) -> DateTime<Utc> {
    Utc.from_utc_datetime(&naive)
}

impl TryFrom<JobRow> for Job {
    type Error = QueueError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Job {
            id: row.id,
            state: row.state.parse()?,
            queue: row.queue,
            worker: row.worker,
            args: row.args.0,
            meta: row.meta.0,
            tags: row.tags,
            errors: row.errors.0,
            attempted_by: row.attempted_by,
            attempt: row.attempt,
            max_attempts: row.max_attempts,
            priority: row.priority,
            inserted_at: utc(row.inserted_at),
            scheduled_at: utc(row.scheduled_at),
            attempted_at: row.attempted_at.map(utc),
            completed_at: row.completed_at.map(utc),
            cancelled_at: row.cancelled_at.map(utc),
            discarded_at: row.discarded_at.map(utc),
        })
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

pub const DEFAULT_QUEUE: &str = "webhooks";
pub const DEFAULT_PRIORITY: i32 = 1;
pub const DEFAULT_ATTEMPTS: i32 = 3;

/// Stored lifecycle of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => anyhow::bail!("unknown job status: {other}"),
        }
    }
}

/// Externally reported state. `waiting` and `delayed` are both stored as
/// `queued`; they differ only in whether `run_at` has passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Waiting => "waiting",
            JobState::Delayed => "delayed",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReason {
    MaxAttemptsExceeded,
    NonRetryable,
    NoHandler,
    /// Lease expired on the last allowed attempt.
    Stalled,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::MaxAttemptsExceeded => "MAX_ATTEMPTS_EXCEEDED",
            FailureReason::NonRetryable => "NON_RETRYABLE",
            FailureReason::NoHandler => "NO_HANDLER",
            FailureReason::Stalled => "STALLED",
        }
    }
}

impl FromStr for FailureReason {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MAX_ATTEMPTS_EXCEEDED" => Ok(FailureReason::MaxAttemptsExceeded),
            "NON_RETRYABLE" => Ok(FailureReason::NonRetryable),
            "NO_HANDLER" => Ok(FailureReason::NoHandler),
            "STALLED" => Ok(FailureReason::Stalled),
            other => anyhow::bail!("unknown failure reason: {other}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Job {
    pub id: Uuid,
    pub queue: String,
    #[serde(rename = "type")]
    pub job_type: String,
    pub payload: Value,
    pub metadata: Value,
    pub priority: i32,
    #[serde(rename = "attempts")]
    pub max_attempts: i32,
    pub attempts_made: i32,
    pub status: JobStatus,
    pub run_at: DateTime<Utc>,

    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub lock_expires_at: Option<DateTime<Utc>>,

    pub last_error: Option<String>,
    pub failure_reason: Option<FailureReason>,

    #[serde(rename = "timestamp")]
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn state_at(&self, now: DateTime<Utc>) -> JobState {
        match self.status {
            JobStatus::Queued if self.run_at > now => JobState::Delayed,
            JobStatus::Queued => JobState::Waiting,
            JobStatus::Running => JobState::Active,
            JobStatus::Completed => JobState::Completed,
            JobStatus::Failed => JobState::Failed,
        }
    }

    pub fn state(&self) -> JobState {
        self.state_at(Utc::now())
    }

    pub fn has_attempts_left(&self) -> bool {
        self.attempts_made < self.max_attempts
    }
}

/// What a caller submits. The queue assigns `timestamp`; supplying one is
/// rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobRequest {
    #[serde(rename = "type")]
    pub job_type: String,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    /// Milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl JobRequest {
    pub fn new(job_type: impl Into<String>, payload: Value) -> Self {
        Self {
            job_type: job_type.into(),
            payload,
            priority: None,
            delay: None,
            attempts: None,
            metadata: None,
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(i64::try_from(delay.as_millis()).unwrap_or(i64::MAX));
        self
    }

    pub fn attempts(mut self, attempts: i32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// A validated job ready to be stored.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub queue: String,
    pub job_type: String,
    pub payload: Value,
    pub metadata: Value,
    pub priority: i32,
    pub max_attempts: i32,
    pub run_at: DateTime<Utc>,
}

impl NewJob {
    pub fn into_job(self, now: DateTime<Utc>) -> Job {
        Job {
            id: Uuid::new_v4(),
            queue: self.queue,
            job_type: self.job_type,
            payload: self.payload,
            metadata: self.metadata,
            priority: self.priority,
            max_attempts: self.max_attempts,
            attempts_made: 0,
            status: JobStatus::Queued,
            run_at: self.run_at,
            locked_by: None,
            locked_at: None,
            lock_expires_at: None,
            last_error: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobHandle {
    pub id: Uuid,
    pub queue: String,
    #[serde(rename = "type")]
    pub job_type: String,
    pub priority: i32,
    pub run_at: DateTime<Utc>,
    #[serde(rename = "timestamp")]
    pub created_at: DateTime<Utc>,
}

impl From<&Job> for JobHandle {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            queue: job.queue.clone(),
            job_type: job.job_type.clone(),
            priority: job.priority,
            run_at: job.run_at,
            created_at: job.created_at,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub waiting: i64,
    pub active: i64,
    pub completed: i64,
    pub failed: i64,
    pub delayed: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn queued_job_is_delayed_until_run_at() {
        let now = Utc::now();
        let job = NewJob {
            queue: DEFAULT_QUEUE.into(),
            job_type: "bigcommerce".into(),
            payload: json!({}),
            metadata: json!({}),
            priority: DEFAULT_PRIORITY,
            max_attempts: DEFAULT_ATTEMPTS,
            run_at: now + chrono::Duration::seconds(5),
        }
        .into_job(now);

        assert_eq!(job.state_at(now), JobState::Delayed);
        assert_eq!(job.state_at(now + chrono::Duration::seconds(5)), JobState::Waiting);
    }

    #[test]
    fn request_rejects_caller_supplied_timestamp() {
        let ok: JobRequest = serde_json::from_value(json!({
            "type": "acumatica",
            "payload": {"a": 1},
            "priority": 5,
            "delay": 1000
        }))
        .unwrap();
        assert_eq!(ok.priority, Some(5));
        assert_eq!(ok.delay, Some(1000));

        let err = serde_json::from_value::<JobRequest>(json!({
            "type": "acumatica",
            "payload": {},
            "timestamp": 1
        }));
        assert!(err.is_err());
    }
}

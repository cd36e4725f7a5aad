use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::jobs::model::{Job, JobHandle, JobState};

/// Body of every `/webhooks/:platform` response, success or not.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookResponse {
    pub success: bool,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl WebhookResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// A job plus its derived state, as the admin routes show it.
#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    #[serde(flatten)]
    pub job: Job,
    pub state: JobState,
}

impl From<Job> for JobView {
    fn from(job: Job) -> Self {
        let state = job.state();
        Self { job, state }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RetryResponse {
    pub success: bool,
    pub job: JobHandle,
}

//! Maps a job's type to its platform handler and runs it.
//!
//! The registry is built once at startup through [`HandlerRegistry::builder`]
//! and is immutable afterwards. Registering two handlers for one type is a
//! configuration error reported when the registry is built.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{info, warn};
use uuid::Uuid;

use crate::jobs::model::{FailureReason, Job};
use crate::jobs::retry::ErrorClass;
use crate::webhooks::payload::WebhookJob;
use crate::webhooks::records::{BeginOutcome, TransitionError, WebhookRecords};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

type HandlerFn =
    dyn for<'a> Fn(&'a WebhookJob, &'a JobContext) -> BoxFuture<'a, Result<(), HandlerError>> + Send + Sync;

/// Error returned by a platform handler. Errors are retried unless the
/// handler marks them permanent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError {
    pub retryable: bool,
    pub message: String,
}

impl HandlerError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            retryable: true,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            retryable: false,
            message: message.into(),
        }
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for HandlerError {}

/// Per-delivery facts a handler may use. Read-only.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: Uuid,
    pub attempt: i32,
    pub max_attempts: i32,
    pub worker_id: String,
    pub metadata: Value,
}

#[derive(Clone, Debug, Default)]
pub struct HandlerOptions {
    max_concurrency: Option<usize>,
}

impl HandlerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = Some(n);
        self
    }
}

#[derive(Clone)]
struct HandlerEntry {
    handler: Arc<HandlerFn>,
    semaphore: Option<Arc<Semaphore>>,
}

impl HandlerEntry {
    async fn run(&self, job: &WebhookJob, ctx: &JobContext) -> Result<(), HandlerError> {
        let _permit = match &self.semaphore {
            Some(sem) => Some(
                sem.clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| HandlerError::transient("handler semaphore closed"))?,
            ),
            None => None,
        };

        (self.handler)(job, ctx).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("a handler for job type {0:?} is already registered")]
    DuplicateHandler(String),
}

/// Immutable `job_type -> handler` table.
pub struct HandlerRegistry {
    handlers: HashMap<String, HandlerEntry>,
}

impl HandlerRegistry {
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder {
            handlers: HashMap::new(),
            duplicates: Vec::new(),
        }
    }

    fn handler_for(&self, job_type: &str) -> Option<&HandlerEntry> {
        self.handlers.get(job_type)
    }

    pub fn job_types(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}

pub struct HandlerRegistryBuilder {
    handlers: HashMap<String, HandlerEntry>,
    duplicates: Vec<String>,
}

impl HandlerRegistryBuilder {
    pub fn register<F>(self, job_type: &str, handler: F) -> Self
    where
        F: for<'a> Fn(&'a WebhookJob, &'a JobContext) -> BoxFuture<'a, Result<(), HandlerError>>
            + Send
            + Sync
            + 'static,
    {
        self.register_with_options(job_type, handler, HandlerOptions::new())
    }

    pub fn register_with_options<F>(mut self, job_type: &str, handler: F, opts: HandlerOptions) -> Self
    where
        F: for<'a> Fn(&'a WebhookJob, &'a JobContext) -> BoxFuture<'a, Result<(), HandlerError>>
            + Send
            + Sync
            + 'static,
    {
        if self.handlers.contains_key(job_type) {
            self.duplicates.push(job_type.to_string());
            return self;
        }

        let semaphore = opts.max_concurrency.map(|n| Arc::new(Semaphore::new(n.max(1))));
        self.handlers.insert(
            job_type.to_string(),
            HandlerEntry {
                handler: Arc::new(handler),
                semaphore,
            },
        );
        self
    }

    pub fn build(self) -> Result<Arc<HandlerRegistry>, RegistryError> {
        if let Some(job_type) = self.duplicates.into_iter().next() {
            return Err(RegistryError::DuplicateHandler(job_type));
        }
        Ok(Arc::new(HandlerRegistry {
            handlers: self.handlers,
        }))
    }
}

pub fn boxed<'a, T>(fut: impl Future<Output = T> + Send + 'a) -> BoxFuture<'a, T> {
    Box::pin(fut)
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("no handler registered for job type {0:?}")]
    NoHandlerForType(String),
    #[error("undecodable job payload: {0}")]
    BadPayload(String),
    #[error("job type {job_type:?} does not match payload platform {platform:?}")]
    TypeMismatch { job_type: String, platform: String },
    #[error("handler failed: {0}")]
    Handler(HandlerError),
    #[error(transparent)]
    Record(#[from] TransitionError),
}

impl DispatchError {
    pub fn class(&self) -> ErrorClass {
        match self {
            DispatchError::Handler(e) if e.retryable => ErrorClass::Retryable,
            DispatchError::Record(TransitionError::Store(_)) => ErrorClass::Retryable,
            _ => ErrorClass::NonRetryable,
        }
    }

    /// Reason recorded when this error ends the job.
    pub fn failure_reason(&self) -> FailureReason {
        match self {
            DispatchError::NoHandlerForType(_) => FailureReason::NoHandler,
            _ if self.class() == ErrorClass::Retryable => FailureReason::MaxAttemptsExceeded,
            _ => FailureReason::NonRetryable,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched {
    Completed,
    /// The record was already `COMPLETED`; the handler was not invoked.
    AlreadyCompleted,
}

/// Runs one leased job: decode, look up handler, drive the record through
/// `PROCESSING -> COMPLETED`. Terminal failure bookkeeping belongs to the
/// runner, which knows whether attempts remain.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<HandlerRegistry>,
    records: WebhookRecords,
}

impl Dispatcher {
    pub fn new(registry: Arc<HandlerRegistry>, records: WebhookRecords) -> Self {
        Self { registry, records }
    }

    pub async fn dispatch(&self, job: &Job, worker_id: &str) -> Result<Dispatched, DispatchError> {
        let Some(entry) = self.registry.handler_for(&job.job_type) else {
            warn!(job_id = %job.id, job_type = %job.job_type, "no handler registered");
            return Err(DispatchError::NoHandlerForType(job.job_type.clone()));
        };

        let payload: WebhookJob =
            serde_json::from_value(job.payload.clone()).map_err(|e| DispatchError::BadPayload(e.to_string()))?;
        let platform = payload.event.platform();
        if platform.job_type() != job.job_type {
            return Err(DispatchError::TypeMismatch {
                job_type: job.job_type.clone(),
                platform: platform.to_string(),
            });
        }

        match self.records.begin_processing(payload.record_id).await? {
            BeginOutcome::AlreadyCompleted(_) => {
                info!(job_id = %job.id, record_id = %payload.record_id, "record already completed; skipping handler");
                return Ok(Dispatched::AlreadyCompleted);
            }
            BeginOutcome::Resumed(_) => {
                info!(job_id = %job.id, record_id = %payload.record_id, attempt = job.attempts_made, "resuming record");
            }
            BeginOutcome::Started(_) => {}
        }

        let ctx = JobContext {
            job_id: job.id,
            attempt: job.attempts_made,
            max_attempts: job.max_attempts,
            worker_id: worker_id.to_string(),
            metadata: job.metadata.clone(),
        };

        if let Err(err) = entry.run(&payload, &ctx).await {
            warn!(
                job_id = %job.id,
                job_type = %job.job_type,
                attempt = job.attempts_made,
                retryable = err.retryable,
                error = %err,
                "handler failed"
            );
            return Err(DispatchError::Handler(err));
        }

        self.records.complete(payload.record_id).await?;
        Ok(Dispatched::Completed)
    }
}

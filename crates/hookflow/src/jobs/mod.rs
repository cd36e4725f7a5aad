pub mod dispatcher;
pub mod maintenance;
pub mod memory;
pub mod model;
pub mod queue;
pub mod repo;
pub mod retry;
pub mod runner;
pub mod store;
pub mod worker;

pub use dispatcher::{Dispatcher, HandlerRegistry};
pub use memory::InMemoryJobStore;
pub use model::{Job, JobHandle, JobRequest, JobState, JobStatus, NewJob, QueueStats};
pub use queue::{JobQueue, QueueError, QueueSettings};
pub use repo::JobsRepo;
pub use runner::JobRunner;
pub use store::JobStore;
pub use worker::{WorkerConfig, WorkerPool};

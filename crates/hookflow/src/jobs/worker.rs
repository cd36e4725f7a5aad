use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::jobs::dispatcher::Dispatcher;
use crate::jobs::maintenance::Retention;
use crate::jobs::model::Job;
use crate::jobs::queue::JobQueue;
use crate::jobs::runner::JobRunner;

const RECONCILE_BATCH: i64 = 100;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub concurrency: usize,
    pub lease_timeout: Duration,
    pub poll_interval: Duration,
    pub reap_interval: Duration,
    pub maintenance_interval: Duration,
    pub retention: Retention,
}

impl WorkerConfig {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            worker_id: cfg.worker_id.clone(),
            concurrency: cfg.worker_concurrency,
            lease_timeout: cfg.lease_timeout,
            poll_interval: cfg.poll_interval,
            reap_interval: cfg.reap_interval,
            maintenance_interval: cfg.maintenance_interval,
            retention: cfg.retention,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: "worker-1".to_string(),
            concurrency: 1,
            lease_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(250),
            reap_interval: Duration::from_secs(1),
            maintenance_interval: Duration::from_secs(60),
            retention: Retention::default(),
        }
    }
}

/// Fixed-size pool pulling leased jobs from one queue. Each job runs on its
/// own task; the lease loop keeps going while handlers execute.
pub struct WorkerPool {
    cfg: WorkerConfig,
    queue: JobQueue,
    dispatcher: Dispatcher,
    runner: JobRunner,
    slots: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(cfg: WorkerConfig, queue: JobQueue, dispatcher: Dispatcher, runner: JobRunner) -> Self {
        let slots = Arc::new(Semaphore::new(cfg.concurrency.max(1)));
        Self {
            cfg,
            queue,
            dispatcher,
            runner,
            slots,
        }
    }

    /// Runs until `shutdown` fires, then stops leasing and waits for
    /// in-flight jobs.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        info!(
            worker_id = %self.cfg.worker_id,
            queue = %self.queue.name(),
            concurrency = self.cfg.concurrency,
            lease_ms = self.cfg.lease_timeout.as_millis() as u64,
            "worker pool started"
        );

        let mut tasks = JoinSet::new();
        let mut last_reap = Instant::now()
            .checked_sub(self.cfg.reap_interval)
            .unwrap_or_else(Instant::now);
        let mut last_maintenance = Instant::now();

        while !shutdown.is_cancelled() {
            // reclaim jobs from dead workers on a fixed interval to avoid hot-loop write load.
            if last_reap.elapsed() >= self.cfg.reap_interval {
                self.reap().await;
                last_reap = Instant::now();
            }
            if last_maintenance.elapsed() >= self.cfg.maintenance_interval {
                if let Err(e) = self.queue.apply_retention(&self.cfg.retention).await {
                    error!(error = %e, "retention pass failed");
                }
                last_maintenance = Instant::now();
            }

            while let Some(joined) = tasks.try_join_next() {
                log_join(joined);
            }

            let free = self.slots.available_permits();
            if free == 0 {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    Some(joined) = tasks.join_next() => log_join(joined),
                }
                continue;
            }

            let batch = match self.queue.lease(&self.cfg.worker_id, self.cfg.lease_timeout, free).await {
                Ok(batch) => batch,
                Err(e) => {
                    error!(error = %e, "lease failed");
                    Vec::new()
                }
            };

            if batch.is_empty() {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.cfg.poll_interval) => {}
                }
                continue;
            }

            for job in batch {
                let permit = self.slots.clone().acquire_owned().await?;
                tasks.spawn(self.process(job, permit));
            }
        }

        info!(in_flight = tasks.len(), "worker pool stopping; waiting for in-flight jobs");
        while let Some(joined) = tasks.join_next().await {
            log_join(joined);
        }
        info!("worker pool stopped");
        Ok(())
    }

    /// One synchronous pass: reap, lease up to `concurrency` jobs, run them
    /// all to completion. Returns how many jobs were processed.
    pub async fn run_once(&self) -> anyhow::Result<usize> {
        self.reap().await;

        let batch = self
            .queue
            .lease(&self.cfg.worker_id, self.cfg.lease_timeout, self.cfg.concurrency.max(1))
            .await?;
        let count = batch.len();

        let mut tasks = JoinSet::new();
        for job in batch {
            let permit = self.slots.clone().acquire_owned().await?;
            tasks.spawn(self.process(job, permit));
        }
        while let Some(joined) = tasks.join_next().await {
            log_join(joined);
        }
        Ok(count)
    }

    async fn reap(&self) {
        match self.queue.reap_expired().await {
            Ok(outcome) => self.runner.on_reaped(&outcome).await,
            Err(e) => error!(error = %e, "reap failed"),
        }
        if let Err(e) = self.runner.reconcile_records(RECONCILE_BATCH).await {
            error!(error = %e, "record reconcile failed");
        }
    }

    fn process(&self, job: Job, permit: OwnedSemaphorePermit) -> impl std::future::Future<Output = ()> + Send + 'static {
        let dispatcher = self.dispatcher.clone();
        let runner = self.runner.clone();
        let worker_id = self.cfg.worker_id.clone();

        async move {
            let _permit = permit;
            debug!(job_id = %job.id, job_type = %job.job_type, attempt = job.attempts_made, "job leased");

            let outcome = match dispatcher.dispatch(&job, &worker_id).await {
                Ok(_) => runner.on_success(&job, &worker_id).await.map(|_| ()),
                Err(err) => runner.on_failure(&job, &worker_id, &err).await.map(|_| ()),
            };
            if let Err(e) = outcome {
                // the lease stays in place; the reaper will hand the job out again
                error!(job_id = %job.id, error = %e, "could not record job outcome");
            }
        }
    }
}

fn log_join(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        error!(error = %e, "job task panicked; its lease will be reaped");
    }
}

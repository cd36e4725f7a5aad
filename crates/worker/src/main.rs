use std::sync::Arc;

use hookflow::api;
use hookflow::config;
use hookflow::db;
use hookflow::jobs::dispatcher::Dispatcher;
use hookflow::jobs::model::DEFAULT_PRIORITY;
use hookflow::jobs::queue::{JobQueue, QueueSettings};
use hookflow::jobs::runner::JobRunner;
use hookflow::jobs::worker::{WorkerConfig, WorkerPool};
use hookflow::jobs::JobsRepo;
use hookflow::logging;
use hookflow::webhooks::ingest::IngestService;
use hookflow::webhooks::records::WebhookRecords;
use hookflow::webhooks::repo::WebhookRecordsRepo;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

mod handlers;
use handlers::build_registry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = config::Config::from_env()?;
    logging::init(cfg.log_json);

    info!(
        worker_id = %cfg.worker_id,
        queue = %cfg.queue,
        lease_secs = cfg.lease_timeout.as_secs(),
        concurrency = cfg.worker_concurrency,
        http = %cfg.http_addr.as_deref().unwrap_or("disabled"),
        migrate_on_startup = cfg.migrate_on_startup,
        "hookflow starting"
    );

    let pool = db::make_pool(&cfg.database_url, &cfg.db).await?;
    if cfg.migrate_on_startup {
        db::run_migrations(&pool).await?;
    }

    let queue = JobQueue::new(
        Arc::new(JobsRepo::new(pool.clone())),
        QueueSettings {
            queue: cfg.queue.clone(),
            default_attempts: cfg.default_attempts,
            default_priority: DEFAULT_PRIORITY,
        },
    );
    let records = WebhookRecords::new(Arc::new(WebhookRecordsRepo::new(pool.clone())));

    let registry = build_registry()?;
    let dispatcher = Dispatcher::new(registry, records.clone());
    let runner = JobRunner::new(queue.store(), records.clone(), cfg.retry.clone());
    let pool_cfg = WorkerConfig::from_config(&cfg);
    let workers = WorkerPool::new(pool_cfg, queue.clone(), dispatcher, runner);

    let shutdown = CancellationToken::new();

    // ---- API task ----
    let ingest = IngestService::new(
        cfg.signature_verifier(),
        records.clone(),
        queue.clone(),
        cfg.webhook_job_priority,
    );
    let app = api::router(api::ApiState::new(ingest));
    let api_addr = cfg.http_addr.clone();
    let api_shutdown = shutdown.clone();
    let api_handle = tokio::spawn(async move {
        if let Some(addr) = api_addr {
            let listener = tokio::net::TcpListener::bind(&addr).await?;
            info!(%addr, "http api listening");
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { api_shutdown.cancelled().await })
                .await?;
        }
        Ok::<(), anyhow::Error>(())
    });

    // ---- Signal task ----
    let signal_shutdown = shutdown.clone();
    let signal_queue = queue.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "could not listen for shutdown signal");
            return;
        }
        info!("shutdown requested");
        signal_queue.close();
        signal_shutdown.cancel();
    });

    // ---- Worker loop ----
    let worker_result = workers.run(shutdown.clone()).await;
    shutdown.cancel();
    queue.close();

    match api_handle.await {
        Ok(Err(e)) => error!(error = %e, "http api stopped with an error"),
        Err(e) => error!(error = %e, "http api task panicked"),
        Ok(Ok(())) => {}
    }

    worker_result
}

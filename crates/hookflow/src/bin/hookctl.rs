use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use hookflow::db::{make_pool, run_migrations, PoolSettings};
use hookflow::jobs::model::{DEFAULT_ATTEMPTS, DEFAULT_PRIORITY, DEFAULT_QUEUE};
use hookflow::jobs::{JobQueue, JobsRepo, QueueSettings};
use hookflow::webhooks::ingest::IngestService;
use hookflow::webhooks::records::WebhookRecords;
use hookflow::webhooks::repo::WebhookRecordsRepo;
use hookflow::webhooks::signature::SignatureVerifier;
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

const USAGE: &str = "hookctl <command>\n\
     Commands:\n\
     - migrate\n\
     - stats [queue]\n\
     - job <job_id>\n\
     - record <record_id>\n\
     - retry-job <job_id>\n\
     - retry-webhook <record_id>\n\
     - drain [queue] [older_than_secs]\n\
     \n\
     Uses DATABASE_URL or TEST_DATABASE_URL.\n";

const DEFAULT_DRAIN_AGE: Duration = Duration::from_secs(24 * 60 * 60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args: Vec<String> = env::args().collect();

    let Some(command) = args.get(1) else {
        eprintln!("{USAGE}");
        std::process::exit(2);
    };

    let url = env::var("DATABASE_URL")
        .or_else(|_| env::var("TEST_DATABASE_URL"))
        .context("DATABASE_URL or TEST_DATABASE_URL must be set")?;
    let pool = make_pool(&url, &PoolSettings::from_env()?).await?;

    match command.as_str() {
        "migrate" => {
            run_migrations(&pool).await?;
            println!("migrations OK");
        }
        "stats" => {
            let queue = queue_for(&pool, args.get(2));
            print_json(&queue.stats().await?)?;
        }
        "job" => {
            let id = id_arg(&args, "job <job_id>")?;
            let job = queue_for(&pool, None).get(id).await?;
            let state = job.state();
            print_json(&serde_json::json!({ "job": job, "state": state }))?;
        }
        "record" => {
            let id = id_arg(&args, "record <record_id>")?;
            match records(&pool).get(id).await? {
                Some(record) => print_json(&record)?,
                None => anyhow::bail!("webhook record {id} not found"),
            }
        }
        "retry-job" => {
            let id = id_arg(&args, "retry-job <job_id>")?;
            let handle = ingest(&pool).retry_job(id).await?;
            print_json(&handle)?;
        }
        "retry-webhook" => {
            let id = id_arg(&args, "retry-webhook <record_id>")?;
            let handle = ingest(&pool).retry_webhook(id).await?;
            print_json(&handle)?;
        }
        "drain" => {
            let queue = queue_for(&pool, args.get(2));
            let older_than = match args.get(3) {
                Some(raw) => Duration::from_secs(raw.parse().context("older_than_secs must be a number")?),
                None => DEFAULT_DRAIN_AGE,
            };
            let removed = queue.drain_terminal(older_than).await?;
            println!("drained {removed} jobs from {}", queue.name());
        }
        other => {
            eprintln!("Unknown command: {other}\n\n{USAGE}");
            std::process::exit(2);
        }
    }

    Ok(())
}

fn id_arg(args: &[String], usage: &str) -> anyhow::Result<Uuid> {
    let raw = args
        .get(2)
        .with_context(|| format!("usage: hookctl {usage}"))?;
    raw.parse().with_context(|| format!("{raw:?} is not a uuid"))
}

fn queue_for(pool: &PgPool, queue: Option<&String>) -> JobQueue {
    let queue = queue
        .cloned()
        .or_else(|| env::var("HOOKFLOW_QUEUE").ok())
        .unwrap_or_else(|| DEFAULT_QUEUE.to_string());
    JobQueue::new(
        Arc::new(JobsRepo::new(pool.clone())),
        QueueSettings {
            queue,
            default_attempts: DEFAULT_ATTEMPTS,
            default_priority: DEFAULT_PRIORITY,
        },
    )
}

fn records(pool: &PgPool) -> WebhookRecords {
    WebhookRecords::new(Arc::new(WebhookRecordsRepo::new(pool.clone())))
}

// retries never authenticate, so the verifier stays empty
fn ingest(pool: &PgPool) -> IngestService {
    let priority = env::var("HOOKFLOW_WEBHOOK_JOB_PRIORITY")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(5);
    IngestService::new(SignatureVerifier::new(), records(pool), queue_for(pool, None), priority)
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

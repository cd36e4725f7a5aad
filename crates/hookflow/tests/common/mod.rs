#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use hookflow::jobs::dispatcher::{Dispatcher, HandlerRegistry};
use hookflow::jobs::model::JobRequest;
use hookflow::jobs::queue::{JobQueue, QueueSettings};
use hookflow::jobs::retry::RetryConfig;
use hookflow::jobs::runner::JobRunner;
use hookflow::jobs::worker::{WorkerConfig, WorkerPool};
use hookflow::webhooks::ingest::IngestService;
use hookflow::webhooks::payload::{PlatformEvent, WebhookJob};
use hookflow::webhooks::platform::Platform;
use hookflow::webhooks::records::WebhookRecords;
use hookflow::webhooks::signature::{PlatformAuth, SignatureEncoding, SignatureVerifier};
use hookflow::webhooks::store::InsertOutcome;
use serde_json::json;
use sqlx::{postgres::PgPoolOptions, PgPool};
use uuid::Uuid;

pub const BC_SECRET: &str = "bc-s3cret";
pub const ACU_SECRET: &str = "acu-s3cret";

/// Connects to `TEST_DATABASE_URL`, migrates and truncates. Returns `None`
/// (and the test passes vacuously) when no database is configured.
pub async fn setup_db() -> Option<PgPool> {
    let _ = dotenvy::dotenv();

    let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
        eprintln!("TEST_DATABASE_URL not set; skipping postgres test");
        return None;
    };

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .expect("failed to connect to TEST_DATABASE_URL");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("migrations failed");

    sqlx::query("TRUNCATE TABLE jobs, webhook_records RESTART IDENTITY CASCADE")
        .execute(&pool)
        .await
        .expect("truncate failed");

    Some(pool)
}

pub fn verifier() -> SignatureVerifier {
    SignatureVerifier::new()
        .with_platform(Platform::BigCommerce, PlatformAuth::shared_secret(BC_SECRET))
        .with_platform(
            Platform::Acumatica,
            PlatformAuth::hmac(ACU_SECRET, SignatureEncoding::Hex),
        )
}

/// Retry policy with no waiting between attempts.
pub fn immediate_retry() -> RetryConfig {
    RetryConfig {
        base_delay: Duration::ZERO,
        max_delay: Duration::ZERO,
        jitter_pct: 0.0,
    }
}

/// The whole pipeline on in-memory stores.
pub struct Harness {
    pub records: WebhookRecords,
    pub queue: JobQueue,
    pub runner: JobRunner,
    pub workers: WorkerPool,
    pub ingest: IngestService,
}

pub fn harness(registry: Arc<HandlerRegistry>, retry: RetryConfig) -> Harness {
    harness_with_records(registry, retry, WebhookRecords::in_memory())
}

pub fn harness_with_records(registry: Arc<HandlerRegistry>, retry: RetryConfig, records: WebhookRecords) -> Harness {
    let queue = JobQueue::in_memory(QueueSettings::default());
    let runner = JobRunner::new(queue.store(), records.clone(), retry);
    let dispatcher = Dispatcher::new(registry, records.clone());
    let workers = WorkerPool::new(
        WorkerConfig {
            worker_id: "w1".into(),
            concurrency: 4,
            lease_timeout: Duration::from_secs(30),
            ..WorkerConfig::default()
        },
        queue.clone(),
        dispatcher,
        runner.clone(),
    );
    let ingest = IngestService::new(verifier(), records.clone(), queue.clone(), 5);

    Harness {
        records,
        queue,
        runner,
        workers,
        ingest,
    }
}

impl Harness {
    /// Records a BigCommerce webhook and enqueues its job directly, bypassing
    /// authentication. Returns `(record_id, job_id)`.
    pub async fn submit(&self, scope: &str, attempts: Option<i32>) -> (Uuid, Uuid) {
        let body = bigcommerce_body(scope, &Uuid::new_v4().to_string());
        let parsed = PlatformEvent::parse(Platform::BigCommerce, &body).unwrap();
        let record = match self.records.create(parsed.record).await.unwrap() {
            InsertOutcome::Created(r) => r,
            InsertOutcome::Duplicate(_) => panic!("fresh hash reported as duplicate"),
        };

        let payload = serde_json::to_value(WebhookJob {
            record_id: record.id,
            event: parsed.event,
        })
        .unwrap();
        let mut req = JobRequest::new("bigcommerce", payload);
        if let Some(n) = attempts {
            req = req.attempts(n);
        }
        let handle = self.queue.enqueue(req).await.unwrap();
        (record.id, handle.id)
    }

    /// Runs worker passes until nothing is left to lease.
    pub async fn drain(&self) -> usize {
        let mut total = 0;
        for _ in 0..50 {
            let n = self.workers.run_once().await.unwrap();
            if n == 0 {
                break;
            }
            total += n;
        }
        total
    }
}

pub fn bigcommerce_body(scope: &str, hash: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "store_id": "1001",
        "producer": "stores/abc123",
        "scope": scope,
        "hash": hash,
        "data": { "type": "order", "id": 250 }
    }))
    .unwrap()
}

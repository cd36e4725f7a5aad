mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common::{harness, harness_with_records, immediate_retry};
use hookflow::jobs::dispatcher::{boxed, DispatchError, Dispatcher, HandlerError, HandlerRegistry};
use hookflow::jobs::model::{FailureReason, JobRequest, JobState, JobStatus};
use hookflow::jobs::retry::RetryConfig;
use hookflow::jobs::runner::FailureDecision;
use hookflow::jobs::worker::{WorkerConfig, WorkerPool};
use hookflow::webhooks::memory::InMemoryWebhookStore;
use hookflow::webhooks::model::{NewWebhookRecord, WebhookRecord, WebhookStatus};
use hookflow::webhooks::records::WebhookRecords;
use hookflow::webhooks::store::{InsertOutcome, WebhookStore};
use serde_json::json;
use tokio::sync::{Barrier, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn counting(calls: Arc<AtomicUsize>, fail: Option<HandlerError>) -> Arc<HandlerRegistry> {
    HandlerRegistry::builder()
        .register("bigcommerce", move |_job, _ctx| {
            let calls = calls.clone();
            let fail = fail.clone();
            boxed(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                match fail {
                    Some(err) => Err(err),
                    None => Ok(()),
                }
            })
        })
        .build()
        .unwrap()
}

#[tokio::test]
async fn transient_failures_stop_after_three_attempts() {
    let calls = Arc::new(AtomicUsize::new(0));
    let h = harness(
        counting(calls.clone(), Some(HandlerError::transient("upstream 503"))),
        immediate_retry(),
    );
    let (record_id, job_id) = h.submit("store/order/created", None).await;

    h.drain().await;

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let job = h.queue.get(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts_made, 3);
    assert_eq!(job.failure_reason, Some(FailureReason::MaxAttemptsExceeded));
    assert!(job.last_error.unwrap().contains("upstream 503"));

    let record = h.records.get(record_id).await.unwrap().unwrap();
    assert_eq!(record.status, WebhookStatus::Failed);
}

#[tokio::test]
async fn backoff_doubles_between_attempts() {
    let retry = RetryConfig {
        base_delay: Duration::from_millis(40),
        max_delay: Duration::from_secs(5),
        jitter_pct: 0.0,
    };
    let h = harness(counting(Arc::new(AtomicUsize::new(0)), None), retry);
    let (_record_id, job_id) = h.submit("store/order/created", None).await;
    let err = DispatchError::Handler(HandlerError::transient("timeout"));

    let mut delays = Vec::new();
    loop {
        let leased = h.queue.lease("w1", Duration::from_secs(30), 1).await.unwrap();
        let Some(job) = leased.into_iter().next() else {
            tokio::time::sleep(Duration::from_millis(20)).await;
            continue;
        };
        match h.runner.on_failure(&job, "w1", &err).await.unwrap() {
            FailureDecision::Retry { delay, run_at } => {
                assert!(run_at > job.updated_at);
                assert_eq!(h.queue.get_status(job_id).await.unwrap(), JobState::Delayed);
                delays.push(delay);
            }
            FailureDecision::Failed { reason } => {
                assert_eq!(reason, FailureReason::MaxAttemptsExceeded);
                break;
            }
            FailureDecision::LeaseLost => panic!("lease lost"),
        }
    }

    assert_eq!(delays, vec![Duration::from_millis(40), Duration::from_millis(80)]);
}

#[tokio::test]
async fn lower_priority_number_runs_first() {
    let h = harness(counting(Arc::new(AtomicUsize::new(0)), None), immediate_retry());

    let low = h
        .queue
        .enqueue(JobRequest::new("bigcommerce", json!({})).priority(5))
        .await
        .unwrap();
    let high = h
        .queue
        .enqueue(JobRequest::new("bigcommerce", json!({})).priority(1))
        .await
        .unwrap();
    let high_later = h
        .queue
        .enqueue(JobRequest::new("bigcommerce", json!({})).priority(1))
        .await
        .unwrap();

    let leased = h.queue.lease("w1", Duration::from_secs(30), 3).await.unwrap();
    let order: Vec<_> = leased.iter().map(|j| j.id).collect();
    assert_eq!(order, vec![high.id, high_later.id, low.id]);
    assert!(leased.iter().all(|j| j.attempts_made == 1));
}

#[tokio::test]
async fn record_is_processing_while_the_handler_runs() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let records_slot: Arc<Mutex<Option<WebhookRecords>>> = Arc::new(Mutex::new(None));

    let registry = {
        let seen = seen.clone();
        let records_slot = records_slot.clone();
        HandlerRegistry::builder()
            .register("bigcommerce", move |job, _ctx| {
                let seen = seen.clone();
                let records = records_slot.lock().unwrap().clone();
                boxed(async move {
                    let records = records.expect("records wired");
                    let record = records.get(job.record_id).await.unwrap().unwrap();
                    seen.lock().unwrap().push(record.status);
                    Ok(())
                })
            })
            .build()
            .unwrap()
    };

    let h = harness(registry, immediate_retry());
    *records_slot.lock().unwrap() = Some(h.records.clone());

    let (record_id, job_id) = h.submit("store/product/updated", None).await;
    assert_eq!(
        h.records.get(record_id).await.unwrap().unwrap().status,
        WebhookStatus::Pending
    );

    assert_eq!(h.drain().await, 1);

    assert_eq!(*seen.lock().unwrap(), vec![WebhookStatus::Processing]);
    assert_eq!(
        h.records.get(record_id).await.unwrap().unwrap().status,
        WebhookStatus::Completed
    );
    assert_eq!(h.queue.get_status(job_id).await.unwrap(), JobState::Completed);
}

#[tokio::test]
async fn unknown_job_type_fails_without_retry() {
    let h = harness(
        HandlerRegistry::builder().build().unwrap(),
        immediate_retry(),
    );
    let (record_id, job_id) = h.submit("store/order/created", None).await;

    assert_eq!(h.drain().await, 1);

    let job = h.queue.get(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts_made, 1);
    assert_eq!(job.failure_reason, Some(FailureReason::NoHandler));
    assert_eq!(
        h.records.get(record_id).await.unwrap().unwrap().status,
        WebhookStatus::Failed
    );
}

#[tokio::test]
async fn permanent_error_fails_on_first_attempt() {
    let calls = Arc::new(AtomicUsize::new(0));
    let h = harness(
        counting(calls.clone(), Some(HandlerError::permanent("order was deleted"))),
        immediate_retry(),
    );
    let (_record_id, job_id) = h.submit("store/order/created", None).await;

    h.drain().await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let job = h.queue.get(job_id).await.unwrap();
    assert_eq!(job.failure_reason, Some(FailureReason::NonRetryable));
    assert_eq!(job.attempts_made, 1);
}

#[tokio::test]
async fn expired_lease_is_redelivered_and_resumes_the_record() {
    let calls = Arc::new(AtomicUsize::new(0));
    let h = harness(counting(calls.clone(), None), immediate_retry());
    let (record_id, job_id) = h.submit("store/customer/created", None).await;

    // a worker that leases, starts the record, then dies
    let leased = h.queue.lease("dead", Duration::from_millis(1), 1).await.unwrap();
    assert_eq!(leased.len(), 1);
    h.records.begin_processing(record_id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(h.drain().await, 1);

    let job = h.queue.get(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.attempts_made, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        h.records.get(record_id).await.unwrap().unwrap().status,
        WebhookStatus::Completed
    );
}

#[tokio::test]
async fn stall_on_last_attempt_fails_job_and_record() {
    let h = harness(counting(Arc::new(AtomicUsize::new(0)), None), immediate_retry());
    let (record_id, job_id) = h.submit("store/order/created", Some(1)).await;

    h.queue.lease("dead", Duration::from_millis(1), 1).await.unwrap();
    h.records.begin_processing(record_id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(h.drain().await, 0);

    let job = h.queue.get(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.failure_reason, Some(FailureReason::Stalled));
    assert_eq!(
        h.records.get(record_id).await.unwrap().unwrap().status,
        WebhookStatus::Failed
    );
}

#[tokio::test]
async fn manual_retry_reruns_a_failed_webhook() {
    let healthy = Arc::new(AtomicBool::new(false));
    let registry = {
        let healthy = healthy.clone();
        HandlerRegistry::builder()
            .register("bigcommerce", move |_job, _ctx| {
                let ok = healthy.load(Ordering::SeqCst);
                boxed(async move {
                    if ok {
                        Ok(())
                    } else {
                        Err(HandlerError::transient("erp offline"))
                    }
                })
            })
            .build()
            .unwrap()
    };
    let h = harness(registry, immediate_retry());
    let (record_id, job_id) = h.submit("store/order/created", None).await;

    h.drain().await;
    assert_eq!(h.queue.get_status(job_id).await.unwrap(), JobState::Failed);

    healthy.store(true, Ordering::SeqCst);
    let handle = h.ingest.retry_job(job_id).await.unwrap();
    assert_eq!(handle.id, job_id);
    assert_eq!(
        h.records.get(record_id).await.unwrap().unwrap().status,
        WebhookStatus::Pending
    );

    h.drain().await;

    let job = h.queue.get(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.attempts_made, 1);
    assert_eq!(
        h.records.get(record_id).await.unwrap().unwrap().status,
        WebhookStatus::Completed
    );
}

#[tokio::test]
async fn retention_keeps_the_newest_terminal_jobs() {
    let h = harness(counting(Arc::new(AtomicUsize::new(0)), None), immediate_retry());
    for _ in 0..5 {
        h.submit("store/order/created", None).await;
    }
    h.drain().await;
    assert_eq!(h.queue.stats().await.unwrap().completed, 5);

    let pruned = h
        .queue
        .apply_retention(&hookflow::jobs::maintenance::Retention {
            keep_completed: 2,
            keep_failed: 0,
        })
        .await
        .unwrap();

    assert_eq!(pruned, 3);
    assert_eq!(h.queue.stats().await.unwrap().completed, 2);
}

/// Record store whose writes to `FAILED` error while `broken` is set.
#[derive(Default)]
struct LossyFailWrites {
    inner: InMemoryWebhookStore,
    broken: AtomicBool,
}

#[async_trait]
impl WebhookStore for LossyFailWrites {
    async fn insert(&self, new: NewWebhookRecord) -> anyhow::Result<InsertOutcome> {
        self.inner.insert(new).await
    }

    async fn get(&self, id: Uuid) -> anyhow::Result<Option<WebhookRecord>> {
        self.inner.get(id).await
    }

    async fn set_status(
        &self,
        id: Uuid,
        from: &[WebhookStatus],
        to: WebhookStatus,
    ) -> anyhow::Result<Option<WebhookRecord>> {
        if to == WebhookStatus::Failed && self.broken.load(Ordering::SeqCst) {
            anyhow::bail!("connection reset by peer");
        }
        self.inner.set_status(id, from, to).await
    }

    async fn list_by_status(&self, status: WebhookStatus, limit: i64) -> anyhow::Result<Vec<WebhookRecord>> {
        self.inner.list_by_status(status, limit).await
    }
}

#[tokio::test]
async fn lost_record_failure_is_reconciled() {
    let store = Arc::new(LossyFailWrites::default());
    let h = harness_with_records(
        counting(Arc::new(AtomicUsize::new(0)), Some(HandlerError::permanent("order was deleted"))),
        immediate_retry(),
        WebhookRecords::new(store.clone()),
    );
    let (record_id, job_id) = h.submit("store/order/created", None).await;

    store.broken.store(true, Ordering::SeqCst);
    assert_eq!(h.workers.run_once().await.unwrap(), 1);
    assert_eq!(h.queue.get_status(job_id).await.unwrap(), JobState::Failed);
    let stuck = h.records.get(record_id).await.unwrap().unwrap();
    assert_eq!(stuck.status, WebhookStatus::Processing);

    store.broken.store(false, Ordering::SeqCst);
    // PROCESSING with a queued job behind it stays put
    let (in_flight, _) = h.submit("store/order/updated", None).await;
    h.records.begin_processing(in_flight).await.unwrap();

    assert_eq!(h.runner.reconcile_records(100).await.unwrap(), 1);
    assert_eq!(
        h.records.get(record_id).await.unwrap().unwrap().status,
        WebhookStatus::Failed
    );
    assert_eq!(
        h.records.get(in_flight).await.unwrap().unwrap().status,
        WebhookStatus::Processing
    );
    assert_eq!(h.runner.reconcile_records(100).await.unwrap(), 0);
}

#[tokio::test]
async fn pool_runs_handlers_concurrently_and_drains_on_shutdown() {
    let started = Arc::new(Barrier::new(3));
    let release = Arc::new(Semaphore::new(0));
    let registry = {
        let started = started.clone();
        let release = release.clone();
        HandlerRegistry::builder()
            .register("bigcommerce", move |_job, _ctx| {
                let started = started.clone();
                let release = release.clone();
                boxed(async move {
                    started.wait().await;
                    let _permit = release
                        .acquire()
                        .await
                        .map_err(|e| HandlerError::permanent(e.to_string()))?;
                    Ok(())
                })
            })
            .build()
            .unwrap()
    };

    let h = harness(registry.clone(), immediate_retry());
    let a = h.submit("store/order/created", None).await;
    let b = h.submit("store/order/updated", None).await;

    let pool = Arc::new(WorkerPool::new(
        WorkerConfig {
            worker_id: "w-run".into(),
            concurrency: 2,
            poll_interval: Duration::from_millis(10),
            ..WorkerConfig::default()
        },
        h.queue.clone(),
        Dispatcher::new(registry, h.records.clone()),
        h.runner.clone(),
    ));
    let shutdown = CancellationToken::new();
    let run = tokio::spawn({
        let pool = pool.clone();
        let shutdown = shutdown.clone();
        async move { pool.run(shutdown).await }
    });

    tokio::time::timeout(Duration::from_secs(5), started.wait())
        .await
        .expect("both handlers running at once");
    assert_eq!(h.queue.stats().await.unwrap().active, 2);

    shutdown.cancel();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!run.is_finished());
    assert_eq!(h.queue.get_status(a.1).await.unwrap(), JobState::Active);

    release.add_permits(2);
    tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("pool stops once in-flight jobs finish")
        .unwrap()
        .unwrap();

    for (record_id, job_id) in [a, b] {
        assert_eq!(h.queue.get_status(job_id).await.unwrap(), JobState::Completed);
        assert_eq!(
            h.records.get(record_id).await.unwrap().unwrap().status,
            WebhookStatus::Completed
        );
    }
}

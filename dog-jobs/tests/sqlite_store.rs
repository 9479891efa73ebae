#![cfg(feature = "sqlite")]

use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};

use dog_jobs::{
    EnqueueOptions, JobError, JobRecord, JobStatus, JobStore, Payload, PersistentQueue, QueueConfig, QueueError,
    RetryPolicy, SqliteStore,
};

fn record(job_type: &str) -> JobRecord {
    let mut payload = Payload::new();
    payload.insert("ticket".to_string(), json!({ "id": "T-7", "tags": ["vip"] }));
    JobRecord::new(job_type, payload, RetryPolicy::default())
}

fn temp_db_url() -> (std::path::PathBuf, String) {
    let path = std::env::temp_dir().join(format!("dog-jobs-{}.db", uuid::Uuid::new_v4()));
    let url = format!("sqlite://{}", path.display());
    (path, url)
}

/// Rows survive a write/read cycle column for column
#[tokio::test]
async fn test_insert_and_get() {
    let store = SqliteStore::in_memory().await.unwrap();
    let mut job = record("download_ticket");
    job.last_error = Some("previous run timed out".to_string());

    store.insert(&job).await.unwrap();
    let loaded = store.get(&job.id).await.unwrap().unwrap();

    assert_eq!(loaded, job);
    assert_eq!(loaded.payload["ticket"]["tags"][0], Value::from("vip"));
    assert!(store.get(&dog_jobs::JobId::new()).await.unwrap().is_none());
}

/// Updates persist the mutable columns
#[tokio::test]
async fn test_update() {
    let store = SqliteStore::in_memory().await.unwrap();
    let mut job = record("download_ticket");
    store.insert(&job).await.unwrap();

    job.mark_running();
    job.record_failure(&JobError::retryable("429"), None);
    store.update(&job).await.unwrap();

    let loaded = store.get(&job.id).await.unwrap().unwrap();
    assert_eq!(loaded.status, JobStatus::Pending);
    assert_eq!(loaded.attempts, 1);
    assert_eq!(loaded.available_at, job.available_at);
    assert_eq!(loaded.last_error.as_deref(), Some("429"));

    let missing = store.update(&record("ghost")).await;
    assert!(matches!(missing, Err(QueueError::JobNotFound(_))));
}

/// Due rows come back in availability order, limited
#[tokio::test]
async fn test_due_and_recoverable() {
    let store = SqliteStore::in_memory().await.unwrap();

    let mut second = record("second");
    second.available_at = second.available_at - chrono::Duration::milliseconds(100);
    let mut first = record("first");
    first.available_at = first.available_at - chrono::Duration::milliseconds(200);
    let mut later = record("later");
    later.available_at = later.available_at + chrono::Duration::hours(1);
    let mut running = record("running");
    running.mark_running();
    let mut done = record("done");
    done.complete();

    for job in [&second, &first, &later, &running, &done] {
        store.insert(job).await.unwrap();
    }

    let due = store.due(Utc::now(), 50).await.unwrap();
    let types: Vec<&str> = due.iter().map(|r| r.job_type.as_str()).collect();
    assert_eq!(types, vec!["first", "second"]);
    assert_eq!(store.due(Utc::now(), 1).await.unwrap().len(), 1);

    let recoverable = store.recoverable().await.unwrap();
    assert_eq!(recoverable.len(), 4);
    assert!(recoverable.iter().all(|r| !r.status.is_terminal()));

    let counts = store.status_counts().await.unwrap();
    assert_eq!(counts.pending, 3);
    assert_eq!(counts.running, 1);
    assert_eq!(counts.completed, 1);
    assert_eq!(counts.failed, 0);
}

/// Closed pool surfaces as StoreClosed
#[tokio::test]
async fn test_closed_store() {
    let store = SqliteStore::in_memory().await.unwrap();
    store.close().await;

    assert!(!store.is_open());
    assert!(matches!(store.insert(&record("a")).await, Err(QueueError::StoreClosed)));
}

/// A second queue over the same database file finishes leftover work
#[tokio::test]
async fn test_queue_restart_on_file_database() {
    let (path, url) = temp_db_url();
    let config = QueueConfig::new().with_poll_interval(Duration::from_millis(20));

    // First process: enqueue without ever starting
    let store = SqliteStore::connect(&url).await.unwrap();
    let first = PersistentQueue::new(store.clone(), config.clone()).unwrap();
    first.register_fn("sync_tickets", |_payload, _meta| async { Ok::<(), JobError>(()) });
    let id = first.enqueue("sync_tickets", Payload::new(), EnqueueOptions::default()).await.unwrap();
    drop(first);
    store.close().await;

    // Second process
    let store = SqliteStore::connect(&url).await.unwrap();
    let second = PersistentQueue::new(store.clone(), config).unwrap();
    second.register_fn("sync_tickets", |_payload, _meta| async { Ok::<(), JobError>(()) });
    assert_eq!(second.start().await.unwrap(), 1);
    second.wait_for_idle().await;

    let record = store.get(&id).await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Completed);

    let metrics = second.metrics().await.unwrap();
    assert_eq!(metrics.backend, "sqlite");
    assert_eq!(metrics.pending, 0);

    second.stop();
    store.close().await;
    let _ = std::fs::remove_file(path);
}

//! Job lifecycle through the queue and store, driven step by step.
//!
//! Run with: cargo test --test queue_lifecycle_test

mod helpers;

use std::time::Duration;

use helpers::*;
use serde_json::json;
use transcode_queue::{
    models::job::{JobOptions, JobStatus},
    models::transcode::TRANSCODE_JOB,
    services::{
        queue::QueueError,
        retry::RetryPolicy,
        store::{Disposition, JobStore, StoreError, LEASE_EXPIRED},
        worker::HandlerError,
    },
};

const WORKER: &str = "worker-a";

#[tokio::test]
async fn test_transient_failures_walk_through_every_status() {
    let h = Harness::new();
    let policy = RetryPolicy::new(Duration::ZERO, Duration::ZERO);
    let job_id = h
        .queue
        .enqueue(TRANSCODE_JOB, transcode_payload("a.mp3"), JobOptions::default())
        .await
        .unwrap();

    let job = h.queue.status(job_id).await.unwrap();
    assert_eq!((job.status, job.attempts, job.max_attempts), (JobStatus::Queued, 0, 3));

    let mut observed = Vec::new();
    for _ in 0..3 {
        let job = h
            .store
            .claim(WORKER, Duration::from_millis(100))
            .await
            .unwrap()
            .expect("job should be claimable");
        observed.push((job.status, job.attempts));

        let disposition = policy.decide(&job, Err(HandlerError::Transient("codec timeout".into())));
        h.store.ack(job_id, WORKER, disposition).await.unwrap();

        let job = h.queue.status(job_id).await.unwrap();
        observed.push((job.status, job.attempts));
    }

    assert_eq!(
        observed,
        vec![
            (JobStatus::Active, 0),
            (JobStatus::Queued, 1),
            (JobStatus::Active, 1),
            (JobStatus::Queued, 2),
            (JobStatus::Active, 2),
            (JobStatus::Failed, 3),
        ]
    );

    let failed = h.queue.status(job_id).await.unwrap();
    let error = failed.last_error.unwrap();
    assert!(error.starts_with("Processing failed after 3 attempts"), "{error}");
    assert!(failed.leased_by.is_none());
    assert!(failed.lease_expiry.is_none());

    let dead = h.queue.dead_letters(10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].id, job_id);
}

#[tokio::test]
async fn test_permanent_failure_stops_after_one_attempt() {
    let h = Harness::new();
    let job_id = h
        .queue
        .enqueue(TRANSCODE_JOB, transcode_payload("bad.mp3"), JobOptions::default())
        .await
        .unwrap();

    let job = h.store.claim(WORKER, Duration::from_millis(100)).await.unwrap().unwrap();
    let disposition = RetryPolicy::default().decide(&job, Err(HandlerError::Permanent("corrupt header".into())));
    assert!(matches!(disposition, Disposition::Fail { .. }));
    h.store.ack(job_id, WORKER, disposition).await.unwrap();

    let job = h.queue.status(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 1);
    assert!(job.last_error.unwrap().contains("corrupt header"));
}

#[tokio::test]
async fn test_remove_on_complete_purges_record() {
    let h = Harness::new();
    let options = JobOptions {
        remove_on_complete: Some(true),
        remove_on_fail: Some(false),
        ..Default::default()
    };
    let job_id = h
        .queue
        .enqueue(TRANSCODE_JOB, transcode_payload("a.mp3"), options)
        .await
        .unwrap();

    h.store.claim(WORKER, Duration::from_millis(100)).await.unwrap().unwrap();
    h.store
        .ack(job_id, WORKER, Disposition::Complete { result: json!({"ok": true}) })
        .await
        .unwrap();

    assert!(matches!(
        h.queue.status(job_id).await,
        Err(QueueError::NotFound(id)) if id == job_id
    ));
}

#[tokio::test]
async fn test_completed_job_kept_without_remove_on_complete() {
    let h = Harness::new();
    let job_id = h
        .queue
        .enqueue(TRANSCODE_JOB, transcode_payload("a.mp3"), JobOptions::default())
        .await
        .unwrap();

    h.store.claim(WORKER, Duration::from_millis(100)).await.unwrap().unwrap();
    h.store
        .ack(job_id, WORKER, Disposition::Complete { result: json!({"ok": true}) })
        .await
        .unwrap();

    let job = h.queue.status(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.result, Some(json!({"ok": true})));
    assert_eq!(job.attempts, 1);
}

#[tokio::test]
async fn test_remove_on_fail_purges_dead_letter() {
    let h = Harness::new();
    let options = JobOptions {
        remove_on_fail: Some(true),
        ..Default::default()
    };
    let job_id = h
        .queue
        .enqueue(TRANSCODE_JOB, transcode_payload("a.mp3"), options)
        .await
        .unwrap();

    h.store.claim(WORKER, Duration::from_millis(100)).await.unwrap().unwrap();
    h.store
        .ack(job_id, WORKER, Disposition::Fail { error: "boom".into() })
        .await
        .unwrap();

    assert!(h.queue.status(job_id).await.is_err());
    assert!(h.queue.dead_letters(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_enqueue_rejects_invalid_input_before_store() {
    let h = Harness::new();

    let err = h
        .queue
        .enqueue("  ", transcode_payload("a.mp3"), JobOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::InvalidJobType));

    let err = h
        .queue
        .enqueue(
            TRANSCODE_JOB,
            object(json!({"fileName": "a.mp3", "originalUrl": "not a url"})),
            JobOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::InvalidPayload { .. }));

    let err = h
        .queue
        .enqueue(TRANSCODE_JOB, object(json!({"fileName": "a.mp3"})), JobOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::InvalidPayload { .. }));

    assert_eq!(h.queue.counts().await.unwrap().queued, 0);
}

#[tokio::test]
async fn test_unknown_job_types_are_accepted_without_schema() {
    let h = Harness::new();
    let job_id = h
        .queue
        .enqueue("thumbnail", object(json!({"anything": 1})), JobOptions::default())
        .await
        .unwrap();
    assert_eq!(h.queue.status(job_id).await.unwrap().job_type, "thumbnail");
}

#[tokio::test]
async fn test_enqueue_while_disconnected_reports_unavailable() {
    let h = Harness::new();
    h.store.set_connected(false);

    let err = h
        .queue
        .enqueue(TRANSCODE_JOB, transcode_payload("a.mp3"), JobOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::BackendUnavailable(_)));
    assert!(h.queue.health_check().await.is_err());

    h.store.set_connected(true);
    assert!(h.queue.health_check().await.is_ok());
    assert_eq!(h.queue.queue_depth().await.unwrap(), 0);
}

#[tokio::test]
async fn test_cancel_only_while_queued() {
    let h = Harness::new();
    let first = h
        .queue
        .enqueue(TRANSCODE_JOB, transcode_payload("a.mp3"), JobOptions::default())
        .await
        .unwrap();
    let second = h
        .queue
        .enqueue(TRANSCODE_JOB, transcode_payload("b.mp3"), JobOptions::default())
        .await
        .unwrap();

    let claimed = h.store.claim(WORKER, Duration::from_millis(100)).await.unwrap().unwrap();
    assert_eq!(claimed.id, first);

    assert!(matches!(
        h.queue.cancel(first).await,
        Err(QueueError::AlreadyClaimed(_))
    ));
    h.queue.cancel(second).await.unwrap();
    assert!(matches!(
        h.queue.cancel(second).await,
        Err(QueueError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_stale_worker_ack_is_rejected_after_lease_expiry() {
    let h = Harness::with_lease(Duration::from_millis(30));
    let job_id = h
        .queue
        .enqueue(TRANSCODE_JOB, transcode_payload("a.mp3"), JobOptions::default())
        .await
        .unwrap();

    h.store.claim("slow", Duration::from_millis(100)).await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;

    let reclaimed = h
        .store
        .claim("fast", Duration::from_millis(100))
        .await
        .unwrap()
        .expect("expired lease should be reclaimable");
    assert_eq!(reclaimed.id, job_id);
    assert_eq!(reclaimed.attempts, 1);
    assert_eq!(reclaimed.last_error.as_deref(), Some(LEASE_EXPIRED));

    let late = h
        .store
        .ack(job_id, "slow", Disposition::Complete { result: json!(null) })
        .await;
    assert!(matches!(late, Err(StoreError::LeaseLost(_))));
    assert!(matches!(
        h.store.extend_lease(job_id, "slow").await,
        Err(StoreError::LeaseLost(_))
    ));

    h.store
        .ack(job_id, "fast", Disposition::Complete { result: json!(null) })
        .await
        .unwrap();
    assert_eq!(h.queue.status(job_id).await.unwrap().status, JobStatus::Completed);
}

#[tokio::test]
async fn test_claim_order_is_fifo_among_due_jobs() {
    let h = Harness::new();
    let mut ids = Vec::new();
    for name in ["1.mp3", "2.mp3", "3.mp3"] {
        ids.push(
            h.queue
                .enqueue(TRANSCODE_JOB, transcode_payload(name), JobOptions::default())
                .await
                .unwrap(),
        );
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    for expected in ids {
        let job = h.store.claim(WORKER, Duration::from_millis(50)).await.unwrap().unwrap();
        assert_eq!(job.id, expected);
    }
    assert!(h.store.claim(WORKER, Duration::from_millis(20)).await.unwrap().is_none());
}

#[tokio::test]
async fn test_retry_delay_defers_claim() {
    let h = Harness::new();
    let job_id = h
        .queue
        .enqueue(TRANSCODE_JOB, transcode_payload("a.mp3"), JobOptions::default())
        .await
        .unwrap();

    h.store.claim(WORKER, Duration::from_millis(50)).await.unwrap().unwrap();
    h.store
        .ack(
            job_id,
            WORKER,
            Disposition::Retry {
                error: "busy".into(),
                delay: Duration::from_millis(150),
            },
        )
        .await
        .unwrap();

    assert!(h.store.claim(WORKER, Duration::from_millis(20)).await.unwrap().is_none());
    let job = h
        .store
        .claim(WORKER, Duration::from_millis(500))
        .await
        .unwrap()
        .expect("job should become claimable after its delay");
    assert_eq!(job.attempts, 1);
}

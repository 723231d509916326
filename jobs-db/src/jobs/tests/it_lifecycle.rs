//! In-tree DB integration tests for finalize, retry release, and heartbeat

use pgtemp::PgTempDB;

use crate::{
    jobs::{self, JobStatus, NewJob},
    JobsDb,
};

const WORKER: &str = "worker-test-1";

async fn setup() -> (PgTempDB, JobsDb) {
    let temp_db = PgTempDB::new();
    let db = JobsDb::connect(&temp_db.connection_uri(), 5)
        .await
        .expect("Failed to connect to jobs db");
    (temp_db, db)
}

/// Insert a job and claim it for [`WORKER`].
async fn insert_running(db: &JobsDb, new_job: NewJob) -> jobs::JobId {
    let job_id = jobs::insert(db.pool(), &new_job)
        .await
        .expect("Failed to insert job");
    jobs::claim(db.pool(), &job_id, WORKER)
        .await
        .expect("Claim query failed")
        .expect("Expected the job to be claimable");
    job_id
}

#[tokio::test]
async fn mark_completed_persists_result_and_clears_error() {
    //* Given
    let (_temp_db, db) = setup().await;
    let job_id = insert_running(&db, NewJob::new("echo")).await;

    //* When
    let result = serde_json::json!({"echoed": true});
    let updated = jobs::mark_completed(db.pool(), &job_id, WORKER, &result)
        .await
        .expect("Finalize query failed");

    //* Then
    assert!(updated, "owner finalize must match the RUNNING row");

    let job = jobs::get(db.pool(), &job_id)
        .await
        .expect("Failed to get job")
        .expect("Job not found");
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.result, Some(result));
    assert_eq!(job.error_message, None);
    assert!(job.completed_at.is_some(), "finalize must set completed_at");
}

#[tokio::test]
async fn finalize_does_not_overwrite_external_cancel() {
    //* Given
    let (_temp_db, db) = setup().await;
    let job_id = insert_running(&db, NewJob::new("echo")).await;

    // The submission API cancels the job while it runs
    sqlx::query("UPDATE jobs SET status = 'CANCELED', updated_at = now() WHERE job_id = $1")
        .bind(job_id)
        .execute(db.pool())
        .await
        .expect("Failed to cancel job");

    //* When
    let completed = jobs::mark_completed(db.pool(), &job_id, WORKER, &serde_json::json!({}))
        .await
        .expect("Finalize query failed");
    let failed = jobs::mark_failed(db.pool(), &job_id, WORKER, "boom")
        .await
        .expect("Finalize query failed");

    //* Then
    assert!(!completed, "finalize must not match a CANCELED row");
    assert!(!failed, "finalize must not match a CANCELED row");

    let job = jobs::get(db.pool(), &job_id)
        .await
        .expect("Failed to get job")
        .expect("Job not found");
    assert_eq!(job.status, JobStatus::Canceled);
}

#[tokio::test]
async fn mark_failed_records_reason() {
    //* Given
    let (_temp_db, db) = setup().await;
    let job_id = insert_running(&db, NewJob::new("echo")).await;

    //* When
    let updated = jobs::mark_failed(db.pool(), &job_id, WORKER, "handler exploded")
        .await
        .expect("Finalize query failed");

    //* Then
    assert!(updated);

    let job = jobs::get(db.pool(), &job_id)
        .await
        .expect("Failed to get job")
        .expect("Job not found");
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error_message.as_deref(), Some("handler exploded"));
    assert!(job.completed_at.is_some());
}

#[tokio::test]
async fn release_for_retry_returns_job_to_pending_and_increments() {
    //* Given
    let (_temp_db, db) = setup().await;
    let mut new_job = NewJob::new("echo");
    new_job.max_retries = 2;
    let job_id = insert_running(&db, new_job).await;

    //* When
    let released = jobs::release_for_retry(db.pool(), &job_id, WORKER, "transient glitch")
        .await
        .expect("Release query failed");

    //* Then
    assert!(released);

    let job = jobs::get(db.pool(), &job_id)
        .await
        .expect("Failed to get job")
        .expect("Job not found");
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.retry_count, 1);
    assert_eq!(job.worker_id, None, "release must clear ownership");
    assert_eq!(job.error_message.as_deref(), Some("transient glitch"));
    assert!(
        job.completed_at.is_none(),
        "a retry release is not a terminal state"
    );

    // The row is claimable again
    let reclaimed = jobs::claim(db.pool(), &job_id, "worker-test-2")
        .await
        .expect("Claim query failed");
    assert!(reclaimed.is_some(), "released rows must be claimable");
}

#[tokio::test]
async fn release_for_retry_requires_ownership() {
    //* Given
    let (_temp_db, db) = setup().await;
    let job_id = insert_running(&db, NewJob::new("echo")).await;

    //* When
    let released = jobs::release_for_retry(db.pool(), &job_id, "worker-imposter", "nope")
        .await
        .expect("Release query failed");

    //* Then
    assert!(!released, "a non-owner must not release the job");

    let job = jobs::get(db.pool(), &job_id)
        .await
        .expect("Failed to get job")
        .expect("Job not found");
    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.retry_count, 0);
}

#[tokio::test]
async fn heartbeat_touch_refreshes_running_row_only() {
    //* Given
    let (_temp_db, db) = setup().await;
    let job_id = insert_running(&db, NewJob::new("echo")).await;

    let before = jobs::get(db.pool(), &job_id)
        .await
        .expect("Failed to get job")
        .expect("Job not found")
        .last_heartbeat_at
        .expect("claim sets the initial heartbeat");

    //* When
    let touched = jobs::touch_heartbeat(db.pool(), &job_id, WORKER)
        .await
        .expect("Heartbeat query failed");

    //* Then
    assert!(touched);

    let after = jobs::get(db.pool(), &job_id)
        .await
        .expect("Failed to get job")
        .expect("Job not found")
        .last_heartbeat_at
        .expect("heartbeat timestamp present");
    assert!(after >= before);

    // Finalize, then the heartbeat must stop matching
    jobs::mark_completed(db.pool(), &job_id, WORKER, &serde_json::json!({}))
        .await
        .expect("Finalize query failed");
    let touched = jobs::touch_heartbeat(db.pool(), &job_id, WORKER)
        .await
        .expect("Heartbeat query failed");
    assert!(!touched, "heartbeat must not touch a terminal row");
}

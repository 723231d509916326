//! In-tree DB integration tests for the stale-heartbeat reclaim sweep

use chrono::{Duration, Utc};
use pgtemp::PgTempDB;

use crate::{
    jobs::{self, JobStatus, NewJob},
    JobsDb,
};

async fn setup() -> (PgTempDB, JobsDb) {
    let temp_db = PgTempDB::new();
    let db = JobsDb::connect(&temp_db.connection_uri(), 5)
        .await
        .expect("Failed to connect to jobs db");
    (temp_db, db)
}

#[tokio::test]
async fn reclaim_returns_only_stale_running_rows() {
    //* Given
    let (_temp_db, db) = setup().await;

    // A fresh running job
    let fresh_id = jobs::insert(db.pool(), &NewJob::new("echo"))
        .await
        .expect("Failed to insert job");
    jobs::claim(db.pool(), &fresh_id, "worker-alive")
        .await
        .expect("Claim query failed")
        .expect("Expected the job to be claimable");

    // A running job whose owner stopped heartbeating
    let stale_id = jobs::insert(db.pool(), &NewJob::new("echo"))
        .await
        .expect("Failed to insert job");
    jobs::claim(db.pool(), &stale_id, "worker-dead")
        .await
        .expect("Claim query failed")
        .expect("Expected the job to be claimable");
    sqlx::query("UPDATE jobs SET last_heartbeat_at = now() - interval '10 minutes' WHERE job_id = $1")
        .bind(stale_id)
        .execute(db.pool())
        .await
        .expect("Failed to age the heartbeat");

    // A pending job, untouched by the sweep
    let pending_id = jobs::insert(db.pool(), &NewJob::new("echo"))
        .await
        .expect("Failed to insert job");

    //* When
    let cutoff = Utc::now() - Duration::seconds(60);
    let reclaimed = jobs::reclaim_stale(db.pool(), cutoff)
        .await
        .expect("Reclaim query failed");

    //* Then
    assert_eq!(reclaimed, vec![stale_id], "only the stale row is reclaimed");

    let stale = jobs::get(db.pool(), &stale_id)
        .await
        .expect("Failed to get job")
        .expect("Job not found");
    assert_eq!(stale.status, JobStatus::Pending);
    assert_eq!(stale.worker_id, None, "reclaim must clear ownership");

    let fresh = jobs::get(db.pool(), &fresh_id)
        .await
        .expect("Failed to get job")
        .expect("Job not found");
    assert_eq!(fresh.status, JobStatus::Running);
    assert_eq!(fresh.worker_id.as_deref(), Some("worker-alive"));

    let pending = jobs::get(db.pool(), &pending_id)
        .await
        .expect("Failed to get job")
        .expect("Job not found");
    assert_eq!(pending.status, JobStatus::Pending);
}

#[tokio::test]
async fn reclaimed_row_is_claimable_again() {
    //* Given
    let (_temp_db, db) = setup().await;

    let job_id = jobs::insert(db.pool(), &NewJob::new("echo"))
        .await
        .expect("Failed to insert job");
    jobs::claim(db.pool(), &job_id, "worker-dead")
        .await
        .expect("Claim query failed")
        .expect("Expected the job to be claimable");
    sqlx::query("UPDATE jobs SET last_heartbeat_at = now() - interval '10 minutes' WHERE job_id = $1")
        .bind(job_id)
        .execute(db.pool())
        .await
        .expect("Failed to age the heartbeat");

    //* When
    let cutoff = Utc::now() - Duration::seconds(60);
    let reclaimed = jobs::reclaim_stale(db.pool(), cutoff)
        .await
        .expect("Reclaim query failed");
    assert_eq!(reclaimed.len(), 1);

    //* Then
    let claimed = jobs::claim(db.pool(), &job_id, "worker-successor")
        .await
        .expect("Claim query failed");
    assert!(claimed.is_some(), "reclaimed rows must be claimable");
}

//! Per-job liveness heartbeat.
//!
//! While a job is RUNNING, a dedicated task refreshes `last_heartbeat_at`
//! at a fixed cadence. Heartbeats are best-effort: failures are logged and
//! never fail the job. Staleness is what the reclaim sweeper keys off to
//! recover jobs from crashed workers.

use std::time::Duration;

use jobs_db::{jobs, JobId, JobsDb};
use monitoring::logging;
use tokio::{sync::oneshot, time::MissedTickBehavior};
use tokio_util::{sync::CancellationToken, task::AbortOnDropHandle};

use crate::worker_id::WorkerId;

/// After this many consecutive update failures the loop gives up. The job
/// itself keeps running; only the liveness signal is lost.
const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// Owns the heartbeat loop of one job.
///
/// Dropping the guard stops the loop: the stop channel closes and, as a
/// backstop, the task handle aborts.
pub(crate) struct HeartbeatGuard {
    _stop: oneshot::Sender<()>,
    _task: AbortOnDropHandle<()>,
}

/// Spawn the heartbeat loop for a claimed job.
pub(crate) fn spawn(
    db: JobsDb,
    job_id: JobId,
    worker_id: WorkerId,
    interval: Duration,
    scope: CancellationToken,
) -> HeartbeatGuard {
    let (stop_tx, stop_rx) = oneshot::channel();
    let task = tokio::spawn(run(db, job_id, worker_id, interval, scope, stop_rx));
    HeartbeatGuard {
        _stop: stop_tx,
        _task: AbortOnDropHandle::new(task),
    }
}

async fn run(
    db: JobsDb,
    job_id: JobId,
    worker_id: WorkerId,
    interval: Duration,
    scope: CancellationToken,
    mut stop_rx: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The claim wrote the initial heartbeat; consume the immediate first tick.
    ticker.tick().await;

    tracing::debug!(%job_id, "job heartbeat started");

    let mut consecutive_failures = 0u32;
    loop {
        tokio::select! {
            _ = &mut stop_rx => {
                tracing::debug!(%job_id, "job heartbeat stopped");
                return;
            }
            () = scope.cancelled() => {
                tracing::debug!(%job_id, "job heartbeat stopped, scope cancelled");
                return;
            }
            _ = ticker.tick() => {}
        }

        match jobs::touch_heartbeat(db.pool(), &job_id, worker_id.as_str()).await {
            Ok(true) => {
                consecutive_failures = 0;
                tracing::trace!(%job_id, "job heartbeat updated");
            }
            Ok(false) => {
                // The row left RUNNING under us (finalized or canceled).
                tracing::debug!(%job_id, "job no longer running under this worker, heartbeat loop exiting");
                return;
            }
            Err(err) => {
                consecutive_failures += 1;
                tracing::warn!(
                    %job_id,
                    error = %err,
                    error_source = logging::error_source(&err),
                    consecutive_failures,
                    "failed to update job heartbeat"
                );
                if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                    tracing::warn!(%job_id, "giving up on job heartbeat after repeated failures");
                    return;
                }
            }
        }
    }
}

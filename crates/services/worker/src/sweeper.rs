//! Reclaim sweeper: crash recovery for abandoned jobs.
//!
//! A worker that dies between claim and finalize leaves its row RUNNING
//! with a heartbeat that stops refreshing. The sweeper periodically returns
//! such rows to PENDING and publishes fresh notifications so any worker can
//! pick them up. The claim guard makes a lost race with a live worker
//! harmless.

use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use jobs_db::{jobs, Error as JobsDbError, JobsDb};
use monitoring::logging;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::{broker::Broker, notif::Notification};

/// A heartbeat is stale once it is older than this many intervals.
const STALENESS_FACTOR: i64 = 2;

/// Periodic stale-job reclaim task.
pub(crate) struct Sweeper {
    db: JobsDb,
    broker: Broker,
    heartbeat_interval: Duration,
    sweep_interval: Duration,
}

impl Sweeper {
    pub(crate) fn new(
        db: JobsDb,
        broker: Broker,
        heartbeat_interval: Duration,
        sweep_interval: Duration,
    ) -> Self {
        Self {
            db,
            broker,
            heartbeat_interval,
            sweep_interval,
        }
    }

    /// Run sweep rounds until the stop signal.
    pub(crate) async fn run(self, stop: CancellationToken) {
        let mut ticker = tokio::time::interval(self.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // Skip the interval's immediate first tick: freshly started workers
        // have nothing of their own to reclaim yet.
        ticker.tick().await;

        tracing::debug!("reclaim sweeper started");

        loop {
            tokio::select! {
                () = stop.cancelled() => {
                    tracing::debug!("reclaim sweeper stopping, stop signaled");
                    return;
                }
                _ = ticker.tick() => {}
            }

            self.sweep_once().await;
        }
    }

    /// One sweep round. Errors degrade the round, never the worker.
    async fn sweep_once(&self) {
        let staleness = chrono::Duration::seconds(
            self.heartbeat_interval.as_secs() as i64 * STALENESS_FACTOR,
        );
        let cutoff = chrono::Utc::now() - staleness;

        let reclaimed = (|| async {
            jobs::reclaim_stale(self.db.pool(), cutoff)
                .await
                .map_err(JobsDbError::Db)
        })
        .retry(ExponentialBuilder::default())
        .when(JobsDbError::is_connection_error)
        .notify(|err, dur| {
            tracing::warn!(
                error = %err,
                "Connection error while reclaiming stale jobs. Retrying in {:.1}s",
                dur.as_secs_f32()
            );
        })
        .await;

        let reclaimed = match reclaimed {
            Ok(reclaimed) => reclaimed,
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    error_source = logging::error_source(&err),
                    "stale-job reclaim failed, skipping this round"
                );
                return;
            }
        };

        for job_id in reclaimed {
            tracing::info!(%job_id, "reclaimed stale job, re-enqueueing");

            let notif = Notification::new(job_id);
            let published = (|| self.broker.publish_notification(&notif))
                .retry(ExponentialBuilder::default())
                .notify(|err, dur| {
                    tracing::warn!(
                        %job_id,
                        error = %err,
                        "Failed to publish reclaim notification. Retrying in {:.1}s",
                        dur.as_secs_f32()
                    );
                })
                .await;

            if let Err(err) = published {
                // The row stays PENDING without a notification; it will be
                // picked up by a redelivery or operator action.
                tracing::error!(
                    %job_id,
                    error = %err,
                    error_source = logging::error_source(&err),
                    "failed to re-enqueue reclaimed job"
                );
            }
        }
    }
}

//! Job executor: drives one claimed job through its full lifecycle.
//!
//! The sequence for one notification is strictly serial: claim, parse
//! payload, derive the timeout scope, start the heartbeat, run the handler,
//! finalize. The broker acknowledgment for the notification happens after
//! this returns, so the terminal DB write always happens-before the ack.

use std::{sync::Arc, time::Duration};

use jobs_db::{jobs, Job, JobId, JobsDb};
use monitoring::logging;
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;

use crate::{
    error::ExecuteError,
    handler::{HandlerError, HandlerRegistry},
    heartbeat,
    worker_id::WorkerId,
};

/// Processing seam between the pool and the executor.
#[async_trait::async_trait]
pub trait Execute: Send + Sync {
    /// Process one notification for the given job.
    async fn process(&self, scope: &CancellationToken, job_id: JobId) -> Result<(), ExecuteError>;
}

/// Executes claimed jobs with timeout enforcement and liveness reporting.
pub struct Executor {
    db: JobsDb,
    worker_id: WorkerId,
    handlers: Arc<HandlerRegistry>,
    default_timeout: Duration,
    heartbeat_interval: Duration,
}

impl Executor {
    pub fn new(
        db: JobsDb,
        worker_id: WorkerId,
        handlers: Arc<HandlerRegistry>,
        default_timeout: Duration,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            db,
            worker_id,
            handlers,
            default_timeout,
            heartbeat_interval,
        }
    }

    async fn process_job(
        &self,
        scope: &CancellationToken,
        job_id: JobId,
    ) -> Result<(), ExecuteError> {
        // 1. Claim: PENDING -> RUNNING, atomically. A zero-row result means
        // some other worker owns the job or the row left PENDING; a driver
        // failure rides broker redelivery instead of being retried here.
        let job = match jobs::claim(self.db.pool(), &job_id, self.worker_id.as_str()).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                tracing::warn!(%job_id, "job already claimed, skipping");
                return Err(ExecuteError::AlreadyClaimed);
            }
            Err(err) => {
                tracing::error!(
                    %job_id,
                    error = %err,
                    error_source = logging::error_source(&err),
                    "failed to claim job"
                );
                return Err(ExecuteError::Retryable(Box::new(err)));
            }
        };

        tracing::info!(%job_id, job_type = %job.job_type, "job claimed");

        // 2. Parse payload. The row is RUNNING and owned by us, so writing
        // FAILED on a decode error is safe.
        let payload = match parse_payload(&job.payload) {
            Ok(payload) => payload,
            Err(err) => {
                let message = format!("Invalid payload JSON: {err}");
                tracing::error!(%job_id, error = %err, "failed to parse job payload");
                self.persist_failed(&job, &message).await;
                return Err(ExecuteError::InvalidPayload(err));
            }
        };

        // 3. Derive the job scope: row override or worker default.
        let timeout = if job.timeout_seconds > 0 {
            Duration::from_secs(job.timeout_seconds as u64)
        } else {
            self.default_timeout
        };
        let job_scope = scope.child_token();

        // 4. Heartbeat loop, stopped when the guard drops on return.
        let heartbeat_guard = heartbeat::spawn(
            self.db.clone(),
            job.job_id,
            self.worker_id.clone(),
            self.heartbeat_interval,
            job_scope.clone(),
        );

        // 5. Dispatch on job_type under the deadline.
        let outcome = match self.handlers.get(&job.job_type) {
            None => Err(HandlerError::fatal(format!(
                "no handler registered for job type '{}'",
                job.job_type
            ))),
            Some(handler) => {
                match tokio::time::timeout(timeout, handler.execute(&job_scope, &job, &payload))
                    .await
                {
                    Ok(result) => result,
                    Err(_elapsed) => {
                        job_scope.cancel();
                        Err(HandlerError::retryable(format!(
                            "job execution exceeded its {:.0}s deadline",
                            timeout.as_secs_f64()
                        )))
                    }
                }
            }
        };

        // 6. Finalize.
        drop(heartbeat_guard);
        self.finalize(&job, outcome).await
    }

    /// Translate the handler outcome into the terminal persistence write and
    /// the error category the pool maps to an acknowledgment.
    async fn finalize(
        &self,
        job: &Job,
        outcome: Result<JsonValue, HandlerError>,
    ) -> Result<(), ExecuteError> {
        match outcome {
            Ok(result) => {
                tracing::info!(job_id = %job.job_id, job_type = %job.job_type, "job completed");

                // The side effect already happened; a failure to persist the
                // terminal status must not cause re-execution.
                match jobs::mark_completed(self.db.pool(), &job.job_id, self.worker_id.as_str(), &result)
                    .await
                {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::warn!(
                            job_id = %job.job_id,
                            "job left RUNNING before finalize (canceled externally?), leaving its state untouched"
                        );
                    }
                    Err(err) => {
                        tracing::error!(
                            job_id = %job.job_id,
                            error = %err,
                            error_source = logging::error_source(&err),
                            "failed to persist COMPLETED status"
                        );
                    }
                }
                Ok(())
            }
            Err(handler_err) => {
                tracing::error!(
                    job_id = %job.job_id,
                    job_type = %job.job_type,
                    error = %handler_err,
                    "job execution failed"
                );

                if handler_err.is_retryable() && job.has_retries_left() {
                    // Keep the row claimable: back to PENDING with the retry
                    // accounted, then let the requeued notification race for it.
                    tracing::info!(
                        job_id = %job.job_id,
                        retry_count = job.retry_count,
                        max_retries = job.max_retries,
                        "job will be retried"
                    );
                    match jobs::release_for_retry(
                        self.db.pool(),
                        &job.job_id,
                        self.worker_id.as_str(),
                        handler_err.message(),
                    )
                    .await
                    {
                        Ok(true) => {}
                        Ok(false) => {
                            tracing::warn!(
                                job_id = %job.job_id,
                                "job left RUNNING before retry release (canceled externally?), leaving its state untouched"
                            );
                        }
                        Err(err) => {
                            // The row stays RUNNING under us; the reclaim
                            // sweeper will return it to the queue once the
                            // heartbeat goes stale.
                            tracing::error!(
                                job_id = %job.job_id,
                                error = %err,
                                error_source = logging::error_source(&err),
                                "failed to release job for retry"
                            );
                        }
                    }
                    return Err(ExecuteError::Retryable(Box::new(handler_err)));
                }

                if handler_err.is_retryable() {
                    tracing::warn!(
                        job_id = %job.job_id,
                        retry_count = job.retry_count,
                        max_retries = job.max_retries,
                        "job exceeded max retries"
                    );
                    self.persist_failed(job, handler_err.message()).await;
                    Err(ExecuteError::MaxRetriesExceeded(handler_err))
                } else {
                    self.persist_failed(job, handler_err.message()).await;
                    Err(ExecuteError::Unclassified(Box::new(handler_err)))
                }
            }
        }
    }

    /// Best-effort FAILED write with the ownership guard; logged only.
    async fn persist_failed(&self, job: &Job, message: &str) {
        match jobs::mark_failed(self.db.pool(), &job.job_id, self.worker_id.as_str(), message).await
        {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(
                    job_id = %job.job_id,
                    "job left RUNNING before finalize (canceled externally?), leaving its state untouched"
                );
            }
            Err(err) => {
                tracing::error!(
                    job_id = %job.job_id,
                    error = %err,
                    error_source = logging::error_source(&err),
                    "failed to persist FAILED status"
                );
            }
        }
    }
}

#[async_trait::async_trait]
impl Execute for Executor {
    async fn process(&self, scope: &CancellationToken, job_id: JobId) -> Result<(), ExecuteError> {
        self.process_job(scope, job_id).await
    }
}

/// Decode the payload text. An empty payload is an empty document, not an
/// error.
fn parse_payload(payload: &str) -> Result<JsonValue, serde_json::Error> {
    if payload.is_empty() {
        return Ok(JsonValue::Object(serde_json::Map::new()));
    }
    serde_json::from_str(payload)
}

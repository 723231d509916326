//! Worker composition and run loop.
//!
//! Wires the broker consumer, the dispatcher, the agent pool, and the
//! reclaim sweeper together, and owns the graceful shutdown sequence:
//! stop signal out, in-flight jobs run to completion bounded by the
//! shutdown timeout, then the process reports graceful or forced.

use std::sync::Arc;

use conveyor_config::Config;
use jobs_db::JobsDb;
use tokio_util::{sync::CancellationToken, task::AbortOnDropHandle};

use crate::{
    broker::{Broker, BrokerError},
    dispatcher,
    executor::Executor,
    handler::HandlerRegistry,
    pool::WorkerPool,
    sweeper::Sweeper,
    worker_id::WorkerId,
};

/// How a worker run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    /// All agents finished within the shutdown timeout.
    Graceful,

    /// The shutdown timeout expired with jobs still in flight; their
    /// notifications will be redelivered by the broker.
    Forced,
}

impl Shutdown {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Graceful => "graceful",
            Self::Forced => "forced",
        }
    }
}

impl std::fmt::Display for Shutdown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur while running the worker.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    /// Failed to open the broker consumer.
    #[error("failed to open broker consumer")]
    Consume(#[source] BrokerError),

    /// The broker delivery stream closed while the worker was running.
    ///
    /// Queued work was drained before returning; the process should exit
    /// so the orchestrator can restart it against a healthy broker.
    #[error("broker delivery stream closed")]
    DeliveryStreamClosed,
}

/// The background job worker.
pub struct Worker {
    worker_id: WorkerId,
    config: Config,
    db: JobsDb,
    broker: Broker,
    handlers: Arc<HandlerRegistry>,
}

impl Worker {
    /// Create a new worker instance with a process-derived identity.
    #[must_use]
    pub fn new(config: Config, db: JobsDb, broker: Broker, handlers: HandlerRegistry) -> Self {
        Self {
            worker_id: WorkerId::for_process(),
            config,
            db,
            broker,
            handlers: Arc::new(handlers),
        }
    }

    /// The identity this worker claims jobs under.
    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    /// Run the worker until `shutdown` is cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error if the consumer cannot be opened or the broker
    /// delivery stream closes underneath the worker.
    pub async fn run(self, shutdown: CancellationToken) -> Result<Shutdown, RunError> {
        let concurrency = self.config.worker.concurrency.get();
        let shutdown_timeout = self.config.worker.shutdown_timeout.get();

        tracing::info!(
            worker_id = %self.worker_id,
            concurrency,
            prefetch_count = self.config.broker.prefetch_count,
            queue = %self.config.broker.queue_name,
            "starting worker"
        );

        // The consumer tag is the worker identity; prefetch caps in-flight
        // deliveries per consumer and is the dominant backpressure.
        let consumer = self
            .broker
            .consume(self.worker_id.as_str(), self.config.broker.prefetch_count)
            .await
            .map_err(RunError::Consume)?;

        // `stop` ends intake (dispatcher and idle agents); `job_scope` is
        // the parent scope of every job and is only cancelled when a forced
        // shutdown abandons in-flight work.
        let stop = CancellationToken::new();
        let job_scope = CancellationToken::new();

        // Capacity 2N absorbs burstiness while the prefetch window stays
        // the dominant limit.
        let (work_tx, work_rx) = tokio::sync::mpsc::channel(concurrency * 2);

        let executor = Arc::new(Executor::new(
            self.db.clone(),
            self.worker_id.clone(),
            Arc::clone(&self.handlers),
            self.config.worker.job_timeout.get(),
            self.config.worker.heartbeat_interval.get(),
        ));

        let pool = WorkerPool::spawn(
            concurrency,
            executor,
            Arc::new(self.broker.clone()),
            work_rx,
            stop.clone(),
            job_scope.clone(),
        );

        let mut dispatcher_handle = AbortOnDropHandle::new(tokio::spawn(dispatcher::run(
            consumer,
            work_tx,
            stop.clone(),
        )));

        let sweeper = Sweeper::new(
            self.db.clone(),
            self.broker.clone(),
            self.config.worker.heartbeat_interval.get(),
            self.config.worker.reclaim_interval.get(),
        );
        let _sweeper_handle = AbortOnDropHandle::new(tokio::spawn(sweeper.run(stop.clone())));

        tracing::info!(worker_id = %self.worker_id, "worker started");

        // Wait for a shutdown request, or for the dispatcher to die on a
        // closed delivery stream.
        let stream_closed = tokio::select! {
            () = shutdown.cancelled() => {
                tracing::info!(worker_id = %self.worker_id, "shutdown requested");
                false
            }
            _ = &mut dispatcher_handle => {
                tracing::error!(worker_id = %self.worker_id, "dispatcher exited unexpectedly");
                true
            }
        };

        // 1. Broadcast stop: the dispatcher and idle agents exit, busy
        //    agents finish their current job first. When the delivery
        //    stream closed on its own, the work channel is already closed
        //    and the agents drain the queued items instead.
        if !stream_closed {
            stop.cancel();
        }

        // 2.-3. Bounded drain of in-flight work.
        let graceful = pool.join(shutdown_timeout).await;
        if !graceful {
            tracing::warn!(
                worker_id = %self.worker_id,
                timeout_secs = shutdown_timeout.as_secs(),
                "shutdown timeout exceeded, abandoning in-flight jobs"
            );
            job_scope.cancel();
        }
        stop.cancel();

        // 4. The work channel closed when the dispatcher dropped its sender;
        //    dropping the handles reaps the background tasks.
        if stream_closed {
            return Err(RunError::DeliveryStreamClosed);
        }

        let outcome = if graceful {
            Shutdown::Graceful
        } else {
            Shutdown::Forced
        };
        tracing::info!(worker_id = %self.worker_id, outcome = %outcome, "worker stopped");
        Ok(outcome)
    }
}

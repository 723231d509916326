//! Worker pool: N parallel processing agents.
//!
//! Each agent serializes claim, execute, finalize for one notification at a
//! time, then issues exactly one broker acknowledgment for it before
//! accepting another. The requeue decision comes only from the error
//! category reported by the executor.

use std::{sync::Arc, time::Duration};

use monitoring::logging;
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use jobs_db::JobId;

use crate::{
    broker::{log_ack_failure, Acknowledge},
    executor::Execute,
};

/// One unit of work handed from the dispatcher to an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkItem {
    pub job_id: JobId,
    pub delivery_tag: u64,
}

/// A fixed set of processing agents consuming from one work channel.
pub struct WorkerPool {
    agents: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `size` agents.
    ///
    /// Agents stop accepting new work when `stop` is cancelled or the work
    /// channel closes; in-flight jobs run to completion unless `job_scope`
    /// is cancelled.
    pub fn spawn(
        size: usize,
        executor: Arc<dyn Execute>,
        acker: Arc<dyn Acknowledge>,
        work_rx: mpsc::Receiver<WorkItem>,
        stop: CancellationToken,
        job_scope: CancellationToken,
    ) -> Self {
        let work_rx = Arc::new(Mutex::new(work_rx));
        let agents = (0..size)
            .map(|agent_num| {
                tokio::spawn(agent_loop(
                    agent_num,
                    Arc::clone(&executor),
                    Arc::clone(&acker),
                    Arc::clone(&work_rx),
                    stop.clone(),
                    job_scope.clone(),
                ))
            })
            .collect();
        Self { agents }
    }

    /// Wait for every agent to exit, bounded by `deadline`.
    ///
    /// Returns `true` when all agents finished in time (graceful) and
    /// `false` on timeout (forced); in the forced case the unfinished
    /// notifications are redelivered by the broker once their visibility
    /// expires.
    pub async fn join(self, deadline: Duration) -> bool {
        let join_all = async {
            for agent in self.agents {
                let _ = agent.await;
            }
        };
        tokio::time::timeout(deadline, join_all).await.is_ok()
    }
}

async fn agent_loop(
    agent_num: usize,
    executor: Arc<dyn Execute>,
    acker: Arc<dyn Acknowledge>,
    work_rx: Arc<Mutex<mpsc::Receiver<WorkItem>>>,
    stop: CancellationToken,
    job_scope: CancellationToken,
) {
    tracing::debug!(agent_num, "processing agent started");

    loop {
        let item = tokio::select! {
            () = stop.cancelled() => {
                tracing::debug!(agent_num, "processing agent stopping, stop signaled");
                break;
            }
            item = recv(&work_rx) => match item {
                Some(item) => item,
                None => {
                    tracing::debug!(agent_num, "processing agent stopping, work channel closed");
                    break;
                }
            },
        };

        tracing::debug!(
            agent_num,
            job_id = %item.job_id,
            delivery_tag = item.delivery_tag,
            "agent received job"
        );

        // The acknowledgment happens-after the executor's terminal DB write:
        // an observer can never see an acked delivery whose row is RUNNING.
        match executor.process(&job_scope, item.job_id).await {
            Ok(()) => {
                if let Err(err) = acker.ack(item.delivery_tag).await {
                    log_ack_failure(&err, item.delivery_tag);
                }
            }
            Err(err) => {
                let requeue = err.should_requeue();
                tracing::error!(
                    agent_num,
                    job_id = %item.job_id,
                    error = %err,
                    error_source = logging::error_source(&err),
                    requeue,
                    "job processing failed"
                );
                if let Err(ack_err) = acker.nack(item.delivery_tag, requeue).await {
                    log_ack_failure(&ack_err, item.delivery_tag);
                }
            }
        }
    }
}

/// Receive one item; agents share the receiver behind a lock.
///
/// Dropping the future (on stop) releases the lock without consuming.
async fn recv(work_rx: &Mutex<mpsc::Receiver<WorkItem>>) -> Option<WorkItem> {
    work_rx.lock().await.recv().await
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::{
        broker::BrokerError,
        error::ExecuteError,
        handler::HandlerError,
    };

    /// Executor double returning pre-scripted outcomes in order.
    struct ScriptedExecutor {
        script: Mutex<VecDeque<Result<(), ExecuteError>>>,
    }

    impl ScriptedExecutor {
        fn new(script: Vec<Result<(), ExecuteError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
            })
        }
    }

    #[async_trait::async_trait]
    impl Execute for ScriptedExecutor {
        async fn process(
            &self,
            _scope: &CancellationToken,
            _job_id: JobId,
        ) -> Result<(), ExecuteError> {
            self.script.lock().await.pop_front().unwrap_or(Ok(()))
        }
    }

    /// What the pool told the broker about a delivery.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum AckCall {
        Ack(u64),
        Nack(u64, bool),
    }

    #[derive(Default)]
    struct RecordingAcker {
        calls: Mutex<Vec<AckCall>>,
    }

    #[async_trait::async_trait]
    impl Acknowledge for RecordingAcker {
        async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
            self.calls.lock().await.push(AckCall::Ack(delivery_tag));
            Ok(())
        }

        async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
            self.calls
                .lock()
                .await
                .push(AckCall::Nack(delivery_tag, requeue));
            Ok(())
        }
    }

    fn work_item(delivery_tag: u64) -> WorkItem {
        WorkItem {
            job_id: JobId::random(),
            delivery_tag,
        }
    }

    #[tokio::test]
    async fn success_is_acked_exactly_once() {
        //* Given
        let executor = ScriptedExecutor::new(vec![Ok(())]);
        let acker = Arc::new(RecordingAcker::default());
        let (work_tx, work_rx) = mpsc::channel(2);
        let pool = WorkerPool::spawn(
            1,
            executor,
            Arc::clone(&acker) as Arc<dyn Acknowledge>,
            work_rx,
            CancellationToken::new(),
            CancellationToken::new(),
        );

        //* When
        work_tx.send(work_item(7)).await.expect("send must succeed");
        drop(work_tx);
        assert!(pool.join(Duration::from_secs(5)).await, "pool must drain");

        //* Then
        let calls = acker.calls.lock().await;
        assert_eq!(*calls, vec![AckCall::Ack(7)]);
    }

    #[tokio::test]
    async fn error_category_decides_the_requeue_flag() {
        //* Given
        let invalid_payload_err =
            serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let executor = ScriptedExecutor::new(vec![
            Err(ExecuteError::AlreadyClaimed),
            Err(ExecuteError::Retryable("db glitch".into())),
            Err(ExecuteError::MaxRetriesExceeded(HandlerError::retryable(
                "still failing",
            ))),
            Err(ExecuteError::InvalidPayload(invalid_payload_err)),
            Err(ExecuteError::Unclassified("who knows".into())),
        ]);
        let acker = Arc::new(RecordingAcker::default());
        let (work_tx, work_rx) = mpsc::channel(8);
        // A single agent keeps the acknowledgment order deterministic
        let pool = WorkerPool::spawn(
            1,
            executor,
            Arc::clone(&acker) as Arc<dyn Acknowledge>,
            work_rx,
            CancellationToken::new(),
            CancellationToken::new(),
        );

        //* When
        for delivery_tag in 1..=5 {
            work_tx
                .send(work_item(delivery_tag))
                .await
                .expect("send must succeed");
        }
        drop(work_tx);
        assert!(pool.join(Duration::from_secs(5)).await, "pool must drain");

        //* Then
        let calls = acker.calls.lock().await;
        assert_eq!(
            *calls,
            vec![
                AckCall::Nack(1, false), // AlreadyClaimed
                AckCall::Nack(2, true),  // Retryable
                AckCall::Nack(3, false), // MaxRetriesExceeded
                AckCall::Nack(4, false), // InvalidPayload
                AckCall::Nack(5, false), // Unclassified (fail-closed)
            ]
        );
    }

    #[tokio::test]
    async fn every_item_gets_exactly_one_acknowledgment() {
        //* Given
        let executor = ScriptedExecutor::new(vec![
            Ok(()),
            Err(ExecuteError::Retryable("glitch".into())),
            Ok(()),
            Err(ExecuteError::AlreadyClaimed),
        ]);
        let acker = Arc::new(RecordingAcker::default());
        let (work_tx, work_rx) = mpsc::channel(8);
        let pool = WorkerPool::spawn(
            2,
            executor,
            Arc::clone(&acker) as Arc<dyn Acknowledge>,
            work_rx,
            CancellationToken::new(),
            CancellationToken::new(),
        );

        //* When
        for delivery_tag in 1..=4 {
            work_tx
                .send(work_item(delivery_tag))
                .await
                .expect("send must succeed");
        }
        drop(work_tx);
        assert!(pool.join(Duration::from_secs(5)).await, "pool must drain");

        //* Then
        let calls = acker.calls.lock().await;
        assert_eq!(calls.len(), 4, "one acknowledgment per delivery");

        let mut acked_tags: Vec<u64> = calls
            .iter()
            .map(|call| match call {
                AckCall::Ack(tag) | AckCall::Nack(tag, _) => *tag,
            })
            .collect();
        acked_tags.sort_unstable();
        assert_eq!(acked_tags, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn stop_signal_ends_idle_agents() {
        //* Given
        let executor = ScriptedExecutor::new(vec![]);
        let acker = Arc::new(RecordingAcker::default());
        let (_work_tx, work_rx) = mpsc::channel(2);
        let stop = CancellationToken::new();
        let pool = WorkerPool::spawn(
            3,
            executor,
            Arc::clone(&acker) as Arc<dyn Acknowledge>,
            work_rx,
            stop.clone(),
            CancellationToken::new(),
        );

        //* When
        stop.cancel();

        //* Then
        assert!(
            pool.join(Duration::from_secs(5)).await,
            "idle agents must observe the stop signal"
        );
        assert!(acker.calls.lock().await.is_empty());
    }

    #[tokio::test]
    async fn agents_drain_the_queue_when_the_channel_closes() {
        //* Given
        let executor = ScriptedExecutor::new(vec![Ok(()), Ok(()), Ok(())]);
        let acker = Arc::new(RecordingAcker::default());
        let (work_tx, work_rx) = mpsc::channel(8);
        let pool = WorkerPool::spawn(
            1,
            executor,
            Arc::clone(&acker) as Arc<dyn Acknowledge>,
            work_rx,
            CancellationToken::new(),
            CancellationToken::new(),
        );

        //* When: the dispatcher goes away with items still queued
        for delivery_tag in 1..=3 {
            work_tx
                .send(work_item(delivery_tag))
                .await
                .expect("send must succeed");
        }
        drop(work_tx);

        //* Then
        assert!(pool.join(Duration::from_secs(5)).await, "pool must drain");
        assert_eq!(acker.calls.lock().await.len(), 3);
    }
}

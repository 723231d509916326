//! Background job worker service.
//!
//! This crate provides the worker component that consumes job notifications
//! from the message broker, claims the corresponding rows in the jobs
//! database using an optimistic lock, executes them under concurrency and
//! timeout limits with liveness heartbeats, and finalizes each broker
//! delivery with exactly one acknowledgment.
//!
//! The worker is composed of a dispatcher feeding a bounded work channel, a
//! fixed pool of processing agents, a per-job executor with a heartbeat
//! loop, and a reclaim sweeper that returns jobs abandoned by crashed
//! workers to the queue.

mod broker;
mod dispatcher;
mod error;
mod executor;
mod handler;
mod heartbeat;
mod notif;
mod pool;
mod sweeper;
mod worker;
mod worker_id;

pub use self::{
    broker::{Acknowledge, Broker, BrokerError},
    error::{BoxError, ExecuteError},
    executor::{Execute, Executor},
    handler::{HandlerError, HandlerRegistry, JobHandler},
    notif::{Notification, ParseNotificationError},
    pool::{WorkItem, WorkerPool},
    worker::{RunError, Shutdown, Worker},
    worker_id::{InvalidIdError, WorkerId},
};

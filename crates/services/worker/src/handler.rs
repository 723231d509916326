//! Job handler dispatch.
//!
//! `job_type` selects a handler from a registry; new job types are added by
//! registering a handler, without touching the executor core. Handlers must
//! be responsive to cancellation of the scope they are given.

use std::{collections::HashMap, sync::Arc, time::Duration};

use jobs_db::Job;
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;

use crate::error::BoxError;

/// A type-specific job handler.
///
/// The handler receives the cancellation scope of the job (carrying the
/// per-job deadline), the claimed row, and the decoded payload document,
/// and returns either a result document or an error. Execution is
/// at-least-once: handlers must be idempotent.
#[async_trait::async_trait]
pub trait JobHandler: Send + Sync {
    async fn execute(
        &self,
        scope: &CancellationToken,
        job: &Job,
        payload: &JsonValue,
    ) -> Result<JsonValue, HandlerError>;
}

/// A failure reported by a job handler.
///
/// The `retryable` marker is the handler's signal that the failure is
/// transient and worth another attempt; unmarked failures are treated as
/// fatal regardless of the retry budget.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
    retryable: bool,
    #[source]
    source: Option<BoxError>,
}

impl HandlerError {
    /// A fatal failure: the job will not be retried.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
            source: None,
        }
    }

    /// A transient failure: the job may be retried if budget remains.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
            source: None,
        }
    }

    /// Attach the underlying cause.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<BoxError>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Whether the handler marked this failure as transient.
    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    /// The human-readable failure reason, persisted to `error_message`.
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Registry mapping `job_type` discriminators to handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the built-in handlers (`echo`, `sleep`).
    #[must_use]
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register("echo", Arc::new(EchoHandler));
        registry.register("sleep", Arc::new(SleepHandler));
        registry
    }

    /// Register a handler for a job type, replacing any previous one.
    pub fn register(&mut self, job_type: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(job_type.into(), handler);
    }

    /// Look up the handler for a job type.
    pub fn get(&self, job_type: &str) -> Option<&Arc<dyn JobHandler>> {
        self.handlers.get(job_type)
    }

    /// The registered job types, for startup logging.
    pub fn job_types(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("job_types", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Echoes the payload back as the job result.
struct EchoHandler;

#[async_trait::async_trait]
impl JobHandler for EchoHandler {
    async fn execute(
        &self,
        _scope: &CancellationToken,
        job: &Job,
        payload: &JsonValue,
    ) -> Result<JsonValue, HandlerError> {
        Ok(serde_json::json!({
            "status": "success",
            "message": format!("job {} of type {} completed", job.job_id, job.job_type),
            "echoed": payload,
        }))
    }
}

/// Sleeps for `duration_secs` from the payload (default: 1 second).
///
/// Exists to exercise timeouts and cancellation end to end.
struct SleepHandler;

#[async_trait::async_trait]
impl JobHandler for SleepHandler {
    async fn execute(
        &self,
        scope: &CancellationToken,
        _job: &Job,
        payload: &JsonValue,
    ) -> Result<JsonValue, HandlerError> {
        let duration_secs = payload
            .get("duration_secs")
            .and_then(JsonValue::as_f64)
            .unwrap_or(1.0);

        tokio::select! {
            () = tokio::time::sleep(Duration::from_secs_f64(duration_secs)) => {
                Ok(serde_json::json!({ "status": "success", "slept_secs": duration_secs }))
            }
            () = scope.cancelled() => {
                Err(HandlerError::retryable("sleep interrupted by cancellation"))
            }
        }
    }
}

//! Error taxonomy for one processed notification.
//!
//! The pool inspects only the category of the error, never its message, to
//! decide the broker acknowledgment. Anything outside the known categories
//! is treated conservatively and not requeued.

use crate::handler::HandlerError;

/// A boxed error with the usual bounds.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Classified outcome of driving one job through the executor.
#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    /// A competing worker won the claim race, or the row is no longer
    /// PENDING (canceled, finished, or deleted).
    #[error("job already claimed or not in PENDING status")]
    AlreadyClaimed,

    /// The payload text is not decodable. Poison from this row's
    /// perspective; the row is moved to FAILED best-effort.
    #[error("invalid job payload")]
    InvalidPayload(#[source] serde_json::Error),

    /// The job failed and has no retries remaining. Terminal.
    #[error("max retries exceeded")]
    MaxRetriesExceeded(#[source] HandlerError),

    /// A transient failure. The notification should be requeued so the job
    /// can be attempted again.
    #[error("retryable job failure")]
    Retryable(#[source] BoxError),

    /// Anything else. Fail-closed: not requeued.
    #[error("unclassified job failure")]
    Unclassified(#[source] BoxError),
}

impl ExecuteError {
    /// Whether the pool should nack the delivery with `requeue=true`.
    ///
    /// Only [`ExecuteError::Retryable`] requeues; every other category
    /// drops the delivery to the broker's dead-letter policy.
    pub fn should_requeue(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::HandlerError;

    #[test]
    fn only_retryable_errors_request_requeue() {
        let already_claimed = ExecuteError::AlreadyClaimed;
        assert!(!already_claimed.should_requeue());

        let invalid_payload = ExecuteError::InvalidPayload(
            serde_json::from_str::<serde_json::Value>("{not json").unwrap_err(),
        );
        assert!(!invalid_payload.should_requeue());

        let max_retries =
            ExecuteError::MaxRetriesExceeded(HandlerError::retryable("still failing"));
        assert!(!max_retries.should_requeue());

        let retryable = ExecuteError::Retryable("db glitch".into());
        assert!(retryable.should_requeue());

        let unclassified = ExecuteError::Unclassified("who knows".into());
        assert!(!unclassified.should_requeue());
    }
}

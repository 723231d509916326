//! Job notification wire format.
//!
//! A notification is a small UTF-8 JSON object carrying the `job_id` of a
//! persisted row. Its only authority is to wake a worker; the durable row
//! is the source of truth. Additional fields are ignored.

use jobs_db::JobId;

/// The payload of a job notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Notification {
    pub job_id: JobId,
}

impl Notification {
    /// A notification waking workers for the given job.
    #[must_use]
    pub fn new(job_id: JobId) -> Self {
        Self { job_id }
    }
}

/// Parse a notification body.
///
/// Both failure modes are poison-message failures: the delivery must be
/// nacked without requeue so it cannot loop on the main queue.
pub fn parse(body: &[u8]) -> Result<Notification, ParseNotificationError> {
    #[derive(serde::Deserialize)]
    struct RawNotification {
        job_id: String,
    }

    let raw: RawNotification =
        serde_json::from_slice(body).map_err(ParseNotificationError::Malformed)?;
    let job_id = raw
        .job_id
        .parse()
        .map_err(|source| ParseNotificationError::InvalidJobId {
            job_id: raw.job_id,
            source,
        })?;
    Ok(Notification { job_id })
}

/// A notification body that cannot be turned into a work item.
#[derive(Debug, thiserror::Error)]
pub enum ParseNotificationError {
    /// The body is not a JSON object with a string `job_id`.
    #[error("malformed notification body")]
    Malformed(#[source] serde_json::Error),

    /// The `job_id` field is not a well-formed UUID.
    #[error("notification job_id '{job_id}' is not a valid UUID")]
    InvalidJobId {
        job_id: String,
        #[source]
        source: uuid::Error,
    },
}

//! Jobs table row types and queries
//!
//! Query functions are generic over the executor so they compose with both
//! the shared pool and explicit transactions.

use chrono::{DateTime, Utc};
use sqlx::{types::JsonValue, Postgres};
use uuid::Uuid;

/// A job row as persisted in the `jobs` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Job {
    /// Stable external identifier for the job
    pub job_id: JobId,

    /// Discriminator selecting the handler
    pub job_type: String,

    /// Opaque JSON payload text (may be empty)
    pub payload: String,

    /// Current status of the job
    pub status: JobStatus,

    /// Identity of the claiming worker while the job is running
    pub worker_id: Option<String>,

    /// Number of times the job has been retried so far
    pub retry_count: i32,

    /// Maximum number of retries before the job fails terminally
    pub max_retries: i32,

    /// Per-job execution budget in seconds; 0 means the worker default
    pub timeout_seconds: i32,

    /// Handler output document, set on COMPLETED
    pub result: Option<JsonValue>,

    /// Human-readable failure reason, set on FAILED
    pub error_message: Option<String>,

    /// Submitting user, if any
    pub user_id: Option<String>,

    /// Submission-time dedup key; unique across non-null values
    pub idempotency_key: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Whether the job still has retries remaining.
    pub fn has_retries_left(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

/// A new job to insert.
///
/// Insertion is normally the submission API's business; the worker crate
/// uses it in tests and fixtures.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_id: JobId,
    pub job_type: String,
    pub payload: String,
    pub max_retries: i32,
    pub timeout_seconds: i32,
    pub user_id: Option<String>,
    pub idempotency_key: Option<String>,
}

impl NewJob {
    /// A new job of the given type with defaults for everything else.
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            job_id: JobId::random(),
            job_type: job_type.into(),
            payload: String::new(),
            max_retries: 0,
            timeout_seconds: 0,
            user_id: None,
            idempotency_key: None,
        }
    }
}

/// Insert a new job in [`JobStatus::Pending`].
///
/// A duplicate non-null `idempotency_key` violates the partial unique index
/// and surfaces as a database error.
pub async fn insert<'c, E>(exe: E, job: &NewJob) -> Result<JobId, sqlx::Error>
where
    E: sqlx::Executor<'c, Database = Postgres>,
{
    let query = indoc::indoc! {r#"
        INSERT INTO jobs (job_id, job_type, payload, status, max_retries, timeout_seconds, user_id, idempotency_key)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        RETURNING job_id
    "#};
    let res = sqlx::query_scalar(query)
        .bind(job.job_id)
        .bind(&job.job_type)
        .bind(&job.payload)
        .bind(JobStatus::Pending)
        .bind(job.max_retries)
        .bind(job.timeout_seconds)
        .bind(&job.user_id)
        .bind(&job.idempotency_key)
        .fetch_one(exe)
        .await?;
    Ok(res)
}

/// Get a job by its ID
pub async fn get<'c, E>(exe: E, job_id: &JobId) -> Result<Option<Job>, sqlx::Error>
where
    E: sqlx::Executor<'c, Database = Postgres>,
{
    let query = indoc::indoc! {r#"
        SELECT *
        FROM jobs
        WHERE job_id = $1
    "#};
    let res = sqlx::query_as(query).bind(job_id).fetch_optional(exe).await?;
    Ok(res)
}

/// Atomically claim a pending job for a worker.
///
/// The conditional UPDATE is the optimistic lock: the row comes back if and
/// only if it was [`JobStatus::Pending`] at the instant of the update. A
/// `None` result means the row was already claimed, canceled, or deleted.
pub async fn claim<'c, E>(exe: E, job_id: &JobId, worker_id: &str) -> Result<Option<Job>, sqlx::Error>
where
    E: sqlx::Executor<'c, Database = Postgres>,
{
    let query = indoc::indoc! {r#"
        UPDATE jobs
        SET status = $3,
            worker_id = $2,
            started_at = now(),
            last_heartbeat_at = now(),
            updated_at = now()
        WHERE job_id = $1
          AND status = $4
        RETURNING *
    "#};
    let res = sqlx::query_as(query)
        .bind(job_id)
        .bind(worker_id)
        .bind(JobStatus::Running)
        .bind(JobStatus::Pending)
        .fetch_optional(exe)
        .await?;
    Ok(res)
}

/// Persist a successful terminal state for an owned running job.
///
/// Returns `false` if the guard did not match, i.e. the row is no longer
/// RUNNING under this worker (for example canceled externally). Callers log
/// that and must not treat it as failure of the job itself.
pub async fn mark_completed<'c, E>(
    exe: E,
    job_id: &JobId,
    worker_id: &str,
    result: &JsonValue,
) -> Result<bool, sqlx::Error>
where
    E: sqlx::Executor<'c, Database = Postgres>,
{
    let query = indoc::indoc! {r#"
        UPDATE jobs
        SET status = $4,
            result = $3,
            error_message = NULL,
            completed_at = now(),
            updated_at = now()
        WHERE job_id = $1
          AND status = $5
          AND worker_id = $2
    "#};
    let res = sqlx::query(query)
        .bind(job_id)
        .bind(worker_id)
        .bind(result)
        .bind(JobStatus::Completed)
        .bind(JobStatus::Running)
        .execute(exe)
        .await?;
    Ok(res.rows_affected() > 0)
}

/// Persist a failed terminal state for an owned running job.
///
/// Same ownership guard and return convention as [`mark_completed`].
pub async fn mark_failed<'c, E>(
    exe: E,
    job_id: &JobId,
    worker_id: &str,
    error_message: &str,
) -> Result<bool, sqlx::Error>
where
    E: sqlx::Executor<'c, Database = Postgres>,
{
    let query = indoc::indoc! {r#"
        UPDATE jobs
        SET status = $4,
            error_message = $3,
            completed_at = now(),
            updated_at = now()
        WHERE job_id = $1
          AND status = $5
          AND worker_id = $2
    "#};
    let res = sqlx::query(query)
        .bind(job_id)
        .bind(worker_id)
        .bind(error_message)
        .bind(JobStatus::Failed)
        .bind(JobStatus::Running)
        .execute(exe)
        .await?;
    Ok(res.rows_affected() > 0)
}

/// Release an owned running job back to PENDING for another attempt.
///
/// Increments `retry_count`, clears ownership, and records the failure
/// reason without making the state terminal. The requeued notification can
/// then claim the row again.
pub async fn release_for_retry<'c, E>(
    exe: E,
    job_id: &JobId,
    worker_id: &str,
    error_message: &str,
) -> Result<bool, sqlx::Error>
where
    E: sqlx::Executor<'c, Database = Postgres>,
{
    let query = indoc::indoc! {r#"
        UPDATE jobs
        SET status = $4,
            worker_id = NULL,
            retry_count = retry_count + 1,
            error_message = $3,
            updated_at = now()
        WHERE job_id = $1
          AND status = $5
          AND worker_id = $2
    "#};
    let res = sqlx::query(query)
        .bind(job_id)
        .bind(worker_id)
        .bind(error_message)
        .bind(JobStatus::Pending)
        .bind(JobStatus::Running)
        .execute(exe)
        .await?;
    Ok(res.rows_affected() > 0)
}

/// Refresh the liveness timestamp of an owned running job.
///
/// Returns `false` when no row matched, which means the job is no longer
/// RUNNING under this worker; the heartbeat loop treats that as a signal to
/// stop, not as an error.
pub async fn touch_heartbeat<'c, E>(
    exe: E,
    job_id: &JobId,
    worker_id: &str,
) -> Result<bool, sqlx::Error>
where
    E: sqlx::Executor<'c, Database = Postgres>,
{
    let query = indoc::indoc! {r#"
        UPDATE jobs
        SET last_heartbeat_at = now(),
            updated_at = now()
        WHERE job_id = $1
          AND status = $3
          AND worker_id = $2
    "#};
    let res = sqlx::query(query)
        .bind(job_id)
        .bind(worker_id)
        .bind(JobStatus::Running)
        .execute(exe)
        .await?;
    Ok(res.rows_affected() > 0)
}

/// Return stale RUNNING rows to PENDING so they can be re-enqueued.
///
/// A row is stale when its `last_heartbeat_at` is older than the given
/// cutoff; the owning worker is presumed dead. Returns the reclaimed job
/// IDs so the caller can publish fresh notifications for them.
pub async fn reclaim_stale<'c, E>(
    exe: E,
    heartbeat_cutoff: DateTime<Utc>,
) -> Result<Vec<JobId>, sqlx::Error>
where
    E: sqlx::Executor<'c, Database = Postgres>,
{
    let query = indoc::indoc! {r#"
        UPDATE jobs
        SET status = $2,
            worker_id = NULL,
            updated_at = now()
        WHERE status = $3
          AND last_heartbeat_at < $1
        RETURNING job_id
    "#};
    let res = sqlx::query_scalar(query)
        .bind(heartbeat_cutoff)
        .bind(JobStatus::Pending)
        .bind(JobStatus::Running)
        .fetch_all(exe)
        .await?;
    Ok(res)
}

/// A unique identifier for a job
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    sqlx::Type,
    serde::Serialize,
    serde::Deserialize,
)]
#[repr(transparent)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Generate a fresh random (v4) job ID
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// The inner [`Uuid`]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl From<Uuid> for JobId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl From<JobId> for Uuid {
    fn from(id: JobId) -> Self {
        id.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<Uuid>().map(Self)
    }
}

/// Represents the current status of a job
///
/// The status is stored as a `TEXT` column in the database. If the fetched
/// status is not one of the valid values in the enum, the `UNKNOWN` status
/// is returned.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[non_exhaustive]
pub enum JobStatus {
    /// Job has been submitted but not yet picked up by any worker.
    ///
    /// This is the initial state of a job. Retried and reclaimed jobs also
    /// return here.
    #[default]
    Pending,

    /// Job has been claimed by a worker and is being executed.
    Running,

    /// Job has finished successfully
    ///
    /// This is a terminal state.
    Completed,

    /// Job has failed and exhausted any retries
    ///
    /// This is a terminal state.
    Failed,

    /// Job was canceled by an external actor
    ///
    /// This is a terminal state. The worker never produces it but must
    /// never overwrite it.
    Canceled,

    /// Unknown status
    ///
    /// Should never happen, although it is possible if the worker version
    /// differs from the version of the submission service.
    Unknown,
}

impl JobStatus {
    /// Whether this status is terminal: no later update reopens it.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }

    /// Convert the [`JobStatus`] to a string
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Canceled => "CANCELED",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Use `eq_ignore_ascii_case` to make the comparison case-insensitive
        match s {
            s if s.eq_ignore_ascii_case("PENDING") => Ok(Self::Pending),
            s if s.eq_ignore_ascii_case("RUNNING") => Ok(Self::Running),
            s if s.eq_ignore_ascii_case("COMPLETED") => Ok(Self::Completed),
            s if s.eq_ignore_ascii_case("FAILED") => Ok(Self::Failed),
            s if s.eq_ignore_ascii_case("CANCELED") => Ok(Self::Canceled),
            _ => Ok(Self::Unknown),
        }
    }
}

impl serde::Serialize for JobStatus {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> serde::Deserialize<'de> for JobStatus {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s: &str = serde::Deserialize::deserialize(deserializer)?;
        // Since FromStr::Err is Infallible, unwrap is safe.
        Ok(s.parse().unwrap())
    }
}

impl sqlx::Type<sqlx::Postgres> for JobStatus {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        sqlx::postgres::PgTypeInfo::with_name("TEXT")
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Postgres> for JobStatus {
    fn decode(
        value: <sqlx::Postgres as sqlx::Database>::ValueRef<'r>,
    ) -> Result<Self, sqlx::error::BoxDynError> {
        let value: &str = sqlx::Decode::<sqlx::Postgres>::decode(value)?;
        // Since FromStr::Err is Infallible, unwrap is safe.
        Ok(value.parse().unwrap())
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Postgres> for JobStatus {
    fn encode_by_ref(
        &self,
        buf: &mut <sqlx::Postgres as sqlx::Database>::ArgumentBuffer<'q>,
    ) -> Result<sqlx::encode::IsNull, sqlx::error::BoxDynError> {
        sqlx::Encode::<sqlx::Postgres>::encode_by_ref(&self.as_str(), buf)
    }
}

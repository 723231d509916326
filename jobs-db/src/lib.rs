//! Storage facade for the `jobs` table.
//!
//! The worker claims, heartbeats, and finalizes jobs exclusively through
//! this crate. Every mutating query on an owned job carries a
//! `status = 'RUNNING' AND worker_id = <owner>` guard, so the optimistic
//! claim is the only synchronization the workers need.

mod conn;
pub mod jobs;

pub use self::{
    conn::DbConnPool,
    jobs::{Job, JobId, JobStatus, NewJob},
};

/// Errors returned by the jobs DB facade.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error connecting to the jobs DB.
    #[error("error connecting to jobs db")]
    Connection(#[source] sqlx::Error),

    /// An error occurred while running migrations.
    #[error("error running migrations")]
    Migration(#[source] sqlx::migrate::MigrateError),

    /// Jobs DB query error.
    #[error("jobs db error")]
    Db(#[from] sqlx::Error),
}

impl Error {
    /// Whether the error is a (possibly transient) connection-level failure.
    ///
    /// Retry policies key off this predicate; query-level errors are never
    /// retried blindly.
    pub fn is_connection_error(&self) -> bool {
        match self {
            Self::Connection(_) => true,
            Self::Migration(_) => false,
            Self::Db(err) => matches!(
                err,
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
            ),
        }
    }
}

/// A cloneable handle to the jobs database.
#[derive(Debug, Clone)]
pub struct JobsDb {
    pool: DbConnPool,
}

impl JobsDb {
    /// Sets up a connection pool to the jobs DB and runs migrations.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, Error> {
        let pool = DbConnPool::connect(url, max_connections).await?;
        pool.run_migrations().await?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool without running migrations.
    pub fn from_pool(pool: DbConnPool) -> Self {
        Self { pool }
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &sqlx::Pool<sqlx::Postgres> {
        &self.pool
    }
}

//! Internal connection pool implementation

use std::time::Duration;

use sqlx::{migrate::Migrator, postgres::PgPoolOptions, Pool, Postgres};
use tracing::instrument;

use crate::Error;

/// A connection pool to the jobs DB.
#[derive(Debug, Clone)]
pub struct DbConnPool(Pool<Postgres>);

impl DbConnPool {
    /// Set up a connection pool to the jobs DB.
    #[instrument(skip_all, err)]
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, Error> {
        PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(url)
            .await
            .map(Self)
            .map_err(Error::Connection)
    }

    /// Runs migrations on the database.
    ///
    /// SQLx does the right things:
    /// - Locks the DB before running migrations.
    /// - Never runs the same migration twice.
    /// - Errors on changes to old migrations.
    #[instrument(skip(self), err)]
    pub async fn run_migrations(&self) -> Result<(), Error> {
        static MIGRATOR: Migrator = sqlx::migrate!();
        MIGRATOR.run(&self.0).await.map_err(Error::Migration)
    }
}

impl std::ops::Deref for DbConnPool {
    type Target = Pool<Postgres>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

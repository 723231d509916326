//! The background job worker daemon.
//!
//! Consumes job notifications from the broker, executes the corresponding
//! jobs from the jobs database, and exits 0 on a clean stop.

use std::path::PathBuf;

use conveyor_worker::{Broker, HandlerRegistry, Shutdown, Worker};
use jobs_db::JobsDb;
use tokio_util::sync::CancellationToken;

#[derive(Debug, clap::Parser)]
#[command(version, about)]
struct Args {
    /// The configuration file to use.
    #[arg(long, env = "CONVEYORD_CONFIG", default_value = "conveyor.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    if let Err(err) = main_inner().await {
        // Manually print the error so we can control the format.
        let err = error_with_causes(&err);
        eprintln!("Exiting with error: {err}");
        std::process::exit(1);
    }
}

async fn main_inner() -> Result<(), Error> {
    monitoring::logging::init();

    let Args { config: config_path } = clap::Parser::parse();

    let config = conveyor_config::load_config(&config_path).map_err(Error::Config)?;

    let db = JobsDb::connect(&config.database.url, config.database.max_connections)
        .await
        .map_err(Error::Db)?;
    tracing::info!("jobs database connection established");

    let broker = Broker::connect(&config.broker).await.map_err(Error::Broker)?;
    tracing::info!("broker connection established");

    let worker = Worker::new(config, db, broker, HandlerRegistry::builtin());
    tracing::info!(worker_id = %worker.worker_id(), "worker service starting");

    let shutdown = CancellationToken::new();
    let signal_task = tokio::spawn(signal_listener(shutdown.clone()));

    let outcome = worker.run(shutdown).await.map_err(Error::Run)?;
    signal_task.abort();

    match outcome {
        Shutdown::Graceful => tracing::info!("worker service shutdown complete"),
        Shutdown::Forced => tracing::warn!("worker service shutdown forced"),
    }

    Ok(())
}

/// Cancel the shutdown token on SIGINT or SIGTERM.
async fn signal_listener(shutdown: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGTERM handler");
                let _ = ctrl_c.await;
                shutdown.cancel();
                return;
            }
        };

        tokio::select! {
            _ = ctrl_c => tracing::info!("received SIGINT, shutting down gracefully"),
            _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down gracefully"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
        tracing::info!("received interrupt, shutting down gracefully");
    }

    shutdown.cancel();
}

/// Unrecoverable initialization or runtime failures.
#[derive(Debug, thiserror::Error)]
enum Error {
    #[error("failed to load configuration")]
    Config(#[source] conveyor_config::LoadConfigError),

    #[error("failed to initialize jobs database")]
    Db(#[source] jobs_db::Error),

    #[error("failed to initialize broker")]
    Broker(#[source] conveyor_worker::BrokerError),

    #[error("worker runtime error")]
    Run(#[source] conveyor_worker::RunError),
}

/// Render an error with its full source chain, one cause per line.
fn error_with_causes(err: &dyn std::error::Error) -> String {
    let mut out = err.to_string();
    let mut current = err.source();
    while let Some(cause) = current {
        out.push_str(&format!("\n  caused by: {cause}"));
        current = cause.source();
    }
    out
}

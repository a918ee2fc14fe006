//! kfleet scheduler entry point.
//!
//! Boots the reconciler against the configured master: loads the cluster
//! snapshot (fatal on failure), serves artifacts over HTTP, and runs the
//! driver until it stops. Exits 0 only when the driver terminated in the
//! stopped state.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use kfleet_mesos::{DriverStatus, FrameworkInfo, HttpSchedulerDriver, SchedulerDriver};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use kfleet_scheduler::{artifact, Cluster, Config, Reconciler, TaskBuilder};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting kfleet scheduler");

    let config = Config::from_env()?;
    info!(
        master_url = %config.master_url,
        listen_addr = %config.listen_addr,
        storage_path = %config.storage_path.display(),
        "Configuration loaded"
    );

    // Task handles do not survive a scheduler restart; status updates and
    // fresh offers repopulate runtime state after registration.
    let mut cluster = Cluster::new(&config.storage_path);
    cluster
        .load(true)
        .context("failed to load cluster snapshot")?;
    info!(brokers = cluster.get_brokers().len(), "Cluster loaded");

    let reconciler = Arc::new(Reconciler::new(cluster, TaskBuilder::from_config(&config)));

    let app = artifact::create_router(Arc::clone(&reconciler), &config.artifact_dir);
    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, "Artifact server listening");
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "Artifact server failed");
        }
    });

    let driver = Arc::new(HttpSchedulerDriver::new(
        &config.master_url,
        FrameworkInfo {
            user: config.framework_user.clone(),
            name: config.framework_name.clone(),
            id: None,
            failover_timeout: None,
        },
    ));

    {
        let driver = Arc::clone(&driver);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received, stopping driver");
                driver.stop();
            }
        });
    }

    let status = driver.run(reconciler).await;
    info!(status = ?status, "Driver terminated");

    // Driver first, artifact server second.
    server.abort();

    Ok(match status {
        DriverStatus::Stopped => ExitCode::SUCCESS,
        DriverStatus::Aborted => ExitCode::from(1),
    })
}

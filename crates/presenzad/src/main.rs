use anyhow::Result;
use presenza_store::Store;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod pipeline;
mod service;

use config::Config;
use dbus_interface::AttendanceService;
use pipeline::RecognitionResult;
use service::Service;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("presenzad starting");

    let config = Config::from_env();
    let store = Arc::new(Store::open(&config.db_path)?);
    let service = Service::start(config, Arc::clone(&store))?;

    let connection = zbus::connection::Builder::session()?
        .name("org.presenza.Attendance1")?
        .serve_at(
            "/org/presenza/Attendance1",
            AttendanceService::new(Arc::clone(&service)),
        )?
        .build()
        .await?;
    tracing::info!("D-Bus interface registered");

    // The pipeline needs the models; enrollment and reports are served over
    // D-Bus in the meantime, failing with NotReady until loading finishes.
    let pipeline = {
        let service = Arc::clone(&service);
        tokio::task::spawn_blocking(move || {
            service.wait_ready(Duration::from_secs(120));
            match service.start_pipeline() {
                Ok(handle) => {
                    handle.subscribe(log_result);
                    Some(handle)
                }
                Err(err) => {
                    tracing::warn!(error = %err, "recognition pipeline not started");
                    None
                }
            }
        })
        .await?
    };

    tracing::info!("presenzad ready");
    tokio::signal::ctrl_c().await?;
    tracing::info!("presenzad shutting down");

    if let Some(mut handle) = pipeline {
        handle.stop();
    }
    drop(connection);
    Ok(())
}

fn log_result(result: &RecognitionResult) {
    match result {
        RecognitionResult::CheckIn { name, at, .. } => {
            tracing::info!(name, at = %at, "checked in");
        }
        RecognitionResult::CheckOut { name, at, .. } => {
            tracing::info!(name, at = %at, "checked out");
        }
        RecognitionResult::Suppressed { name, reason, .. } => {
            tracing::debug!(name, ?reason, "event suppressed");
        }
        RecognitionResult::NoMatch => {}
    }
}

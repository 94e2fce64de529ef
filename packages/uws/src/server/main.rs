// Main entry point for the UWS server

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uws_core::kernel::{Job, JobResult, JobTask, TaskError};
use uws_core::server::build_app;
use uws_core::{Config, TaskRegistry, UwsConfig};

/// Demo work unit: sleeps for the `duration` parameter (milliseconds),
/// checking for cancellation, then records one text result.
struct SleepTask;

#[async_trait]
impl JobTask for SleepTask {
    async fn run(&self, job: Arc<Job>, cancel: CancellationToken) -> Result<(), TaskError> {
        let duration_ms = job
            .parameter("duration")
            .and_then(|value| {
                value
                    .as_i64()
                    .or_else(|| value.as_str().and_then(|text| text.parse().ok()))
            })
            .unwrap_or(1000)
            .max(0) as u64;

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(duration_ms)) => {}
            _ = cancel.cancelled() => return Ok(()),
        }

        job.add_result(JobResult::new("slept"))
            .map_err(|error| TaskError::fatal(error.to_string()))?;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,uws_core=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting UWS server");

    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;
    let service_config = match &config.config_path {
        Some(path) => UwsConfig::load(path)?,
        None => {
            tracing::info!("UWS_CONFIG not set, running the demo service");
            UwsConfig::demo()
        }
    };

    // Register the job work the config refers to
    let mut tasks = TaskRegistry::new();
    tasks.insert("sleep".to_string(), Arc::new(SleepTask) as _);

    // Build and start the service (restores any backup)
    let service = service_config
        .build_service(&tasks)
        .await
        .context("Failed to build the UWS service")?;
    service.start().await.context("Failed to start the service")?;

    let app = build_app(service.clone());

    // Start server
    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown requested");
        })
        .await
        .context("Server error")?;

    // Stop managers and flush the backup
    service.stop().await;
    tracing::info!("UWS server stopped");
    Ok(())
}

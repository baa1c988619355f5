use std::path::Path;

use libconfd::metrics;
use libconfd::utils::file_io::create_parent_dir_if_not_exist;
use libconfd::BackendRegistry;
use libconfd::Error;
use libconfd::Processor;
use libconfd::Result;
use libconfd::Settings;
use libconfd::SystemError;
use tokio::signal::unix::signal;
use tokio::signal::unix::SignalKind;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() -> Result<()> {
    let settings = Settings::load(None)?;

    // Initializing Logs
    let _guard = init_observability(&settings.log.log_dir, &settings.log.file_name)?;

    let shutdown = CancellationToken::new();
    if settings.monitoring.prometheus_enabled {
        let port = settings.monitoring.prometheus_port;
        let token = shutdown.clone();
        tokio::spawn(metrics::start_server(port, token));
    }

    let registry = BackendRegistry::with_defaults();
    let client = registry.new_backend_client(settings.backend.clone()).await?;

    let processor = Processor::new();
    let handle = processor.go(settings.confd.clone(), client.clone()).await?;
    info!("Application started. Waiting for completion or a shutdown signal...");

    let result = tokio::select! {
        r = handle.wait() => r,
        r = wait_for_signal() => r,
    };

    processor.close().await;
    client.close().await;
    shutdown.cancel();

    if let Err(e) = &result {
        error!("confd stops: {}", e);
    }
    info!("Exiting program.");
    result
}

async fn wait_for_signal() -> Result<()> {
    let mut sigint = signal(SignalKind::interrupt()).map_err(SystemError::IoError)?;
    let mut sigterm = signal(SignalKind::terminate()).map_err(SystemError::IoError)?;
    tokio::select! {
        _ = sigint.recv() => {
            info!("SIGINT detected.");
        },
        _ = sigterm.recv() => {
            info!("SIGTERM detected.");
        },
    }
    Ok(())
}

pub fn init_observability(
    log_dir: &Path,
    file_name: &str,
) -> Result<WorkerGuard> {
    let log_path = log_dir.join(file_name);
    create_parent_dir_if_not_exist(&log_path)?;
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .map_err(|e| {
            Error::System(SystemError::PathError {
                path: log_path.clone(),
                source: e,
            })
        })?;

    let (non_blocking, guard) = tracing_appender::non_blocking(log_file);
    let base_subscriber = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::from_default_env());
    tracing_subscriber::registry().with(base_subscriber).init();

    Ok(guard)
}

//! Service bus worker entry point.

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use servicebus_sagas::scheduler::InMemorySchedulerStore;
use servicebus_worker::config::WorkerConfig;
use servicebus_worker::kernel::Kernel;
use servicebus_worker::telemetry;
use servicebus_worker::transport::InMemoryTransport;
use servicebus_worker::worker::Worker;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Configuration file is optional; environment overrides always apply.
    let config_path = std::env::var("SERVICEBUS_CONFIG").ok().map(PathBuf::from);
    let config = WorkerConfig::load(config_path.as_deref())?;

    telemetry::init_tracing(&config.log_filter, config.log_format)?;
    tracing::info!(service = %config.service_name, "Starting service bus worker");

    let kernel = Kernel::builder(config)
        .with_scheduler_store(Arc::new(InMemorySchedulerStore::new()))
        .build()?;
    let transport = Arc::new(InMemoryTransport::new());
    let worker = Arc::new(Worker::new(Arc::new(kernel), transport));

    let (shutdown, signal) = watch::channel(false);
    let running = tokio::spawn(worker.run(signal));

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");
    shutdown.send(true)?;
    running.await??;

    Ok(())
}

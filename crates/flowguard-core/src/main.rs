use std::sync::Once;

use anyhow::Result;
use tokio::signal;
use tracing::info;

use flowguard_core::collectors;
use flowguard_core::config::PipelineConfig;
use flowguard_core::pipeline::Pipeline;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = PipelineConfig::load()?;
    let pipeline = Pipeline::start(config.clone(), Vec::new()).await?;

    info!(
        sensor_id = %config.sensor_id,
        collectors = config.collectors.len(),
        partitions = config.bus.partitions,
        audit_backend = %config.audit.backend,
        "flowguard core started"
    );

    let collector_tasks =
        collectors::spawn_collectors(&config.collectors, pipeline.collector()).await?;

    wait_for_shutdown_signal().await;

    collector_tasks.abort_all_and_wait().await;
    pipeline.shutdown().await;
    info!("flowguard core stopped");
    Ok(())
}

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(tracing_subscriber::fmt::init);
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("register SIGTERM handler");
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("shutdown signal received (SIGINT)");
            }
            _ = sigterm.recv() => {
                info!("shutdown signal received (SIGTERM)");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
        info!("shutdown signal received");
    }
}

use anyhow::Context;

use flowforge_engine::ProcessEngine;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    flowforge_observability::init();

    let engine = ProcessEngine::from_env()
        .await
        .context("failed to build process engine")?;

    tracing::info!(engine = %engine.name(), "engine running; press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    tracing::info!("shutdown signal received");
    let report = engine.shutdown().await;
    if !report.drained {
        tracing::warn!(abandoned = report.abandoned, "shutdown timed out with jobs in flight");
    }
    Ok(())
}

use anyhow::Context;

use batchflow_service::{build_services, seed_demo_records};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    batchflow_observability::init();

    let config = batchflow_infra::BatchflowConfig::from_env().context("invalid configuration")?;
    let services = build_services(config).context("failed to start worker pool")?;

    let seeded = seed_demo_records(&services.store, services.config.seed_records);
    tracing::info!(records = seeded.len(), workers = services.pool.size(), "store seeded");

    // Accepted immediately; the batch runs on the pool while we hold the handle.
    let accepted = services.process_items().await;
    let batch_id = accepted.id;
    let report = accepted.wait().await?;

    if let Some(state) = services.tracker.status(&batch_id).await {
        tracing::info!(batch_id = %batch_id, state = %serde_json::to_string(&state)?, "batch state");
    }
    for failure in &report.failures {
        tracing::warn!(record_id = %failure.id, error = %failure.error, "record not processed");
    }

    println!("{}", serde_json::to_string_pretty(&report.processed)?);

    let stats = services.processor.stats();
    tracing::info!(stats = %serde_json::to_string(&stats)?, "processor stats");

    tokio::task::spawn_blocking(move || services.shutdown())
        .await
        .context("worker pool shutdown panicked")?;

    Ok(())
}

use anyhow::{bail, Result};
use meter_client::db::statistics_queries;
use meter_client::domain::statistic_id;
use reading_service::{
    config::AppConfig, metrics_server, observability, HistoryReconciler, JsonFileStorage,
    MeterService, PgHistoryStore, ReadingStore,
};
use sqlx::postgres::PgPoolOptions;
use std::env;

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        bail!("usage: rebuild_history <meter> [--incremental]");
    }
    let meter = &args[1];
    let complete_wipe = !args.iter().skip(2).any(|a| a == "--incremental");

    // Configuration (point READING_SERVICE_CONFIG at an alternate file).
    let cfg = AppConfig::load()?;

    if let Some(metrics_cfg) = &cfg.metrics {
        metrics_server::init(&metrics_cfg.bind_addr)?;
    }

    let pool = PgPoolOptions::new()
        .max_connections(cfg.history_db.max_connections)
        .connect(&cfg.history_db.uri)
        .await?;

    let store = ReadingStore::new(JsonFileStorage::new(&cfg.storage.path));
    let reconciler = HistoryReconciler::new(PgHistoryStore::new(pool.clone()))
        .with_settings(cfg.reconcile.settings());
    let service = MeterService::new(store, reconciler);

    let outcome = service.rebuild_history(meter, complete_wipe).await?;
    tracing::info!(
        meter,
        mode = outcome.mode.as_str(),
        readings = outcome.readings_processed,
        consumption_updates = outcome.consumption_updates,
        statistics = outcome.report.statistics_written,
        snapshots = outcome.report.snapshots_written,
        failures = outcome.report.failures.len(),
        "rebuild finished"
    );

    if let Some(latest) = statistics_queries::latest_statistic(&pool, &statistic_id(meter)).await? {
        tracing::info!(
            start_ts = %latest.start_ts,
            sum = latest.sum,
            "latest statistic point after rebuild"
        );
    }

    Ok(())
}

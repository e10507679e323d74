use std::{env, fs::File};

use anyhow::{bail, Context, Result};
use csv::StringRecord;
use reading_service::{
    config::AppConfig, observability, HistoryReconciler, JsonFileStorage, MeterService,
    NewReading, PgHistoryStore, ReadingStore,
};
use sqlx::postgres::PgPoolOptions;
use time::OffsetDateTime;

/// Expected header columns (by name):
/// - timestamp (RFC3339)
/// - value
/// - unit (optional)
/// - notes (optional)
fn record_to_new_reading(record: &StringRecord, headers: &StringRecord) -> Result<NewReading> {
    let get = |name: &str| -> Option<&str> {
        headers
            .iter()
            .position(|h| h == name)
            .and_then(|idx| record.get(idx))
    };

    let ts_str = get("timestamp").context("missing column 'timestamp'")?;
    let timestamp = OffsetDateTime::parse(
        ts_str.trim(),
        &time::format_description::well_known::Rfc3339,
    )
    .with_context(|| format!("invalid timestamp '{ts_str}'"))?;

    let value_str = get("value").context("missing column 'value'")?;
    let value: f64 = value_str
        .trim()
        .parse()
        .with_context(|| format!("invalid value '{value_str}'"))?;

    let optional = |s: Option<&str>| {
        s.map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    Ok(NewReading {
        timestamp: Some(timestamp),
        value,
        unit: optional(get("unit")),
        notes: optional(get("notes")),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        bail!("usage: import_readings <meter> <csv_file_path>");
    }
    let meter = &args[1];
    let file_path = &args[2];

    let cfg = AppConfig::load()?;

    let pool = PgPoolOptions::new()
        .max_connections(cfg.history_db.max_connections)
        .connect(&cfg.history_db.uri)
        .await?;

    let file = File::open(file_path).with_context(|| format!("failed to open {file_path}"))?;
    let mut rdr = csv::Reader::from_reader(file);
    let headers = rdr.headers().context("failed to read CSV headers")?.clone();

    let mut readings = Vec::new();
    for (row, result) in rdr.records().enumerate() {
        let record = result.with_context(|| format!("failed to read CSV record {}", row + 2))?;
        let reading = record_to_new_reading(&record, &headers)
            .with_context(|| format!("bad CSV record at line {}", row + 2))?;
        readings.push(reading);
    }

    let store = ReadingStore::new(JsonFileStorage::new(&cfg.storage.path));
    let reconciler = HistoryReconciler::new(PgHistoryStore::new(pool))
        .with_settings(cfg.reconcile.settings());
    let service = MeterService::new(store, reconciler);

    let report = service.bulk_import(meter, readings).await;

    for error in &report.errors {
        tracing::warn!(timestamp = %error.timestamp, error = %error.error, "import item failed");
    }
    tracing::info!(
        meter,
        imported = report.success_count,
        failed = report.error_count,
        "import finished"
    );

    if report.error_count > 0 {
        std::process::exit(1);
    }
    Ok(())
}

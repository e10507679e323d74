use std::collections::HashMap;
use std::sync::Arc;

use meter_client::domain::{Reading, TimePeriod, DEFAULT_UNIT};
use time::OffsetDateTime;
use tokio::sync::Mutex;

use crate::rebuild::{self, RebuildError, RebuildMode, RebuildOutcome};
use crate::reconcile::{HistoryReconciler, HistoryStore};
use crate::storage::LogStorage;
use crate::store::{ReadingStore, StoreError};

#[derive(thiserror::Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Rebuild(#[from] RebuildError),
    #[error("no meter reading at or before {0} to derive the ending value from")]
    NoBaselineReading(OffsetDateTime),
}

/// Caller-supplied reading fields; everything the command surface accepts.
/// Timestamp defaults to "now", unit to kWh.
#[derive(Debug, Clone)]
pub struct NewReading {
    pub timestamp: Option<OffsetDateTime>,
    pub value: f64,
    pub unit: Option<String>,
    pub notes: Option<String>,
}

impl NewReading {
    pub fn at(timestamp: OffsetDateTime, value: f64) -> Self {
        Self {
            timestamp: Some(timestamp),
            value,
            unit: None,
            notes: None,
        }
    }

    fn into_reading(self) -> Reading {
        Reading::new(
            self.timestamp.unwrap_or_else(OffsetDateTime::now_utc),
            self.value,
            self.unit.unwrap_or_else(|| DEFAULT_UNIT.to_string()),
            self.notes,
        )
    }
}

#[derive(Debug)]
pub struct BulkImportError {
    pub timestamp: OffsetDateTime,
    pub error: String,
}

/// Tally of a bulk import. The batch has no transactionality: every item is
/// attempted and failures are reported individually.
#[derive(Debug, Default)]
pub struct BulkImportReport {
    pub success_count: usize,
    pub error_count: usize,
    pub errors: Vec<BulkImportError>,
    pub reading_ids: Vec<String>,
}

#[derive(Debug)]
pub struct MeterReadingAdded {
    pub reading: Reading,
    /// Consumption derived against the nearest prior reading, when one exists.
    pub consumption: Option<f64>,
}

#[derive(Debug)]
pub struct ConsumptionPeriodAdded {
    pub reading: Reading,
    /// Baseline value + supplied consumption.
    pub ending_value: f64,
}

/// Command surface over the reading store and the reconciliation engine.
///
/// Mutations for one meter are serialized by a per-meter guard (mutation and
/// the reconciliation push must not interleave); different meters proceed in
/// parallel. Nothing here supports cancellation: bulk imports and rebuilds
/// run item-by-item to completion or failure.
pub struct MeterService<S: LogStorage, H: HistoryStore> {
    store: Mutex<ReadingStore<S>>,
    reconciler: HistoryReconciler<H>,
    meter_locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl<S: LogStorage, H: HistoryStore> MeterService<S, H> {
    pub fn new(store: ReadingStore<S>, reconciler: HistoryReconciler<H>) -> Self {
        Self {
            store: Mutex::new(store),
            reconciler,
            meter_locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    fn meter_lock(&self, meter: &str) -> Arc<Mutex<()>> {
        self.meter_locks
            .lock()
            .expect("meter lock registry poisoned")
            .entry(meter.to_string())
            .or_default()
            .clone()
    }

    /// Record a raw reading. On success the stored reading (with derived
    /// consumption) is returned and its statistic point is pushed to the
    /// secondary store.
    pub async fn add_reading(
        &self,
        meter: &str,
        reading: NewReading,
    ) -> Result<Reading, ServiceError> {
        let lock = self.meter_lock(meter);
        let _guard = lock.lock().await;
        self.add_locked(meter, reading.into_reading()).await
    }

    /// Record a meter reading, deriving consumption against the nearest
    /// prior reading and retroactively fixing every later reading's figures.
    pub async fn add_meter_reading(
        &self,
        meter: &str,
        timestamp: OffsetDateTime,
        value: f64,
        notes: Option<String>,
        unit: Option<String>,
    ) -> Result<MeterReadingAdded, ServiceError> {
        let lock = self.meter_lock(meter);
        let _guard = lock.lock().await;

        let reading = NewReading {
            timestamp: Some(timestamp),
            value,
            unit,
            notes,
        }
        .into_reading();
        let stored = self.add_locked(meter, reading).await?;

        // Later readings were re-derived against the new predecessor; push
        // their refreshed figures too.
        let suffix: Vec<Reading> = self
            .store
            .lock()
            .await
            .list(meter)
            .await?
            .into_iter()
            .filter(|r| r.timestamp > timestamp)
            .collect();
        if !suffix.is_empty() {
            let report = self.reconciler.project_readings(meter, &suffix).await;
            if report.is_degraded() {
                tracing::warn!(
                    meter,
                    failures = report.failures.len(),
                    "projection of subsequent readings degraded"
                );
            }
        }

        Ok(MeterReadingAdded {
            consumption: stored.consumption,
            reading: stored,
        })
    }

    /// Record consumption for a period; the ending cumulative value is
    /// derived from the latest reading at or before the period start.
    pub async fn add_consumption_period(
        &self,
        meter: &str,
        period_start: OffsetDateTime,
        period_end: OffsetDateTime,
        consumption: f64,
        notes: Option<String>,
        unit: Option<String>,
    ) -> Result<ConsumptionPeriodAdded, ServiceError> {
        let lock = self.meter_lock(meter);
        let _guard = lock.lock().await;

        let baseline = {
            let mut store = self.store.lock().await;
            store
                .list(meter)
                .await?
                .into_iter()
                .filter(|r| r.timestamp <= period_start)
                .next_back()
        };
        let Some(baseline) = baseline else {
            return Err(ServiceError::NoBaselineReading(period_start));
        };

        let ending_value = baseline.value + consumption;
        let reading = NewReading {
            timestamp: Some(period_end),
            value: ending_value,
            unit,
            notes,
        }
        .into_reading();
        let stored = self.add_locked(meter, reading).await?;

        Ok(ConsumptionPeriodAdded {
            reading: stored,
            ending_value,
        })
    }

    /// Replace an existing reading and refresh its projection.
    pub async fn update_reading(
        &self,
        meter: &str,
        reading_id: &str,
        reading: NewReading,
    ) -> Result<Reading, ServiceError> {
        let lock = self.meter_lock(meter);
        let _guard = lock.lock().await;

        let stored = self
            .store
            .lock()
            .await
            .update(meter, reading_id, reading.into_reading())
            .await?;

        let report = self.reconciler.project_reading(meter, &stored).await;
        if report.is_degraded() {
            tracing::warn!(meter, reading_id, "projection refresh degraded");
        }
        Ok(stored)
    }

    /// Remove one reading; later readings get their refreshed consumption
    /// figures pushed to the secondary store.
    pub async fn delete_reading(
        &self,
        meter: &str,
        reading_id: &str,
    ) -> Result<Reading, ServiceError> {
        let lock = self.meter_lock(meter);
        let _guard = lock.lock().await;

        let removed = self.store.lock().await.delete(meter, reading_id).await?;

        let suffix: Vec<Reading> = self
            .store
            .lock()
            .await
            .list(meter)
            .await?
            .into_iter()
            .filter(|r| r.timestamp > removed.timestamp)
            .collect();
        if !suffix.is_empty() {
            let report = self.reconciler.project_readings(meter, &suffix).await;
            if report.is_degraded() {
                tracing::warn!(meter, "projection after delete degraded");
            }
        }

        Ok(removed)
    }

    /// Remove every reading in the inclusive period. Interior deletes shift
    /// surrounding consumption and bucket sums, so a non-empty delete is
    /// followed by an incremental regeneration of the secondary store.
    pub async fn delete_readings_in_period(
        &self,
        meter: &str,
        period: TimePeriod,
    ) -> Result<usize, ServiceError> {
        let lock = self.meter_lock(meter);
        let _guard = lock.lock().await;

        let removed = self
            .store
            .lock()
            .await
            .delete_in_range(meter, period)
            .await?;
        if removed.is_empty() {
            return Ok(0);
        }

        rebuild::rebuild(&self.store, &self.reconciler, meter, RebuildMode::Incremental).await?;
        Ok(removed.len())
    }

    /// Import a batch of readings; each item goes through the normal add
    /// path and failures are tallied instead of aborting the batch.
    pub async fn bulk_import(&self, meter: &str, readings: Vec<NewReading>) -> BulkImportReport {
        let lock = self.meter_lock(meter);
        let _guard = lock.lock().await;

        let mut report = BulkImportReport::default();
        for item in readings {
            let reading = item.into_reading();
            let timestamp = reading.timestamp;
            match self.add_locked(meter, reading).await {
                Ok(stored) => {
                    report.success_count += 1;
                    report.reading_ids.push(stored.id);
                    metrics::counter!("readings_imported_total").increment(1);
                }
                Err(e) => {
                    report.error_count += 1;
                    report.errors.push(BulkImportError {
                        timestamp,
                        error: e.to_string(),
                    });
                }
            }
        }

        tracing::info!(
            meter,
            imported = report.success_count,
            failed = report.error_count,
            "bulk import finished"
        );
        report
    }

    pub async fn get_readings(
        &self,
        meter: &str,
        period: Option<TimePeriod>,
    ) -> Result<Vec<Reading>, ServiceError> {
        let mut store = self.store.lock().await;
        let readings = match period {
            Some(period) => store.list_in_range(meter, period).await?,
            None => store.list(meter).await?,
        };
        Ok(readings)
    }

    pub async fn get_reading(
        &self,
        meter: &str,
        reading_id: &str,
    ) -> Result<Option<Reading>, ServiceError> {
        Ok(self.store.lock().await.get(meter, reading_id).await?)
    }

    pub async fn latest_reading(&self, meter: &str) -> Result<Option<Reading>, ServiceError> {
        Ok(self.store.lock().await.latest(meter).await?)
    }

    /// Re-derive consumption and re-run the incremental projection.
    pub async fn recalculate_statistics(
        &self,
        meter: &str,
    ) -> Result<RebuildOutcome, ServiceError> {
        let lock = self.meter_lock(meter);
        let _guard = lock.lock().await;

        let outcome =
            rebuild::rebuild(&self.store, &self.reconciler, meter, RebuildMode::Incremental)
                .await?;
        Ok(outcome)
    }

    /// Regenerate the meter's secondary-store history: destructive
    /// wipe-and-replay with `complete_wipe`, catch-up without it.
    pub async fn rebuild_history(
        &self,
        meter: &str,
        complete_wipe: bool,
    ) -> Result<RebuildOutcome, ServiceError> {
        let lock = self.meter_lock(meter);
        let _guard = lock.lock().await;

        let mode = if complete_wipe {
            RebuildMode::Complete
        } else {
            RebuildMode::Incremental
        };
        let outcome = rebuild::rebuild(&self.store, &self.reconciler, meter, mode).await?;
        Ok(outcome)
    }

    pub fn reconciler(&self) -> &HistoryReconciler<H> {
        &self.reconciler
    }

    async fn add_locked(&self, meter: &str, reading: Reading) -> Result<Reading, ServiceError> {
        let stored = self.store.lock().await.add(meter, reading).await?;

        let report = self.reconciler.project_reading(meter, &stored).await;
        if report.is_degraded() {
            tracing::warn!(
                meter,
                failures = report.failures.len(),
                "append projection degraded; log is authoritative, run a rebuild to reconcile"
            );
        }

        Ok(stored)
    }
}

pub mod memory;
pub mod postgres;

use meter_client::domain::{
    consumption_statistic_id, statistic_id, Reading, StateSnapshot, StatisticPoint,
};
use time::{Duration, OffsetDateTime};
use tokio::sync::mpsc;

pub use memory::InMemoryHistoryStore;
pub use postgres::PgHistoryStore;

/// Snapshots closer together than this are considered the same moment; an
/// upsert inside the window replaces the existing row.
pub const SNAPSHOT_MERGE_TOLERANCE: Duration = Duration::seconds(1);

#[derive(thiserror::Error, Debug)]
pub enum HistoryStoreError {
    #[error("history database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("history store rejected point: {0}")]
    Rejected(String),
    #[error("history store unavailable: {0}")]
    Unavailable(String),
}

/// Narrow projection contract over the externally-owned time-series store.
///
/// The engine never assumes anything about the store's internal schema:
/// statistic series are addressed by statistic id, snapshots by meter, and
/// every write has upsert semantics so reprojection is always safe.
#[async_trait::async_trait]
pub trait HistoryStore: Send + Sync {
    async fn upsert_statistic(
        &self,
        statistic_id: &str,
        unit: &str,
        point: StatisticPoint,
    ) -> Result<(), HistoryStoreError>;

    /// Fine-grained mirror of `upsert_statistic`, written only for recent
    /// points to bound storage growth.
    async fn upsert_short_term_statistic(
        &self,
        statistic_id: &str,
        unit: &str,
        point: StatisticPoint,
    ) -> Result<(), HistoryStoreError>;

    /// Insert-or-replace a snapshot; rows within [`SNAPSHOT_MERGE_TOLERANCE`]
    /// of the new timestamp are replaced, never duplicated.
    async fn upsert_snapshot(
        &self,
        meter: &str,
        snapshot: StateSnapshot,
    ) -> Result<(), HistoryStoreError>;

    /// Remove junk snapshot rows (null, non-finite or negative values).
    /// Returns the number of removed rows.
    async fn cleanup_invalid_snapshots(&self, meter: &str) -> Result<u64, HistoryStoreError>;

    /// Delete everything the meter owns: both statistic series, their
    /// short-term mirrors, metadata side-tables and all snapshots.
    async fn clear_meter(&self, meter: &str) -> Result<(), HistoryStoreError>;

    /// Availability probe used as a rebuild preflight.
    async fn ping(&self) -> Result<(), HistoryStoreError>;
}

/// Tunables for the projection.
#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    /// Minimum value delta before a new snapshot is worth recording.
    pub minimum_state_change: f64,
    /// Record a snapshot after this much time even without a value change.
    pub daily_snapshot_interval: Duration,
    /// Points younger than this also go to the short-term mirror.
    pub short_term_window: Duration,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            minimum_state_change: 0.1,
            daily_snapshot_interval: Duration::seconds(86_400),
            short_term_window: Duration::days(10),
        }
    }
}

/// Sent to the injected observer whenever a meter's current value is
/// re-established after a projection run.
#[derive(Debug, Clone, PartialEq)]
pub struct MeterValueUpdate {
    pub meter: String,
    pub value: f64,
    pub unit: String,
}

#[derive(Debug)]
pub struct ProjectionFailure {
    pub timestamp: OffsetDateTime,
    pub detail: String,
}

/// Outcome of a projection pass. Per-point failures degrade the result but
/// never fail it; the reading log is the source of truth and is not rolled
/// back when the secondary store misbehaves.
#[derive(Debug, Default)]
pub struct ProjectionReport {
    pub readings_processed: usize,
    pub statistics_written: usize,
    pub snapshots_written: usize,
    pub failures: Vec<ProjectionFailure>,
}

impl ProjectionReport {
    pub fn is_degraded(&self) -> bool {
        !self.failures.is_empty()
    }
}

/// Projects the reading log into the secondary store's two sub-views:
/// hourly statistic points and noise-filtered state snapshots.
pub struct HistoryReconciler<H> {
    history: H,
    settings: ReconcilerSettings,
    value_tx: Option<mpsc::UnboundedSender<MeterValueUpdate>>,
}

impl<H: HistoryStore> HistoryReconciler<H> {
    pub fn new(history: H) -> Self {
        Self {
            history,
            settings: ReconcilerSettings::default(),
            value_tx: None,
        }
    }

    pub fn with_settings(mut self, settings: ReconcilerSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Inject a current-value observer. Interested parties (a dashboard
    /// gauge, a host sensor) receive the latest value after regeneration
    /// runs instead of reaching into shared state.
    pub fn with_observer(mut self, tx: mpsc::UnboundedSender<MeterValueUpdate>) -> Self {
        self.value_tx = Some(tx);
        self
    }

    pub fn history(&self) -> &H {
        &self.history
    }

    /// Append path: project exactly one reading's statistic points. The
    /// browsable snapshot timeline is only maintained by full projection
    /// runs, where the noise filter has the context to do its job.
    pub async fn project_reading(&self, meter: &str, reading: &Reading) -> ProjectionReport {
        let mut report = ProjectionReport {
            readings_processed: 1,
            ..ProjectionReport::default()
        };
        self.project_statistics(meter, reading, &mut report).await;
        report
    }

    /// Project a suffix of the log after a timeline mutation. Statistics
    /// only, same as the append path, one reading at a time.
    pub async fn project_readings(&self, meter: &str, readings: &[Reading]) -> ProjectionReport {
        let mut report = ProjectionReport::default();
        for reading in readings {
            self.project_statistics(meter, reading, &mut report).await;
            report.readings_processed += 1;
        }
        report
    }

    /// Full projection of a meter's log: statistics for every reading plus
    /// the snapshot journey. With `bypass_filter` every reading becomes a
    /// snapshot so the complete history is reconstructible independent of
    /// the filter's earlier decisions.
    pub async fn project_log(
        &self,
        meter: &str,
        readings: &[Reading],
        bypass_filter: bool,
    ) -> ProjectionReport {
        let mut report = ProjectionReport::default();
        let mut last_snapshot: Option<StateSnapshot> = None;

        for reading in readings {
            self.project_statistics(meter, reading, &mut report).await;

            if self.should_record_snapshot(reading, bypass_filter, last_snapshot.as_ref()) {
                let snapshot = StateSnapshot::new(reading.timestamp, reading.value);
                match self.history.upsert_snapshot(meter, snapshot).await {
                    Ok(()) => {
                        last_snapshot = Some(snapshot);
                        report.snapshots_written += 1;
                        metrics::counter!("history_snapshots_written_total").increment(1);
                    }
                    Err(e) => record_failure(&mut report, meter, reading.timestamp, &e),
                }
            }

            report.readings_processed += 1;
        }

        report
    }

    /// Push the meter's latest value to the injected observer, if any.
    pub fn notify_current_value(&self, meter: &str, latest: &Reading) {
        if let Some(tx) = &self.value_tx {
            let _ = tx.send(MeterValueUpdate {
                meter: meter.to_string(),
                value: latest.value,
                unit: latest.unit.clone(),
            });
        }
    }

    async fn project_statistics(
        &self,
        meter: &str,
        reading: &Reading,
        report: &mut ProjectionReport,
    ) {
        let bucket = hour_bucket(reading.timestamp);

        let point = StatisticPoint::cumulative(bucket, reading.value);
        self.write_statistic(&statistic_id(meter), reading, point, report)
            .await;

        // Companion consumption series. Non-positive deltas (rollovers,
        // corrections) stay out of the consumption view.
        if let Some(consumed) = reading.consumption {
            if consumed > 0.0 {
                let point = StatisticPoint::cumulative(bucket, consumed);
                self.write_statistic(&consumption_statistic_id(meter), reading, point, report)
                    .await;
            }
        }
    }

    async fn write_statistic(
        &self,
        statistic_id: &str,
        reading: &Reading,
        point: StatisticPoint,
        report: &mut ProjectionReport,
    ) {
        match self
            .history
            .upsert_statistic(statistic_id, &reading.unit, point)
            .await
        {
            Ok(()) => {
                report.statistics_written += 1;
                metrics::counter!("history_statistics_written_total").increment(1);
            }
            Err(e) => {
                record_failure(report, statistic_id, reading.timestamp, &e);
                return;
            }
        }

        if OffsetDateTime::now_utc() - reading.timestamp <= self.settings.short_term_window {
            if let Err(e) = self
                .history
                .upsert_short_term_statistic(statistic_id, &reading.unit, point)
                .await
            {
                record_failure(report, statistic_id, reading.timestamp, &e);
            }
        }
    }

    fn should_record_snapshot(
        &self,
        reading: &Reading,
        bypass_filter: bool,
        last: Option<&StateSnapshot>,
    ) -> bool {
        if bypass_filter {
            return true;
        }
        let Some(last) = last else {
            // First snapshot ever for this meter.
            return true;
        };
        if (reading.value - last.value).abs() >= self.settings.minimum_state_change {
            return true;
        }
        reading.timestamp - last.changed_at >= self.settings.daily_snapshot_interval
    }
}

fn record_failure(
    report: &mut ProjectionReport,
    key: &str,
    timestamp: OffsetDateTime,
    error: &HistoryStoreError,
) {
    tracing::warn!(key, %timestamp, error = %error, "history point write failed");
    metrics::counter!("history_projection_failures_total").increment(1);
    report.failures.push(ProjectionFailure {
        timestamp,
        detail: error.to_string(),
    });
}

/// Floor a timestamp to the top of its hour.
pub fn hour_bucket(ts: OffsetDateTime) -> OffsetDateTime {
    let secs = ts.unix_timestamp();
    let floored = secs - secs.rem_euclid(3600);
    OffsetDateTime::from_unix_timestamp(floored).expect("hour floor of a valid timestamp is valid")
}

#[cfg(test)]
mod tests {
    use super::*;
    use meter_client::domain::DEFAULT_UNIT;
    use time::macros::datetime;

    fn reading(ts: OffsetDateTime, value: f64) -> Reading {
        Reading::new(ts, value, DEFAULT_UNIT, None)
    }

    fn reconciler() -> HistoryReconciler<InMemoryHistoryStore> {
        HistoryReconciler::new(InMemoryHistoryStore::default())
    }

    #[test]
    fn hour_bucket_floors_to_the_hour() {
        assert_eq!(
            hour_bucket(datetime!(2025-06-01 12:34:56.789 UTC)),
            datetime!(2025-06-01 12:00:00 UTC)
        );
        assert_eq!(
            hour_bucket(datetime!(2025-06-01 12:00:00 UTC)),
            datetime!(2025-06-01 12:00:00 UTC)
        );
    }

    #[test]
    fn first_snapshot_is_always_recorded() {
        let r = reconciler();
        assert!(r.should_record_snapshot(&reading(datetime!(2025-06-01 00:00:00 UTC), 1.0), false, None));
    }

    #[test]
    fn near_identical_snapshot_is_filtered() {
        let r = reconciler();
        let last = StateSnapshot::new(datetime!(2025-06-01 00:00:00 UTC), 100.0);
        let candidate = reading(datetime!(2025-06-01 06:00:00 UTC), 100.05);
        assert!(!r.should_record_snapshot(&candidate, false, Some(&last)));
    }

    #[test]
    fn significant_change_is_recorded() {
        let r = reconciler();
        let last = StateSnapshot::new(datetime!(2025-06-01 00:00:00 UTC), 100.0);
        let candidate = reading(datetime!(2025-06-01 00:30:00 UTC), 100.1);
        assert!(r.should_record_snapshot(&candidate, false, Some(&last)));
    }

    #[test]
    fn daily_interval_forces_a_snapshot() {
        let r = reconciler();
        let last = StateSnapshot::new(datetime!(2025-06-01 00:00:00 UTC), 100.0);
        let candidate = reading(datetime!(2025-06-02 00:00:00 UTC), 100.0);
        assert!(r.should_record_snapshot(&candidate, false, Some(&last)));
    }

    #[test]
    fn bypass_ignores_the_filter() {
        let r = reconciler();
        let last = StateSnapshot::new(datetime!(2025-06-01 00:00:00 UTC), 100.0);
        let candidate = reading(datetime!(2025-06-01 00:00:30 UTC), 100.0);
        assert!(r.should_record_snapshot(&candidate, true, Some(&last)));
    }
}

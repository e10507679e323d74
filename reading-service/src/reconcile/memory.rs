use std::collections::BTreeMap;
use std::sync::Mutex;

use meter_client::domain::{
    consumption_statistic_id, statistic_id, StateSnapshot, StatisticPoint,
};
use time::OffsetDateTime;

use super::{HistoryStore, HistoryStoreError, SNAPSHOT_MERGE_TOLERANCE};

/// Deterministic in-memory history store.
///
/// Used by the test suites and by embedders that want the reconciliation
/// behavior without a SQL store. Everything is kept in ordered maps so two
/// stores with the same logical content compare equal, which is how the
/// rebuild idempotence tests check convergence.
#[derive(Default)]
pub struct InMemoryHistoryStore {
    inner: Mutex<HistoryDump>,
}

/// Point-in-time copy of the store's entire content.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryDump {
    /// statistic id -> hour bucket (unix seconds) -> (state, sum)
    pub statistics: BTreeMap<String, BTreeMap<i64, (f64, f64)>>,
    pub short_term: BTreeMap<String, BTreeMap<i64, (f64, f64)>>,
    /// statistic id -> unit recorded on the metadata row
    pub metadata_units: BTreeMap<String, String>,
    /// meter -> snapshot time (unix nanoseconds) -> value
    pub snapshots: BTreeMap<String, BTreeMap<i128, f64>>,
}

impl InMemoryHistoryStore {
    pub fn dump(&self) -> HistoryDump {
        self.inner.lock().expect("history lock poisoned").clone()
    }

    pub fn statistics_for(&self, meter: &str) -> Vec<StatisticPoint> {
        let inner = self.inner.lock().expect("history lock poisoned");
        inner
            .statistics
            .get(&statistic_id(meter))
            .map(|series| {
                series
                    .iter()
                    .map(|(&start, &(state, sum))| StatisticPoint {
                        start: OffsetDateTime::from_unix_timestamp(start)
                            .expect("stored bucket is a valid timestamp"),
                        state,
                        sum,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn snapshots_for(&self, meter: &str) -> Vec<StateSnapshot> {
        let inner = self.inner.lock().expect("history lock poisoned");
        inner
            .snapshots
            .get(meter)
            .map(|series| {
                series
                    .iter()
                    .map(|(&nanos, &value)| StateSnapshot {
                        changed_at: OffsetDateTime::from_unix_timestamp_nanos(nanos)
                            .expect("stored snapshot time is a valid timestamp"),
                        value,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Plant a junk row, as a host with a buggy writer would.
    pub fn insert_raw_snapshot(&self, meter: &str, changed_at: OffsetDateTime, value: f64) {
        let mut inner = self.inner.lock().expect("history lock poisoned");
        inner
            .snapshots
            .entry(meter.to_string())
            .or_default()
            .insert(changed_at.unix_timestamp_nanos(), value);
    }
}

#[async_trait::async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn upsert_statistic(
        &self,
        statistic_id: &str,
        unit: &str,
        point: StatisticPoint,
    ) -> Result<(), HistoryStoreError> {
        let mut inner = self.inner.lock().expect("history lock poisoned");
        inner
            .metadata_units
            .insert(statistic_id.to_string(), unit.to_string());
        inner
            .statistics
            .entry(statistic_id.to_string())
            .or_default()
            .insert(point.start.unix_timestamp(), (point.state, point.sum));
        Ok(())
    }

    async fn upsert_short_term_statistic(
        &self,
        statistic_id: &str,
        _unit: &str,
        point: StatisticPoint,
    ) -> Result<(), HistoryStoreError> {
        let mut inner = self.inner.lock().expect("history lock poisoned");
        inner
            .short_term
            .entry(statistic_id.to_string())
            .or_default()
            .insert(point.start.unix_timestamp(), (point.state, point.sum));
        Ok(())
    }

    async fn upsert_snapshot(
        &self,
        meter: &str,
        snapshot: StateSnapshot,
    ) -> Result<(), HistoryStoreError> {
        let mut inner = self.inner.lock().expect("history lock poisoned");
        let series = inner.snapshots.entry(meter.to_string()).or_default();

        let nanos = snapshot.changed_at.unix_timestamp_nanos();
        let tolerance = SNAPSHOT_MERGE_TOLERANCE.whole_nanoseconds();
        let colliding: Vec<i128> = series
            .range(nanos - tolerance..=nanos + tolerance)
            .map(|(&k, _)| k)
            .collect();
        for key in colliding {
            series.remove(&key);
        }

        series.insert(nanos, snapshot.value);
        Ok(())
    }

    async fn cleanup_invalid_snapshots(&self, meter: &str) -> Result<u64, HistoryStoreError> {
        let mut inner = self.inner.lock().expect("history lock poisoned");
        let Some(series) = inner.snapshots.get_mut(meter) else {
            return Ok(0);
        };
        let before = series.len();
        series.retain(|_, value| value.is_finite() && *value >= 0.0);
        Ok((before - series.len()) as u64)
    }

    async fn clear_meter(&self, meter: &str) -> Result<(), HistoryStoreError> {
        let mut inner = self.inner.lock().expect("history lock poisoned");
        for id in [statistic_id(meter), consumption_statistic_id(meter)] {
            inner.statistics.remove(&id);
            inner.short_term.remove(&id);
            inner.metadata_units.remove(&id);
        }
        inner.snapshots.remove(meter);
        Ok(())
    }

    async fn ping(&self) -> Result<(), HistoryStoreError> {
        Ok(())
    }
}

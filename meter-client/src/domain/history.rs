use time::OffsetDateTime;

/// Source tag recorded on statistic metadata rows, and the prefix of every
/// statistic id this system owns.
pub const STATISTIC_SOURCE: &str = "meter_log";

/// Statistic id for a meter's cumulative series.
pub fn statistic_id(meter: &str) -> String {
    format!("{STATISTIC_SOURCE}:{meter}")
}

/// Statistic id for the companion per-period consumption series.
pub fn consumption_statistic_id(meter: &str) -> String {
    format!("{STATISTIC_SOURCE}:{meter}_consumption")
}

/// One hourly aggregate sample in the secondary store. `start` is the hour
/// bucket; `state` and `sum` both carry the cumulative meter value so the
/// series can be charted either way.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatisticPoint {
    pub start: OffsetDateTime,
    pub state: f64,
    pub sum: f64,
}

impl StatisticPoint {
    pub fn cumulative(start: OffsetDateTime, value: f64) -> Self {
        Self {
            start,
            state: value,
            sum: value,
        }
    }
}

/// One discrete point on a meter's browsable value-over-time journey.
/// Snapshots are noise-filtered before they reach the secondary store.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StateSnapshot {
    pub changed_at: OffsetDateTime,
    pub value: f64,
}

impl StateSnapshot {
    pub fn new(changed_at: OffsetDateTime, value: f64) -> Self {
        Self { changed_at, value }
    }
}

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

pub const DEFAULT_UNIT: &str = "kWh";

/// One manual observation of a utility meter: a cumulative counter value at
/// a point in time. The `consumption` / `period_*` fields are derived from
/// the neighboring reading and recomputed whenever the timeline changes.
///
/// The serde shape is the on-disk storage format; field names are stable
/// across schema versions, and every field added after the first version
/// carries a default so older documents keep deserializing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reading {
    pub id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub value: f64,
    pub unit: String,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub updated_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub period_start: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub period_end: Option<OffsetDateTime>,
    #[serde(default)]
    pub consumption: Option<f64>,
}

impl Reading {
    /// Create a reading with a fresh id and audit timestamp. Derived fields
    /// start empty until the consumption pass fills them in.
    pub fn new(
        timestamp: OffsetDateTime,
        value: f64,
        unit: impl Into<String>,
        notes: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp,
            value,
            unit: unit.into(),
            notes,
            created_at: OffsetDateTime::now_utc(),
            updated_at: None,
            period_start: None,
            period_end: None,
            consumption: None,
        }
    }

    pub fn clear_derived(&mut self) {
        self.consumption = None;
        self.period_start = None;
        self.period_end = None;
    }
}

/// Inclusive time range used for queries and range deletes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimePeriod {
    pub start: OffsetDateTime,
    pub end: OffsetDateTime,
}

impl TimePeriod {
    pub fn new(start: OffsetDateTime, end: OffsetDateTime) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, ts: OffsetDateTime) -> bool {
        self.start <= ts && ts <= self.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn new_reading_gets_id_and_empty_derived_fields() {
        let r = Reading::new(datetime!(2025-06-01 00:00:00 UTC), 100.0, DEFAULT_UNIT, None);
        assert!(!r.id.is_empty());
        assert!(r.consumption.is_none());
        assert!(r.period_start.is_none());
        assert!(r.updated_at.is_none());
    }

    #[test]
    fn legacy_document_without_derived_fields_deserializes() {
        // Shape written before consumption tracking existed.
        let json = r#"{
            "id": "abc",
            "timestamp": "2025-06-01T00:00:00Z",
            "value": 100.0,
            "unit": "kWh",
            "created_at": "2025-06-01T00:05:00Z"
        }"#;

        let r: Reading = serde_json::from_str(json).expect("legacy shape must parse");
        assert_eq!(r.id, "abc");
        assert!(r.notes.is_none());
        assert!(r.consumption.is_none());
        assert!(r.period_end.is_none());
    }

    #[test]
    fn storage_field_names_are_stable() {
        let r = Reading::new(datetime!(2025-06-01 00:00:00 UTC), 42.0, "m³", None);
        let json = serde_json::to_value(&r).expect("serialize");
        for key in [
            "id",
            "timestamp",
            "value",
            "unit",
            "notes",
            "created_at",
            "updated_at",
            "period_start",
            "period_end",
            "consumption",
        ] {
            assert!(json.get(key).is_some(), "missing storage field {key}");
        }
    }

    #[test]
    fn time_period_bounds_are_inclusive() {
        let period = TimePeriod::new(
            datetime!(2025-06-01 00:00:00 UTC),
            datetime!(2025-06-30 00:00:00 UTC),
        );
        assert!(period.contains(datetime!(2025-06-01 00:00:00 UTC)));
        assert!(period.contains(datetime!(2025-06-30 00:00:00 UTC)));
        assert!(!period.contains(datetime!(2025-06-30 00:00:01 UTC)));
    }
}

use meter_client::domain::Reading;
use time::OffsetDateTime;

/// Derivation of per-reading consumption from neighboring readings.
///
/// All functions expect `readings` sorted ascending by timestamp and assign,
/// for each reading with a predecessor:
///
///   consumption  = value - previous.value   (raw signed difference)
///   period_start = previous.timestamp
///   period_end   = timestamp
///
/// The first reading in a log has no predecessor and carries no consumption.
/// A value lower than its predecessor (meter rolled over or was replaced)
/// produces a negative consumption; it is not clamped or rejected.

/// Recompute every derived field in the log. Returns the number of readings
/// whose derived fields changed.
pub fn recalculate(readings: &mut [Reading]) -> usize {
    recalculate_range(readings, 0)
}

/// Recompute derived fields for every reading at or after `changed_at`.
/// Inserting or editing a reading in the past invalidates everything later,
/// so callers pass the earliest timestamp they touched.
pub fn recalculate_after(readings: &mut [Reading], changed_at: OffsetDateTime) -> usize {
    let first_affected = readings
        .iter()
        .position(|r| r.timestamp >= changed_at)
        .unwrap_or(readings.len());
    recalculate_range(readings, first_affected)
}

/// Fill in consumption only where it is missing, leaving existing figures
/// untouched. Used by the incremental rebuild path.
pub fn fill_missing(readings: &mut [Reading]) -> usize {
    let mut updated = 0;
    for i in 1..readings.len() {
        if readings[i].consumption.is_some() {
            continue;
        }
        let (prev_value, prev_ts) = (readings[i - 1].value, readings[i - 1].timestamp);
        apply(&mut readings[i], prev_value, prev_ts);
        updated += 1;
    }
    updated
}

fn recalculate_range(readings: &mut [Reading], from: usize) -> usize {
    let mut updated = 0;
    for i in from..readings.len() {
        if i == 0 {
            let first = &mut readings[i];
            if first.consumption.is_some() || first.period_start.is_some() {
                first.clear_derived();
                updated += 1;
            }
            continue;
        }

        let (prev_value, prev_ts) = (readings[i - 1].value, readings[i - 1].timestamp);
        let reading = &mut readings[i];
        let consumption = reading.value - prev_value;
        let changed = reading.consumption != Some(consumption)
            || reading.period_start != Some(prev_ts)
            || reading.period_end != Some(reading.timestamp);
        if changed {
            apply(reading, prev_value, prev_ts);
            updated += 1;
        }
    }
    updated
}

fn apply(reading: &mut Reading, prev_value: f64, prev_ts: OffsetDateTime) {
    reading.consumption = Some(reading.value - prev_value);
    reading.period_start = Some(prev_ts);
    reading.period_end = Some(reading.timestamp);
}

#[cfg(test)]
mod tests {
    use super::*;
    use meter_client::domain::DEFAULT_UNIT;
    use time::macros::datetime;

    fn reading(ts: OffsetDateTime, value: f64) -> Reading {
        Reading::new(ts, value, DEFAULT_UNIT, None)
    }

    #[test]
    fn consumption_is_difference_to_previous_reading() {
        let mut log = vec![
            reading(datetime!(2025-06-01 00:00:00 UTC), 100.0),
            reading(datetime!(2025-07-01 00:00:00 UTC), 130.0),
            reading(datetime!(2025-08-01 00:00:00 UTC), 155.5),
        ];

        let updated = recalculate(&mut log);

        assert_eq!(updated, 2);
        assert!(log[0].consumption.is_none());
        assert_eq!(log[1].consumption, Some(30.0));
        assert_eq!(log[2].consumption, Some(25.5));
        assert_eq!(log[1].period_start, Some(log[0].timestamp));
        assert_eq!(log[1].period_end, Some(log[1].timestamp));
    }

    #[test]
    fn backfilled_reading_invalidates_later_consumption() {
        let mut log = vec![
            reading(datetime!(2025-06-01 00:00:00 UTC), 100.0),
            reading(datetime!(2025-07-01 00:00:00 UTC), 130.0),
        ];
        recalculate(&mut log);

        // Insert an older reading at the front of the timeline.
        log.insert(0, reading(datetime!(2025-05-01 00:00:00 UTC), 80.0));
        recalculate_after(&mut log, datetime!(2025-05-01 00:00:00 UTC));

        assert!(log[0].consumption.is_none());
        assert_eq!(log[1].consumption, Some(20.0));
        assert_eq!(log[2].consumption, Some(30.0));
    }

    #[test]
    fn promoted_first_reading_loses_consumption() {
        let mut log = vec![
            reading(datetime!(2025-06-01 00:00:00 UTC), 100.0),
            reading(datetime!(2025-07-01 00:00:00 UTC), 130.0),
        ];
        recalculate(&mut log);

        log.remove(0);
        recalculate(&mut log);

        assert!(log[0].consumption.is_none());
        assert!(log[0].period_start.is_none());
    }

    #[test]
    fn rollover_produces_negative_consumption() {
        let mut log = vec![
            reading(datetime!(2025-06-01 00:00:00 UTC), 9990.0),
            reading(datetime!(2025-07-01 00:00:00 UTC), 15.0),
        ];
        recalculate(&mut log);
        assert_eq!(log[1].consumption, Some(-9975.0));
    }

    #[test]
    fn fill_missing_leaves_existing_figures_alone() {
        let mut log = vec![
            reading(datetime!(2025-06-01 00:00:00 UTC), 100.0),
            reading(datetime!(2025-07-01 00:00:00 UTC), 130.0),
            reading(datetime!(2025-08-01 00:00:00 UTC), 150.0),
        ];
        log[1].consumption = Some(999.0); // deliberately wrong, must survive

        let updated = fill_missing(&mut log);

        assert_eq!(updated, 1);
        assert_eq!(log[1].consumption, Some(999.0));
        assert_eq!(log[2].consumption, Some(20.0));
    }

    #[test]
    fn recalculate_is_idempotent() {
        let mut log = vec![
            reading(datetime!(2025-06-01 00:00:00 UTC), 100.0),
            reading(datetime!(2025-07-01 00:00:00 UTC), 130.0),
        ];
        assert_eq!(recalculate(&mut log), 1);
        assert_eq!(recalculate(&mut log), 0);
    }
}

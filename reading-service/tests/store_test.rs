// Reading store behavior over in-memory storage: ordering, duplicate
// detection, validation, consumption recompute on timeline mutations.

use meter_client::domain::{Reading, TimePeriod, DEFAULT_UNIT};
use reading_service::{MemoryStorage, ReadingStore, StoreError};
use time::macros::datetime;
use time::{Duration, OffsetDateTime};

fn store() -> ReadingStore<MemoryStorage> {
    ReadingStore::new(MemoryStorage::default())
}

fn reading(ts: OffsetDateTime, value: f64) -> Reading {
    Reading::new(ts, value, DEFAULT_UNIT, None)
}

#[tokio::test]
async fn list_is_always_sorted_ascending_without_duplicates() {
    let mut store = store();

    // Insert out of order.
    for (ts, value) in [
        (datetime!(2025-07-01 00:00:00 UTC), 130.0),
        (datetime!(2025-05-01 00:00:00 UTC), 80.0),
        (datetime!(2025-06-01 00:00:00 UTC), 100.0),
    ] {
        store
            .add("sensor.power", reading(ts, value))
            .await
            .expect("add");
    }

    let readings = store.list("sensor.power").await.expect("list");
    assert_eq!(readings.len(), 3);
    for pair in readings.windows(2) {
        assert!(
            pair[0].timestamp < pair[1].timestamp,
            "log must be strictly ascending"
        );
    }
}

#[tokio::test]
async fn duplicate_timestamp_is_rejected_and_log_unchanged() {
    let mut store = store();
    let ts = datetime!(2025-06-01 00:00:00 UTC);

    store.add("sensor.power", reading(ts, 100.0)).await.expect("add");
    let err = store
        .add("sensor.power", reading(ts, 200.0))
        .await
        .expect_err("duplicate must be rejected");

    match &err {
        StoreError::DuplicateTimestamp {
            existing_value,
            existing_unit,
            ..
        } => {
            assert_eq!(*existing_value, 100.0);
            assert_eq!(existing_unit, DEFAULT_UNIT);
        }
        other => panic!("expected DuplicateTimestamp, got {other:?}"),
    }
    // The error text must point the caller at the update path.
    let message = err.to_string();
    assert!(message.contains("100"), "message carries existing value: {message}");
    assert!(message.contains("update_reading"), "message suggests update: {message}");

    let readings = store.list("sensor.power").await.expect("list");
    assert_eq!(readings.len(), 1);
    assert_eq!(readings[0].value, 100.0);
}

#[tokio::test]
async fn future_timestamp_is_rejected() {
    let mut store = store();
    let future = OffsetDateTime::now_utc() + Duration::hours(1);

    let err = store
        .add("sensor.power", reading(future, 100.0))
        .await
        .expect_err("future reading must be rejected");
    assert!(matches!(err, StoreError::Validation(_)));
    assert_eq!(store.count("sensor.power").await.expect("count"), 0);
}

#[tokio::test]
async fn non_finite_value_is_rejected() {
    let mut store = store();
    let err = store
        .add(
            "sensor.power",
            reading(datetime!(2025-06-01 00:00:00 UTC), f64::NAN),
        )
        .await
        .expect_err("NaN must be rejected");
    assert!(matches!(err, StoreError::Validation(_)));
}

#[tokio::test]
async fn consumption_follows_the_timeline() {
    let mut store = store();
    store
        .add(
            "sensor.power",
            reading(datetime!(2025-06-01 00:00:00 UTC), 100.0),
        )
        .await
        .expect("add");
    store
        .add(
            "sensor.power",
            reading(datetime!(2025-07-01 00:00:00 UTC), 130.0),
        )
        .await
        .expect("add");
    store
        .add(
            "sensor.power",
            reading(datetime!(2025-08-01 00:00:00 UTC), 155.0),
        )
        .await
        .expect("add");

    let readings = store.list("sensor.power").await.expect("list");
    assert_eq!(readings[0].consumption, None);
    assert_eq!(readings[1].consumption, Some(30.0));
    assert_eq!(readings[2].consumption, Some(25.0));

    // Backfill before everything; later figures must follow without being
    // asked explicitly.
    store
        .add(
            "sensor.power",
            reading(datetime!(2025-05-01 00:00:00 UTC), 90.0),
        )
        .await
        .expect("add");

    let readings = store.list("sensor.power").await.expect("list");
    assert_eq!(readings[0].consumption, None);
    assert_eq!(readings[1].consumption, Some(10.0));
    assert_eq!(readings[2].consumption, Some(30.0));
    assert_eq!(readings[3].consumption, Some(25.0));
}

#[tokio::test]
async fn update_preserves_id_and_resorts() {
    let mut store = store();
    let first = store
        .add(
            "sensor.power",
            reading(datetime!(2025-06-01 00:00:00 UTC), 100.0),
        )
        .await
        .expect("add");
    store
        .add(
            "sensor.power",
            reading(datetime!(2025-07-01 00:00:00 UTC), 130.0),
        )
        .await
        .expect("add");

    // Move the first reading after the second.
    let updated = store
        .update(
            "sensor.power",
            &first.id,
            reading(datetime!(2025-08-01 00:00:00 UTC), 150.0),
        )
        .await
        .expect("update");

    assert_eq!(updated.id, first.id);
    assert!(updated.updated_at.is_some());

    let readings = store.list("sensor.power").await.expect("list");
    assert_eq!(readings[0].value, 130.0);
    assert_eq!(readings[0].consumption, None);
    assert_eq!(readings[1].id, first.id);
    assert_eq!(readings[1].consumption, Some(20.0));
}

#[tokio::test]
async fn update_unknown_ids_report_not_found() {
    let mut store = store();
    let err = store
        .update(
            "sensor.missing",
            "nope",
            reading(datetime!(2025-06-01 00:00:00 UTC), 1.0),
        )
        .await
        .expect_err("unknown meter");
    assert!(matches!(err, StoreError::MeterNotFound(_)));

    store
        .add(
            "sensor.power",
            reading(datetime!(2025-06-01 00:00:00 UTC), 1.0),
        )
        .await
        .expect("add");
    let err = store
        .update(
            "sensor.power",
            "nope",
            reading(datetime!(2025-06-02 00:00:00 UTC), 2.0),
        )
        .await
        .expect_err("unknown reading");
    assert!(matches!(err, StoreError::ReadingNotFound { .. }));
}

#[tokio::test]
async fn deleting_the_first_reading_clears_successor_consumption() {
    let mut store = store();
    let first = store
        .add(
            "sensor.power",
            reading(datetime!(2025-06-01 00:00:00 UTC), 100.0),
        )
        .await
        .expect("add");
    store
        .add(
            "sensor.power",
            reading(datetime!(2025-07-01 00:00:00 UTC), 130.0),
        )
        .await
        .expect("add");

    store
        .delete("sensor.power", &first.id)
        .await
        .expect("delete");

    let readings = store.list("sensor.power").await.expect("list");
    assert_eq!(readings.len(), 1);
    assert_eq!(readings[0].value, 130.0);
    assert_eq!(readings[0].consumption, None, "no predecessor remains");
}

#[tokio::test]
async fn delete_in_range_is_inclusive_and_reports_removed() {
    let mut store = store();
    for (ts, value) in [
        (datetime!(2025-06-01 00:00:00 UTC), 100.0),
        (datetime!(2025-06-15 00:00:00 UTC), 110.0),
        (datetime!(2025-07-01 00:00:00 UTC), 130.0),
    ] {
        store
            .add("sensor.power", reading(ts, value))
            .await
            .expect("add");
    }

    let removed = store
        .delete_in_range(
            "sensor.power",
            TimePeriod::new(
                datetime!(2025-06-01 00:00:00 UTC),
                datetime!(2025-06-15 00:00:00 UTC),
            ),
        )
        .await
        .expect("delete range");

    assert_eq!(removed.len(), 2, "both boundary readings are removed");
    let readings = store.list("sensor.power").await.expect("list");
    assert_eq!(readings.len(), 1);
    assert_eq!(readings[0].consumption, None);
}

#[tokio::test]
async fn log_survives_a_storage_round_trip() {
    let storage = MemoryStorage::default();
    {
        let mut store = ReadingStore::new(&storage);
        store
            .add(
                "sensor.power",
                reading(datetime!(2025-06-01 00:00:00 UTC), 100.0),
            )
            .await
            .expect("add");
        store
            .add(
                "sensor.power",
                reading(datetime!(2025-07-01 00:00:00 UTC), 130.0),
            )
            .await
            .expect("add");
    }

    // A fresh store over the same storage lazily loads the saved document.
    let mut reloaded = ReadingStore::new(&storage);
    let readings = reloaded.list("sensor.power").await.expect("list");
    assert_eq!(readings.len(), 2);
    assert_eq!(readings[1].consumption, Some(30.0));
}

#[tokio::test]
async fn queries_cover_the_basics() {
    let mut store = store();
    let added = store
        .add(
            "sensor.power",
            reading(datetime!(2025-06-01 08:30:00 UTC), 100.0),
        )
        .await
        .expect("add");
    store
        .add(
            "sensor.power",
            reading(datetime!(2025-07-01 08:30:00 UTC), 130.0),
        )
        .await
        .expect("add");

    assert_eq!(store.count("sensor.power").await.expect("count"), 2);
    assert_eq!(
        store
            .get("sensor.power", &added.id)
            .await
            .expect("get")
            .expect("present")
            .value,
        100.0
    );
    assert_eq!(
        store
            .get_by_timestamp("sensor.power", datetime!(2025-06-01 08:30:00 UTC))
            .await
            .expect("get_by_timestamp")
            .expect("present")
            .id,
        added.id
    );
    assert_eq!(
        store
            .earliest("sensor.power")
            .await
            .expect("earliest")
            .expect("present")
            .value,
        100.0
    );
    assert_eq!(
        store
            .latest("sensor.power")
            .await
            .expect("latest")
            .expect("present")
            .value,
        130.0
    );
    let in_june = store
        .list_in_range(
            "sensor.power",
            TimePeriod::new(
                datetime!(2025-06-01 00:00:00 UTC),
                datetime!(2025-06-30 00:00:00 UTC),
            ),
        )
        .await
        .expect("list_in_range");
    assert_eq!(in_june.len(), 1);

    // Unknown meters are empty, not errors, for read paths.
    assert!(store.list("sensor.unknown").await.expect("list").is_empty());
    assert_eq!(store.count("sensor.unknown").await.expect("count"), 0);
}

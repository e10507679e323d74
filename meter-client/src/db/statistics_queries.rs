use anyhow::Result;
use sqlx::PgPool;
use time::OffsetDateTime;

/// One row of the long-term (or short-term) statistics table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StatisticRow {
    pub start_ts: OffsetDateTime,
    pub state: f64,
    pub sum: f64,
}

/// One row of the state snapshot table. `value` is nullable because hosts
/// have historically written junk rows; the cleanup pass removes them.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SnapshotRow {
    pub changed_at: OffsetDateTime,
    pub value: Option<f64>,
}

/// Fetch the hourly statistic series for one statistic id, time-ordered.
pub async fn statistic_series(
    pool: &PgPool,
    statistic_id: &str,
    start: OffsetDateTime,
    end: OffsetDateTime,
) -> Result<Vec<StatisticRow>> {
    let rows = sqlx::query_as::<_, StatisticRow>(
        r#"
        SELECT
            s.start_ts,
            s.state,
            s.sum
        FROM statistics s
        JOIN statistics_meta m ON s.metadata_id = m.id
        WHERE m.statistic_id = $1
          AND s.start_ts >= $2
          AND s.start_ts <  $3
        ORDER BY s.start_ts
        "#,
    )
    .bind(statistic_id)
    .bind(start)
    .bind(end)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Most recent statistic point for one statistic id, if any.
pub async fn latest_statistic(pool: &PgPool, statistic_id: &str) -> Result<Option<StatisticRow>> {
    let row = sqlx::query_as::<_, StatisticRow>(
        r#"
        SELECT
            s.start_ts,
            s.state,
            s.sum
        FROM statistics s
        JOIN statistics_meta m ON s.metadata_id = m.id
        WHERE m.statistic_id = $1
        ORDER BY s.start_ts DESC
        LIMIT 1
        "#,
    )
    .bind(statistic_id)
    .fetch_optional(pool)
    .await?;

    Ok(row)
}

/// Time-ordered snapshot journey for one meter.
pub async fn snapshot_series(
    pool: &PgPool,
    entity_key: &str,
    start: OffsetDateTime,
    end: OffsetDateTime,
) -> Result<Vec<SnapshotRow>> {
    let rows = sqlx::query_as::<_, SnapshotRow>(
        r#"
        SELECT
            changed_at,
            value
        FROM state_snapshots
        WHERE entity_key = $1
          AND changed_at >= $2
          AND changed_at <  $3
        ORDER BY changed_at
        "#,
    )
    .bind(entity_key)
    .bind(start)
    .bind(end)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

use meter_client::domain::{
    consumption_statistic_id, statistic_id, StateSnapshot, StatisticPoint, STATISTIC_SOURCE,
};
use sqlx::PgPool;

use super::{HistoryStore, HistoryStoreError};

const REQUIRED_TABLES: [&str; 4] = [
    "statistics_meta",
    "statistics",
    "statistics_short_term",
    "state_snapshots",
];

/// Postgres-backed history store.
///
/// Tables are described in `sql/schema/` and applied out-of-band. Statistic
/// rows are unique per `(metadata_id, start_ts)` and snapshot rows per
/// `(entity_key, changed_at)`; all writes are ON CONFLICT upserts so
/// reprojection converges instead of duplicating.
pub struct PgHistoryStore {
    pool: PgPool,
}

impl PgHistoryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn metadata_id(&self, statistic_id: &str, unit: &str) -> Result<i64, HistoryStoreError> {
        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO statistics_meta (statistic_id, source, unit_of_measurement, has_sum, name)
            VALUES ($1, $2, $3, TRUE, $4)
            ON CONFLICT (statistic_id)
            DO UPDATE SET unit_of_measurement = EXCLUDED.unit_of_measurement
            RETURNING id
            "#,
        )
        .bind(statistic_id)
        .bind(STATISTIC_SOURCE)
        .bind(unit)
        .bind(display_name(statistic_id))
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }
}

#[async_trait::async_trait]
impl HistoryStore for PgHistoryStore {
    async fn upsert_statistic(
        &self,
        statistic_id: &str,
        unit: &str,
        point: StatisticPoint,
    ) -> Result<(), HistoryStoreError> {
        let metadata_id = self.metadata_id(statistic_id, unit).await?;

        sqlx::query(
            r#"
            INSERT INTO statistics (metadata_id, start_ts, state, sum, created_ts)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (metadata_id, start_ts)
            DO UPDATE SET state = EXCLUDED.state, sum = EXCLUDED.sum
            "#,
        )
        .bind(metadata_id)
        .bind(point.start)
        .bind(point.state)
        .bind(point.sum)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn upsert_short_term_statistic(
        &self,
        statistic_id: &str,
        unit: &str,
        point: StatisticPoint,
    ) -> Result<(), HistoryStoreError> {
        let metadata_id = self.metadata_id(statistic_id, unit).await?;

        sqlx::query(
            r#"
            INSERT INTO statistics_short_term (metadata_id, start_ts, state, sum, created_ts)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (metadata_id, start_ts)
            DO UPDATE SET state = EXCLUDED.state, sum = EXCLUDED.sum
            "#,
        )
        .bind(metadata_id)
        .bind(point.start)
        .bind(point.state)
        .bind(point.sum)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn upsert_snapshot(
        &self,
        meter: &str,
        snapshot: StateSnapshot,
    ) -> Result<(), HistoryStoreError> {
        let mut tx = self.pool.begin().await?;

        // Rows within the merge tolerance are the same observed moment;
        // replace them instead of piling up near-duplicates.
        sqlx::query(
            r#"
            DELETE FROM state_snapshots
            WHERE entity_key = $1
              AND changed_at BETWEEN $2 - INTERVAL '1 second' AND $2 + INTERVAL '1 second'
            "#,
        )
        .bind(meter)
        .bind(snapshot.changed_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO state_snapshots (entity_key, value, changed_at)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(meter)
        .bind(snapshot.value)
        .bind(snapshot.changed_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn cleanup_invalid_snapshots(&self, meter: &str) -> Result<u64, HistoryStoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM state_snapshots
            WHERE entity_key = $1
              AND (value IS NULL OR value = 'NaN'::float8 OR value < 0)
            "#,
        )
        .bind(meter)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn clear_meter(&self, meter: &str) -> Result<(), HistoryStoreError> {
        let owned_ids = [statistic_id(meter), consumption_statistic_id(meter)];
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            DELETE FROM statistics
            WHERE metadata_id IN (SELECT id FROM statistics_meta WHERE statistic_id = ANY($1))
            "#,
        )
        .bind(&owned_ids[..])
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            DELETE FROM statistics_short_term
            WHERE metadata_id IN (SELECT id FROM statistics_meta WHERE statistic_id = ANY($1))
            "#,
        )
        .bind(&owned_ids[..])
        .execute(&mut *tx)
        .await?;

        // Metadata last, so the sub-selects above still resolve.
        sqlx::query("DELETE FROM statistics_meta WHERE statistic_id = ANY($1)")
            .bind(&owned_ids[..])
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM state_snapshots WHERE entity_key = $1")
            .bind(meter)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), HistoryStoreError> {
        let (present,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*)
            FROM information_schema.tables
            WHERE table_schema = 'public' AND table_name = ANY($1)
            "#,
        )
        .bind(&REQUIRED_TABLES.map(String::from)[..])
        .fetch_one(&self.pool)
        .await?;

        if present as usize != REQUIRED_TABLES.len() {
            return Err(HistoryStoreError::Unavailable(format!(
                "history schema incomplete: {present}/{} required tables present",
                REQUIRED_TABLES.len()
            )));
        }
        Ok(())
    }
}

/// Human-readable series name recorded on the metadata row:
/// `meter_log:sensor.gas_meter` becomes `Gas Meter`.
fn display_name(statistic_id: &str) -> String {
    let key = statistic_id
        .rsplit(':')
        .next()
        .unwrap_or(statistic_id)
        .trim_start_matches("sensor.");

    key.split('_')
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::display_name;

    #[test]
    fn display_name_strips_prefixes_and_titles_words() {
        assert_eq!(display_name("meter_log:sensor.gas_meter"), "Gas Meter");
        assert_eq!(
            display_name("meter_log:sensor.gas_meter_consumption"),
            "Gas Meter Consumption"
        );
        assert_eq!(display_name("plain"), "Plain");
    }
}

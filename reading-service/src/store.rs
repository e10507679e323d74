use meter_client::domain::{Reading, TimePeriod};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::consumption;
use crate::storage::{LogStorage, ReadingLogs, StorageError};

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("invalid reading: {0}")]
    Validation(String),
    #[error(
        "a reading already exists at {timestamp} ({existing_value} {existing_unit}); \
         use update_reading to modify it"
    )]
    DuplicateTimestamp {
        timestamp: OffsetDateTime,
        existing_value: f64,
        existing_unit: String,
    },
    #[error("meter '{0}' not found")]
    MeterNotFound(String),
    #[error("reading '{reading_id}' not found for meter '{meter}'")]
    ReadingNotFound { meter: String, reading_id: String },
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Authoritative append-ordered log of readings, one log per meter.
///
/// The whole meter map lives in memory, is loaded lazily from storage on
/// first access and written back as a full document after every mutation.
/// Logs are kept sorted ascending by timestamp at all times, and every
/// timeline mutation recomputes the derived consumption figures for the
/// mutated reading and everything after it.
pub struct ReadingStore<S: LogStorage> {
    storage: S,
    logs: ReadingLogs,
    loaded: bool,
}

impl<S: LogStorage> ReadingStore<S> {
    pub fn new(storage: S) -> Self {
        Self {
            storage,
            logs: ReadingLogs::new(),
            loaded: false,
        }
    }

    async fn ensure_loaded(&mut self) -> Result<(), StoreError> {
        if self.loaded {
            return Ok(());
        }
        if let Some(mut logs) = self.storage.load().await? {
            for log in logs.values_mut() {
                log.sort_by_key(|r| r.timestamp);
            }
            self.logs = logs;
        }
        self.loaded = true;
        Ok(())
    }

    async fn persist(&self) -> Result<(), StoreError> {
        self.storage.save(&self.logs).await?;
        Ok(())
    }

    fn validate(reading: &Reading) -> Result<(), StoreError> {
        if !reading.value.is_finite() {
            return Err(StoreError::Validation(format!(
                "value must be a finite number, got {}",
                reading.value
            )));
        }
        if reading.timestamp > OffsetDateTime::now_utc() {
            return Err(StoreError::Validation(format!(
                "timestamp {} is in the future",
                reading.timestamp
            )));
        }
        Ok(())
    }

    /// Insert a new reading. Fails on validation problems and on timestamp
    /// collisions; on success the stored reading (with derived fields) is
    /// returned.
    pub async fn add(&mut self, meter: &str, mut reading: Reading) -> Result<Reading, StoreError> {
        self.ensure_loaded().await?;
        Self::validate(&reading)?;

        let log = self.logs.entry(meter.to_string()).or_default();
        if let Some(existing) = log.iter().find(|r| r.timestamp == reading.timestamp) {
            return Err(StoreError::DuplicateTimestamp {
                timestamp: reading.timestamp,
                existing_value: existing.value,
                existing_unit: existing.unit.clone(),
            });
        }

        if reading.id.is_empty() {
            reading.id = Uuid::new_v4().to_string();
        }
        let id = reading.id.clone();
        let inserted_at = reading.timestamp;

        log.push(reading);
        log.sort_by_key(|r| r.timestamp);
        consumption::recalculate_after(log, inserted_at);

        self.persist().await?;

        let stored = self
            .logs
            .get(meter)
            .and_then(|log| log.iter().find(|r| r.id == id))
            .cloned()
            .ok_or_else(|| StoreError::ReadingNotFound {
                meter: meter.to_string(),
                reading_id: id,
            })?;

        tracing::info!(
            meter,
            value = stored.value,
            unit = %stored.unit,
            timestamp = %stored.timestamp,
            "reading added"
        );
        Ok(stored)
    }

    /// Replace an existing reading in place, preserving its id and creation
    /// audit stamp. The log is re-sorted in case the timestamp moved.
    pub async fn update(
        &mut self,
        meter: &str,
        reading_id: &str,
        mut updated: Reading,
    ) -> Result<Reading, StoreError> {
        self.ensure_loaded().await?;
        Self::validate(&updated)?;

        let log = self
            .logs
            .get_mut(meter)
            .ok_or_else(|| StoreError::MeterNotFound(meter.to_string()))?;
        let index = log
            .iter()
            .position(|r| r.id == reading_id)
            .ok_or_else(|| StoreError::ReadingNotFound {
                meter: meter.to_string(),
                reading_id: reading_id.to_string(),
            })?;

        if let Some(conflict) = log
            .iter()
            .find(|r| r.timestamp == updated.timestamp && r.id != reading_id)
        {
            return Err(StoreError::DuplicateTimestamp {
                timestamp: updated.timestamp,
                existing_value: conflict.value,
                existing_unit: conflict.unit.clone(),
            });
        }

        let old_timestamp = log[index].timestamp;
        let new_timestamp = updated.timestamp;
        updated.id = reading_id.to_string();
        updated.created_at = log[index].created_at;
        updated.updated_at = Some(OffsetDateTime::now_utc());

        log[index] = updated;
        log.sort_by_key(|r| r.timestamp);
        // A timestamp move invalidates everything from the earlier of the
        // two positions onward.
        consumption::recalculate_after(log, old_timestamp.min(new_timestamp));

        self.persist().await?;

        let stored = self
            .logs
            .get(meter)
            .and_then(|log| log.iter().find(|r| r.id == reading_id))
            .cloned()
            .ok_or_else(|| StoreError::ReadingNotFound {
                meter: meter.to_string(),
                reading_id: reading_id.to_string(),
            })?;

        tracing::info!(meter, reading_id, "reading updated");
        Ok(stored)
    }

    /// Remove one reading and return it. Readings after it get their
    /// consumption recomputed against the new predecessor.
    pub async fn delete(&mut self, meter: &str, reading_id: &str) -> Result<Reading, StoreError> {
        self.ensure_loaded().await?;

        let log = self
            .logs
            .get_mut(meter)
            .ok_or_else(|| StoreError::MeterNotFound(meter.to_string()))?;
        let index = log
            .iter()
            .position(|r| r.id == reading_id)
            .ok_or_else(|| StoreError::ReadingNotFound {
                meter: meter.to_string(),
                reading_id: reading_id.to_string(),
            })?;

        let removed = log.remove(index);
        consumption::recalculate_after(log, removed.timestamp);

        self.persist().await?;

        tracing::info!(
            meter,
            reading_id,
            value = removed.value,
            timestamp = %removed.timestamp,
            "reading deleted"
        );
        Ok(removed)
    }

    /// Remove every reading inside the inclusive period and return them.
    pub async fn delete_in_range(
        &mut self,
        meter: &str,
        period: TimePeriod,
    ) -> Result<Vec<Reading>, StoreError> {
        self.ensure_loaded().await?;

        let log = self
            .logs
            .get_mut(meter)
            .ok_or_else(|| StoreError::MeterNotFound(meter.to_string()))?;

        let removed: Vec<Reading> = log
            .iter()
            .filter(|r| period.contains(r.timestamp))
            .cloned()
            .collect();
        if removed.is_empty() {
            return Ok(removed);
        }

        log.retain(|r| !period.contains(r.timestamp));
        consumption::recalculate_after(log, period.start);

        self.persist().await?;

        tracing::info!(
            meter,
            deleted = removed.len(),
            start = %period.start,
            end = %period.end,
            "readings deleted in period"
        );
        Ok(removed)
    }

    /// Recompute derived consumption for the whole log, persisting only if
    /// something actually changed. Returns the number of updated readings.
    pub async fn recalculate_consumption(&mut self, meter: &str) -> Result<usize, StoreError> {
        self.ensure_loaded().await?;
        let Some(log) = self.logs.get_mut(meter) else {
            return Ok(0);
        };
        let updated = consumption::recalculate(log);
        if updated > 0 {
            self.persist().await?;
        }
        Ok(updated)
    }

    /// Fill in consumption only where missing (incremental rebuild step).
    pub async fn fill_missing_consumption(&mut self, meter: &str) -> Result<usize, StoreError> {
        self.ensure_loaded().await?;
        let Some(log) = self.logs.get_mut(meter) else {
            return Ok(0);
        };
        let updated = consumption::fill_missing(log);
        if updated > 0 {
            self.persist().await?;
        }
        Ok(updated)
    }

    pub async fn get(&mut self, meter: &str, reading_id: &str) -> Result<Option<Reading>, StoreError> {
        self.ensure_loaded().await?;
        Ok(self
            .logs
            .get(meter)
            .and_then(|log| log.iter().find(|r| r.id == reading_id))
            .cloned())
    }

    pub async fn get_by_timestamp(
        &mut self,
        meter: &str,
        timestamp: OffsetDateTime,
    ) -> Result<Option<Reading>, StoreError> {
        self.ensure_loaded().await?;
        Ok(self
            .logs
            .get(meter)
            .and_then(|log| log.iter().find(|r| r.timestamp == timestamp))
            .cloned())
    }

    /// All readings for a meter, ascending by timestamp.
    pub async fn list(&mut self, meter: &str) -> Result<Vec<Reading>, StoreError> {
        self.ensure_loaded().await?;
        Ok(self.logs.get(meter).cloned().unwrap_or_default())
    }

    pub async fn list_in_range(
        &mut self,
        meter: &str,
        period: TimePeriod,
    ) -> Result<Vec<Reading>, StoreError> {
        let readings = self.list(meter).await?;
        Ok(readings
            .into_iter()
            .filter(|r| period.contains(r.timestamp))
            .collect())
    }

    pub async fn count(&mut self, meter: &str) -> Result<usize, StoreError> {
        self.ensure_loaded().await?;
        Ok(self.logs.get(meter).map_or(0, Vec::len))
    }

    pub async fn latest(&mut self, meter: &str) -> Result<Option<Reading>, StoreError> {
        self.ensure_loaded().await?;
        Ok(self.logs.get(meter).and_then(|log| log.last()).cloned())
    }

    pub async fn earliest(&mut self, meter: &str) -> Result<Option<Reading>, StoreError> {
        self.ensure_loaded().await?;
        Ok(self.logs.get(meter).and_then(|log| log.first()).cloned())
    }
}

use tokio::sync::Mutex;

use crate::reconcile::{HistoryReconciler, HistoryStore, HistoryStoreError, ProjectionReport};
use crate::store::{ReadingStore, StoreError};
use crate::storage::LogStorage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildMode {
    /// Clean up junk rows and fill gaps; the snapshot noise filter applies.
    Incremental,
    /// Wipe everything the meter owns and replay the full log with the
    /// noise filter bypassed.
    Complete,
}

impl RebuildMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Incremental => "incremental",
            Self::Complete => "complete",
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum RebuildError {
    #[error("history store unavailable: {0}")]
    Unavailable(#[source] HistoryStoreError),
    #[error("rebuild aborted during {step}: {source}")]
    StepFailed {
        step: &'static str,
        #[source]
        source: HistoryStoreError,
    },
    #[error("rebuild aborted during {step}: {source}")]
    StoreFailed {
        step: &'static str,
        #[source]
        source: StoreError,
    },
}

#[derive(Debug)]
pub struct RebuildOutcome {
    pub mode: RebuildMode,
    pub readings_processed: usize,
    pub consumption_updates: usize,
    pub report: ProjectionReport,
}

/// Wipe-and-replay (or catch-up) of the secondary store from the reading
/// log. Steps run strictly in order and any step failure aborts the whole
/// rebuild; that is safe because the reading log is never touched here, so
/// a retry starts from the same authoritative state and converges to the
/// same secondary-store contents.
/// The store sits behind a mutex so the long projection phase does not hold
/// it; callers serialize whole rebuilds per meter with their own guard.
pub async fn rebuild<S, H>(
    store: &Mutex<ReadingStore<S>>,
    reconciler: &HistoryReconciler<H>,
    meter: &str,
    mode: RebuildMode,
) -> Result<RebuildOutcome, RebuildError>
where
    S: LogStorage,
    H: HistoryStore,
{
    tracing::info!(meter, mode = mode.as_str(), "starting history rebuild");

    // Step 1: preflight, fail fast when the secondary store is unreachable.
    reconciler
        .history()
        .ping()
        .await
        .map_err(RebuildError::Unavailable)?;

    // Step 2: clearing.
    match mode {
        RebuildMode::Complete => {
            reconciler
                .history()
                .clear_meter(meter)
                .await
                .map_err(|source| RebuildError::StepFailed {
                    step: "clear",
                    source,
                })?;
        }
        RebuildMode::Incremental => {
            let removed = reconciler
                .history()
                .cleanup_invalid_snapshots(meter)
                .await
                .map_err(|source| RebuildError::StepFailed {
                    step: "cleanup",
                    source,
                })?;
            if removed > 0 {
                tracing::debug!(meter, removed, "removed invalid snapshot rows");
            }
        }
    }

    // Step 3: load the authoritative log.
    let readings = store
        .lock()
        .await
        .list(meter)
        .await
        .map_err(|source| RebuildError::StoreFailed {
            step: "load",
            source,
        })?;
    if readings.is_empty() {
        tracing::debug!(meter, "no readings, nothing to rebuild");
        return Ok(RebuildOutcome {
            mode,
            readings_processed: 0,
            consumption_updates: 0,
            report: ProjectionReport::default(),
        });
    }

    // Step 4: bring derived consumption up to date, persist if changed, and
    // take a stable copy of the log for the replay.
    let (consumption_updates, readings) = {
        let mut store = store.lock().await;
        let updates = match mode {
            RebuildMode::Complete => store.recalculate_consumption(meter).await,
            RebuildMode::Incremental => store.fill_missing_consumption(meter).await,
        }
        .map_err(|source| RebuildError::StoreFailed {
            step: "consumption",
            source,
        })?;
        let readings = store
            .list(meter)
            .await
            .map_err(|source| RebuildError::StoreFailed {
                step: "reload",
                source,
            })?;
        (updates, readings)
    };

    // Step 5: replay the projection. Per-point failures degrade the report
    // but do not abort.
    let report = reconciler
        .project_log(meter, &readings, mode == RebuildMode::Complete)
        .await;

    // Step 6: re-establish the current value for observers.
    if let Some(latest) = readings.last() {
        reconciler.notify_current_value(meter, latest);
    }

    tracing::info!(
        meter,
        mode = mode.as_str(),
        readings = report.readings_processed,
        statistics = report.statistics_written,
        snapshots = report.snapshots_written,
        failures = report.failures.len(),
        "history rebuild finished"
    );

    Ok(RebuildOutcome {
        mode,
        readings_processed: readings.len(),
        consumption_updates,
        report,
    })
}

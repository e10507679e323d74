pub mod config;
pub mod consumption;
pub mod metrics_server;
pub mod observability;
pub mod rebuild;
pub mod reconcile;
pub mod service;
pub mod storage;
pub mod store;

pub use rebuild::{RebuildError, RebuildMode, RebuildOutcome};
pub use reconcile::{
    HistoryReconciler, HistoryStore, HistoryStoreError, InMemoryHistoryStore, MeterValueUpdate,
    PgHistoryStore, ProjectionReport, ReconcilerSettings,
};
pub use service::{BulkImportReport, MeterService, NewReading, ServiceError};
pub use storage::{JsonFileStorage, LogStorage, MemoryStorage, StorageError};
pub use store::{ReadingStore, StoreError};

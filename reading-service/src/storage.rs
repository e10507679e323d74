use std::collections::HashMap;
use std::path::PathBuf;

use meter_client::domain::Reading;

/// The whole persisted document: one ordered reading log per meter.
pub type ReadingLogs = HashMap<String, Vec<Reading>>;

#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage document error: {0}")]
    Document(#[from] serde_json::Error),
}

/// Durable key-value persistence for the reading logs. The document is
/// loaded lazily on first access and saved as a full overwrite; there are
/// no partial writes.
#[async_trait::async_trait]
pub trait LogStorage: Send + Sync {
    async fn load(&self) -> Result<Option<ReadingLogs>, StorageError>;
    async fn save(&self, logs: &ReadingLogs) -> Result<(), StorageError>;
}

#[async_trait::async_trait]
impl<'a, T: LogStorage + ?Sized> LogStorage for &'a T {
    async fn load(&self) -> Result<Option<ReadingLogs>, StorageError> {
        (**self).load().await
    }

    async fn save(&self, logs: &ReadingLogs) -> Result<(), StorageError> {
        (**self).save(logs).await
    }
}

#[async_trait::async_trait]
impl<T: LogStorage + ?Sized> LogStorage for std::sync::Arc<T> {
    async fn load(&self) -> Result<Option<ReadingLogs>, StorageError> {
        (**self).load().await
    }

    async fn save(&self, logs: &ReadingLogs) -> Result<(), StorageError> {
        (**self).save(logs).await
    }
}

/// Production storage: one JSON document on disk.
pub struct JsonFileStorage {
    path: PathBuf,
}

impl JsonFileStorage {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait::async_trait]
impl LogStorage for JsonFileStorage {
    async fn load(&self) -> Result<Option<ReadingLogs>, StorageError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let logs: ReadingLogs = serde_json::from_slice(&bytes)?;
        Ok(Some(logs))
    }

    async fn save(&self, logs: &ReadingLogs) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec_pretty(logs)?;
        tokio::fs::write(&self.path, bytes).await?;
        Ok(())
    }
}

/// Volatile storage for tests and embedders that do not need durability.
#[derive(Default)]
pub struct MemoryStorage {
    document: std::sync::Mutex<Option<ReadingLogs>>,
}

#[async_trait::async_trait]
impl LogStorage for MemoryStorage {
    async fn load(&self) -> Result<Option<ReadingLogs>, StorageError> {
        Ok(self.document.lock().expect("storage lock poisoned").clone())
    }

    async fn save(&self, logs: &ReadingLogs) -> Result<(), StorageError> {
        *self.document.lock().expect("storage lock poisoned") = Some(logs.clone());
        Ok(())
    }
}

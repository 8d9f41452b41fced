pub mod file;
pub mod memory;
pub mod sql;

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use thiserror::Error;
use tracing::info;

use crate::config::StorageConfig;
use crate::export::health::HealthMetrics;
use crate::metric::{Metric, MetricError, MetricKind};

use self::file::{FileStorage, FileStorageConfig};
use self::memory::MemStorage;
use self::sql::SqlStorage;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{kind} {name:?} not found")]
    NotFound { name: String, kind: MetricKind },

    #[error(transparent)]
    Aggregation(#[from] MetricError),

    /// Non-transactional batch stopped at the first failing element.
    #[error("batch aborted after {applied} of {total} updates: {source}")]
    PartialBatch {
        applied: usize,
        total: usize,
        #[source]
        source: Box<StorageError>,
    },

    /// Transactional batch failed and nothing was committed.
    #[error("batch rolled back at element {index}: {source}")]
    RolledBack {
        index: usize,
        #[source]
        source: Box<StorageError>,
    },

    #[error("database: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("stored {kind} {name:?} has no value")]
    Corrupt { name: String, kind: MetricKind },

    #[error("{}", DisplayAll(.0))]
    Multiple(Vec<StorageError>),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Whether the failure came from the caller's input rather than the backend.
    pub fn is_client_error(&self) -> bool {
        match self {
            Self::Aggregation(_) => true,
            Self::PartialBatch { source, .. } | Self::RolledBack { source, .. } => {
                source.is_client_error()
            }
            _ => false,
        }
    }

    /// Collapses a list of errors into one result.
    pub fn join(mut errors: Vec<StorageError>) -> Result<(), StorageError> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Self::Multiple(errors)),
        }
    }
}

struct DisplayAll<'a>(&'a [StorageError]);

impl fmt::Display for DisplayAll<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, e) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{e}")?;
        }
        Ok(())
    }
}

/// Current-value metric store.
///
/// Counters accumulate, gauges overwrite. See [`Metric::apply`].
pub trait Storage: Send + Sync + 'static {
    /// Returns the backend name for logging.
    fn name(&self) -> &'static str;

    fn get(
        &self,
        name: &str,
        kind: MetricKind,
    ) -> impl Future<Output = Result<Metric, StorageError>> + Send;

    /// Applies one update and returns the post-update stored value.
    fn update(&self, metric: &Metric) -> impl Future<Output = Result<Metric, StorageError>> + Send;

    /// Applies every update in order as one logical operation.
    fn add_batch(&self, batch: &[Metric]) -> impl Future<Output = Result<(), StorageError>> + Send;

    /// Every known identity exactly once.
    fn list(&self) -> impl Future<Output = Result<Vec<Metric>, StorageError>> + Send;

    fn ping(&self) -> impl Future<Output = Result<(), StorageError>> + Send;

    fn close(&self) -> impl Future<Output = Result<(), StorageError>> + Send;
}

/// Storage backend chosen at startup.
///
/// Enum dispatch keeps the async trait methods statically dispatched.
pub enum Backend {
    Memory(MemStorage),
    File(FileStorage<MemStorage>),
    Sql(SqlStorage),
}

impl Storage for Backend {
    fn name(&self) -> &'static str {
        match self {
            Self::Memory(s) => s.name(),
            Self::File(s) => s.name(),
            Self::Sql(s) => s.name(),
        }
    }

    async fn get(&self, name: &str, kind: MetricKind) -> Result<Metric, StorageError> {
        match self {
            Self::Memory(s) => s.get(name, kind).await,
            Self::File(s) => s.get(name, kind).await,
            Self::Sql(s) => s.get(name, kind).await,
        }
    }

    async fn update(&self, metric: &Metric) -> Result<Metric, StorageError> {
        match self {
            Self::Memory(s) => s.update(metric).await,
            Self::File(s) => s.update(metric).await,
            Self::Sql(s) => s.update(metric).await,
        }
    }

    async fn add_batch(&self, batch: &[Metric]) -> Result<(), StorageError> {
        match self {
            Self::Memory(s) => s.add_batch(batch).await,
            Self::File(s) => s.add_batch(batch).await,
            Self::Sql(s) => s.add_batch(batch).await,
        }
    }

    async fn list(&self) -> Result<Vec<Metric>, StorageError> {
        match self {
            Self::Memory(s) => s.list().await,
            Self::File(s) => s.list().await,
            Self::Sql(s) => s.list().await,
        }
    }

    async fn ping(&self) -> Result<(), StorageError> {
        match self {
            Self::Memory(s) => s.ping().await,
            Self::File(s) => s.ping().await,
            Self::Sql(s) => s.ping().await,
        }
    }

    async fn close(&self) -> Result<(), StorageError> {
        match self {
            Self::Memory(s) => s.close().await,
            Self::File(s) => s.close().await,
            Self::Sql(s) => s.close().await,
        }
    }
}

/// Opens the backend selected by `cfg`.
///
/// A database DSN wins over a file path; with neither the store is volatile.
pub async fn open(cfg: &StorageConfig, health: Option<Arc<HealthMetrics>>) -> Result<Backend> {
    if !cfg.database_dsn.is_empty() {
        let store = SqlStorage::connect(&cfg.database_dsn)
            .await
            .context("connecting to metrics database")?;
        info!(backend = store.name(), "storage opened");
        return Ok(Backend::Sql(store));
    }

    if !cfg.file_path.as_os_str().is_empty() {
        let file_cfg = FileStorageConfig {
            path: cfg.file_path.clone(),
            store_interval: cfg.store_interval,
            restore: cfg.restore,
        };
        let store = FileStorage::open(MemStorage::new(), file_cfg, health)
            .await
            .with_context(|| format!("opening metrics file {}", cfg.file_path.display()))?;
        info!(
            backend = store.name(),
            path = %cfg.file_path.display(),
            store_interval = ?cfg.store_interval,
            restore = cfg.restore,
            "storage opened",
        );
        return Ok(Backend::File(store));
    }

    info!(backend = "memory", "storage opened");
    Ok(Backend::Memory(MemStorage::new()))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_join_errors() {
        assert!(StorageError::join(Vec::new()).is_ok());

        let single = StorageError::join(vec![StorageError::NotFound {
            name: "a".into(),
            kind: MetricKind::Gauge,
        }])
        .expect_err("one error");
        assert!(single.is_not_found());

        let many = StorageError::join(vec![
            StorageError::NotFound {
                name: "a".into(),
                kind: MetricKind::Gauge,
            },
            StorageError::Aggregation(MetricError::EmptyName),
        ])
        .expect_err("two errors");
        assert_eq!(
            many.to_string(),
            "gauge \"a\" not found; metric name must not be empty"
        );
    }

    #[test]
    fn test_client_error_classification() {
        let partial = StorageError::PartialBatch {
            applied: 1,
            total: 2,
            source: Box::new(StorageError::Aggregation(MetricError::EmptyName)),
        };
        assert!(partial.is_client_error());
        assert!(!StorageError::Corrupt {
            name: "x".into(),
            kind: MetricKind::Counter
        }
        .is_client_error());
    }

    #[tokio::test]
    async fn test_open_selects_memory_without_path_or_dsn() {
        let cfg = StorageConfig {
            database_dsn: String::new(),
            file_path: PathBuf::new(),
            store_interval: Duration::ZERO,
            restore: false,
        };
        let backend = open(&cfg, None).await.expect("open");
        assert_eq!(backend.name(), "memory");
    }

    #[tokio::test]
    async fn test_open_selects_file_for_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = StorageConfig {
            database_dsn: String::new(),
            file_path: dir.path().join("metrics.json"),
            store_interval: Duration::ZERO,
            restore: true,
        };
        let backend = open(&cfg, None).await.expect("open");
        assert_eq!(backend.name(), "file");
        backend.close().await.expect("close");
    }

    #[tokio::test]
    async fn test_open_prefers_dsn_over_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = StorageConfig {
            database_dsn: "sqlite::memory:".to_string(),
            file_path: dir.path().join("metrics.json"),
            store_interval: Duration::ZERO,
            restore: true,
        };
        let backend = open(&cfg, None).await.expect("open");
        assert_eq!(backend.name(), "sql");
        assert!(!dir.path().join("metrics.json").exists());
        backend.close().await.expect("close");
    }
}

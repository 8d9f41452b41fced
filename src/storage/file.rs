//! File-backed decorator: mirrors any backend into a newline-delimited JSON
//! log and restores it on startup.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{Storage, StorageError};
use crate::export::health::HealthMetrics;
use crate::metric::record::MetricRecord;
use crate::metric::{Metric, MetricKind};

#[derive(Debug, Clone)]
pub struct FileStorageConfig {
    pub path: PathBuf,
    /// Zero mirrors every accepted update before returning. Otherwise a
    /// background task rewrites the whole file on this period.
    pub store_interval: Duration,
    pub restore: bool,
}

struct Shared<S> {
    inner: S,
    path: PathBuf,
    file: tokio::sync::Mutex<File>,
    health: Option<Arc<HealthMetrics>>,
}

impl<S: Storage> Shared<S> {
    fn io_err(&self, source: std::io::Error) -> StorageError {
        StorageError::Io {
            path: self.path.clone(),
            source,
        }
    }

    fn record_write(&self, mode: &str, ok: bool) {
        if let Some(h) = &self.health {
            if ok {
                h.file_writes.with_label_values(&[mode]).inc();
            } else {
                h.file_write_failures.with_label_values(&[mode]).inc();
            }
        }
    }

    /// Truncates the file and writes one record per stored identity.
    async fn snapshot(&self) -> Result<usize, StorageError> {
        let mut file = self.file.lock().await;
        let metrics = self.inner.list().await?;
        let buf = encode_lines(&metrics).map_err(|e| self.io_err(e))?;

        let res = async {
            file.set_len(0).await?;
            file.seek(SeekFrom::Start(0)).await?;
            file.write_all(&buf).await?;
            file.flush().await
        }
        .await;

        self.record_write("snapshot", res.is_ok());
        res.map_err(|e| self.io_err(e))?;

        Ok(metrics.len())
    }

    /// Appends accepted updates. Failures are logged and never returned.
    async fn mirror(&self, file: &mut File, updates: &[Metric]) {
        if updates.is_empty() {
            return;
        }

        let res = async {
            let buf = encode_lines(updates)?;
            file.seek(SeekFrom::End(0)).await?;
            file.write_all(&buf).await?;
            file.flush().await
        }
        .await;

        self.record_write("append", res.is_ok());
        if let Err(e) = res {
            error!(
                path = %self.path.display(),
                records = updates.len(),
                error = %e,
                "failed to append metrics to file",
            );
        }
    }
}

fn encode_lines(metrics: &[Metric]) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(metrics.len() * 64);
    for m in metrics {
        serde_json::to_writer(&mut buf, &MetricRecord::from(m))?;
        buf.push(b'\n');
    }
    Ok(buf)
}

/// Parses log lines, skipping any that cannot be decoded.
fn decode_lines(data: &[u8], path: &Path) -> Vec<Metric> {
    let mut out = Vec::new();

    for (lineno, line) in data.split(|b| *b == b'\n').enumerate() {
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        let parsed = serde_json::from_slice::<MetricRecord>(line)
            .map_err(|e| e.to_string())
            .and_then(|rec| Metric::try_from(rec).map_err(|e| e.to_string()));

        match parsed {
            Ok(m) => out.push(m),
            Err(e) => warn!(
                path = %path.display(),
                line = lineno + 1,
                error = %e,
                "skipping unreadable metric record",
            ),
        }
    }

    out
}

/// Decorates `S` with a durable log file.
pub struct FileStorage<S> {
    shared: Arc<Shared<S>>,
    sync: bool,
    cancel: CancellationToken,
    flusher: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl<S: Storage> FileStorage<S> {
    /// Opens or creates the log, optionally replays it into `inner`, and
    /// starts the periodic writer when configured.
    pub async fn open(
        inner: S,
        cfg: FileStorageConfig,
        health: Option<Arc<HealthMetrics>>,
    ) -> Result<Self, StorageError> {
        let io_err = |source| StorageError::Io {
            path: cfg.path.clone(),
            source,
        };

        if let Some(parent) = cfg.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&cfg.path)
            .await
            .map_err(io_err)?;

        let mut restored = Vec::new();
        if cfg.restore {
            let mut data = Vec::new();
            file.read_to_end(&mut data).await.map_err(io_err)?;
            restored = decode_lines(&data, &cfg.path);
            inner.add_batch(&restored).await?;
        } else {
            file.set_len(0).await.map_err(io_err)?;
        }

        let shared = Arc::new(Shared {
            inner,
            path: cfg.path.clone(),
            file: tokio::sync::Mutex::new(file),
            health,
        });

        if cfg.restore {
            // Compact the replayed log down to one record per identity.
            let kept = shared.snapshot().await?;
            info!(
                path = %cfg.path.display(),
                records = restored.len(),
                metrics = kept,
                "restored metrics from file",
            );
        }

        let cancel = CancellationToken::new();
        let sync = cfg.store_interval.is_zero();
        let flusher = if sync {
            None
        } else {
            Some(tokio::spawn(run_flusher(
                Arc::clone(&shared),
                cfg.store_interval,
                cancel.clone(),
            )))
        };

        Ok(Self {
            shared,
            sync,
            cancel,
            flusher: parking_lot::Mutex::new(flusher),
        })
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    pub fn inner(&self) -> &S {
        &self.shared.inner
    }
}

async fn run_flusher<S: Storage>(
    shared: Arc<Shared<S>>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        match shared.snapshot().await {
            Ok(n) => debug!(path = %shared.path.display(), metrics = n, "wrote metrics snapshot"),
            Err(e) => error!(error = %e, "periodic metrics snapshot failed"),
        }
    }
}

impl<S> Drop for FileStorage<S> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl<S: Storage> Storage for FileStorage<S> {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn get(&self, name: &str, kind: MetricKind) -> Result<Metric, StorageError> {
        self.shared.inner.get(name, kind).await
    }

    async fn update(&self, metric: &Metric) -> Result<Metric, StorageError> {
        if !self.sync {
            return self.shared.inner.update(metric).await;
        }

        // Holding the file lock keeps log order identical to apply order.
        let mut file = self.shared.file.lock().await;
        let stored = self.shared.inner.update(metric).await?;
        self.shared
            .mirror(&mut file, std::slice::from_ref(metric))
            .await;
        Ok(stored)
    }

    async fn add_batch(&self, batch: &[Metric]) -> Result<(), StorageError> {
        if !self.sync {
            return self.shared.inner.add_batch(batch).await;
        }

        let mut file = self.shared.file.lock().await;
        match self.shared.inner.add_batch(batch).await {
            Ok(()) => {
                self.shared.mirror(&mut file, batch).await;
                Ok(())
            }
            Err(e) => {
                // Whatever the backend kept must survive a restart too.
                if let StorageError::PartialBatch { applied, .. } = &e {
                    if let Some(prefix) = batch.get(..*applied) {
                        self.shared.mirror(&mut file, prefix).await;
                    }
                }
                Err(e)
            }
        }
    }

    async fn list(&self) -> Result<Vec<Metric>, StorageError> {
        self.shared.inner.list().await
    }

    async fn ping(&self) -> Result<(), StorageError> {
        self.shared.inner.ping().await
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.cancel.cancel();

        let flusher = self.flusher.lock().take();
        if let Some(handle) = flusher {
            if let Err(e) = handle.await {
                warn!(error = %e, "metrics file flusher join failed");
            }
        }

        let mut errors = Vec::new();

        match self.shared.snapshot().await {
            Ok(n) => info!(
                path = %self.shared.path.display(),
                metrics = n,
                "wrote final metrics snapshot",
            ),
            Err(e) => {
                error!(error = %e, "final metrics snapshot failed");
                errors.push(e);
            }
        }

        if let Err(e) = self.shared.inner.close().await {
            errors.push(e);
        }

        StorageError::join(errors)
    }
}

//! Fixed-size worker pool draining the batch queue.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::client::Deliver;
use crate::export::health::HealthMetrics;
use crate::metric::MetricBatch;
use crate::retry::{retry, RetryPolicy};

/// Error channel capacity per worker.
const ERRORS_PER_WORKER: usize = 16;

/// `size` workers sharing one queue; at most `size` deliveries are in flight.
pub struct WorkerPool<D> {
    size: usize,
    policy: RetryPolicy,
    delivery: Arc<D>,
    health: Option<Arc<HealthMetrics>>,
}

impl<D: Deliver> WorkerPool<D> {
    pub fn new(size: usize, policy: RetryPolicy, delivery: Arc<D>) -> Self {
        Self {
            size: size.max(1),
            policy,
            delivery,
            health: None,
        }
    }

    pub fn with_health(mut self, health: Option<Arc<HealthMetrics>>) -> Self {
        self.health = health;
        self
    }

    /// Spawns the workers. Each pulls batches until the queue closes or
    /// `cancel` fires, and reports batches that exhausted their retries.
    ///
    /// The returned stream closes once every worker has exited.
    pub fn start(
        self,
        batches: mpsc::Receiver<MetricBatch>,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<anyhow::Error> {
        let (tx, rx) = mpsc::channel(self.size * ERRORS_PER_WORKER);
        let queue = Arc::new(Mutex::new(batches));

        info!(workers = self.size, "starting delivery workers");

        for id in 0..self.size {
            tokio::spawn(run_worker(
                id,
                Arc::clone(&queue),
                Arc::clone(&self.delivery),
                self.policy,
                self.health.clone(),
                cancel.clone(),
                tx.clone(),
            ));
        }

        rx
    }
}

async fn run_worker<D: Deliver>(
    id: usize,
    queue: Arc<Mutex<mpsc::Receiver<MetricBatch>>>,
    delivery: Arc<D>,
    policy: RetryPolicy,
    health: Option<Arc<HealthMetrics>>,
    cancel: CancellationToken,
    errors: mpsc::Sender<anyhow::Error>,
) {
    loop {
        let batch = {
            let mut rx = queue.lock().await;
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,
                batch = rx.recv() => batch,
            }
        };

        let Some(batch) = batch else {
            break;
        };

        let delivery = &delivery;
        let batch = &batch;
        match retry(&cancel, policy, move || delivery.deliver(batch)).await {
            Ok(Some(())) => {}
            Ok(None) => break,
            Err(e) => {
                if let Some(h) = &health {
                    h.retries_exhausted.inc();
                }
                warn!(worker = id, metrics = batch.len(), error = %e, "dropping batch");

                let err = anyhow::Error::new(e)
                    .context(format!("delivering batch of {} metrics", batch.len()));
                if errors.send(err).await.is_err() {
                    break;
                }
            }
        }
    }

    debug!(worker = id, "delivery worker exited");
}

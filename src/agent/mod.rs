//! Metrics agent: samples on one schedule, queues batches on another, and
//! delivers them with a bounded worker pool.

pub mod client;
pub mod fanin;
pub mod pool;
pub mod sampler;

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::AgentConfig;
use crate::export::health::HealthMetrics;
use crate::metric::MetricBatch;
use crate::scheduler::{Scheduler, Task};
use crate::shutdown::JoinedError;

use self::client::{Deliver, HttpDelivery};
use self::pool::WorkerPool;
use self::sampler::Sampler;

/// Agent wiring: sampler, scheduler, queue and worker pool.
pub struct Agent<D = HttpDelivery> {
    cfg: AgentConfig,
    delivery: Arc<D>,
    sampler: Sampler,
    health: Option<Arc<HealthMetrics>>,
}

impl Agent<HttpDelivery> {
    /// Creates an agent delivering over HTTP to `cfg.address`.
    pub fn new(cfg: AgentConfig, health: Option<Arc<HealthMetrics>>) -> Result<Self> {
        let delivery =
            HttpDelivery::new(&cfg, health.clone()).context("creating delivery client")?;
        Ok(Self::with_delivery(cfg, Arc::new(delivery), health))
    }
}

impl<D: Deliver> Agent<D> {
    pub fn with_delivery(
        cfg: AgentConfig,
        delivery: Arc<D>,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        Self {
            cfg,
            delivery,
            sampler: Sampler::new(),
            health,
        }
    }

    /// Replaces the procfs sampler.
    pub fn with_sampler(mut self, sampler: Sampler) -> Self {
        self.sampler = sampler;
        self
    }

    /// Runs until `cancel` fires or the first task or delivery error.
    ///
    /// Every error observed before all loops and workers exited is returned.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), JoinedError> {
        let cancel = cancel.child_token();
        let sampler = Arc::new(Mutex::new(self.sampler));
        let (queue_tx, queue_rx) = mpsc::channel::<MetricBatch>(self.cfg.queue_size.max(1));

        let poll = poll_task(
            Arc::clone(&sampler),
            self.cfg.poll_interval,
            self.health.clone(),
        );
        let report = report_task(
            sampler,
            self.cfg.report_interval,
            queue_tx,
            cancel.clone(),
            self.health.clone(),
        );

        let scheduler = match Scheduler::new(vec![poll, report]) {
            Ok(s) => s,
            Err(e) => return Err(JoinedError(vec![e.context("creating scheduler")])),
        };

        info!(
            address = %self.cfg.address,
            poll_interval = ?self.cfg.poll_interval,
            report_interval = ?self.cfg.report_interval,
            rate_limit = self.cfg.rate_limit,
            compression = %self.cfg.compression,
            "agent started",
        );

        let pool = WorkerPool::new(self.cfg.rate_limit, self.cfg.retry, self.delivery)
            .with_health(self.health);
        let errors = drive(scheduler, pool, queue_rx, &cancel).await;

        info!(errors = errors.len(), "agent stopped");

        JoinedError(errors).into_result()
    }
}

/// Starts the task loops and workers, then supervises their merged error
/// streams until every one of them has exited.
async fn drive<D: Deliver>(
    scheduler: Scheduler,
    pool: WorkerPool<D>,
    queue: mpsc::Receiver<MetricBatch>,
    cancel: &CancellationToken,
) -> Vec<anyhow::Error> {
    let task_errors = scheduler.start(cancel.clone());
    let delivery_errors = pool.start(queue, cancel.clone());

    let merged = fanin::merge(vec![task_errors, delivery_errors]);
    fanin::supervise(cancel, merged).await
}

fn poll_task(
    sampler: Arc<Mutex<Sampler>>,
    period: std::time::Duration,
    health: Option<Arc<HealthMetrics>>,
) -> Task {
    Task::new("poll", period, move || {
        let result = sampler.lock().poll();
        if let Some(h) = &health {
            h.polls.inc();
            if result.is_err() {
                h.poll_errors.inc();
            }
        }
        // Missing procfs is expected off Linux; keep reporting what we have.
        if let Err(e) = result {
            debug!(error = %format!("{e:#}"), "poll incomplete");
        }
        async { Ok(()) }
    })
}

fn report_task(
    sampler: Arc<Mutex<Sampler>>,
    period: std::time::Duration,
    queue: mpsc::Sender<MetricBatch>,
    cancel: CancellationToken,
    health: Option<Arc<HealthMetrics>>,
) -> Task {
    Task::new("report", period, move || {
        let batch = sampler.lock().take_batch();
        let queue = queue.clone();
        let cancel = cancel.clone();
        let health = health.clone();

        async move {
            if batch.is_empty() {
                return Ok(());
            }
            let size = batch.len();

            tokio::select! {
                biased;

                _ = cancel.cancelled() => return Ok(()),
                res = queue.send(batch) => {
                    res.map_err(|_| anyhow!("delivery queue closed"))?;
                }
            }

            if let Some(h) = &health {
                h.batches_queued.inc();
            }
            debug!(metrics = size, "queued batch");

            anyhow::Ok(())
        }
    })
}

//! Runs a fixed set of periodic jobs concurrently.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Boxed future returned by a task's unit of work.
pub type TaskFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

type TaskFn = Box<dyn FnMut() -> TaskFuture + Send>;

/// Error channel capacity per scheduler.
const ERROR_CHANNEL_SIZE: usize = 64;

/// A named unit of work executed every `period`.
pub struct Task {
    name: String,
    period: Duration,
    op: TaskFn,
}

impl Task {
    pub fn new<F, Fut>(name: impl Into<String>, period: Duration, mut op: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            period,
            op: Box::new(move || Box::pin(op())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn period(&self) -> Duration {
        self.period
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("period", &self.period)
            .finish_non_exhaustive()
    }
}

/// Owns the task set and spawns one loop per task on start.
#[derive(Debug)]
pub struct Scheduler {
    tasks: Vec<Task>,
}

impl Scheduler {
    pub fn new(tasks: Vec<Task>) -> Result<Self> {
        for task in &tasks {
            if task.period.is_zero() {
                bail!("task {:?} has a zero period", task.name);
            }
        }
        Ok(Self { tasks })
    }

    /// Spawns every task loop and returns their shared error stream.
    ///
    /// The stream closes once every loop has exited.
    pub fn start(self, cancel: CancellationToken) -> mpsc::Receiver<anyhow::Error> {
        let (tx, rx) = mpsc::channel(ERROR_CHANNEL_SIZE);

        info!(tasks = self.tasks.len(), "starting scheduler");

        for task in self.tasks {
            tokio::spawn(run_task(task, cancel.clone(), tx.clone()));
        }

        rx
    }
}

async fn run_task(mut task: Task, cancel: CancellationToken, errors: mpsc::Sender<anyhow::Error>) {
    let mut ticker = tokio::time::interval_at(Instant::now() + task.period, task.period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        debug!(task = %task.name, "running task");

        if let Err(e) = (task.op)().await {
            warn!(task = %task.name, error = %format!("{e:#}"), "task failed");

            // Sent even after cancellation: the consumer drains until close.
            if errors
                .send(e.context(format!("task {}", task.name)))
                .await
                .is_err()
            {
                break;
            }
        }
    }

    debug!(task = %task.name, "task loop exited");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_runs_periodically_after_first_period() {
        let runs = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();

        let r = runs.clone();
        let sched = Scheduler::new(vec![Task::new("count", Duration::from_secs(2), move || {
            let r = r.clone();
            async move {
                r.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })])
        .expect("scheduler");

        let mut errors = sched.start(cancel.clone());

        tokio::time::sleep(Duration::from_millis(1900)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(5000)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);

        cancel.cancel();
        assert!(errors.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_are_reported_and_loop_continues() {
        let cancel = CancellationToken::new();
        let sched = Scheduler::new(vec![Task::new("boom", Duration::from_secs(1), || async {
            anyhow::bail!("sampler unavailable")
        })])
        .expect("scheduler");

        let mut errors = sched.start(cancel.clone());

        let first = errors.recv().await.expect("first error");
        let second = errors.recv().await.expect("second error");
        assert_eq!(format!("{first:#}"), "task boom: sampler unavailable");
        assert_eq!(format!("{second:#}"), "task boom: sampler unavailable");

        cancel.cancel();
        while errors.recv().await.is_some() {}
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_during_shutdown_is_still_reported() {
        let cancel = CancellationToken::new();
        let sched = Scheduler::new(vec![Task::new("flush", Duration::from_secs(1), || async {
            tokio::time::sleep(Duration::from_secs(2)).await;
            anyhow::bail!("flush interrupted")
        })])
        .expect("scheduler");

        let mut errors = sched.start(cancel.clone());

        // The op is mid-flight when cancellation lands.
        tokio::time::sleep(Duration::from_millis(1500)).await;
        cancel.cancel();

        let mut drained = Vec::new();
        while let Some(e) = errors.recv().await {
            drained.push(format!("{e:#}"));
        }
        assert_eq!(drained, vec!["task flush: flush interrupted".to_string()]);
    }

    #[tokio::test]
    async fn test_zero_tasks_closes_immediately() {
        let mut errors = Scheduler::new(Vec::new())
            .expect("scheduler")
            .start(CancellationToken::new());
        assert!(errors.recv().await.is_none());
    }

    #[test]
    fn test_zero_period_is_rejected() {
        let err = Scheduler::new(vec![Task::new("bad", Duration::ZERO, || async { Ok(()) })])
            .expect_err("zero period");
        assert!(err.to_string().contains("bad"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_never_overlap() {
        let running = Arc::new(AtomicBool::new(false));
        let overlapped = Arc::new(AtomicBool::new(false));
        let runs = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();

        let (rn, ov, rc) = (running.clone(), overlapped.clone(), runs.clone());
        let sched = Scheduler::new(vec![Task::new("slow", Duration::from_secs(1), move || {
            let (rn, ov, rc) = (rn.clone(), ov.clone(), rc.clone());
            async move {
                if rn.swap(true, Ordering::SeqCst) {
                    ov.store(true, Ordering::SeqCst);
                }
                tokio::time::sleep(Duration::from_millis(2500)).await;
                rn.store(false, Ordering::SeqCst);
                rc.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })])
        .expect("scheduler");

        let mut errors = sched.start(cancel.clone());
        tokio::time::sleep(Duration::from_secs(12)).await;
        // Missed ticks are skipped, so runs are bounded by op duration.
        let n = runs.load(Ordering::SeqCst);
        assert!((3..=4).contains(&n), "runs = {n}");

        cancel.cancel();
        assert!(errors.recv().await.is_none());
        assert!(!overlapped.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_independent_tasks_run_concurrently() {
        let fast = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();

        let f = fast.clone();
        let sched = Scheduler::new(vec![
            Task::new("hang", Duration::from_secs(1), || async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            }),
            Task::new("fast", Duration::from_secs(1), move || {
                let f = f.clone();
                async move {
                    f.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        ])
        .expect("scheduler");

        let _errors = sched.start(cancel.clone());
        tokio::time::sleep(Duration::from_millis(5500)).await;
        assert_eq!(fast.load(Ordering::SeqCst), 5);
        cancel.cancel();
    }
}

//! Autoscaling worker pool
//!
//! The pool runs caller-supplied tasks at a concurrency it continually
//! adjusts: `current_concurrency` follows `desired_concurrency` as
//! closely as task supply and system load allow, while the desired
//! value drifts up during sustained idle periods and down under
//! sustained overload. A single control loop owns every decision —
//! spawning, scaling, and finish detection — so no locks guard the
//! counters beyond atomics for observers on other tasks.

mod options;

pub use options::AutoscaledPoolOptions;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use log::{debug, info};
use tokio::sync::{Notify, mpsc};
use tokio::time::MissedTickBehavior;

/// Closure spawning one unit of work.
pub type RunTaskFn = Box<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Closure answering an asynchronous yes/no question about the task
/// supply (`is_task_ready`) or overall completion (`is_finished`).
pub type PoolQueryFn = Box<dyn Fn() -> BoxFuture<'static, anyhow::Result<bool>> + Send + Sync>;

/// Errors from the pool control plane.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("invalid autoscaled pool options: {0}")]
    InvalidOptions(String),

    /// A worker task returned an error; the pool shut down.
    #[error("worker task failed")]
    TaskFailed(#[source] anyhow::Error),

    /// The `is_task_ready` query returned an error; the pool shut down.
    #[error("task-ready query failed")]
    TaskReadyQueryFailed(#[source] anyhow::Error),

    /// The `is_finished` query returned an error; the pool shut down.
    #[error("finished query failed")]
    FinishedQueryFailed(#[source] anyhow::Error),

    /// In-flight tasks did not drain before the pause deadline.
    #[error("pool did not drain within {timeout:?}")]
    PauseTimeout { timeout: Duration },
}

#[derive(Debug, Default)]
struct PoolShared {
    desired_concurrency: AtomicUsize,
    current_concurrency: AtomicUsize,
    paused: AtomicBool,
    aborted: AtomicBool,
    /// Notified whenever `current_concurrency` drops to zero.
    drained: Notify,
    /// Notified on abort/resume so the control loop reacts promptly.
    control: Notify,
}

enum Flow {
    Continue,
    Finished,
}

/// Concurrency governor running tasks from three caller closures.
pub struct AutoscaledPool {
    options: AutoscaledPoolOptions,
    run_task: RunTaskFn,
    is_task_ready: PoolQueryFn,
    is_finished: PoolQueryFn,
    shared: Arc<PoolShared>,
}

impl AutoscaledPool {
    /// Create a pool. Fails on inconsistent options.
    pub fn new(
        options: AutoscaledPoolOptions,
        run_task: RunTaskFn,
        is_task_ready: PoolQueryFn,
        is_finished: PoolQueryFn,
    ) -> Result<Self, PoolError> {
        options.validate()?;
        let shared = Arc::new(PoolShared::default());
        shared.desired_concurrency.store(
            options.desired_concurrency.unwrap_or(options.min_concurrency),
            Ordering::SeqCst,
        );
        Ok(Self {
            options,
            run_task,
            is_task_ready,
            is_finished,
            shared,
        })
    }

    /// Drive the pool until `is_finished` resolves true with all
    /// workers drained, `abort` is called, or a task/query fails.
    pub async fn run(&self) -> Result<(), PoolError> {
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<anyhow::Result<()>>();

        let now = tokio::time::Instant::now();
        let mut maybe_run_timer = tokio::time::interval_at(
            now + self.options.maybe_run_interval,
            self.options.maybe_run_interval,
        );
        let mut autoscale_timer = tokio::time::interval_at(
            now + self.options.autoscale_interval,
            self.options.autoscale_interval,
        );
        let mut logging_timer = tokio::time::interval_at(
            now + self.options.logging_interval,
            self.options.logging_interval,
        );
        for timer in [&mut maybe_run_timer, &mut autoscale_timer, &mut logging_timer] {
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        info!(
            "AutoscaledPool starting: min {}, max {}, desired {}",
            self.options.min_concurrency,
            self.options.max_concurrency,
            self.desired_concurrency()
        );

        loop {
            if self.shared.aborted.load(Ordering::SeqCst) {
                info!("AutoscaledPool aborted, leaving in-flight tasks to complete on their own");
                return Ok(());
            }

            if let Flow::Finished = self.maybe_run_tasks(&done_tx).await? {
                info!("AutoscaledPool finished: all tasks done and sources report finished");
                return Ok(());
            }

            tokio::select! {
                _ = maybe_run_timer.tick() => {}
                result = done_rx.recv() => {
                    if let Some(result) = result {
                        self.handle_task_result(result)?;
                    }
                }
                _ = autoscale_timer.tick() => self.autoscale(),
                _ = logging_timer.tick() => self.log_state(),
                _ = self.shared.control.notified() => {}
            }
        }
    }

    /// Spawn tasks until a decline condition holds: paused or aborted,
    /// concurrency at target, system busy above the floor, or no task
    /// ready. When no task is ready and nothing is running, consult
    /// `is_finished`.
    async fn maybe_run_tasks(
        &self,
        done_tx: &mpsc::UnboundedSender<anyhow::Result<()>>,
    ) -> Result<Flow, PoolError> {
        loop {
            if self.shared.paused.load(Ordering::SeqCst) || self.shared.aborted.load(Ordering::SeqCst)
            {
                return Ok(Flow::Continue);
            }

            let current = self.shared.current_concurrency.load(Ordering::SeqCst);
            if current >= self.shared.desired_concurrency.load(Ordering::SeqCst) {
                return Ok(Flow::Continue);
            }
            if current >= self.options.min_concurrency && !self.currently_idle() {
                return Ok(Flow::Continue);
            }

            let ready = (self.is_task_ready)()
                .await
                .map_err(|e| self.fatal(PoolError::TaskReadyQueryFailed(e)))?;
            if !ready {
                if self.shared.current_concurrency.load(Ordering::SeqCst) == 0 {
                    let finished = (self.is_finished)()
                        .await
                        .map_err(|e| self.fatal(PoolError::FinishedQueryFailed(e)))?;
                    if finished {
                        return Ok(Flow::Finished);
                    }
                }
                return Ok(Flow::Continue);
            }

            self.shared.current_concurrency.fetch_add(1, Ordering::SeqCst);
            let task = (self.run_task)();
            let shared = Arc::clone(&self.shared);
            let done_tx = done_tx.clone();
            tokio::spawn(async move {
                let result = task.await;
                let remaining = shared.current_concurrency.fetch_sub(1, Ordering::SeqCst) - 1;
                if remaining == 0 {
                    shared.drained.notify_waiters();
                }
                // The control loop may already be gone after abort.
                let _ = done_tx.send(result);
            });
        }
    }

    fn handle_task_result(&self, result: anyhow::Result<()>) -> Result<(), PoolError> {
        match result {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fatal(PoolError::TaskFailed(e))),
        }
    }

    /// Mark the pool aborted on a fatal error so observers see a
    /// consistent state after `run` rejects.
    fn fatal(&self, error: PoolError) -> PoolError {
        self.shared.aborted.store(true, Ordering::SeqCst);
        error
    }

    /// Adjust desired concurrency from the historical load verdict.
    fn autoscale(&self) {
        let desired = self.shared.desired_concurrency.load(Ordering::SeqCst);
        let current = self.shared.current_concurrency.load(Ordering::SeqCst);

        if self.historically_idle() && self.currently_idle() {
            let occupancy_floor =
                (desired as f64 * self.options.desired_concurrency_ratio).floor() as usize;
            if desired < self.options.max_concurrency && current >= occupancy_floor {
                let step = (desired as f64 * self.options.scale_up_step_ratio).ceil() as usize;
                let scaled = (desired + step).min(self.options.max_concurrency);
                self.shared.desired_concurrency.store(scaled, Ordering::SeqCst);
                debug!("Scaling up desired concurrency {desired} -> {scaled}");
            }
        } else if !self.historically_idle() && desired > self.options.min_concurrency {
            let step = (desired as f64 * self.options.scale_down_step_ratio).ceil() as usize;
            let scaled = desired
                .saturating_sub(step)
                .max(self.options.min_concurrency);
            self.shared.desired_concurrency.store(scaled, Ordering::SeqCst);
            debug!("Scaling down desired concurrency {desired} -> {scaled}");
        }
    }

    fn log_state(&self) {
        info!(
            "AutoscaledPool state: current {}, desired {}, system idle {}",
            self.current_concurrency(),
            self.desired_concurrency(),
            self.currently_idle()
        );
    }

    fn currently_idle(&self) -> bool {
        self.options
            .load_monitor
            .as_ref()
            .is_none_or(|monitor| monitor.current_status().is_system_idle)
    }

    fn historically_idle(&self) -> bool {
        self.options
            .load_monitor
            .as_ref()
            .is_none_or(|monitor| monitor.historical_status().is_system_idle)
    }

    /// Stop spawning new tasks and wait for in-flight ones to finish.
    pub async fn pause(&self, timeout: Duration) -> Result<(), PoolError> {
        self.shared.paused.store(true, Ordering::SeqCst);
        self.shared.control.notify_waiters();

        let drained = async {
            loop {
                let notified = self.shared.drained.notified();
                if self.shared.current_concurrency.load(Ordering::SeqCst) == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, drained)
            .await
            .map_err(|_| PoolError::PauseTimeout { timeout })
    }

    /// Resume spawning after a pause.
    pub fn resume(&self) {
        self.shared.paused.store(false, Ordering::SeqCst);
        self.shared.control.notify_waiters();
    }

    /// Stop the pool as soon as the control loop notices. In-flight
    /// tasks are not cancelled; they complete or fail on their own.
    pub fn abort(&self) {
        self.shared.aborted.store(true, Ordering::SeqCst);
        self.shared.control.notify_waiters();
    }

    #[must_use]
    pub fn current_concurrency(&self) -> usize {
        self.shared.current_concurrency.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn desired_concurrency(&self) -> usize {
        self.shared.desired_concurrency.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.shared.aborted.load(Ordering::SeqCst)
    }
}

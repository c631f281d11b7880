//! Autoscaled pool configuration

use std::sync::Arc;
use std::time::Duration;

use crate::load_monitor::LoadMonitor;

use super::PoolError;

/// Configuration for an [`AutoscaledPool`].
///
/// [`AutoscaledPool`]: super::AutoscaledPool
#[derive(Debug, Clone)]
pub struct AutoscaledPoolOptions {
    /// Concurrency floor. The pool keeps spawning up to this many
    /// tasks even while the system reports overload.
    pub min_concurrency: usize,
    /// Concurrency ceiling.
    pub max_concurrency: usize,
    /// Starting desired concurrency. Defaults to `min_concurrency`.
    pub desired_concurrency: Option<usize>,
    /// Scale up only when at least this fraction of the desired
    /// concurrency is actually in use — otherwise raising the target
    /// would change nothing.
    pub desired_concurrency_ratio: f64,
    /// Fraction of the desired concurrency added per scale-up step.
    pub scale_up_step_ratio: f64,
    /// Fraction of the desired concurrency removed per scale-down step.
    pub scale_down_step_ratio: f64,
    /// Fallback interval for re-checking whether a task can start; task
    /// completions re-check immediately.
    pub maybe_run_interval: Duration,
    /// Interval between desired-concurrency adjustments.
    pub autoscale_interval: Duration,
    /// Interval between state log lines.
    pub logging_interval: Duration,
    /// Source of the idle/overloaded signal. Without one the system is
    /// treated as always idle.
    pub load_monitor: Option<Arc<LoadMonitor>>,
}

impl Default for AutoscaledPoolOptions {
    fn default() -> Self {
        Self {
            min_concurrency: 1,
            max_concurrency: 1000,
            desired_concurrency: None,
            desired_concurrency_ratio: 0.90,
            scale_up_step_ratio: 0.05,
            scale_down_step_ratio: 0.05,
            maybe_run_interval: Duration::from_millis(500),
            autoscale_interval: Duration::from_secs(10),
            logging_interval: Duration::from_secs(60),
            load_monitor: None,
        }
    }
}

impl AutoscaledPoolOptions {
    pub(crate) fn validate(&self) -> Result<(), PoolError> {
        if self.min_concurrency == 0 {
            return Err(PoolError::InvalidOptions(
                "min_concurrency must be at least 1".to_string(),
            ));
        }
        if self.min_concurrency > self.max_concurrency {
            return Err(PoolError::InvalidOptions(format!(
                "min_concurrency ({}) must not exceed max_concurrency ({})",
                self.min_concurrency, self.max_concurrency
            )));
        }
        if let Some(desired) = self.desired_concurrency
            && (desired < self.min_concurrency || desired > self.max_concurrency)
        {
            return Err(PoolError::InvalidOptions(format!(
                "desired_concurrency ({desired}) must lie within [{}, {}]",
                self.min_concurrency, self.max_concurrency
            )));
        }
        for (name, value) in [
            ("desired_concurrency_ratio", self.desired_concurrency_ratio),
            ("scale_up_step_ratio", self.scale_up_step_ratio),
            ("scale_down_step_ratio", self.scale_down_step_ratio),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(PoolError::InvalidOptions(format!(
                    "{name} must lie within (0, 1], got {value}"
                )));
            }
        }
        Ok(())
    }
}

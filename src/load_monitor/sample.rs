//! Load sample and status types

use std::time::{Duration, Instant};

use super::LoadMonitorOptions;

/// One measurement of system load.
#[derive(Debug, Clone, Copy)]
pub struct LoadSample {
    pub at: Instant,
    /// Whole-system CPU utilisation in `0.0..=1.0`.
    pub cpu_ratio: f64,
    /// Used / total memory in `0.0..=1.0`.
    pub mem_ratio: f64,
    /// How late the sampler's own timer fired. A busy scheduler delays
    /// timers, so this doubles as an event-loop latency proxy.
    pub scheduler_delay: Duration,
}

impl LoadSample {
    pub(crate) fn is_cpu_overloaded(&self, options: &LoadMonitorOptions) -> bool {
        self.cpu_ratio >= options.max_cpu_ratio
    }

    pub(crate) fn is_memory_overloaded(&self, options: &LoadMonitorOptions) -> bool {
        self.mem_ratio >= options.max_memory_ratio
    }

    pub(crate) fn is_scheduler_overloaded(&self, options: &LoadMonitorOptions) -> bool {
        self.scheduler_delay >= options.max_scheduler_delay
    }

    /// A sample is overloaded when any resource crossed its threshold.
    pub(crate) fn is_overloaded(&self, options: &LoadMonitorOptions) -> bool {
        self.is_cpu_overloaded(options)
            || self.is_memory_overloaded(options)
            || self.is_scheduler_overloaded(options)
    }
}

/// Aggregated verdict over one sample (current) or a window of samples
/// (historical).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SystemStatus {
    pub is_system_idle: bool,
    /// Fraction of inspected samples where CPU was overloaded.
    pub cpu_overloaded_ratio: f64,
    /// Fraction of inspected samples where memory was overloaded.
    pub mem_overloaded_ratio: f64,
    /// Fraction of inspected samples where the scheduler lagged.
    pub scheduler_overloaded_ratio: f64,
}

impl SystemStatus {
    /// Status reported before any sample exists.
    pub(crate) const IDLE: Self = Self {
        is_system_idle: true,
        cpu_overloaded_ratio: 0.0,
        mem_overloaded_ratio: 0.0,
        scheduler_overloaded_ratio: 0.0,
    };
}

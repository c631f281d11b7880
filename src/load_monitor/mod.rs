//! System load monitoring for the autoscaling signal
//!
//! A background sampler measures CPU utilisation, memory pressure, and
//! scheduler latency on a fixed interval and keeps a sliding window of
//! samples. Two verdicts are derived: the *current* status reflects
//! only the newest sample and gates spawning an additional task right
//! now; the *historical* status reflects the fraction of overloaded
//! samples across the window and drives the slower desired-concurrency
//! adjustments.

mod sample;

pub use sample::{LoadSample, SystemStatus};

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::debug;
use parking_lot::Mutex;
use sysinfo::System;
use tokio::task::JoinHandle;

/// Tuning options for a [`LoadMonitor`].
#[derive(Debug, Clone)]
pub struct LoadMonitorOptions {
    /// Interval between samples.
    pub sample_interval: Duration,
    /// Length of the sliding window the historical verdict covers.
    pub window: Duration,
    /// Scheduler delay above which a sample counts as overloaded.
    pub max_scheduler_delay: Duration,
    /// Memory usage ratio above which a sample counts as overloaded.
    pub max_memory_ratio: f64,
    /// CPU utilisation ratio above which a sample counts as overloaded.
    pub max_cpu_ratio: f64,
    /// Window fraction of CPU-overloaded samples tolerated before the
    /// historical verdict flips to overloaded.
    pub max_cpu_overloaded_ratio: f64,
    /// Same, for memory.
    pub max_mem_overloaded_ratio: f64,
    /// Same, for scheduler latency.
    pub max_scheduler_overloaded_ratio: f64,
}

impl Default for LoadMonitorOptions {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(1),
            window: Duration::from_secs(60),
            max_scheduler_delay: Duration::from_millis(100),
            max_memory_ratio: 0.9,
            max_cpu_ratio: 0.95,
            max_cpu_overloaded_ratio: 0.4,
            max_mem_overloaded_ratio: 0.2,
            max_scheduler_overloaded_ratio: 0.7,
        }
    }
}

/// Sliding-window system load monitor.
#[derive(Debug)]
pub struct LoadMonitor {
    options: LoadMonitorOptions,
    /// Shared with the sampler task, which outlives any `&self` borrow.
    samples: Arc<Mutex<VecDeque<LoadSample>>>,
    sampler_task: Mutex<Option<JoinHandle<()>>>,
}

impl LoadMonitor {
    #[must_use]
    pub fn new(options: LoadMonitorOptions) -> Self {
        Self {
            options,
            samples: Arc::new(Mutex::new(VecDeque::new())),
            sampler_task: Mutex::new(None),
        }
    }

    /// Start the background sampler. Idempotent.
    pub fn start(&self) {
        let mut slot = self.sampler_task.lock();
        if slot.is_some() {
            return;
        }

        let samples = Arc::clone(&self.samples);
        let options = self.options.clone();
        let interval = self.options.sample_interval;
        *slot = Some(tokio::spawn(async move {
            let mut system = System::new();
            loop {
                let slept_at = Instant::now();
                tokio::time::sleep(interval).await;
                // Anything beyond the requested interval is time the
                // scheduler made us wait.
                let scheduler_delay = slept_at.elapsed().saturating_sub(interval);

                system.refresh_cpu_usage();
                system.refresh_memory();
                let cpu_ratio = f64::from(system.global_cpu_usage()) / 100.0;
                let total = system.total_memory();
                let mem_ratio = if total == 0 {
                    0.0
                } else {
                    system.used_memory() as f64 / total as f64
                };

                Self::record(
                    &samples,
                    &options,
                    LoadSample {
                        at: Instant::now(),
                        cpu_ratio,
                        mem_ratio,
                        scheduler_delay,
                    },
                );
            }
        }));
    }

    /// Stop the background sampler. Recorded samples remain readable.
    pub fn stop(&self) {
        if let Some(task) = self.sampler_task.lock().take() {
            task.abort();
        }
    }

    fn record(samples: &Mutex<VecDeque<LoadSample>>, options: &LoadMonitorOptions, sample: LoadSample) {
        let mut samples = samples.lock();
        samples.push_back(sample);
        while let Some(front) = samples.front() {
            if front.at.elapsed() > options.window {
                samples.pop_front();
            } else {
                break;
            }
        }
        if sample.is_overloaded(options) {
            debug!(
                "System overloaded: cpu {:.2}, mem {:.2}, scheduler delay {:?}",
                sample.cpu_ratio, sample.mem_ratio, sample.scheduler_delay
            );
        }
    }

    pub(crate) fn record_sample(&self, sample: LoadSample) {
        Self::record(&self.samples, &self.options, sample);
    }

    /// Verdict from the most recent sample alone. Idle until the first
    /// sample lands.
    #[must_use]
    pub fn current_status(&self) -> SystemStatus {
        let samples = self.samples.lock();
        let Some(newest) = samples.back() else {
            return SystemStatus::IDLE;
        };
        let cpu = u8::from(newest.is_cpu_overloaded(&self.options));
        let mem = u8::from(newest.is_memory_overloaded(&self.options));
        let sched = u8::from(newest.is_scheduler_overloaded(&self.options));
        SystemStatus {
            is_system_idle: cpu + mem + sched == 0,
            cpu_overloaded_ratio: f64::from(cpu),
            mem_overloaded_ratio: f64::from(mem),
            scheduler_overloaded_ratio: f64::from(sched),
        }
    }

    /// Verdict over the whole sliding window: the fraction of
    /// overloaded samples per resource compared against the configured
    /// tolerated ratios.
    #[must_use]
    pub fn historical_status(&self) -> SystemStatus {
        let samples = self.samples.lock();
        if samples.is_empty() {
            return SystemStatus::IDLE;
        }

        let len = samples.len() as f64;
        let mut cpu = 0usize;
        let mut mem = 0usize;
        let mut sched = 0usize;
        for sample in samples.iter() {
            cpu += usize::from(sample.is_cpu_overloaded(&self.options));
            mem += usize::from(sample.is_memory_overloaded(&self.options));
            sched += usize::from(sample.is_scheduler_overloaded(&self.options));
        }

        let cpu_ratio = cpu as f64 / len;
        let mem_ratio = mem as f64 / len;
        let sched_ratio = sched as f64 / len;
        SystemStatus {
            is_system_idle: cpu_ratio <= self.options.max_cpu_overloaded_ratio
                && mem_ratio <= self.options.max_mem_overloaded_ratio
                && sched_ratio <= self.options.max_scheduler_overloaded_ratio,
            cpu_overloaded_ratio: cpu_ratio,
            mem_overloaded_ratio: mem_ratio,
            scheduler_overloaded_ratio: sched_ratio,
        }
    }

    /// Number of samples currently in the window.
    #[must_use]
    pub fn sample_count(&self) -> usize {
        self.samples.lock().len()
    }
}

impl Default for LoadMonitor {
    fn default() -> Self {
        Self::new(LoadMonitorOptions::default())
    }
}

impl Drop for LoadMonitor {
    fn drop(&mut self) {
        if let Some(task) = self.sampler_task.lock().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idle_sample() -> LoadSample {
        LoadSample {
            at: Instant::now(),
            cpu_ratio: 0.1,
            mem_ratio: 0.2,
            scheduler_delay: Duration::from_millis(1),
        }
    }

    fn overloaded_sample() -> LoadSample {
        LoadSample {
            at: Instant::now(),
            cpu_ratio: 0.99,
            mem_ratio: 0.95,
            scheduler_delay: Duration::from_millis(500),
        }
    }

    #[test]
    fn idle_before_first_sample() {
        let monitor = LoadMonitor::default();
        assert!(monitor.current_status().is_system_idle);
        assert!(monitor.historical_status().is_system_idle);
    }

    #[test]
    fn current_status_tracks_newest_sample() {
        let monitor = LoadMonitor::default();
        monitor.record_sample(overloaded_sample());
        assert!(!monitor.current_status().is_system_idle);
        monitor.record_sample(idle_sample());
        assert!(monitor.current_status().is_system_idle);
    }

    #[test]
    fn historical_status_uses_window_fractions() {
        let monitor = LoadMonitor::default();
        // One overloaded out of ten: under every tolerated ratio.
        monitor.record_sample(overloaded_sample());
        for _ in 0..9 {
            monitor.record_sample(idle_sample());
        }
        let status = monitor.historical_status();
        assert!(status.is_system_idle);
        assert!((status.cpu_overloaded_ratio - 0.1).abs() < 1e-9);

        // Majority overloaded flips the verdict.
        for _ in 0..20 {
            monitor.record_sample(overloaded_sample());
        }
        assert!(!monitor.historical_status().is_system_idle);
    }

    #[tokio::test]
    async fn sampler_produces_samples() {
        let monitor = Arc::new(LoadMonitor::new(LoadMonitorOptions {
            sample_interval: Duration::from_millis(20),
            ..LoadMonitorOptions::default()
        }));
        monitor.start();
        tokio::time::sleep(Duration::from_millis(150)).await;
        monitor.stop();
        assert!(monitor.sample_count() > 0);
    }
}

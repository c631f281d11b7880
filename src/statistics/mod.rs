//! Crawl run statistics
//!
//! Tracks per-request lifetimes, the retry histogram, and
//! success/failure totals. The collector is cheap to update from every
//! worker (short lock on a plain map) and can periodically checkpoint
//! itself through the key-value store so a migrated process resumes
//! its counters instead of starting from zero.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::storage::{KeyValueStore, STATISTICS_STATE_KEY, StorageError, get_json, set_json};

/// Tuning options for [`Statistics`].
#[derive(Debug, Clone)]
pub struct StatisticsOptions {
    /// How often the periodic checkpoint task writes state.
    pub persist_interval: Duration,
    /// Store key the snapshot is written under.
    pub persist_state_key: String,
}

impl Default for StatisticsOptions {
    fn default() -> Self {
        Self {
            persist_interval: Duration::from_secs(60),
            persist_state_key: STATISTICS_STATE_KEY.to_string(),
        }
    }
}

/// Persisted snapshot of the collector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StatisticsState {
    pub requests_finished: u64,
    pub requests_failed: u64,
    /// Index k counts requests that reached their final outcome with
    /// `retry_count == k`.
    pub request_retry_histogram: Vec<u64>,
    pub request_total_duration_millis: u64,
    pub request_min_duration_millis: Option<u64>,
    pub request_max_duration_millis: Option<u64>,
    pub crawler_started_at: Option<DateTime<Utc>>,
}

impl StatisticsState {
    /// Mean duration of finished requests, if any finished.
    #[must_use]
    pub fn mean_duration_millis(&self) -> Option<f64> {
        if self.requests_finished == 0 {
            None
        } else {
            Some(self.request_total_duration_millis as f64 / self.requests_finished as f64)
        }
    }
}

/// Accumulates request outcomes for one crawler run.
pub struct Statistics {
    /// Shared with the periodic persist task, which outlives any
    /// `&self` borrow.
    state: Arc<Mutex<StatisticsState>>,
    in_progress: Mutex<HashMap<String, Instant>>,
    store: Option<Arc<dyn KeyValueStore>>,
    options: StatisticsOptions,
    persist_task: Mutex<Option<JoinHandle<()>>>,
}

impl Statistics {
    #[must_use]
    pub fn new(store: Option<Arc<dyn KeyValueStore>>, options: StatisticsOptions) -> Self {
        Self {
            state: Arc::new(Mutex::new(StatisticsState::default())),
            in_progress: Mutex::new(HashMap::new()),
            store,
            options,
            persist_task: Mutex::new(None),
        }
    }

    /// Load a previously persisted snapshot, if a store is configured,
    /// and stamp the run start.
    pub async fn initialize(&self) -> Result<(), StorageError> {
        if let Some(store) = &self.store
            && let Some(persisted) =
                get_json::<StatisticsState>(store.as_ref(), &self.options.persist_state_key).await?
        {
            info!(
                "Restored statistics: {} finished / {} failed so far",
                persisted.requests_finished, persisted.requests_failed
            );
            *self.state.lock() = persisted;
        }

        let mut state = self.state.lock();
        if state.crawler_started_at.is_none() {
            state.crawler_started_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Record that the attempt identified by `id` has started.
    pub fn start_job(&self, id: &str) {
        self.in_progress.lock().insert(id.to_string(), Instant::now());
    }

    /// Record a successful final outcome for `id`.
    pub fn finish_job(&self, id: &str, retry_count: u32) {
        let started = self.in_progress.lock().remove(id);
        let mut state = self.state.lock();
        state.requests_finished += 1;
        bump_histogram(&mut state.request_retry_histogram, retry_count);

        if let Some(started) = started {
            let millis = started.elapsed().as_millis() as u64;
            state.request_total_duration_millis += millis;
            state.request_min_duration_millis = Some(match state.request_min_duration_millis {
                Some(min) => min.min(millis),
                None => millis,
            });
            state.request_max_duration_millis = Some(match state.request_max_duration_millis {
                Some(max) => max.max(millis),
                None => millis,
            });
        }
    }

    /// Record a failed final outcome for `id` (retries exhausted or
    /// suppressed).
    pub fn fail_job(&self, id: &str, retry_count: u32) {
        self.in_progress.lock().remove(id);
        let mut state = self.state.lock();
        state.requests_failed += 1;
        bump_histogram(&mut state.request_retry_histogram, retry_count);
    }

    /// Snapshot of the current totals.
    #[must_use]
    pub fn state(&self) -> StatisticsState {
        self.state.lock().clone()
    }

    #[must_use]
    pub fn requests_finished(&self) -> u64 {
        self.state.lock().requests_finished
    }

    #[must_use]
    pub fn requests_failed(&self) -> u64 {
        self.state.lock().requests_failed
    }

    /// Write the snapshot through the key-value store. A collector
    /// without a store is a no-op.
    pub async fn persist(&self) -> Result<(), StorageError> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let snapshot = self.state();
        set_json(store.as_ref(), &self.options.persist_state_key, &snapshot).await
    }

    /// Start the periodic checkpoint task. Idempotent; a second call
    /// replaces nothing.
    pub fn start_periodic_persist(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let mut slot = self.persist_task.lock();
        if slot.is_some() {
            return;
        }

        let state = Arc::clone(&self.state);
        let store = Arc::clone(store);
        let key = self.options.persist_state_key.clone();
        let interval = self.options.persist_interval;
        *slot = Some(tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            timer.tick().await; // first tick fires immediately
            loop {
                timer.tick().await;
                let snapshot = state.lock().clone();
                if let Err(e) = set_json(store.as_ref(), &key, &snapshot).await {
                    warn!("Periodic statistics persist failed: {e}");
                }
            }
        }));
    }

    /// Stop the periodic checkpoint task.
    pub fn stop_periodic_persist(&self) {
        if let Some(task) = self.persist_task.lock().take() {
            task.abort();
        }
    }

    /// Emit the final summary line. Called by the crawler before
    /// `run()` returns, regardless of outcome.
    pub fn log_summary(&self) {
        let state = self.state();
        let mean = state
            .mean_duration_millis()
            .map_or_else(|| "n/a".to_string(), |m| format!("{m:.0} ms"));
        info!(
            "Crawl statistics: {} finished, {} failed, mean duration {}, retry histogram {:?}",
            state.requests_finished, state.requests_failed, mean, state.request_retry_histogram
        );
    }
}

fn bump_histogram(histogram: &mut Vec<u64>, retry_count: u32) {
    let index = retry_count as usize;
    if histogram.len() <= index {
        histogram.resize(index + 1, 0);
    }
    histogram[index] += 1;
}

impl Drop for Statistics {
    fn drop(&mut self) {
        if let Some(task) = self.persist_task.lock().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryKeyValueStore;

    #[tokio::test]
    async fn accumulates_outcomes() {
        let stats = Statistics::new(None, StatisticsOptions::default());
        stats.start_job("a");
        stats.finish_job("a", 0);
        stats.start_job("b");
        stats.fail_job("b", 2);

        let state = stats.state();
        assert_eq!(state.requests_finished, 1);
        assert_eq!(state.requests_failed, 1);
        assert_eq!(state.request_retry_histogram, vec![1, 0, 1]);
        assert!(state.mean_duration_millis().is_some());
    }

    #[tokio::test]
    async fn histogram_grows_sparsely() {
        let stats = Statistics::new(None, StatisticsOptions::default());
        stats.start_job("a");
        stats.finish_job("a", 4);
        assert_eq!(stats.state().request_retry_histogram, vec![0, 0, 0, 0, 1]);
    }

    #[tokio::test]
    async fn persists_and_restores() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryKeyValueStore::new());

        let stats = Statistics::new(Some(Arc::clone(&store)), StatisticsOptions::default());
        stats.initialize().await.expect("initialize");
        stats.start_job("a");
        stats.finish_job("a", 1);
        stats.persist().await.expect("persist");

        let restored = Statistics::new(Some(store), StatisticsOptions::default());
        restored.initialize().await.expect("initialize");
        let state = restored.state();
        assert_eq!(state.requests_finished, 1);
        assert_eq!(state.request_retry_histogram, vec![0, 1]);
        assert!(state.crawler_started_at.is_some());
    }

    #[tokio::test]
    async fn finish_without_start_still_counts() {
        let stats = Statistics::new(None, StatisticsOptions::default());
        stats.finish_job("ghost", 0);
        let state = stats.state();
        assert_eq!(state.requests_finished, 1);
        // No duration was recorded for the unknown job.
        assert_eq!(state.request_total_duration_millis, 0);
        assert!(state.request_min_duration_millis.is_none());
    }
}

use crate::cache::StatsCache;
use crate::error::{Result, StatsError};
use crate::quota::QuotaMonitor;
use common::{PeriodicTask, TaskExecutor};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const CACHE_TASK: &str = "cache-cycle";
const WRITE_TASK: &str = "write-cycle";
const FORCE_TASK: &str = "force-update";

/// Clears the in-flight flag however the forced run ends.
struct ForceGuard(Arc<AtomicBool>);

impl Drop for ForceGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Drives the periodic cache and write cycles plus forced one-off runs.
pub struct StatsScheduler {
    executor: TaskExecutor,
    cache: Arc<StatsCache>,
    monitor: Arc<QuotaMonitor>,
    write_interval: Duration,
    cache_task: Mutex<Option<PeriodicTask>>,
    write_task: Mutex<Option<PeriodicTask>>,
    forcing: Arc<AtomicBool>,
}

impl StatsScheduler {
    pub fn new(
        executor: TaskExecutor,
        cache: Arc<StatsCache>,
        monitor: Arc<QuotaMonitor>,
        write_interval: Duration,
    ) -> Self {
        Self {
            executor,
            cache,
            monitor,
            write_interval,
            cache_task: Mutex::new(None),
            write_task: Mutex::new(None),
            forcing: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn start(&self, cache_interval: Duration) {
        self.set_cache_interval(cache_interval);

        let cache = self.cache.clone();
        let task = self
            .executor
            .spawn_periodic(WRITE_TASK, self.write_interval, move || {
                let cache = cache.clone();
                async move {
                    if let Err(e) = cache.write_cycle(false).await {
                        warn!("scheduled write failed: {}", e);
                    }
                }
            });
        if let Some(old) = self.write_task.lock().replace(task) {
            old.cancel();
        }
        info!(
            cache_secs = cache_interval.as_secs(),
            write_secs = self.write_interval.as_secs(),
            "stats scheduler started"
        );
    }

    /// Replaces the periodic cache task with one running every `interval`.
    pub fn set_cache_interval(&self, interval: Duration) {
        let cache = self.cache.clone();
        let monitor = self.monitor.clone();
        let task = self.executor.spawn_periodic(CACHE_TASK, interval, move || {
            let cache = cache.clone();
            let monitor = monitor.clone();
            async move {
                cache.cache_cycle().await;
                monitor.evaluate_all().await;
            }
        });
        if let Some(old) = self.cache_task.lock().replace(task) {
            debug!(task = old.name(), "replacing periodic task");
            old.cancel();
        }
    }

    pub fn is_running(&self) -> bool {
        self.cache_task.lock().as_ref().is_some_and(|t| !t.is_finished())
    }

    pub fn is_forcing(&self) -> bool {
        self.forcing.load(Ordering::SeqCst)
    }

    /// Runs a cache cycle and a forced write on a background task.
    ///
    /// Returns None when a forced update is already in flight.
    pub fn force_update(&self) -> Option<JoinHandle<Result<usize>>> {
        if self.forcing.swap(true, Ordering::SeqCst) {
            debug!("forced update already in flight");
            return None;
        }
        let guard = ForceGuard(self.forcing.clone());
        let cache = self.cache.clone();
        let monitor = self.monitor.clone();
        Some(self.executor.spawn(FORCE_TASK, async move {
            let _guard = guard;
            cache.cache_cycle().await;
            monitor.evaluate_all().await;
            let written = cache.write_cycle(true).await;
            cache.reload_iface_idents().await;
            written
        }))
    }

    /// Forced update the caller waits on.
    pub async fn force_update_and_wait(&self) -> Result<usize> {
        let handle = self
            .force_update()
            .ok_or_else(|| StatsError::state("forced update already in flight"))?;
        TaskExecutor::join(FORCE_TASK, handle).await?
    }

    /// Stops both periodic tasks, waiting for a cycle already running to
    /// finish so rows it took are written or restored.
    pub async fn stop(&self) {
        let tasks = [self.cache_task.lock().take(), self.write_task.lock().take()];
        for task in tasks.into_iter().flatten() {
            let name = task.name().to_string();
            if let Err(e) = task.stop().await {
                warn!(task = %name, "periodic task ended abnormally: {}", e);
            }
        }
        info!("stats scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accumulator::Dimension;
    use crate::callbacks::StatsCallbackManager;
    use crate::classifier::UidFlagClassifier;
    use crate::persistence::StatsTable;
    use crate::quota::QuotaTracker;
    use crate::testing::{Harness, sample};

    fn scheduler(harness: &Harness) -> (StatsScheduler, Arc<StatsCache>) {
        scheduler_with(harness, Duration::from_secs(3600))
    }

    fn scheduler_with(harness: &Harness, write_interval: Duration) -> (StatsScheduler, Arc<StatsCache>) {
        let tracker = Arc::new(QuotaTracker::new());
        let cache = Arc::new(StatsCache::new(
            &harness.config,
            &harness.ports(),
            Arc::new(UidFlagClassifier::new(harness.config.classifier.clone())),
            tracker.clone(),
            Arc::new(StatsCallbackManager::new()),
        ));
        let monitor = Arc::new(QuotaMonitor::new(tracker, cache.clone(), &harness.ports()));
        let executor = TaskExecutor::current().unwrap();
        let scheduler = StatsScheduler::new(executor, cache.clone(), monitor, write_interval);
        (scheduler, cache)
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_cycles_sample_then_flush() {
        let harness = Harness::new();
        let (scheduler, cache) = scheduler(&harness);
        harness.sampler.set_uid_stats(vec![sample(1000, "wlan0", "", 100, 50)]);
        scheduler.start(Duration::from_secs(60));
        assert!(scheduler.is_running());

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(cache.pending_rows(Dimension::PerUid).await.len(), 1);
        assert!(harness.gateway.rows(StatsTable::Uid).is_empty());

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(harness.gateway.rows(StatsTable::Uid).len(), 1);

        scheduler.stop().await;
        assert!(!scheduler.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_waits_for_a_flush_in_flight() {
        let harness = Harness::new();
        let (scheduler, cache) = scheduler_with(&harness, Duration::from_secs(90));
        harness.gateway.set_write_delay(Duration::from_millis(200));
        harness.sampler.set_uid_stats(vec![sample(1000, "wlan0", "", 100, 50)]);
        scheduler.start(Duration::from_secs(60));

        // The scheduled write starts at 90s and is still inside write_rows.
        tokio::time::sleep(Duration::from_millis(90_100)).await;
        assert!(harness.gateway.rows(StatsTable::Uid).is_empty());
        scheduler.stop().await;

        cache.cache_cycle().await;
        cache.write_cycle(true).await.unwrap();
        let rows = harness.gateway.rows(StatsTable::Uid);
        assert_eq!(rows.len(), 1);
        assert_eq!((rows[0].rx_bytes, rows[0].tx_bytes), (100, 50));
        assert!(cache.pending_rows(Dimension::PerUid).await.is_empty());
    }

    #[tokio::test]
    async fn forced_update_writes_everything_now() {
        let mut harness = Harness::new();
        harness.config.flush_threshold_bytes = u64::MAX;
        let (scheduler, _cache) = scheduler(&harness);
        harness.sampler.set_uid_stats(vec![sample(1000, "wlan0", "", 100, 50)]);

        assert_eq!(scheduler.force_update_and_wait().await.unwrap(), 1);
        assert!(!scheduler.is_forcing());
        assert_eq!(harness.gateway.backup_count(), 1);
    }

    #[tokio::test]
    async fn second_forced_update_is_refused_while_one_runs() {
        let harness = Harness::new();
        let (scheduler, _cache) = scheduler(&harness);
        let first = scheduler.force_update().unwrap();
        assert!(scheduler.force_update().is_none());
        TaskExecutor::join(FORCE_TASK, first).await.unwrap().unwrap();
        assert!(scheduler.force_update().is_some());
    }
}

use crate::accumulator::{Dimension, StatsAccumulator};
use crate::callbacks::{ChangeSet, StatsCallbackManager};
use crate::classifier::UidFlagClassifier;
use crate::config::StatsConfig;
use crate::delta::compute_delta;
use crate::error::Result;
use crate::model::{ClassificationFlag, CompositeKey, LOOPBACK_IFACE, TrafficSample};
use crate::persistence::{PersistenceGateway, RowFilter, StatsTable};
use crate::ports::{BundleInfoSource, Clock, CounterSampler, Ports};
use crate::quota::QuotaTracker;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

/// Accumulator dimensions that are flushed, with their target tables.
const FLUSH_PLAN: [(Dimension, StatsTable); 3] = [
    (Dimension::PerUid, StatsTable::Uid),
    (Dimension::PerUidSim, StatsTable::UidSim),
    (Dimension::PerInterface, StatsTable::Iface),
];

type Baselines = HashMap<CompositeKey, TrafficSample>;

#[derive(Default)]
struct CacheState {
    accumulator: StatsAccumulator,
    last_uid: Baselines,
    last_uid_sim: Baselines,
    last_iface: Baselines,
}

fn delta_against(baselines: &Baselines, current: &TrafficSample, now: u64) -> TrafficSample {
    let previous = baselines.get(&current.key());
    let mut delta = compute_delta(current, previous.map(std::slice::from_ref).unwrap_or(&[]), now);
    delta.date = now;
    delta
}

/// Streams missing from this read keep their old baseline.
fn rebase(baselines: &mut Baselines, current: Vec<TrafficSample>) {
    for sample in current {
        baselines.insert(sample.key(), sample);
    }
}

fn add_usage(usage: &mut HashMap<String, u64>, sample: &TrafficSample) {
    let entry = usage.entry(sample.ident.clone()).or_default();
    *entry = entry.saturating_add(sample.total_bytes());
}

/// The in-memory traffic cache: samples kernel counters into deltas and
/// flushes them to the row store.
///
/// One async lock guards the accumulator and every delta baseline, and it is
/// held across a flush so snapshot, write and reset never interleave with a push.
pub struct StatsCache {
    state: Mutex<CacheState>,
    sampler: Arc<dyn CounterSampler>,
    bundles: Arc<dyn BundleInfoSource>,
    gateway: Arc<dyn PersistenceGateway>,
    clock: Arc<dyn Clock>,
    classifier: Arc<UidFlagClassifier>,
    quota: Arc<QuotaTracker>,
    callbacks: Arc<StatsCallbackManager>,
    configured_idents: HashMap<String, String>,
    iface_idents: RwLock<HashMap<String, String>>,
    classification_degraded: AtomicBool,
    flush_threshold: u64,
    retention_secs: u64,
    database_path: PathBuf,
    backup_path: PathBuf,
}

impl StatsCache {
    pub fn new(
        config: &StatsConfig,
        ports: &Ports,
        classifier: Arc<UidFlagClassifier>,
        quota: Arc<QuotaTracker>,
        callbacks: Arc<StatsCallbackManager>,
    ) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            sampler: ports.sampler.clone(),
            bundles: ports.bundles.clone(),
            gateway: ports.gateway.clone(),
            clock: ports.clock.clone(),
            classifier,
            quota,
            callbacks,
            configured_idents: config.counters.iface_idents.clone(),
            iface_idents: RwLock::new(config.counters.iface_idents.clone()),
            classification_degraded: AtomicBool::new(false),
            flush_threshold: config.flush_threshold_bytes,
            retention_secs: config.retention_secs(),
            database_path: PathBuf::from(&config.database_path),
            backup_path: PathBuf::from(&config.backup_database_path),
        }
    }

    async fn read<F>(dimension: &str, read: F) -> Option<Vec<TrafficSample>>
    where
        F: Future<Output = Result<Vec<TrafficSample>>>,
    {
        match read.await {
            Ok(samples) => Some(samples),
            Err(e) => {
                warn!(dimension, "counter read failed, dimension skipped this cycle: {}", e);
                None
            }
        }
    }

    /// Reads one uid dimension and fills in the carrier ident of rows whose
    /// sampler left it empty.
    async fn read_stamped<F>(&self, dimension: &str, read: F) -> Option<Vec<TrafficSample>>
    where
        F: Future<Output = Result<Vec<TrafficSample>>>,
    {
        let mut samples = Self::read(dimension, read).await?;
        let idents = self.iface_idents.read();
        for sample in samples.iter_mut().filter(|s| s.ident.is_empty()) {
            if let Some(ident) = idents.get(&sample.iface) {
                sample.ident = ident.clone();
            }
        }
        Some(samples)
    }

    /// Re-runs batch classification from the bundle source.
    ///
    /// On failure, uids without a cached flag are billed as Default until a
    /// later refresh succeeds.
    pub async fn refresh_classification(&self) -> bool {
        match self.bundles.bundles().await {
            Ok(bundles) => {
                self.classifier.classify_batch(&bundles);
                self.classification_degraded.store(false, Ordering::SeqCst);
                true
            }
            Err(e) => {
                warn!("bundle metadata unavailable, classifying as default: {}", e);
                self.classification_degraded.store(true, Ordering::SeqCst);
                false
            }
        }
    }

    pub fn classification_degraded(&self) -> bool {
        self.classification_degraded.load(Ordering::SeqCst)
    }

    /// One cache cycle: billing rollover first, then the uid, pushed,
    /// uid-SIM and interface dimensions.
    #[instrument(skip(self))]
    pub async fn cache_cycle(&self) {
        let now = self.clock.now();
        let now_secs = now.timestamp().max(0) as u64;
        let rolled = self.quota.roll_over_expired(&now);
        if !rolled.is_empty() {
            debug!(?rolled, "cycles rolled before accumulation");
        }
        if self.classification_degraded() {
            self.refresh_classification().await;
        }

        let mut changes = ChangeSet::default();
        let mut usage = HashMap::new();
        {
            // Counters are read under the lock so a slower read can never
            // land on top of a newer baseline.
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let uid_stats = self.read_stamped("uid", self.sampler.uid_stats()).await;
            let uid_sim_stats = self.read_stamped("uid_sim", self.sampler.uid_sim_stats()).await;
            let iface_stats = Self::read("iface", self.sampler.iface_stats()).await;
            let degraded = self.classification_degraded();

            if let Some(samples) = uid_stats {
                for current in samples.iter().filter(|s| s.iface != LOOPBACK_IFACE) {
                    let mut delta = delta_against(&state.last_uid, current, now_secs);
                    if delta.has_no_data() {
                        continue;
                    }
                    if self.classifier.cached(delta.uid) == Some(ClassificationFlag::Uninstalled) {
                        delta.flag = ClassificationFlag::Uninstalled;
                    }
                    add_usage(&mut usage, &delta);
                    changes.uid(&delta.iface, delta.uid);
                    state.accumulator.push(Dimension::PerUid, delta);
                }
                rebase(&mut state.last_uid, samples);
            }

            for pushed in state.accumulator.snapshot_and_reset(Dimension::PushedByApp) {
                add_usage(&mut usage, &pushed);
                changes.uid(&pushed.iface, pushed.uid);
                state.accumulator.push(Dimension::PerUid, pushed.clone());
                state.accumulator.push(Dimension::PushedAll, pushed);
            }

            if let Some(samples) = uid_sim_stats {
                for current in samples.iter().filter(|s| s.iface != LOOPBACK_IFACE) {
                    let mut delta = delta_against(&state.last_uid_sim, current, now_secs);
                    if delta.has_no_data() {
                        continue;
                    }
                    delta.flag = if degraded {
                        self.classifier.cached(delta.uid).unwrap_or_default()
                    } else {
                        self.classifier.classify(delta.uid)
                    };
                    state.accumulator.push(Dimension::PerUidSim, delta);
                }
                rebase(&mut state.last_uid_sim, samples);
            }

            if let Some(samples) = iface_stats {
                for current in samples.iter().filter(|s| s.iface != LOOPBACK_IFACE) {
                    let delta = delta_against(&state.last_iface, current, now_secs);
                    if delta.has_no_data() {
                        continue;
                    }
                    changes.iface(&delta.iface);
                    state.accumulator.push(Dimension::PerInterface, delta);
                }
                rebase(&mut state.last_iface, samples);
            }
        }

        usage.remove("");
        self.quota.accumulate(&usage);
        self.callbacks.dispatch(&changes);
    }

    /// Flushes pending rows. Unless `forced`, a table is only written once its
    /// pending bytes reach the flush threshold. Returns the number of rows written.
    #[instrument(skip(self))]
    pub async fn write_cycle(&self, forced: bool) -> Result<usize> {
        let cutoff = self.clock.now_secs().saturating_sub(self.retention_secs);
        let mut written = 0;
        let mut failure = None;
        {
            let mut state = self.state.lock().await;
            for (dimension, table) in FLUSH_PLAN {
                if state.accumulator.is_empty(dimension) {
                    continue;
                }
                let pending = state.accumulator.pending_bytes(dimension);
                if !forced && pending < self.flush_threshold {
                    debug!(table = table.name(), pending, "below flush threshold");
                    continue;
                }

                let rows = state.accumulator.snapshot_and_reset(dimension);
                match self.gateway.write_rows(table, &rows).await {
                    Ok(()) => {
                        written += rows.len();
                        if dimension == Dimension::PerUid {
                            state.accumulator.snapshot_and_reset(Dimension::PushedAll);
                        }
                        if let Err(e) = self.gateway.delete_older_than(table, cutoff).await {
                            warn!(table = table.name(), "retention purge failed: {}", e);
                        }
                    }
                    Err(e) => {
                        error!(table = table.name(), rows = rows.len(), "flush failed, rows kept: {}", e);
                        state.accumulator.restore(dimension, rows);
                        failure = Some(e);
                    }
                }
            }
        }

        if written > 0 {
            info!(written, "cache flushed");
            if !self.gateway.backup(&self.database_path, &self.backup_path).await {
                warn!("backup after flush failed");
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(written),
        }
    }

    pub async fn backup(&self) -> bool {
        self.gateway.backup(&self.database_path, &self.backup_path).await
    }

    /// Runs a cache cycle, then writes only the rows of `uid` tagged
    /// Uninstalled and forgets the uid's baselines and pending rows.
    #[instrument(skip(self))]
    pub async fn archive_uid(&self, uid: u32) -> Result<()> {
        self.cache_cycle().await;

        let mut state = self.state.lock().await;
        let mut tagged = Vec::new();
        for (dimension, table) in [
            (Dimension::PerUid, StatsTable::Uid),
            (Dimension::PerUidSim, StatsTable::UidSim),
        ] {
            let rows: Vec<_> = state
                .accumulator
                .snapshot_and_reset_uid(dimension, uid)
                .into_iter()
                .map(|row| row.with_flag(ClassificationFlag::Uninstalled))
                .collect();
            tagged.push((dimension, table, rows));
        }

        let mut failed = None;
        for (at, (_, table, rows)) in tagged.iter().enumerate() {
            if rows.is_empty() {
                continue;
            }
            if let Err(e) = self.gateway.write_rows(*table, rows).await {
                error!(uid, table = table.name(), "archive write failed: {}", e);
                failed = Some((at, e));
                break;
            }
        }
        if let Some((at, e)) = failed {
            for (dimension, _, rows) in tagged.into_iter().skip(at) {
                state.accumulator.restore(dimension, rows);
            }
            return Err(e);
        }

        state.accumulator.remove_uid(uid);
        state.last_uid.retain(|key, _| key.uid != uid);
        state.last_uid_sim.retain(|key, _| key.uid != uid);
        info!(uid, "uid archived");
        Ok(())
    }

    /// Queues an app-reported sample; merged into the uid dimension next cycle.
    pub async fn push_app_stats(&self, sample: TrafficSample) {
        self.state.lock().await.accumulator.push(Dimension::PushedByApp, sample);
    }

    /// Accounts a shared-traffic delta straight into the uid dimension.
    pub async fn push_shared(&self, delta: TrafficSample) {
        let mut usage = HashMap::new();
        add_usage(&mut usage, &delta);
        let mut changes = ChangeSet::default();
        changes.uid(&delta.iface, delta.uid);
        self.state.lock().await.accumulator.push(Dimension::PerUid, delta);
        self.quota.accumulate(&usage);
        self.callbacks.dispatch(&changes);
    }

    pub async fn pending_rows(&self, dimension: Dimension) -> Vec<TrafficSample> {
        self.state.lock().await.accumulator.rows(dimension).to_vec()
    }

    /// Traffic the kernel has counted since the last cache cycle, without
    /// moving any baseline.
    pub async fn live_deltas(&self) -> Vec<TrafficSample> {
        let state = self.state.lock().await;
        let Some(samples) = self.read_stamped("uid", self.sampler.uid_stats()).await else {
            return Vec::new();
        };
        let now = self.clock.now_secs();
        samples
            .iter()
            .filter(|s| s.iface != LOOPBACK_IFACE)
            .map(|s| delta_against(&state.last_uid, s, now))
            .filter(|d| !d.has_no_data())
            .collect()
    }

    pub async fn live_bytes(&self, ident: &str) -> u64 {
        self.live_deltas()
            .await
            .iter()
            .filter(|d| d.ident == ident)
            .fold(0u64, |sum, d| sum.saturating_add(d.total_bytes()))
    }

    /// Persisted plus pending uid-dimension rows of one carrier ident in `[start, end]`.
    pub async fn network_rows(&self, ident: &str, start: u64, end: u64) -> Result<Vec<TrafficSample>> {
        let filter = RowFilter::range(start, end).ident(ident);
        let mut rows = self.gateway.query_rows(StatsTable::Uid, &filter).await?;
        let state = self.state.lock().await;
        for dimension in [Dimension::PerUid, Dimension::PushedByApp] {
            rows.extend(state.accumulator.rows(dimension).iter().filter(|r| filter.matches(r)).cloned());
        }
        Ok(rows)
    }

    pub async fn network_usage(&self, ident: &str, start: u64, end: u64) -> Result<u64> {
        let rows = self.network_rows(ident, start, end).await?;
        Ok(rows.iter().fold(0u64, |sum, r| sum.saturating_add(r.total_bytes())))
    }

    /// Persisted rows of `table` matching `filter`, followed by the matching pending rows.
    pub async fn rows(&self, table: StatsTable, filter: &RowFilter) -> Result<Vec<TrafficSample>> {
        let mut rows = self.gateway.query_rows(table, filter).await?;
        let dimension = match table {
            StatsTable::Uid => Dimension::PerUid,
            StatsTable::UidSim => Dimension::PerUidSim,
            StatsTable::Iface => Dimension::PerInterface,
        };
        let state = self.state.lock().await;
        rows.extend(state.accumulator.rows(dimension).iter().filter(|r| filter.matches(r)).cloned());
        Ok(rows)
    }

    /// Forgets the uid's baselines after its kernel counters were deleted.
    pub async fn forget_uid(&self, uid: u32) {
        let mut state = self.state.lock().await;
        state.accumulator.remove_uid(uid);
        state.last_uid.retain(|key, _| key.uid != uid);
        state.last_uid_sim.retain(|key, _| key.uid != uid);
    }

    /// Reloads the sampler's iface idents on top of the configured ones.
    pub async fn reload_iface_idents(&self) {
        match self.sampler.iface_idents().await {
            Ok(idents) => {
                let mut merged = self.configured_idents.clone();
                merged.extend(idents);
                debug!(count = merged.len(), "iface idents reloaded");
                *self.iface_idents.write() = merged;
            }
            Err(e) => warn!("iface ident reload failed: {}", e),
        }
    }

    pub fn ident_of(&self, iface: &str) -> String {
        self.iface_idents.read().get(iface).cloned().unwrap_or_default()
    }

    /// Drops every pending row and baseline.
    pub async fn reset(&self) {
        *self.state.lock().await = CacheState::default();
        info!("cache reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{StaticBundleSource, StaticCounterSampler};
    use crate::model::BundleInfo;
    use crate::persistence::MemoryGateway;
    use crate::ports::{ManualClock, StatsChangeListener};
    use crate::testing::{Harness, sample as uid_sample};

    struct Fixture {
        cache: StatsCache,
        sampler: Arc<StaticCounterSampler>,
        bundles: Arc<StaticBundleSource>,
        gateway: Arc<MemoryGateway>,
        quota: Arc<QuotaTracker>,
        classifier: Arc<UidFlagClassifier>,
        callbacks: Arc<StatsCallbackManager>,
        clock: Arc<ManualClock>,
    }

    fn fixture(flush_threshold_bytes: u64) -> Fixture {
        let mut harness = Harness::new();
        harness.config.flush_threshold_bytes = flush_threshold_bytes;
        fixture_from(harness)
    }

    fn fixture_from(harness: Harness) -> Fixture {
        let classifier = Arc::new(UidFlagClassifier::new(harness.config.classifier.clone()));
        let quota = Arc::new(QuotaTracker::new());
        let callbacks = Arc::new(StatsCallbackManager::new());
        let cache = StatsCache::new(
            &harness.config,
            &harness.ports(),
            classifier.clone(),
            quota.clone(),
            callbacks.clone(),
        );
        Fixture {
            cache,
            sampler: harness.sampler,
            bundles: harness.bundles,
            gateway: harness.gateway,
            quota,
            classifier,
            callbacks,
            clock: harness.clock,
        }
    }

    fn persisted_total(gateway: &MemoryGateway, table: StatsTable, uid: u32) -> (u64, u64) {
        gateway
            .rows(table)
            .iter()
            .filter(|r| r.uid == uid)
            .fold((0, 0), |(rx, tx), r| (rx + r.rx_bytes, tx + r.tx_bytes))
    }

    #[tokio::test]
    async fn only_deltas_are_persisted_across_flushes() {
        let f = fixture(0);
        f.sampler.set_uid_stats(vec![uid_sample(1000, "wlan0", "", 100, 50)]);
        f.cache.cache_cycle().await;
        assert_eq!(f.cache.write_cycle(true).await.unwrap(), 1);

        f.sampler.set_uid_stats(vec![uid_sample(1000, "wlan0", "", 150, 80)]);
        f.cache.cache_cycle().await;
        let pending = f.cache.pending_rows(Dimension::PerUid).await;
        assert_eq!((pending[0].rx_bytes, pending[0].tx_bytes), (50, 30));
        f.cache.write_cycle(true).await.unwrap();

        assert_eq!(persisted_total(&f.gateway, StatsTable::Uid, 1000), (150, 80));
        assert_eq!(f.gateway.backup_count(), 2);
    }

    #[tokio::test]
    async fn failed_flush_keeps_rows_for_the_next_write() {
        let f = fixture(0);
        f.sampler.set_uid_stats(vec![uid_sample(1000, "wlan0", "", 100, 50)]);
        f.cache.cache_cycle().await;

        f.gateway.set_fail_writes(true);
        assert!(f.cache.write_cycle(true).await.is_err());
        assert_eq!(f.cache.pending_rows(Dimension::PerUid).await.len(), 1);
        assert_eq!(f.gateway.backup_count(), 0);

        f.gateway.set_fail_writes(false);
        f.cache.write_cycle(true).await.unwrap();
        assert!(f.cache.pending_rows(Dimension::PerUid).await.is_empty());
        assert_eq!(persisted_total(&f.gateway, StatsTable::Uid, 1000), (100, 50));
    }

    #[tokio::test]
    async fn scheduled_write_waits_for_threshold() {
        let f = fixture(1_000);
        f.sampler.set_uid_stats(vec![uid_sample(1000, "wlan0", "", 100, 50)]);
        f.cache.cache_cycle().await;
        assert_eq!(f.cache.write_cycle(false).await.unwrap(), 0);

        f.sampler.set_uid_stats(vec![uid_sample(1000, "wlan0", "", 1_100, 50)]);
        f.cache.cache_cycle().await;
        assert_eq!(f.cache.write_cycle(false).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn loopback_is_never_accounted() {
        let f = fixture(0);
        f.sampler.set_uid_stats(vec![uid_sample(1000, LOOPBACK_IFACE, "", 100, 50)]);
        f.sampler.set_iface_stats(vec![uid_sample(0, LOOPBACK_IFACE, "", 100, 50)]);
        f.cache.cache_cycle().await;
        assert!(f.cache.pending_rows(Dimension::PerUid).await.is_empty());
        assert!(f.cache.pending_rows(Dimension::PerInterface).await.is_empty());
    }

    #[tokio::test]
    async fn cellular_usage_feeds_the_billing_ledger() {
        let f = fixture(0);
        let now = f.clock.now();
        f.quota.activate(1, "1", 0, &now);
        f.sampler.set_uid_stats(vec![
            uid_sample(1000, "rmnet0", "1", 300, 100),
            uid_sample(1001, "wlan0", "", 999, 999),
        ]);
        f.cache.cache_cycle().await;
        assert_eq!(f.quota.cycle(1).unwrap().accumulated_bytes, 400);

        f.cache
            .push_app_stats(uid_sample(1002, "rmnet0", "1", 50, 0))
            .await;
        f.cache.cache_cycle().await;
        assert_eq!(f.quota.cycle(1).unwrap().accumulated_bytes, 450);
        assert_eq!(f.cache.pending_rows(Dimension::PushedAll).await.len(), 1);
    }

    #[tokio::test]
    async fn uid_sim_rows_carry_classification() {
        let f = fixture(0);
        f.bundles.set_bundles(vec![BundleInfo {
            uid: 2000,
            package_name: "com.carrier.sim".into(),
            install_source: "preload".into(),
            install_time: 1,
        }]);
        assert!(f.cache.refresh_classification().await);
        f.sampler.set_uid_sim_stats(vec![uid_sample(3000, "rmnet0", "1", 10, 10)]);
        f.cache.cache_cycle().await;
        let rows = f.cache.pending_rows(Dimension::PerUidSim).await;
        assert_eq!(rows[0].flag, ClassificationFlag::Sim);
    }

    #[tokio::test]
    async fn unavailable_bundles_degrade_to_default() {
        let f = fixture(0);
        f.bundles.set_unavailable(true);
        assert!(!f.cache.refresh_classification().await);
        f.sampler.set_uid_sim_stats(vec![uid_sample(3000, "rmnet0", "1", 10, 10)]);
        f.cache.cache_cycle().await;

        let rows = f.cache.pending_rows(Dimension::PerUidSim).await;
        assert_eq!(rows[0].flag, ClassificationFlag::Default);
        assert_eq!(f.classifier.cached(3000), None);

        f.bundles.set_unavailable(false);
        f.cache.cache_cycle().await;
        assert!(!f.cache.classification_degraded());
    }

    #[tokio::test]
    async fn archive_writes_only_that_uid_as_uninstalled() {
        let f = fixture(u64::MAX);
        f.sampler.set_uid_stats(vec![
            uid_sample(1000, "wlan0", "", 100, 50),
            uid_sample(1001, "wlan0", "", 7, 7),
        ]);
        f.cache.cache_cycle().await;
        f.cache.archive_uid(1000).await.unwrap();

        let rows = f.gateway.rows(StatsTable::Uid);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].uid, 1000);
        assert_eq!(rows[0].flag, ClassificationFlag::Uninstalled);

        let pending = f.cache.pending_rows(Dimension::PerUid).await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].uid, 1001);
    }

    #[derive(Default)]
    struct Counter {
        calls: parking_lot::Mutex<usize>,
    }

    impl StatsChangeListener for Counter {
        fn on_iface_stats_changed(&self, _iface: &str) {
            *self.calls.lock() += 1;
        }

        fn on_uid_stats_changed(&self, _iface: &str, _uid: u32) {
            *self.calls.lock() += 1;
        }
    }

    #[tokio::test]
    async fn listeners_hear_about_changed_streams() {
        let f = fixture(0);
        let counter = Arc::new(Counter::default());
        f.callbacks.register(counter.clone());
        f.sampler.set_uid_stats(vec![uid_sample(1000, "wlan0", "", 1, 1)]);
        f.sampler.set_iface_stats(vec![uid_sample(0, "wlan0", "", 1, 1)]);
        f.cache.cache_cycle().await;
        assert_eq!(*counter.calls.lock(), 2);

        // Nothing moved, nothing to report.
        f.cache.cache_cycle().await;
        assert_eq!(*counter.calls.lock(), 2);
    }

    #[tokio::test]
    async fn configured_idents_tag_cellular_uid_rows() {
        let mut harness = Harness::new();
        harness
            .config
            .counters
            .iface_idents
            .insert("rmnet0".into(), "1".into());
        let f = fixture_from(harness);
        let now = f.clock.now();
        f.quota.activate(1, "1", 0, &now);

        f.sampler.set_uid_stats(vec![
            uid_sample(1000, "rmnet0", "", 300, 100),
            uid_sample(1001, "wlan0", "", 50, 50),
        ]);
        f.sampler.set_uid_sim_stats(vec![uid_sample(1000, "rmnet0", "", 300, 100)]);
        f.cache.cache_cycle().await;

        assert_eq!(f.quota.cycle(1).unwrap().accumulated_bytes, 400);
        let rows = f.cache.pending_rows(Dimension::PerUid).await;
        let cellular = rows.iter().find(|r| r.uid == 1000).unwrap();
        assert_eq!(cellular.ident, "1");
        let wifi = rows.iter().find(|r| r.uid == 1001).unwrap();
        assert_eq!(wifi.ident, "");
        assert_eq!(f.cache.pending_rows(Dimension::PerUidSim).await[0].ident, "1");

        // An empty sampler listing keeps the configured mapping.
        f.cache.reload_iface_idents().await;
        assert_eq!(f.cache.ident_of("rmnet0"), "1");
        f.sampler.set_uid_stats(vec![uid_sample(1000, "rmnet0", "", 400, 100)]);
        assert_eq!(f.cache.live_bytes("1").await, 100);
    }

    /// Hands out queued uid readings in call order, each after its delay.
    #[derive(Default)]
    struct QueuedSampler {
        uid: parking_lot::Mutex<std::collections::VecDeque<(std::time::Duration, TrafficSample)>>,
    }

    impl QueuedSampler {
        fn queue(&self, delay_ms: u64, sample: TrafficSample) {
            self.uid
                .lock()
                .push_back((std::time::Duration::from_millis(delay_ms), sample));
        }
    }

    #[async_trait::async_trait]
    impl CounterSampler for QueuedSampler {
        async fn uid_stats(&self) -> Result<Vec<TrafficSample>> {
            let next = self.uid.lock().pop_front();
            match next {
                Some((delay, sample)) => {
                    tokio::time::sleep(delay).await;
                    Ok(vec![sample])
                }
                None => Ok(Vec::new()),
            }
        }

        async fn uid_sim_stats(&self) -> Result<Vec<TrafficSample>> {
            Ok(Vec::new())
        }

        async fn iface_stats(&self) -> Result<Vec<TrafficSample>> {
            Ok(Vec::new())
        }

        async fn iface_idents(&self) -> Result<HashMap<String, String>> {
            Ok(HashMap::new())
        }

        async fn delete_uid_counters(&self, _uid: u32) -> Result<()> {
            Ok(())
        }

        async fn clear_all(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_cycles_account_each_byte_once() {
        let harness = Harness::new();
        let sampler = Arc::new(QueuedSampler::default());
        let mut ports = harness.ports();
        ports.sampler = sampler.clone();
        let quota = Arc::new(QuotaTracker::new());
        let cache = StatsCache::new(
            &harness.config,
            &ports,
            Arc::new(UidFlagClassifier::new(harness.config.classifier.clone())),
            quota.clone(),
            Arc::new(StatsCallbackManager::new()),
        );
        let now = harness.clock.now();
        quota.activate(1, "1", 0, &now);

        sampler.queue(0, uid_sample(1000, "rmnet0", "1", 900, 0));
        cache.cache_cycle().await;

        // The slow read is taken first; the fast one must not overtake it.
        sampler.queue(50, uid_sample(1000, "rmnet0", "1", 1000, 0));
        sampler.queue(0, uid_sample(1000, "rmnet0", "1", 1010, 0));
        tokio::join!(cache.cache_cycle(), cache.cache_cycle());

        let pending = cache.pending_rows(Dimension::PerUid).await;
        let accounted = pending.iter().fold(0, |sum, r| sum + r.total_bytes());
        assert_eq!(accounted, 1010);
        assert_eq!(quota.cycle(1).unwrap().accumulated_bytes, 1010);
    }
}

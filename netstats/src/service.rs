use crate::accumulator::Dimension;
use crate::cache::StatsCache;
use crate::callbacks::StatsCallbackManager;
use crate::classifier::UidFlagClassifier;
use crate::config::StatsConfig;
use crate::error::{Result, StatsError};
use crate::model::{
    ClassificationFlag, DAY_SECS, DEFAULT_ACCOUNT_UID, NetworkQuery, OTHER_ACCOUNT_UID, PushStatsInfo,
    SIM_UID, SIM2_UID, SharedTrafficInfo, TimeBucketedTotals, Totals, TrafficSample, UNINSTALLED_UID,
    is_synthetic_uid,
};
use crate::persistence::{RowFilter, StatsTable};
use crate::ports::{Ports, StatsChangeListener};
use crate::quota::{
    Availability, BillingCycle, QuotaMonitor, QuotaSettings, QuotaTracker, SettingChange, cycle_bounds,
};
use crate::scheduler::StatsScheduler;
use crate::sharing::SharedTrafficTracker;
use chrono::{DateTime, FixedOffset, NaiveDate};
use common::TaskExecutor;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Capabilities of whoever invokes a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    stats: bool,
}

impl Caller {
    pub fn trusted() -> Self {
        Self { stats: true }
    }

    pub fn anonymous() -> Self {
        Self { stats: false }
    }

    pub fn can_read_stats(&self) -> bool {
        self.stats
    }
}

/// OS account ids used to fold other accounts' traffic into account buckets.
#[derive(Debug, Clone, Copy, Default)]
struct UserIds {
    foreground: u32,
    default: u32,
    private: Option<u32>,
}

impl UserIds {
    fn merge_account(&self, row: &mut TrafficSample) {
        if is_synthetic_uid(row.uid) {
            return;
        }
        if self.foreground == self.default {
            if self.private == Some(row.user_id) {
                row.uid = OTHER_ACCOUNT_UID;
            }
        } else if self.private == Some(self.foreground) && row.user_id != self.foreground {
            row.uid = DEFAULT_ACCOUNT_UID;
        }
    }

    fn is_default_account(&self, user_id: u32) -> bool {
        user_id == self.default || user_id == 0
    }
}

fn sim_ident(sim_id: u32) -> String {
    sim_id.to_string()
}

fn check_range(start: u64, end: u64) -> Result<()> {
    if start > end {
        return Err(StatsError::validation(format!("start {start} is after end {end}")));
    }
    Ok(())
}

fn sum(rows: &[TrafficSample]) -> Totals {
    let mut totals = Totals::default();
    rows.iter().for_each(|r| totals.add_sample(r));
    totals
}

/// SIM-family uid-SIM rows re-keyed to the SIM buckets they are shown under.
fn sim_view(rows: Vec<TrafficSample>, display_separately: bool) -> impl Iterator<Item = TrafficSample> {
    rows.into_iter()
        .filter(|r| r.flag.is_sim_family())
        .map(move |mut r| {
            match (display_separately, r.flag) {
                (false, ClassificationFlag::Sim) | (true, ClassificationFlag::SimBasic) => r.uid = SIM_UID,
                (false, ClassificationFlag::Sim2) | (true, ClassificationFlag::Sim2Basic) => r.uid = SIM2_UID,
                _ => {}
            }
            r
        })
}

fn natural_day(ts: u64, offset: FixedOffset) -> Option<NaiveDate> {
    let secs = i64::try_from(ts).ok()?;
    DateTime::from_timestamp(secs, 0).map(|d| d.with_timezone(&offset).date_naive())
}

/// Rows within a day of `end` stay separate; older rows fold into one bucket
/// per natural day.
fn merge_day_buckets(mut rows: Vec<TrafficSample>, end: u64, offset: FixedOffset) -> Vec<TimeBucketedTotals> {
    rows.sort_by_key(|r| r.date);
    let recent_from = end.saturating_sub(DAY_SECS);
    let mut buckets: Vec<TimeBucketedTotals> = Vec::new();
    for row in rows {
        if row.date <= recent_from {
            let day = natural_day(row.date, offset);
            if let Some(bucket) = buckets
                .iter_mut()
                .find(|b| b.end_time < recent_from && natural_day(b.end_time, offset) == day)
            {
                bucket.totals.add_sample(&row);
                bucket.end_time = row.date;
                continue;
            }
        }
        buckets.push(TimeBucketedTotals {
            start_time: row.date,
            end_time: row.date,
            totals: row.totals(),
        });
    }
    buckets
}

/// The traffic statistics service. Built once by the entry point and shared.
pub struct NetStatsService {
    config: StatsConfig,
    ports: Ports,
    classifier: Arc<UidFlagClassifier>,
    quota: Arc<QuotaTracker>,
    callbacks: Arc<StatsCallbackManager>,
    cache: Arc<StatsCache>,
    monitor: Arc<QuotaMonitor>,
    scheduler: StatsScheduler,
    sharing: Option<SharedTrafficTracker>,
    users: Mutex<UserIds>,
    started: AtomicBool,
}

impl NetStatsService {
    pub fn new(config: StatsConfig, ports: Ports, executor: TaskExecutor) -> Self {
        let classifier = Arc::new(UidFlagClassifier::new(config.classifier.clone()));
        let quota = Arc::new(QuotaTracker::new());
        let callbacks = Arc::new(StatsCallbackManager::new());
        let cache = Arc::new(StatsCache::new(
            &config,
            &ports,
            classifier.clone(),
            quota.clone(),
            callbacks.clone(),
        ));
        let monitor = Arc::new(QuotaMonitor::new(quota.clone(), cache.clone(), &ports));
        let scheduler = StatsScheduler::new(executor, cache.clone(), monitor.clone(), config.write_interval());
        let sharing = config
            .enable_shared_traffic
            .then(|| SharedTrafficTracker::new(config.counters.cellular_prefix.clone()));

        Self {
            config,
            ports,
            classifier,
            quota,
            callbacks,
            cache,
            monitor,
            scheduler,
            sharing,
            users: Mutex::new(UserIds::default()),
            started: AtomicBool::new(false),
        }
    }

    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<()> {
        if self.started.load(Ordering::SeqCst) {
            return Err(StatsError::state("service already started"));
        }
        self.cache.reload_iface_idents().await;
        self.cache.refresh_classification().await;
        for sim in &self.config.sims {
            self.quota.put_settings(QuotaSettings::from_config(sim));
            self.activate(sim.sim_id).await?;
        }
        self.scheduler.start(self.config.cache_interval());
        self.started.store(true, Ordering::SeqCst);
        info!(
            sims = self.config.sims.len(),
            shared_traffic = self.sharing.is_some(),
            "netstats service started"
        );
        Ok(())
    }

    /// Stops the timers and flushes whatever is pending.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<()> {
        self.scheduler.stop().await;
        self.started.store(false, Ordering::SeqCst);
        self.cache.cache_cycle().await;
        let written = self.cache.write_cycle(true).await?;
        info!(written, "netstats service stopped");
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    fn ensure_ready(&self, caller: Caller) -> Result<()> {
        if !caller.can_read_stats() {
            return Err(StatsError::Permission("caller lacks the stats capability".into()));
        }
        if !self.is_started() {
            return Err(StatsError::state("service not started"));
        }
        Ok(())
    }

    fn now(&self) -> DateTime<FixedOffset> {
        self.ports.clock.now()
    }

    pub fn classifier(&self) -> &UidFlagClassifier {
        &self.classifier
    }

    /// Applies a new cache interval, clamped like the configured one, and
    /// returns the interval in effect.
    pub fn set_cache_interval(&self, secs: u64) -> u64 {
        let secs = StatsConfig::clamp_cache_interval(secs);
        self.scheduler.set_cache_interval(Duration::from_secs(secs));
        secs
    }

    // Queries

    pub async fn get_iface_stats(&self, caller: Caller, iface: &str, start: u64, end: u64) -> Result<Totals> {
        self.ensure_ready(caller)?;
        check_range(start, end)?;
        let rows = self
            .cache
            .rows(StatsTable::Iface, &RowFilter::range(start, end).iface(iface))
            .await?;
        Ok(sum(&rows))
    }

    pub async fn get_uid_stats(
        &self,
        caller: Caller,
        iface: &str,
        uid: u32,
        start: u64,
        end: u64,
    ) -> Result<Totals> {
        self.ensure_ready(caller)?;
        check_range(start, end)?;
        let mut rows = self
            .cache
            .rows(StatsTable::Uid, &RowFilter::range(start, end).uid(uid).iface(iface))
            .await?;
        rows.retain(|r| r.flag != ClassificationFlag::Uninstalled);
        Ok(sum(&rows))
    }

    /// Traffic archived for `uid` when it was uninstalled.
    pub async fn get_archived_uid_stats(&self, caller: Caller, uid: u32, start: u64, end: u64) -> Result<Totals> {
        self.ensure_ready(caller)?;
        check_range(start, end)?;
        let mut rows = self
            .cache
            .rows(StatsTable::Uid, &RowFilter::range(start, end).uid(uid))
            .await?;
        rows.retain(|r| r.flag == ClassificationFlag::Uninstalled);
        Ok(sum(&rows))
    }

    /// Lifetime totals per (uid, iface, ident) of installed apps.
    pub async fn get_all_stats(&self, caller: Caller) -> Result<Vec<TrafficSample>> {
        self.ensure_ready(caller)?;
        let rows = self.cache.rows(StatsTable::Uid, &RowFilter::default()).await?;
        let mut merged: HashMap<(u32, String, String), TrafficSample> = HashMap::new();
        for row in rows.into_iter().filter(|r| r.flag != ClassificationFlag::Uninstalled) {
            match merged.get_mut(&(row.uid, row.iface.clone(), row.ident.clone())) {
                Some(total) => total.absorb(&row),
                None => {
                    merged.insert((row.uid, row.iface.clone(), row.ident.clone()), row);
                }
            }
        }
        let mut all: Vec<_> = merged.into_values().collect();
        all.sort_by(|a, b| (a.uid, &a.iface, &a.ident).cmp(&(b.uid, &b.iface, &b.ident)));
        Ok(all)
    }

    /// App-reported totals merged by uid and ident, not yet flushed.
    pub async fn get_reported_app_stats(&self, caller: Caller) -> Result<Vec<TrafficSample>> {
        self.ensure_ready(caller)?;
        Ok(self.cache.pending_rows(Dimension::PushedAll).await)
    }

    /// Every row of one network: history, pending, SIM-profile rows and live kernel deltas.
    async fn network_view(&self, ident: &str, start: u64, end: u64) -> Result<Vec<TrafficSample>> {
        let mut rows = self.cache.network_rows(ident, start, end).await?;
        let sim_rows = self
            .cache
            .rows(StatsTable::UidSim, &RowFilter::range(start, end).ident(ident))
            .await?;
        rows.extend(sim_view(sim_rows, self.classifier.policy().display_anchor_separately));
        rows.extend(
            self.cache
                .live_deltas()
                .await
                .into_iter()
                .filter(|d| d.ident == ident && d.date >= start && d.date <= end),
        );
        Ok(rows)
    }

    pub async fn get_traffic_by_network(&self, caller: Caller, query: &NetworkQuery) -> Result<HashMap<u32, Totals>> {
        self.ensure_ready(caller)?;
        check_range(query.start, query.end)?;
        let rows = self.network_view(&query.ident(), query.start, query.end).await?;
        let users = *self.users.lock();

        let mut totals: HashMap<u32, Totals> = HashMap::new();
        for mut row in rows {
            users.merge_account(&mut row);
            let uid = if row.flag == ClassificationFlag::Uninstalled {
                UNINSTALLED_UID
            } else {
                row.uid
            };
            totals.entry(uid).or_default().add_sample(&row);
        }
        Ok(totals)
    }

    pub async fn get_traffic_by_uid_network(
        &self,
        caller: Caller,
        uid: u32,
        query: &NetworkQuery,
    ) -> Result<Vec<TimeBucketedTotals>> {
        self.ensure_ready(caller)?;
        check_range(query.start, query.end)?;
        let rows = self.network_view(&query.ident(), query.start, query.end).await?;
        let users = *self.users.lock();

        let selected: Vec<_> = rows
            .into_iter()
            .filter(|r| r.flag != ClassificationFlag::Uninstalled)
            .filter(|r| match uid {
                DEFAULT_ACCOUNT_UID => users.is_default_account(r.user_id),
                OTHER_ACCOUNT_UID => !users.is_default_account(r.user_id),
                _ => r.uid == uid,
            })
            .collect();
        Ok(merge_day_buckets(selected, query.end, *self.now().offset()))
    }

    // Reports

    pub async fn report_app_stats(&self, caller: Caller, info: &PushStatsInfo) -> Result<()> {
        self.ensure_ready(caller)?;
        check_range(info.begin_time, info.end_time)?;
        debug!(uid = info.uid, iface = %info.iface, "app stats reported");
        self.cache.push_app_stats(info.to_sample()).await;
        Ok(())
    }

    /// Accounts tethered traffic. Returns false when nothing was billed.
    pub async fn report_shared_traffic(&self, caller: Caller, info: &SharedTrafficInfo) -> Result<bool> {
        self.ensure_ready(caller)?;
        let Some(sharing) = &self.sharing else {
            debug!("shared traffic accounting disabled");
            return Ok(false);
        };
        let ident = self.cache.ident_of(&info.iface);
        match sharing.delta(info, &ident, self.ports.clock.now_secs()) {
            Some(delta) => {
                self.cache.push_shared(delta).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // Maintenance

    /// Starts a forced update in the background. Returns false when one is already running.
    pub fn force_update(&self, caller: Caller) -> Result<bool> {
        self.ensure_ready(caller)?;
        Ok(self.scheduler.force_update().is_some())
    }

    pub async fn force_update_and_wait(&self, caller: Caller) -> Result<usize> {
        self.ensure_ready(caller)?;
        self.scheduler.force_update_and_wait().await
    }

    pub async fn force_update_and_backup(&self, caller: Caller) -> Result<()> {
        self.force_update_and_wait(caller).await?;
        if !self.cache.backup().await {
            warn!("backup after forced update failed");
        }
        Ok(())
    }

    /// Forgets every byte ever counted.
    #[instrument(skip(self))]
    pub async fn reset_all(&self, caller: Caller) -> Result<()> {
        self.ensure_ready(caller)?;
        self.cache.reset().await;
        if let Some(sharing) = &self.sharing {
            sharing.reset();
        }
        self.ports.sampler.clear_all().await?;
        self.ports.gateway.clear_all().await?;
        self.classifier.clear_all();
        self.cache.refresh_classification().await;

        let now = self.now();
        for cycle in self.quota.active_sims() {
            self.quota.rederive(cycle.sim_id, cycle.begin_day, 0, &now)?;
        }
        info!("all traffic statistics reset");
        Ok(())
    }

    pub fn register_change_callback(&self, listener: Arc<dyn StatsChangeListener>) -> u64 {
        self.callbacks.register(listener)
    }

    pub fn unregister_change_callback(&self, id: u64) -> bool {
        self.callbacks.unregister(id)
    }

    // Lifecycle events

    #[instrument(skip(self))]
    pub async fn on_package_added(&self, uid: u32) {
        self.classifier.clear(uid);
        self.cache.refresh_classification().await;
        debug!(uid, flag = ?self.classifier.cached(uid), "package added");
    }

    /// Archives the uid's traffic as Uninstalled, then drops its kernel counters.
    #[instrument(skip(self))]
    pub async fn on_package_removed(&self, uid: u32) -> Result<()> {
        self.ports
            .gateway
            .update_uid_flag(uid, ClassificationFlag::Uninstalled)
            .await?;
        self.classifier.mark_uninstalled(uid);
        self.cache.archive_uid(uid).await?;

        if let Some(sample) = self.classifier.clear(uid) {
            if let Some(flag) = self.classifier.flag_of_sample(&sample) {
                self.ports
                    .gateway
                    .update_flag(flag, ClassificationFlag::Uninstalled)
                    .await?;
                self.classifier.reassign(flag);
            }
            self.cache.refresh_classification().await;
        }
        self.classifier.mark_uninstalled(uid);

        self.ports.sampler.delete_uid_counters(uid).await?;
        self.cache.forget_uid(uid).await;
        info!(uid, "package removed, traffic archived");
        Ok(())
    }

    async fn activate(&self, sim_id: u32) -> Result<BillingCycle> {
        if self.quota.settings(sim_id).is_none() {
            self.quota.put_settings(QuotaSettings::new(sim_id));
        }
        match self.ports.gateway.load_notify_state(sim_id).await {
            Ok(Some(state)) => self.quota.restore_notify_state(state),
            Ok(None) => {}
            Err(e) => warn!(sim_id, "notify state not loaded: {}", e),
        }

        let now = self.now();
        let begin_day = self.quota.settings(sim_id).map(|s| s.begin_day).unwrap_or(1);
        let (start, _) = cycle_bounds(begin_day, &now);
        let ident = sim_ident(sim_id);
        let seed = self
            .cache
            .network_usage(&ident, start, self.ports.clock.now_secs())
            .await?;
        Ok(self.quota.activate(sim_id, &ident, seed, &now))
    }

    pub async fn activate_sim(&self, sim_id: u32) -> Result<BillingCycle> {
        self.activate(sim_id).await
    }

    pub fn deactivate_sim(&self, sim_id: u32) {
        self.quota.deactivate(sim_id);
    }

    /// Applies one quota settings change and re-evaluates the SIM.
    #[instrument(skip(self))]
    pub async fn on_settings_changed(&self, sim_id: u32, change: SettingChange) -> Result<QuotaSettings> {
        let (settings, moved) = self.quota.apply_change(sim_id, change)?;
        if moved && self.quota.is_active(sim_id) {
            let now = self.now();
            let (start, _) = cycle_bounds(settings.begin_day, &now);
            let seed = self
                .cache
                .network_usage(&sim_ident(sim_id), start, self.ports.clock.now_secs())
                .await?;
            self.quota.rederive(sim_id, settings.begin_day, seed, &now)?;
        }
        if let Err(e) = self.ports.gateway.save_notify_state(&settings.notify).await {
            warn!(sim_id, "notify state not persisted: {}", e);
        }
        if self.quota.is_active(sim_id) {
            self.monitor.evaluate(sim_id).await;
        }
        Ok(self.quota.settings(sim_id).unwrap_or(settings))
    }

    pub fn set_foreground_user(&self, user_id: u32) {
        self.users.lock().foreground = user_id;
    }

    pub fn set_default_user(&self, user_id: u32) {
        self.users.lock().default = user_id;
    }

    pub fn set_private_user(&self, user_id: Option<u32>) {
        self.users.lock().private = user_id;
    }

    // Quota

    pub async fn month_usage(&self, caller: Caller, sim_id: u32) -> Result<u64> {
        self.ensure_ready(caller)?;
        let live = self.cache.live_bytes(&sim_ident(sim_id)).await;
        self.quota.month_usage(sim_id, live, &self.now())
    }

    pub async fn availability(&self, caller: Caller, sim_id: u32) -> Result<Availability> {
        self.ensure_ready(caller)?;
        self.monitor.availability(sim_id).await
    }

    pub fn quota_settings(&self, sim_id: u32) -> Option<QuotaSettings> {
        self.quota.settings(sim_id)
    }

    pub fn billing_cycle(&self, sim_id: u32) -> Option<BillingCycle> {
        self.quota.cycle(sim_id)
    }
}

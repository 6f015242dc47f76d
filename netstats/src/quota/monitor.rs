use super::cycle::today_start;
use super::settings::{Availability, QuotaSettings, evaluate_availability, exceeded_thresholds};
use super::tracker::QuotaTracker;
use crate::cache::StatsCache;
use crate::error::{Result, StatsError};
use crate::persistence::PersistenceGateway;
use crate::ports::{Clock, Ports, QuotaNotifier};
use chrono::{DateTime, FixedOffset};
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

struct Usage {
    settings: QuotaSettings,
    month: u64,
    today: u64,
}

/// Evaluates SIM quotas against recorded usage and raises alerts.
pub struct QuotaMonitor {
    tracker: Arc<QuotaTracker>,
    cache: Arc<StatsCache>,
    gateway: Arc<dyn PersistenceGateway>,
    notifier: Arc<dyn QuotaNotifier>,
    clock: Arc<dyn Clock>,
}

impl QuotaMonitor {
    pub fn new(tracker: Arc<QuotaTracker>, cache: Arc<StatsCache>, ports: &Ports) -> Self {
        Self {
            tracker,
            cache,
            gateway: ports.gateway.clone(),
            notifier: ports.notifier.clone(),
            clock: ports.clock.clone(),
        }
    }

    async fn usage(&self, sim_id: u32, now: &DateTime<FixedOffset>) -> Result<Usage> {
        let cycle = self
            .tracker
            .cycle(sim_id)
            .ok_or_else(|| StatsError::not_found(format!("no billing cycle for sim {sim_id}")))?;
        let settings = self
            .tracker
            .settings(sim_id)
            .unwrap_or_else(|| QuotaSettings::new(sim_id));
        let now_secs = now.timestamp().max(0) as u64;

        let live = self.cache.live_bytes(&cycle.ident).await;
        let month = self.cache.network_usage(&cycle.ident, cycle.start, now_secs).await?;
        let today = self
            .cache
            .network_usage(&cycle.ident, today_start(now), now_secs)
            .await?;
        Ok(Usage {
            settings,
            month: month.saturating_add(live),
            today: today.saturating_add(live),
        })
    }

    /// Bytes left before each threshold of `sim_id`.
    pub async fn availability(&self, sim_id: u32) -> Result<Availability> {
        let usage = self.usage(sim_id, &self.clock.now()).await?;
        Ok(evaluate_availability(&usage.settings, usage.month, usage.today))
    }

    /// Evaluates one SIM and sends any alert it is allowed to send.
    ///
    /// Returns None when usage could not be read; the next cycle tries again.
    #[instrument(skip(self))]
    pub async fn evaluate(&self, sim_id: u32) -> Option<Availability> {
        let now = self.clock.now();
        let usage = match self.usage(sim_id, &now).await {
            Ok(usage) => usage,
            Err(e) => {
                warn!(sim_id, "quota unavailable this cycle: {}", e);
                return None;
            }
        };
        let availability = evaluate_availability(&usage.settings, usage.month, usage.today);

        let crossed = exceeded_thresholds(&usage.settings, usage.month, usage.today);
        if crossed.is_empty() {
            return Some(availability);
        }
        let Some((fired, state)) = self.tracker.take_notifications(sim_id, &crossed, &now) else {
            return Some(availability);
        };
        if fired.is_empty() {
            debug!(sim_id, ?crossed, "thresholds already notified this period");
            return Some(availability);
        }
        for kind in &fired {
            self.notifier
                .notify(sim_id, *kind, usage.settings.notify_type)
                .await;
        }
        if let Err(e) = self.gateway.save_notify_state(&state).await {
            warn!(sim_id, "notify state not persisted: {}", e);
        }
        Some(availability)
    }

    pub async fn evaluate_all(&self) {
        let sims = self.tracker.active_sims();
        join_all(sims.iter().map(|cycle| self.evaluate(cycle.sim_id))).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::StatsCallbackManager;
    use crate::classifier::UidFlagClassifier;
    use crate::quota::{SettingChange, ThresholdKind, UNLIMITED};
    use crate::testing::{Harness, sample};

    fn monitor(harness: &Harness) -> (QuotaMonitor, Arc<StatsCache>, Arc<QuotaTracker>) {
        let tracker = Arc::new(QuotaTracker::new());
        let cache = Arc::new(StatsCache::new(
            &harness.config,
            &harness.ports(),
            Arc::new(UidFlagClassifier::new(harness.config.classifier.clone())),
            tracker.clone(),
            Arc::new(StatsCallbackManager::new()),
        ));
        let monitor = QuotaMonitor::new(tracker.clone(), cache.clone(), &harness.ports());
        (monitor, cache, tracker)
    }

    #[tokio::test]
    async fn limit_boundary_reports_exceeded() {
        let harness = Harness::new();
        let (monitor, cache, tracker) = monitor(&harness);
        tracker.apply_change(1, SettingChange::MonthlyLimit(1000)).unwrap();
        tracker.activate(1, "1", 0, &harness.clock.now());

        harness.sampler.set_uid_stats(vec![sample(1000, "rmnet0", "1", 999, 0)]);
        cache.cache_cycle().await;
        assert_eq!(monitor.availability(1).await.unwrap().monthly_available, 1);

        harness.sampler.set_uid_stats(vec![sample(1000, "rmnet0", "1", 1000, 0)]);
        cache.cache_cycle().await;
        assert_eq!(monitor.availability(1).await.unwrap().monthly_available, UNLIMITED);
    }

    #[tokio::test]
    async fn each_threshold_alerts_once_per_period() {
        let harness = Harness::new();
        let (monitor, cache, tracker) = monitor(&harness);
        tracker.apply_change(1, SettingChange::MonthlyLimit(1000)).unwrap();
        tracker.activate(1, "1", 0, &harness.clock.now());

        harness.sampler.set_uid_stats(vec![sample(1000, "rmnet0", "1", 1500, 0)]);
        cache.cache_cycle().await;
        for _ in 0..5 {
            monitor.evaluate(1).await.unwrap();
        }
        assert_eq!(*harness.notifier.alerts.lock(), vec![(1, ThresholdKind::Limit)]);
        let saved = harness.gateway.load_notify_state(1).await.unwrap().unwrap();
        assert!(!saved.limit_armed);
        assert!(saved.last_alert_time > 0);
    }

    #[tokio::test]
    async fn unknown_sim_skips_evaluation() {
        let harness = Harness::new();
        let (monitor, _, _) = monitor(&harness);
        assert!(monitor.evaluate(7).await.is_none());
        assert!(matches!(monitor.availability(7).await, Err(StatsError::NotFound(_))));
    }
}

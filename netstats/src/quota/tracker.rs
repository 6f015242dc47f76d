use super::cycle::{BillingCycle, today_start};
use super::settings::{NotifyState, QuotaSettings, SettingChange, ThresholdKind};
use crate::error::{Result, StatsError};
use chrono::{DateTime, FixedOffset};
use common::SafeMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::{debug, info};

/// Per-SIM billing-cycle ledgers and quota settings.
///
/// A SIM without a ledger is uninitialized; activation seeds one, a cycle
/// rollover zeroes it in place and deactivation drops it.
#[derive(Default)]
pub struct QuotaTracker {
    ledger: RwLock<HashMap<u32, BillingCycle>>,
    settings: SafeMap<u32, QuotaSettings>,
}

impl QuotaTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the ledger of `sim_id` with `seed_bytes` already used this cycle.
    pub fn activate(&self, sim_id: u32, ident: &str, seed_bytes: u64, now: &DateTime<FixedOffset>) -> BillingCycle {
        let begin_day = self.settings(sim_id).map(|s| s.begin_day).unwrap_or(1);
        let mut cycle = BillingCycle::derive(sim_id, ident, begin_day, now);
        cycle.accumulated_bytes = seed_bytes;
        info!(
            sim_id,
            ident,
            start = cycle.start,
            end = cycle.end,
            seed_bytes,
            "billing cycle active"
        );
        self.ledger.write().insert(sim_id, cycle.clone());
        cycle
    }

    pub fn deactivate(&self, sim_id: u32) {
        self.ledger.write().remove(&sim_id);
        self.settings.erase(&sim_id);
        info!(sim_id, "billing cycle dropped");
    }

    pub fn is_active(&self, sim_id: u32) -> bool {
        self.ledger.read().contains_key(&sim_id)
    }

    pub fn cycle(&self, sim_id: u32) -> Option<BillingCycle> {
        self.ledger.read().get(&sim_id).cloned()
    }

    pub fn active_sims(&self) -> Vec<BillingCycle> {
        let mut cycles: Vec<_> = self.ledger.read().values().cloned().collect();
        cycles.sort_by_key(|c| c.sim_id);
        cycles
    }

    /// Rolls every expired cycle over. Returns the SIMs that rolled.
    pub fn roll_over_expired(&self, now: &DateTime<FixedOffset>) -> Vec<u32> {
        let now_secs = now.timestamp().max(0) as u64;
        if !self.ledger.read().values().any(|c| c.is_expired(now_secs)) {
            return Vec::new();
        }

        let mut rolled = Vec::new();
        let mut ledger = self.ledger.write();
        for cycle in ledger.values_mut().filter(|c| c.is_expired(now_secs)) {
            cycle.roll_over(now);
            rolled.push(cycle.sim_id);
            info!(sim_id = cycle.sim_id, start = cycle.start, end = cycle.end, "billing cycle rolled over");
        }
        rolled
    }

    /// Adds bytes observed per ident. Idents without a ledger are ignored.
    pub fn accumulate(&self, usage: &HashMap<String, u64>) {
        if usage.is_empty() {
            return;
        }
        let mut ledger = self.ledger.write();
        for cycle in ledger.values_mut() {
            if let Some(bytes) = usage.get(&cycle.ident) {
                cycle.accumulated_bytes = cycle.accumulated_bytes.saturating_add(*bytes);
                debug!(sim_id = cycle.sim_id, bytes, total = cycle.accumulated_bytes, "usage accumulated");
            }
        }
    }

    /// Moves the bounds of `sim_id` after a begin day change, keeping usage re-seeded by the caller.
    pub fn rederive(&self, sim_id: u32, begin_day: u8, seed_bytes: u64, now: &DateTime<FixedOffset>) -> Result<BillingCycle> {
        let mut ledger = self.ledger.write();
        let cycle = ledger
            .get_mut(&sim_id)
            .ok_or_else(|| StatsError::not_found(format!("no billing cycle for sim {sim_id}")))?;
        cycle.begin_day = begin_day;
        cycle.roll_over(now);
        cycle.accumulated_bytes = seed_bytes;
        Ok(cycle.clone())
    }

    /// Cycle usage of `sim_id` including `live_bytes` not yet cached.
    pub fn month_usage(&self, sim_id: u32, live_bytes: u64, now: &DateTime<FixedOffset>) -> Result<u64> {
        let now_secs = now.timestamp().max(0) as u64;
        {
            let ledger = self.ledger.read();
            let cycle = ledger
                .get(&sim_id)
                .ok_or_else(|| StatsError::not_found(format!("no billing cycle for sim {sim_id}")))?;
            if !cycle.is_expired(now_secs) {
                return Ok(cycle.accumulated_bytes.saturating_add(live_bytes));
            }
        }

        let mut ledger = self.ledger.write();
        let cycle = ledger
            .get_mut(&sim_id)
            .ok_or_else(|| StatsError::not_found(format!("no billing cycle for sim {sim_id}")))?;
        if cycle.is_expired(now_secs) {
            cycle.roll_over(now);
        }
        Ok(cycle.accumulated_bytes.saturating_add(live_bytes))
    }

    pub fn settings(&self, sim_id: u32) -> Option<QuotaSettings> {
        self.settings.find(&sim_id)
    }

    pub fn put_settings(&self, settings: QuotaSettings) {
        self.settings.ensure_insert(settings.sim_id(), settings);
    }

    /// Restores persisted notify bookkeeping into existing settings.
    pub fn restore_notify_state(&self, state: NotifyState) {
        self.settings.update(&state.sim_id, |s| s.notify = state);
    }

    /// Applies a settings change. Returns the new settings and whether cycle bounds moved.
    pub fn apply_change(&self, sim_id: u32, change: SettingChange) -> Result<(QuotaSettings, bool)> {
        self.settings.with(|map| {
            let settings = map.entry(sim_id).or_insert_with(|| QuotaSettings::new(sim_id));
            settings.apply(change).map(|moved| (settings.clone(), moved))
        })
    }

    /// Returns the thresholds in `crossed` that may notify now and records
    /// them as notified. The updated bookkeeping is returned for persisting.
    pub fn take_notifications(
        &self,
        sim_id: u32,
        crossed: &[ThresholdKind],
        now: &DateTime<FixedOffset>,
    ) -> Option<(Vec<ThresholdKind>, NotifyState)> {
        let cycle_start = self.cycle(sim_id)?.start;
        let day_start = today_start(now);
        let now_secs = now.timestamp().max(0) as u64;

        let mut fired = Vec::new();
        let mut state = None;
        self.settings.update(&sim_id, |settings| {
            for kind in crossed {
                let period_start = match kind {
                    ThresholdKind::DailyMark => day_start,
                    _ => cycle_start,
                };
                if settings.take_notify_permit(*kind, period_start) {
                    settings.record_notified(*kind, now_secs);
                    fired.push(*kind);
                }
            }
            state = Some(settings.notify);
        });
        state.map(|state| (fired, state))
    }

    pub fn clear(&self) {
        self.ledger.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339(s).unwrap()
    }

    fn tracker_with_sim(begin_day: u8) -> QuotaTracker {
        let tracker = QuotaTracker::new();
        let mut settings = QuotaSettings::new(1);
        settings.begin_day = begin_day;
        settings.monthly_limit_bytes = 1000;
        tracker.put_settings(settings);
        tracker
    }

    #[test]
    fn unknown_sim_is_not_found() {
        let tracker = QuotaTracker::new();
        let err = tracker.month_usage(9, 0, &at("2024-03-15T00:00:00+00:00")).unwrap_err();
        assert!(matches!(err, StatsError::NotFound(_)));
    }

    #[test]
    fn activation_seeds_and_accumulates_by_ident() {
        let tracker = tracker_with_sim(10);
        let now = at("2024-03-15T12:00:00+00:00");
        tracker.activate(1, "1", 300, &now);

        let mut usage = HashMap::new();
        usage.insert("1".to_string(), 200);
        usage.insert("2".to_string(), 999);
        tracker.accumulate(&usage);

        assert_eq!(tracker.month_usage(1, 50, &now).unwrap(), 550);
    }

    #[test]
    fn rollover_runs_before_accumulation() {
        let tracker = tracker_with_sim(10);
        tracker.activate(1, "1", 700, &at("2024-03-15T12:00:00+00:00"));

        let next = at("2024-04-10T00:10:00+00:00");
        assert_eq!(tracker.roll_over_expired(&next), vec![1]);
        tracker.accumulate(&HashMap::from([("1".to_string(), 25)]));

        let cycle = tracker.cycle(1).unwrap();
        assert_eq!(cycle.accumulated_bytes, 25);
        assert!(cycle.contains(next.timestamp() as u64));
        assert!(tracker.roll_over_expired(&next).is_empty());
    }

    #[test]
    fn stale_cycle_heals_on_query() {
        let tracker = tracker_with_sim(10);
        tracker.activate(1, "1", 700, &at("2024-03-15T12:00:00+00:00"));
        let usage = tracker.month_usage(1, 5, &at("2024-04-11T00:00:00+00:00")).unwrap();
        assert_eq!(usage, 5);
    }

    #[test]
    fn notifications_fire_once_per_cycle() {
        let tracker = tracker_with_sim(10);
        let now = at("2024-03-15T12:00:00+00:00");
        tracker.activate(1, "1", 0, &now);

        let (fired, state) = tracker.take_notifications(1, &[ThresholdKind::Limit], &now).unwrap();
        assert_eq!(fired, vec![ThresholdKind::Limit]);
        assert_eq!(state.last_alert_time, now.timestamp() as u64);

        for hour in 13..20 {
            let later = at(&format!("2024-03-20T{hour}:00:00+00:00"));
            let (fired, _) = tracker.take_notifications(1, &[ThresholdKind::Limit], &later).unwrap();
            assert!(fired.is_empty());
        }

        let next_cycle = at("2024-04-12T00:00:00+00:00");
        tracker.roll_over_expired(&next_cycle);
        let (fired, _) = tracker.take_notifications(1, &[ThresholdKind::Limit], &next_cycle).unwrap();
        assert_eq!(fired, vec![ThresholdKind::Limit]);
    }

    #[test]
    fn daily_mark_fires_once_per_day() {
        let tracker = tracker_with_sim(1);
        tracker.apply_change(1, SettingChange::DailyMark(10)).unwrap();
        let morning = at("2024-03-15T08:00:00+00:00");
        tracker.activate(1, "1", 0, &morning);

        let kinds = [ThresholdKind::DailyMark];
        assert_eq!(tracker.take_notifications(1, &kinds, &morning).unwrap().0, kinds);
        let evening = at("2024-03-15T22:00:00+00:00");
        assert!(tracker.take_notifications(1, &kinds, &evening).unwrap().0.is_empty());
        let tomorrow = at("2024-03-16T00:05:00+00:00");
        assert_eq!(tracker.take_notifications(1, &kinds, &tomorrow).unwrap().0, kinds);
    }

    #[test]
    fn begin_day_change_rederives_bounds() {
        let tracker = tracker_with_sim(10);
        let now = at("2024-03-15T12:00:00+00:00");
        tracker.activate(1, "1", 100, &now);

        let (settings, moved) = tracker.apply_change(1, SettingChange::BeginDay(20)).unwrap();
        assert!(moved);
        let cycle = tracker.rederive(1, settings.begin_day, 40, &now).unwrap();
        assert_eq!(cycle.start, at("2024-02-20T00:00:00+00:00").timestamp() as u64);
        assert_eq!(cycle.accumulated_bytes, 40);
    }

    #[test]
    fn deactivation_drops_ledger_and_settings() {
        let tracker = tracker_with_sim(1);
        tracker.activate(1, "1", 0, &at("2024-03-15T12:00:00+00:00"));
        tracker.deactivate(1);
        assert!(!tracker.is_active(1));
        assert!(tracker.settings(1).is_none());
    }
}

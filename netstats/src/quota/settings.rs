use crate::config::SimConfig;
use crate::error::{Result, StatsError};
use serde::{Deserialize, Serialize};

/// "Infinite" availability: the threshold is exceeded or not configured.
pub const UNLIMITED: u64 = u64::MAX;
pub const MARK_UNSET: u16 = u16::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdKind {
    Limit,
    MonthlyMark,
    DailyMark,
}

/// Notification bookkeeping that survives restarts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyState {
    pub sim_id: u32,
    pub last_alert_time: u64,
    pub last_monthly_notify_time: u64,
    pub last_daily_notify_time: u64,
    pub limit_armed: bool,
    pub monthly_mark_armed: bool,
    pub daily_mark_armed: bool,
}

/// One settings key changed in the external store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "key", content = "value", rename_all = "snake_case")]
pub enum SettingChange {
    Unlimited(u8),
    MonthlyLimit(u64),
    BeginDay(u8),
    NotifyType(u8),
    MonthlyMark(u16),
    DailyMark(u16),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaSettings {
    pub begin_day: u8,
    pub unlimited: bool,
    pub notify_type: u8,
    pub monthly_limit_bytes: u64,
    pub monthly_mark_percent: u16,
    pub daily_mark_percent: u16,
    pub notify: NotifyState,
}

impl QuotaSettings {
    pub fn new(sim_id: u32) -> Self {
        Self {
            begin_day: 1,
            unlimited: false,
            notify_type: 0,
            monthly_limit_bytes: UNLIMITED,
            monthly_mark_percent: MARK_UNSET,
            daily_mark_percent: MARK_UNSET,
            notify: NotifyState {
                sim_id,
                ..NotifyState::default()
            },
        }
    }

    pub fn from_config(config: &SimConfig) -> Self {
        Self {
            begin_day: config.begin_day,
            unlimited: config.unlimited,
            notify_type: config.notify_type,
            monthly_limit_bytes: config.monthly_limit_bytes.unwrap_or(UNLIMITED),
            monthly_mark_percent: config.monthly_mark_percent.unwrap_or(MARK_UNSET),
            daily_mark_percent: config.daily_mark_percent.unwrap_or(MARK_UNSET),
            ..Self::new(config.sim_id)
        }
    }

    pub fn sim_id(&self) -> u32 {
        self.notify.sim_id
    }

    /// Applies a settings change. Returns true when the billing cycle bounds move.
    pub fn apply(&mut self, change: SettingChange) -> Result<bool> {
        match change {
            SettingChange::Unlimited(value) => {
                self.unlimited = parse_switch("unlimited", value)?;
            }
            SettingChange::MonthlyLimit(limit) => {
                self.monthly_limit_bytes = limit;
                self.notify.limit_armed = true;
                self.notify.monthly_mark_armed = true;
                self.notify.daily_mark_armed = true;
            }
            SettingChange::BeginDay(day) => {
                if !(1..=31).contains(&day) {
                    return Err(StatsError::validation(format!("begin day {day} outside 1..=31")));
                }
                let moved = self.begin_day != day;
                self.begin_day = day;
                return Ok(moved);
            }
            SettingChange::NotifyType(value) => {
                self.notify_type = u8::from(parse_switch("notify type", value)?);
            }
            SettingChange::MonthlyMark(percent) => {
                self.monthly_mark_percent = parse_percent("monthly mark", percent)?;
                self.notify.monthly_mark_armed = true;
            }
            SettingChange::DailyMark(percent) => {
                self.daily_mark_percent = parse_percent("daily mark", percent)?;
                self.notify.daily_mark_armed = true;
            }
        }
        Ok(false)
    }

    /// Decides whether a crossed threshold may notify now, consuming its arm.
    ///
    /// `period_start` is the cycle start for the limit and monthly mark, and
    /// today's start for the daily mark.
    pub fn take_notify_permit(&mut self, kind: ThresholdKind, period_start: u64) -> bool {
        if self.unlimited {
            return false;
        }
        let notify = &mut self.notify;
        match kind {
            ThresholdKind::Limit => {
                if notify.limit_armed {
                    notify.limit_armed = false;
                    notify.monthly_mark_armed = false;
                    notify.daily_mark_armed = false;
                    return true;
                }
                notify.last_alert_time < period_start
            }
            ThresholdKind::MonthlyMark => {
                if notify.monthly_mark_armed {
                    notify.monthly_mark_armed = false;
                    return true;
                }
                notify.last_monthly_notify_time < period_start
            }
            ThresholdKind::DailyMark => {
                if notify.daily_mark_armed {
                    notify.daily_mark_armed = false;
                    return true;
                }
                notify.last_daily_notify_time < period_start
            }
        }
    }

    pub fn record_notified(&mut self, kind: ThresholdKind, now: u64) {
        match kind {
            ThresholdKind::Limit => self.notify.last_alert_time = now,
            ThresholdKind::MonthlyMark => self.notify.last_monthly_notify_time = now,
            ThresholdKind::DailyMark => self.notify.last_daily_notify_time = now,
        }
    }
}

fn parse_switch(name: &str, value: u8) -> Result<bool> {
    match value {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(StatsError::validation(format!("{name} must be 0 or 1, got {other}"))),
    }
}

fn parse_percent(name: &str, value: u16) -> Result<u16> {
    if value > 100 {
        return Err(StatsError::validation(format!("{name} {value}% outside 0..=100")));
    }
    Ok(value)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Availability {
    pub monthly_available: u64,
    pub monthly_mark_available: u64,
    pub daily_mark_available: u64,
}

impl Availability {
    pub fn unlimited() -> Self {
        Self {
            monthly_available: UNLIMITED,
            monthly_mark_available: UNLIMITED,
            daily_mark_available: UNLIMITED,
        }
    }
}

fn mark_threshold(limit: u64, percent: u16) -> Option<u64> {
    if percent > 100 {
        return None;
    }
    Some((u128::from(limit) * u128::from(percent) / 100) as u64)
}

fn remaining(threshold: Option<u64>, used: u64) -> u64 {
    match threshold {
        Some(threshold) if used < threshold => threshold - used,
        _ => UNLIMITED,
    }
}

/// Bytes left before each threshold, or [`UNLIMITED`].
pub fn evaluate_availability(settings: &QuotaSettings, month_used: u64, today_used: u64) -> Availability {
    let limit = settings.monthly_limit_bytes;
    if settings.unlimited || limit == UNLIMITED {
        return Availability::unlimited();
    }
    Availability {
        monthly_available: remaining(Some(limit), month_used),
        monthly_mark_available: remaining(
            mark_threshold(limit, settings.monthly_mark_percent),
            month_used,
        ),
        daily_mark_available: remaining(
            mark_threshold(limit, settings.daily_mark_percent),
            today_used,
        ),
    }
}

/// Configured thresholds that usage has reached.
pub fn exceeded_thresholds(settings: &QuotaSettings, month_used: u64, today_used: u64) -> Vec<ThresholdKind> {
    let limit = settings.monthly_limit_bytes;
    if settings.unlimited || limit == UNLIMITED {
        return Vec::new();
    }
    let mut exceeded = Vec::new();
    if month_used >= limit {
        exceeded.push(ThresholdKind::Limit);
    }
    if mark_threshold(limit, settings.monthly_mark_percent).is_some_and(|t| month_used >= t) {
        exceeded.push(ThresholdKind::MonthlyMark);
    }
    if mark_threshold(limit, settings.daily_mark_percent).is_some_and(|t| today_used >= t) {
        exceeded.push(ThresholdKind::DailyMark);
    }
    exceeded
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limited(limit: u64) -> QuotaSettings {
        QuotaSettings {
            monthly_limit_bytes: limit,
            ..QuotaSettings::new(1)
        }
    }

    #[test]
    fn limit_reached_reports_sentinel() {
        let settings = limited(1000);
        assert_eq!(evaluate_availability(&settings, 1000, 0).monthly_available, UNLIMITED);
        assert_eq!(evaluate_availability(&settings, 999, 0).monthly_available, 1);
    }

    #[test]
    fn marks_scale_the_limit() {
        let mut settings = limited(1000);
        settings.monthly_mark_percent = 80;
        settings.daily_mark_percent = 10;

        let availability = evaluate_availability(&settings, 700, 40);
        assert_eq!(availability.monthly_available, 300);
        assert_eq!(availability.monthly_mark_available, 100);
        assert_eq!(availability.daily_mark_available, 60);

        let availability = evaluate_availability(&settings, 800, 100);
        assert_eq!(availability.monthly_mark_available, UNLIMITED);
        assert_eq!(availability.daily_mark_available, UNLIMITED);
        assert_eq!(
            exceeded_thresholds(&settings, 800, 100),
            vec![ThresholdKind::MonthlyMark, ThresholdKind::DailyMark]
        );
    }

    #[test]
    fn unlimited_and_unconfigured_never_exceed() {
        let mut settings = limited(1000);
        settings.unlimited = true;
        assert_eq!(evaluate_availability(&settings, 5000, 5000), Availability::unlimited());
        assert!(exceeded_thresholds(&settings, 5000, 5000).is_empty());

        let settings = QuotaSettings::new(1);
        assert_eq!(evaluate_availability(&settings, 5000, 5000), Availability::unlimited());
        assert!(exceeded_thresholds(&settings, u64::MAX - 1, 0).is_empty());
    }

    #[test]
    fn huge_limits_do_not_overflow() {
        let mut settings = limited(u64::MAX - 1);
        settings.monthly_mark_percent = 100;
        let availability = evaluate_availability(&settings, 1, 0);
        assert_eq!(availability.monthly_mark_available, u64::MAX - 2);
    }

    #[test]
    fn settings_validate_ranges() {
        let mut settings = QuotaSettings::new(1);
        assert!(settings.apply(SettingChange::BeginDay(0)).is_err());
        assert!(settings.apply(SettingChange::BeginDay(32)).is_err());
        assert!(settings.apply(SettingChange::Unlimited(2)).is_err());
        assert!(settings.apply(SettingChange::NotifyType(7)).is_err());
        assert!(settings.apply(SettingChange::MonthlyMark(101)).is_err());
        assert!(settings.apply(SettingChange::DailyMark(500)).is_err());
        assert_eq!(settings, QuotaSettings::new(1));

        assert!(settings.apply(SettingChange::BeginDay(15)).unwrap());
        assert!(!settings.apply(SettingChange::BeginDay(15)).unwrap());
        assert!(!settings.apply(SettingChange::Unlimited(1)).unwrap());
        assert!(settings.unlimited);
    }

    #[test]
    fn limit_change_arms_all_thresholds() {
        let mut settings = QuotaSettings::new(1);
        settings.apply(SettingChange::MonthlyLimit(1000)).unwrap();
        assert!(settings.notify.limit_armed);
        assert!(settings.notify.monthly_mark_armed);
        assert!(settings.notify.daily_mark_armed);

        // Firing the limit consumes every arm.
        assert!(settings.take_notify_permit(ThresholdKind::Limit, 0));
        assert!(!settings.notify.monthly_mark_armed);
        assert!(!settings.notify.daily_mark_armed);
    }

    #[test]
    fn permit_is_gated_by_last_notify_time() {
        let mut settings = limited(1000);
        let cycle_start = 1_000;

        assert!(settings.take_notify_permit(ThresholdKind::MonthlyMark, cycle_start));
        settings.record_notified(ThresholdKind::MonthlyMark, 1_500);
        for _ in 0..5 {
            assert!(!settings.take_notify_permit(ThresholdKind::MonthlyMark, cycle_start));
        }

        // Next cycle.
        assert!(settings.take_notify_permit(ThresholdKind::MonthlyMark, 2_000));

        // A settings change re-arms within the same cycle, once.
        settings.record_notified(ThresholdKind::MonthlyMark, 2_100);
        settings.apply(SettingChange::MonthlyMark(90)).unwrap();
        assert!(settings.take_notify_permit(ThresholdKind::MonthlyMark, 2_000));
        assert!(!settings.take_notify_permit(ThresholdKind::MonthlyMark, 2_000));
    }

    #[test]
    fn unlimited_sims_never_get_a_permit() {
        let mut settings = limited(1000);
        settings.apply(SettingChange::MonthlyLimit(10)).unwrap();
        settings.apply(SettingChange::Unlimited(1)).unwrap();
        assert!(!settings.take_notify_permit(ThresholdKind::Limit, u64::MAX));
    }
}

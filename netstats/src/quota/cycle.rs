use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, TimeZone};
use serde::{Deserialize, Serialize};

/// Usage ledger of one SIM over its current billing cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingCycle {
    pub sim_id: u32,
    pub ident: String,
    pub begin_day: u8,
    /// First second of the cycle.
    pub start: u64,
    /// First second after the cycle.
    pub end: u64,
    pub accumulated_bytes: u64,
}

impl BillingCycle {
    pub fn derive(sim_id: u32, ident: impl Into<String>, begin_day: u8, now: &DateTime<FixedOffset>) -> Self {
        let (start, end) = cycle_bounds(begin_day, now);
        Self {
            sim_id,
            ident: ident.into(),
            begin_day,
            start,
            end,
            accumulated_bytes: 0,
        }
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.end
    }

    pub fn contains(&self, ts: u64) -> bool {
        ts >= self.start && ts < self.end
    }

    /// Zeroes the ledger and moves the bounds to the cycle holding `now`.
    pub fn roll_over(&mut self, now: &DateTime<FixedOffset>) {
        let (start, end) = cycle_bounds(self.begin_day, now);
        self.start = start;
        self.end = end;
        self.accumulated_bytes = 0;
    }
}

/// `[start, end)` of the cycle holding `now`, as unix seconds.
///
/// A cycle starts at local midnight on `begin_day`, clamped to the length of
/// the month it falls in, and ends where the next one starts.
pub fn cycle_bounds(begin_day: u8, now: &DateTime<FixedOffset>) -> (u64, u64) {
    let day = u32::from(begin_day.clamp(1, 31));
    let tz = *now.offset();
    let (year, month) = (now.year(), now.month());

    let anchor = day.min(days_in_month(year, month));
    let (start_year, start_month, start_day) = if now.day() >= anchor {
        (year, month, anchor)
    } else {
        let (y, m) = previous_month(year, month);
        (y, m, day.min(days_in_month(y, m)))
    };
    let (end_year, end_month) = next_month(start_year, start_month);
    let end_day = day.min(days_in_month(end_year, end_month));

    (
        local_midnight(tz, start_year, start_month, start_day),
        local_midnight(tz, end_year, end_month, end_day),
    )
}

/// Local midnight of the day holding `now`.
pub fn today_start(now: &DateTime<FixedOffset>) -> u64 {
    local_midnight(*now.offset(), now.year(), now.month(), now.day())
}

pub fn days_in_month(year: i32, month: u32) -> u32 {
    let (y, m) = next_month(year, month);
    NaiveDate::from_ymd_opt(y, m, 1)
        .and_then(|first| first.pred_opt())
        .map(|last| last.day())
        .unwrap_or(28)
}

fn previous_month(year: i32, month: u32) -> (i32, u32) {
    if month == 1 { (year - 1, 12) } else { (year, month - 1) }
}

fn next_month(year: i32, month: u32) -> (i32, u32) {
    if month == 12 { (year + 1, 1) } else { (year, month + 1) }
}

fn local_midnight(tz: FixedOffset, year: i32, month: u32, day: u32) -> u64 {
    let Some(midnight) = NaiveDate::from_ymd_opt(year, month, day).and_then(|d| d.and_hms_opt(0, 0, 0))
    else {
        return 0;
    };
    tz.from_local_datetime(&midnight)
        .single()
        .map(|dt| dt.timestamp().max(0) as u64)
        .unwrap_or(0)
}

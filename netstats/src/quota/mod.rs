mod cycle;
mod monitor;
mod settings;
mod tracker;

pub use cycle::{BillingCycle, cycle_bounds, days_in_month, today_start};
pub use settings::{
    Availability, MARK_UNSET, NotifyState, QuotaSettings, SettingChange, ThresholdKind, UNLIMITED,
    evaluate_availability, exceeded_thresholds,
};
pub use monitor::QuotaMonitor;
pub use tracker::QuotaTracker;

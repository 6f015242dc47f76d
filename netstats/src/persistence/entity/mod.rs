pub mod iface_stats;
pub mod quota_state;
pub mod uid_sim_stats;
pub mod uid_stats;

/// Counters are stored as SQLite integers; values past `i64::MAX` saturate.
pub(crate) fn to_db(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

pub mod error;
pub mod executor;
pub mod safe_map;

pub use error::{CommonError, Result};
pub use executor::{PeriodicTask, TaskExecutor};
pub use safe_map::SafeMap;

use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since the unix epoch, zero if the system clock is before it.
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

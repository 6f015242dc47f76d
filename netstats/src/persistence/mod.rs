mod entity;
mod memory;
mod sqlite;

pub use memory::MemoryGateway;
pub use sqlite::SqliteGateway;

use crate::error::Result;
use crate::model::{ClassificationFlag, TrafficSample};
use crate::quota::NotifyState;
use async_trait::async_trait;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatsTable {
    Uid,
    Iface,
    UidSim,
}

impl StatsTable {
    pub const ALL: [StatsTable; 3] = [StatsTable::Uid, StatsTable::Iface, StatsTable::UidSim];

    pub fn name(self) -> &'static str {
        match self {
            StatsTable::Uid => "uid_stats",
            StatsTable::Iface => "iface_stats",
            StatsTable::UidSim => "uid_sim_stats",
        }
    }
}

/// Row selection for history queries. Time bounds are inclusive.
#[derive(Debug, Clone)]
pub struct RowFilter {
    pub uid: Option<u32>,
    pub iface: Option<String>,
    pub ident: Option<String>,
    pub start: u64,
    pub end: u64,
}

impl Default for RowFilter {
    fn default() -> Self {
        Self {
            uid: None,
            iface: None,
            ident: None,
            start: 0,
            end: u64::MAX,
        }
    }
}

impl RowFilter {
    pub fn range(start: u64, end: u64) -> Self {
        Self {
            start,
            end,
            ..Self::default()
        }
    }

    pub fn uid(mut self, uid: u32) -> Self {
        self.uid = Some(uid);
        self
    }

    pub fn iface(mut self, iface: impl Into<String>) -> Self {
        self.iface = Some(iface.into());
        self
    }

    pub fn ident(mut self, ident: impl Into<String>) -> Self {
        self.ident = Some(ident.into());
        self
    }

    pub fn matches(&self, row: &TrafficSample) -> bool {
        row.date >= self.start
            && row.date <= self.end
            && self.uid.is_none_or(|uid| uid == row.uid)
            && self.iface.as_deref().is_none_or(|iface| iface == row.iface)
            && self.ident.as_deref().is_none_or(|ident| ident == row.ident)
    }
}

/// Durable row storage for flushed traffic and per-SIM notify state.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    async fn write_rows(&self, table: StatsTable, rows: &[TrafficSample]) -> Result<()>;

    /// Drops rows dated before `cutoff`. Safe to repeat.
    async fn delete_older_than(&self, table: StatsTable, cutoff: u64) -> Result<()>;

    /// Copies the store at `source` to `backup`. Failures are logged, never raised.
    async fn backup(&self, source: &Path, backup: &Path) -> bool;

    async fn query_rows(&self, table: StatsTable, filter: &RowFilter) -> Result<Vec<TrafficSample>>;

    /// Re-flags every stored row of `uid`.
    async fn update_uid_flag(&self, uid: u32, flag: ClassificationFlag) -> Result<()>;

    /// Re-flags stored per-uid-SIM rows carrying `from`.
    async fn update_flag(&self, from: ClassificationFlag, to: ClassificationFlag) -> Result<()>;

    async fn clear_all(&self) -> Result<()>;

    async fn load_notify_state(&self, sim_id: u32) -> Result<Option<NotifyState>>;

    async fn save_notify_state(&self, state: &NotifyState) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_bounds_are_inclusive() {
        let filter = RowFilter::range(10, 20).uid(1000);
        let mut row = TrafficSample::new(1000, "wlan0", "", 10);
        assert!(filter.matches(&row));
        row.date = 20;
        assert!(filter.matches(&row));
        row.date = 21;
        assert!(!filter.matches(&row));
        row.date = 15;
        row.uid = 1001;
        assert!(!filter.matches(&row));
    }

    #[test]
    fn filter_combines_iface_and_ident() {
        let filter = RowFilter::default().iface("rmnet0").ident("1");
        assert!(filter.matches(&TrafficSample::new(1, "rmnet0", "1", 5)));
        assert!(!filter.matches(&TrafficSample::new(1, "rmnet0", "2", 5)));
        assert!(!filter.matches(&TrafficSample::new(1, "wlan0", "1", 5)));
    }
}

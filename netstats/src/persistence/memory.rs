use super::{PersistenceGateway, RowFilter, StatsTable};
use crate::error::{Result, StatsError};
use crate::model::{ClassificationFlag, TrafficSample};
use crate::quota::NotifyState;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Default)]
struct Tables {
    uid: Vec<TrafficSample>,
    iface: Vec<TrafficSample>,
    uid_sim: Vec<TrafficSample>,
    notify: HashMap<u32, NotifyState>,
}

impl Tables {
    fn table(&mut self, table: StatsTable) -> &mut Vec<TrafficSample> {
        match table {
            StatsTable::Uid => &mut self.uid,
            StatsTable::Iface => &mut self.iface,
            StatsTable::UidSim => &mut self.uid_sim,
        }
    }
}

/// Gateway keeping every row in process memory.
#[derive(Default)]
pub struct MemoryGateway {
    tables: Mutex<Tables>,
    fail_writes: AtomicBool,
    write_delay: Mutex<Duration>,
    backups: AtomicUsize,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following write fail until switched off.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Makes every following write take `delay` before it lands.
    pub fn set_write_delay(&self, delay: Duration) {
        *self.write_delay.lock() = delay;
    }

    pub fn backup_count(&self) -> usize {
        self.backups.load(Ordering::SeqCst)
    }

    pub fn rows(&self, table: StatsTable) -> Vec<TrafficSample> {
        self.tables.lock().table(table).clone()
    }
}

#[async_trait]
impl PersistenceGateway for MemoryGateway {
    async fn write_rows(&self, table: StatsTable, rows: &[TrafficSample]) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            warn!(table = table.name(), "write rejected");
            return Err(StatsError::Io(format!("write to {} failed", table.name())));
        }
        let delay = *self.write_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.tables.lock().table(table).extend_from_slice(rows);
        debug!(table = table.name(), rows = rows.len(), "rows stored");
        Ok(())
    }

    async fn delete_older_than(&self, table: StatsTable, cutoff: u64) -> Result<()> {
        self.tables.lock().table(table).retain(|r| r.date >= cutoff);
        Ok(())
    }

    async fn backup(&self, _source: &Path, _backup: &Path) -> bool {
        self.backups.fetch_add(1, Ordering::SeqCst);
        true
    }

    async fn query_rows(&self, table: StatsTable, filter: &RowFilter) -> Result<Vec<TrafficSample>> {
        Ok(self
            .tables
            .lock()
            .table(table)
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect())
    }

    async fn update_uid_flag(&self, uid: u32, flag: ClassificationFlag) -> Result<()> {
        let mut tables = self.tables.lock();
        for table in [StatsTable::Uid, StatsTable::UidSim] {
            tables
                .table(table)
                .iter_mut()
                .filter(|r| r.uid == uid)
                .for_each(|r| r.flag = flag);
        }
        Ok(())
    }

    async fn update_flag(&self, from: ClassificationFlag, to: ClassificationFlag) -> Result<()> {
        self.tables
            .lock()
            .uid_sim
            .iter_mut()
            .filter(|r| r.flag == from)
            .for_each(|r| r.flag = to);
        Ok(())
    }

    async fn clear_all(&self) -> Result<()> {
        *self.tables.lock() = Tables::default();
        Ok(())
    }

    async fn load_notify_state(&self, sim_id: u32) -> Result<Option<NotifyState>> {
        Ok(self.tables.lock().notify.get(&sim_id).copied())
    }

    async fn save_notify_state(&self, state: &NotifyState) -> Result<()> {
        self.tables.lock().notify.insert(state.sim_id, *state);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn injected_failure_rejects_writes() {
        let gateway = MemoryGateway::new();
        let row = TrafficSample::new(1, "wlan0", "", 5).with_bytes(1, 1);

        gateway.set_fail_writes(true);
        assert!(gateway.write_rows(StatsTable::Uid, &[row.clone()]).await.is_err());
        assert!(gateway.rows(StatsTable::Uid).is_empty());

        gateway.set_fail_writes(false);
        gateway.write_rows(StatsTable::Uid, &[row]).await.unwrap();
        assert_eq!(gateway.rows(StatsTable::Uid).len(), 1);
    }

    #[tokio::test]
    async fn flag_updates_touch_only_matching_rows() {
        let gateway = MemoryGateway::new();
        gateway
            .write_rows(
                StatsTable::UidSim,
                &[
                    TrafficSample::new(1, "rmnet0", "1", 5).with_flag(ClassificationFlag::Sim),
                    TrafficSample::new(2, "rmnet0", "1", 5).with_flag(ClassificationFlag::Sim2),
                ],
            )
            .await
            .unwrap();

        gateway
            .update_flag(ClassificationFlag::Sim, ClassificationFlag::Uninstalled)
            .await
            .unwrap();
        let rows = gateway.rows(StatsTable::UidSim);
        assert_eq!(rows[0].flag, ClassificationFlag::Uninstalled);
        assert_eq!(rows[1].flag, ClassificationFlag::Sim2);
    }
}

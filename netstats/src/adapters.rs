use crate::config::CountersConfig;
use crate::error::{Result, StatsError};
use crate::model::{BundleInfo, LOOPBACK_IFACE, TrafficSample};
use crate::ports::{BundleInfoSource, Clock, CounterSampler, QuotaNotifier};
use crate::quota::ThresholdKind;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

/// Reads per-interface counters from `/sys/class/net/<iface>/statistics`.
///
/// The tree has no per-uid accounting, so uid dimensions come back empty.
pub struct SysfsCounterSampler {
    root: PathBuf,
    iface_idents: HashMap<String, String>,
    clock: Arc<dyn Clock>,
}

impl SysfsCounterSampler {
    pub fn new(config: &CountersConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            root: PathBuf::from(&config.sysfs_root),
            iface_idents: config.iface_idents.clone(),
            clock,
        }
    }

    async fn read_counter(dir: &Path, name: &str) -> Result<u64> {
        let raw = tokio::fs::read_to_string(dir.join(name)).await?;
        raw.trim()
            .parse()
            .map_err(|e| StatsError::Io(format!("bad counter {}/{}: {}", dir.display(), name, e)))
    }
}

#[async_trait]
impl CounterSampler for SysfsCounterSampler {
    async fn uid_stats(&self) -> Result<Vec<TrafficSample>> {
        Ok(Vec::new())
    }

    async fn uid_sim_stats(&self) -> Result<Vec<TrafficSample>> {
        Ok(Vec::new())
    }

    async fn iface_stats(&self) -> Result<Vec<TrafficSample>> {
        let now = self.clock.now_secs();
        let mut samples = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let iface = entry.file_name().to_string_lossy().to_string();
            if iface == LOOPBACK_IFACE {
                continue;
            }
            let dir = entry.path().join("statistics");
            let counters = (
                Self::read_counter(&dir, "rx_bytes").await,
                Self::read_counter(&dir, "tx_bytes").await,
                Self::read_counter(&dir, "rx_packets").await,
                Self::read_counter(&dir, "tx_packets").await,
            );
            match counters {
                (Ok(rx), Ok(tx), Ok(rx_packets), Ok(tx_packets)) => {
                    let ident = self.iface_idents.get(&iface).cloned().unwrap_or_default();
                    samples.push(
                        TrafficSample::new(0, iface, ident, now)
                            .with_bytes(rx, tx)
                            .with_packets(rx_packets, tx_packets),
                    );
                }
                _ => debug!(iface = %iface, "skipping interface without readable counters"),
            }
        }
        Ok(samples)
    }

    async fn iface_idents(&self) -> Result<HashMap<String, String>> {
        Ok(self.iface_idents.clone())
    }

    async fn delete_uid_counters(&self, _uid: u32) -> Result<()> {
        Ok(())
    }

    async fn clear_all(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct StaticCounters {
    uid: Vec<TrafficSample>,
    uid_sim: Vec<TrafficSample>,
    iface: Vec<TrafficSample>,
    idents: HashMap<String, String>,
    deleted_uids: Vec<u32>,
}

/// Sampler serving counters set by hand.
#[derive(Default)]
pub struct StaticCounterSampler {
    counters: Mutex<StaticCounters>,
}

impl StaticCounterSampler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_uid_stats(&self, samples: Vec<TrafficSample>) {
        self.counters.lock().uid = samples;
    }

    pub fn set_uid_sim_stats(&self, samples: Vec<TrafficSample>) {
        self.counters.lock().uid_sim = samples;
    }

    pub fn set_iface_stats(&self, samples: Vec<TrafficSample>) {
        self.counters.lock().iface = samples;
    }

    pub fn set_iface_idents(&self, idents: HashMap<String, String>) {
        self.counters.lock().idents = idents;
    }

    pub fn deleted_uids(&self) -> Vec<u32> {
        self.counters.lock().deleted_uids.clone()
    }
}

#[async_trait]
impl CounterSampler for StaticCounterSampler {
    async fn uid_stats(&self) -> Result<Vec<TrafficSample>> {
        Ok(self.counters.lock().uid.clone())
    }

    async fn uid_sim_stats(&self) -> Result<Vec<TrafficSample>> {
        Ok(self.counters.lock().uid_sim.clone())
    }

    async fn iface_stats(&self) -> Result<Vec<TrafficSample>> {
        Ok(self.counters.lock().iface.clone())
    }

    async fn iface_idents(&self) -> Result<HashMap<String, String>> {
        Ok(self.counters.lock().idents.clone())
    }

    async fn delete_uid_counters(&self, uid: u32) -> Result<()> {
        let mut counters = self.counters.lock();
        counters.uid.retain(|s| s.uid != uid);
        counters.uid_sim.retain(|s| s.uid != uid);
        counters.deleted_uids.push(uid);
        Ok(())
    }

    async fn clear_all(&self) -> Result<()> {
        let mut counters = self.counters.lock();
        counters.uid.clear();
        counters.uid_sim.clear();
        counters.iface.clear();
        Ok(())
    }
}

/// Bundle listing fixed at construction.
pub struct StaticBundleSource {
    bundles: Mutex<Vec<BundleInfo>>,
    unavailable: AtomicBool,
}

impl StaticBundleSource {
    pub fn new(bundles: Vec<BundleInfo>) -> Self {
        Self {
            bundles: Mutex::new(bundles),
            unavailable: AtomicBool::new(false),
        }
    }

    pub fn set_bundles(&self, bundles: Vec<BundleInfo>) {
        *self.bundles.lock() = bundles;
    }

    /// Makes every query fail, as a crashed package service would.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StatsError::Io("bundle service unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl BundleInfoSource for StaticBundleSource {
    async fn bundles(&self) -> Result<Vec<BundleInfo>> {
        self.check()?;
        Ok(self.bundles.lock().clone())
    }

    async fn bundle(&self, uid: u32) -> Result<Option<BundleInfo>> {
        self.check()?;
        Ok(self.bundles.lock().iter().find(|b| b.uid == uid).cloned())
    }
}

/// Writes each quota alert to the log.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl QuotaNotifier for LogNotifier {
    async fn notify(&self, sim_id: u32, kind: ThresholdKind, notify_type: u8) {
        warn!(sim_id, ?kind, notify_type, "traffic quota threshold reached");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::SystemClock;
    use tempfile::tempdir;

    fn write_iface(root: &Path, iface: &str, rx: u64, tx: u64) {
        let dir = root.join(iface).join("statistics");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("rx_bytes"), format!("{rx}\n")).unwrap();
        std::fs::write(dir.join("tx_bytes"), format!("{tx}\n")).unwrap();
        std::fs::write(dir.join("rx_packets"), "3\n").unwrap();
        std::fs::write(dir.join("tx_packets"), "4\n").unwrap();
    }

    #[tokio::test]
    async fn sysfs_sampler_reads_interfaces_and_skips_loopback() {
        let root = tempdir().unwrap();
        write_iface(root.path(), "wlan0", 100, 50);
        write_iface(root.path(), "rmnet0", 7, 8);
        write_iface(root.path(), "lo", 999, 999);
        std::fs::create_dir_all(root.path().join("dummy0")).unwrap();

        let config = CountersConfig {
            sysfs_root: root.path().display().to_string(),
            iface_idents: HashMap::from([("rmnet0".to_string(), "1".to_string())]),
            ..CountersConfig::default()
        };
        let sampler = SysfsCounterSampler::new(&config, Arc::new(SystemClock));

        let mut samples = sampler.iface_stats().await.unwrap();
        samples.sort_by(|a, b| a.iface.cmp(&b.iface));
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].iface, "rmnet0");
        assert_eq!(samples[0].ident, "1");
        assert_eq!(samples[1].rx_bytes, 100);
        assert_eq!(samples[1].tx_packets, 4);
        assert!(sampler.uid_stats().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unavailable_bundle_source_errors() {
        let source = StaticBundleSource::new(vec![BundleInfo {
            uid: 1,
            package_name: "a".into(),
            install_source: "default".into(),
            install_time: 0,
        }]);
        assert!(source.bundle(1).await.unwrap().is_some());
        source.set_unavailable(true);
        assert!(source.bundles().await.is_err());
    }
}

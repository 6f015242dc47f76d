//! Seams to the collaborators the accounting core does not own.

use crate::error::Result;
use crate::model::{BundleInfo, TrafficSample};
use crate::persistence::PersistenceGateway;
use crate::quota::ThresholdKind;
use async_trait::async_trait;
use chrono::{DateTime, Duration, FixedOffset, Local};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Every external collaborator the service is wired with.
#[derive(Clone)]
pub struct Ports {
    pub sampler: Arc<dyn CounterSampler>,
    pub bundles: Arc<dyn BundleInfoSource>,
    pub gateway: Arc<dyn PersistenceGateway>,
    pub notifier: Arc<dyn QuotaNotifier>,
    pub clock: Arc<dyn Clock>,
}

/// Cumulative kernel counters.
#[async_trait]
pub trait CounterSampler: Send + Sync {
    async fn uid_stats(&self) -> Result<Vec<TrafficSample>>;

    async fn uid_sim_stats(&self) -> Result<Vec<TrafficSample>>;

    async fn iface_stats(&self) -> Result<Vec<TrafficSample>>;

    /// Carrier ident of each interface currently known.
    async fn iface_idents(&self) -> Result<HashMap<String, String>>;

    async fn delete_uid_counters(&self, uid: u32) -> Result<()>;

    async fn clear_all(&self) -> Result<()>;
}

#[async_trait]
pub trait BundleInfoSource: Send + Sync {
    async fn bundles(&self) -> Result<Vec<BundleInfo>>;

    async fn bundle(&self, uid: u32) -> Result<Option<BundleInfo>>;
}

/// Renders quota alerts to the user.
#[async_trait]
pub trait QuotaNotifier: Send + Sync {
    async fn notify(&self, sim_id: u32, kind: ThresholdKind, notify_type: u8);
}

pub trait StatsChangeListener: Send + Sync {
    fn on_iface_stats_changed(&self, iface: &str);

    fn on_uid_stats_changed(&self, iface: &str, uid: u32);
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<FixedOffset>;

    fn now_secs(&self) -> u64 {
        self.now().timestamp().max(0) as u64
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<FixedOffset> {
        Local::now().fixed_offset()
    }
}

/// Clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<DateTime<FixedOffset>>,
}

impl ManualClock {
    pub fn new(now: DateTime<FixedOffset>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<FixedOffset>) {
        *self.now.lock() = now;
    }

    pub fn advance_secs(&self, secs: i64) {
        let mut now = self.now.lock();
        *now += Duration::seconds(secs);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<FixedOffset> {
        *self.now.lock()
    }
}

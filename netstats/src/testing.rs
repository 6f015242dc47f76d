//! Deterministic wiring shared by the unit tests.

use crate::adapters::{StaticBundleSource, StaticCounterSampler};
use crate::config::{ClassifierConfig, StatsConfig};
use crate::model::TrafficSample;
use crate::persistence::MemoryGateway;
use crate::ports::{ManualClock, Ports, QuotaNotifier};
use crate::quota::ThresholdKind;
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use parking_lot::Mutex;
use std::sync::Arc;

pub fn at(rfc3339: &str) -> DateTime<FixedOffset> {
    DateTime::parse_from_rfc3339(rfc3339).unwrap()
}

pub fn sample(uid: u32, iface: &str, ident: &str, rx: u64, tx: u64) -> TrafficSample {
    TrafficSample::new(uid, iface, ident, 0)
        .with_bytes(rx, tx)
        .with_packets(1, 1)
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub alerts: Mutex<Vec<(u32, ThresholdKind)>>,
}

#[async_trait]
impl QuotaNotifier for RecordingNotifier {
    async fn notify(&self, sim_id: u32, kind: ThresholdKind, _notify_type: u8) {
        self.alerts.lock().push((sim_id, kind));
    }
}

pub struct Harness {
    pub config: StatsConfig,
    pub sampler: Arc<StaticCounterSampler>,
    pub bundles: Arc<StaticBundleSource>,
    pub gateway: Arc<MemoryGateway>,
    pub notifier: Arc<RecordingNotifier>,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    pub fn new() -> Self {
        let config = StatsConfig {
            flush_threshold_bytes: 0,
            classifier: ClassifierConfig {
                sim_packages: vec!["com.carrier.sim".into()],
                sim2_packages: vec!["com.carrier.sim2".into()],
                ..ClassifierConfig::default()
            },
            ..StatsConfig::default()
        };
        Self::with_config(config)
    }

    pub fn with_config(config: StatsConfig) -> Self {
        Self {
            config,
            sampler: Arc::new(StaticCounterSampler::new()),
            bundles: Arc::new(StaticBundleSource::new(Vec::new())),
            gateway: Arc::new(MemoryGateway::new()),
            notifier: Arc::new(RecordingNotifier::default()),
            clock: Arc::new(ManualClock::new(at("2024-03-15T12:00:00+00:00"))),
        }
    }

    pub fn ports(&self) -> Ports {
        Ports {
            sampler: self.sampler.clone(),
            bundles: self.bundles.clone(),
            gateway: self.gateway.clone(),
            notifier: self.notifier.clone(),
            clock: self.clock.clone(),
        }
    }
}

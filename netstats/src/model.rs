use serde::{Deserialize, Serialize};
use std::fmt;

/// Divides a uid into the owning OS user id.
pub const USER_ID_DIVISOR: u32 = 200_000;

/// Synthetic uids used as aggregation buckets.
pub const SIM_UID: u32 = u32::MAX - 3;
pub const SIM2_UID: u32 = u32::MAX - 4;
pub const UNINSTALLED_UID: u32 = u32::MAX - 1;
pub const IPTABLES_UID: u32 = u32::MAX - 2;
pub const DEFAULT_ACCOUNT_UID: u32 = u32::MAX - 5;
pub const OTHER_ACCOUNT_UID: u32 = u32::MAX - 6;

pub const LOOPBACK_IFACE: &str = "lo";

pub const DAY_SECS: u64 = 24 * 60 * 60;

/// True for the aggregation buckets above, which belong to no app.
pub fn is_synthetic_uid(uid: u32) -> bool {
    uid >= OTHER_ACCOUNT_UID
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationFlag {
    #[default]
    Default,
    Sim,
    Sim2,
    SimBasic,
    Sim2Basic,
    Uninstalled,
}

impl ClassificationFlag {
    pub fn as_i32(self) -> i32 {
        match self {
            Self::Default => 0,
            Self::Sim => 1,
            Self::Sim2 => 2,
            Self::SimBasic => 3,
            Self::Sim2Basic => 4,
            Self::Uninstalled => 5,
        }
    }

    pub fn from_i32(value: i32) -> Self {
        match value {
            1 => Self::Sim,
            2 => Self::Sim2,
            3 => Self::SimBasic,
            4 => Self::Sim2Basic,
            5 => Self::Uninstalled,
            _ => Self::Default,
        }
    }

    pub fn is_sim_family(self) -> bool {
        matches!(
            self,
            Self::Sim | Self::Sim2 | Self::SimBasic | Self::Sim2Basic
        )
    }
}

/// Identity of one logical counter stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CompositeKey {
    pub uid: u32,
    pub iface: String,
    pub ident: String,
    pub flag: ClassificationFlag,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficSample {
    pub uid: u32,
    pub iface: String,
    /// Carrier identity; empty for non-cellular traffic.
    pub ident: String,
    /// Unix seconds.
    pub date: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub flag: ClassificationFlag,
    pub user_id: u32,
}

impl TrafficSample {
    pub fn new(uid: u32, iface: impl Into<String>, ident: impl Into<String>, date: u64) -> Self {
        Self {
            uid,
            iface: iface.into(),
            ident: ident.into(),
            date,
            user_id: uid / USER_ID_DIVISOR,
            ..Default::default()
        }
    }

    pub fn with_bytes(mut self, rx_bytes: u64, tx_bytes: u64) -> Self {
        self.rx_bytes = rx_bytes;
        self.tx_bytes = tx_bytes;
        self
    }

    pub fn with_packets(mut self, rx_packets: u64, tx_packets: u64) -> Self {
        self.rx_packets = rx_packets;
        self.tx_packets = tx_packets;
        self
    }

    pub fn with_flag(mut self, flag: ClassificationFlag) -> Self {
        self.flag = flag;
        self
    }

    pub fn key(&self) -> CompositeKey {
        CompositeKey {
            uid: self.uid,
            iface: self.iface.clone(),
            ident: self.ident.clone(),
            flag: self.flag,
        }
    }

    pub fn same_stream(&self, other: &TrafficSample) -> bool {
        self.uid == other.uid
            && self.flag == other.flag
            && self.iface == other.iface
            && self.ident == other.ident
    }

    pub fn has_no_data(&self) -> bool {
        self.rx_bytes == 0 && self.tx_bytes == 0 && self.rx_packets == 0 && self.tx_packets == 0
    }

    pub fn total_bytes(&self) -> u64 {
        self.rx_bytes.saturating_add(self.tx_bytes)
    }

    /// Adds counters of a sample from the same stream.
    pub fn absorb(&mut self, other: &TrafficSample) {
        self.rx_bytes = self.rx_bytes.saturating_add(other.rx_bytes);
        self.tx_bytes = self.tx_bytes.saturating_add(other.tx_bytes);
        self.rx_packets = self.rx_packets.saturating_add(other.rx_packets);
        self.tx_packets = self.tx_packets.saturating_add(other.tx_packets);
        self.date = self.date.max(other.date);
    }

    pub fn totals(&self) -> Totals {
        Totals {
            rx_bytes: self.rx_bytes,
            tx_bytes: self.tx_bytes,
            rx_packets: self.rx_packets,
            tx_packets: self.tx_packets,
        }
    }
}

impl fmt::Display for TrafficSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "uid={} iface={} ident={} flag={:?} rx={} tx={}",
            self.uid, self.iface, self.ident, self.flag, self.rx_bytes, self.tx_bytes
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Totals {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub tx_packets: u64,
}

impl Totals {
    pub fn add_sample(&mut self, sample: &TrafficSample) {
        self.rx_bytes = self.rx_bytes.saturating_add(sample.rx_bytes);
        self.tx_bytes = self.tx_bytes.saturating_add(sample.tx_bytes);
        self.rx_packets = self.rx_packets.saturating_add(sample.rx_packets);
        self.tx_packets = self.tx_packets.saturating_add(sample.tx_packets);
    }

    pub fn total_bytes(&self) -> u64 {
        self.rx_bytes.saturating_add(self.tx_bytes)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeBucketedTotals {
    pub start_time: u64,
    pub end_time: u64,
    pub totals: Totals,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleInfo {
    pub uid: u32,
    pub package_name: String,
    pub install_source: String,
    /// Unix seconds.
    pub install_time: u64,
}

impl BundleInfo {
    pub fn is_valid(&self) -> bool {
        !self.package_name.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BearerType {
    Cellular,
    Wifi,
    Ethernet,
    Other,
}

/// Traffic an app reports on its own behalf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushStatsInfo {
    pub uid: u32,
    pub iface: String,
    pub sim_id: u32,
    pub bearer: BearerType,
    pub begin_time: u64,
    pub end_time: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

impl PushStatsInfo {
    pub fn to_sample(&self) -> TrafficSample {
        let ident = if self.bearer == BearerType::Cellular {
            self.sim_id.to_string()
        } else {
            String::new()
        };
        TrafficSample::new(self.uid, self.iface.clone(), ident, self.end_time)
            .with_bytes(self.rx_bytes, self.tx_bytes)
            .with_packets(u64::from(self.rx_bytes > 0), u64::from(self.tx_bytes > 0))
    }
}

/// Cumulative counters of a tethering/sharing interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedTrafficInfo {
    pub iface: String,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub tx_packets: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NetworkSelector {
    /// Cellular traffic of a SIM slot; resolved to its ident.
    Sim { sim_id: u32 },
    Ident { ident: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkQuery {
    #[serde(flatten)]
    pub network: NetworkSelector,
    pub start: u64,
    pub end: u64,
}

impl NetworkQuery {
    pub fn ident(&self) -> String {
        match &self.network {
            NetworkSelector::Sim { sim_id } => sim_id.to_string(),
            NetworkSelector::Ident { ident } => ident.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_id_follows_uid() {
        let sample = TrafficSample::new(20_010_042, "wlan0", "", 0);
        assert_eq!(sample.user_id, 100);
    }

    #[test]
    fn flag_is_part_of_stream_identity() {
        let a = TrafficSample::new(1000, "rmnet0", "1", 0);
        let b = a.clone().with_flag(ClassificationFlag::Sim);
        assert!(!a.same_stream(&b));
        assert_ne!(a.key(), b.key());
        assert!(a.same_stream(&a.clone().with_bytes(5, 5)));
    }

    #[test]
    fn pushed_info_uses_sim_ident_only_for_cellular() {
        let mut info = PushStatsInfo {
            uid: 1000,
            iface: "rmnet0".into(),
            sim_id: 2,
            bearer: BearerType::Cellular,
            begin_time: 10,
            end_time: 20,
            rx_bytes: 300,
            tx_bytes: 0,
        };
        let sample = info.to_sample();
        assert_eq!(sample.ident, "2");
        assert_eq!(sample.date, 20);
        assert_eq!((sample.rx_packets, sample.tx_packets), (1, 0));

        info.bearer = BearerType::Wifi;
        assert_eq!(info.to_sample().ident, "");
    }

    #[test]
    fn unknown_flag_code_reads_as_default() {
        assert_eq!(ClassificationFlag::from_i32(99), ClassificationFlag::Default);
        assert_eq!(ClassificationFlag::from_i32(5), ClassificationFlag::Uninstalled);
    }
}

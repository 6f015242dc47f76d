use crate::delta::compute_delta;
use crate::model::{IPTABLES_UID, SharedTrafficInfo, TrafficSample};
use parking_lot::Mutex;
use tracing::debug;

/// Tethered traffic accounting, billed to the carrier under [`IPTABLES_UID`].
///
/// Only present when the shared-traffic capability is enabled.
pub struct SharedTrafficTracker {
    cellular_prefix: String,
    last: Mutex<Vec<TrafficSample>>,
}

impl SharedTrafficTracker {
    pub fn new(cellular_prefix: impl Into<String>) -> Self {
        Self {
            cellular_prefix: cellular_prefix.into(),
            last: Mutex::new(Vec::new()),
        }
    }

    /// Delta of a cumulative sharing report, or None when there is nothing to bill.
    pub fn delta(&self, info: &SharedTrafficInfo, ident: &str, now: u64) -> Option<TrafficSample> {
        if !info.iface.starts_with(&self.cellular_prefix) {
            debug!(iface = %info.iface, "shared traffic on non-cellular iface ignored");
            return None;
        }
        let sample = TrafficSample::new(IPTABLES_UID, info.iface.clone(), ident, now)
            .with_bytes(info.rx_bytes, info.tx_bytes)
            .with_packets(info.rx_packets, info.tx_packets);

        let mut last = self.last.lock();
        let delta = compute_delta(&sample, &last, now);
        last.retain(|s| !s.same_stream(&sample));
        last.push(sample);
        (!delta.has_no_data()).then_some(delta)
    }

    pub fn reset(&self) {
        self.last.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(iface: &str, rx: u64, tx: u64) -> SharedTrafficInfo {
        SharedTrafficInfo {
            iface: iface.into(),
            rx_bytes: rx,
            tx_bytes: tx,
            rx_packets: 0,
            tx_packets: 0,
        }
    }

    #[test]
    fn cellular_reports_become_deltas() {
        let tracker = SharedTrafficTracker::new("rmnet");
        let first = tracker.delta(&report("rmnet0", 100, 10), "1", 5).unwrap();
        assert_eq!((first.uid, first.rx_bytes), (IPTABLES_UID, 100));

        let second = tracker.delta(&report("rmnet0", 160, 10), "1", 6).unwrap();
        assert_eq!((second.rx_bytes, second.tx_bytes), (60, 0));

        assert!(tracker.delta(&report("rmnet0", 160, 10), "1", 7).is_none());
    }

    #[test]
    fn wifi_reports_are_ignored() {
        let tracker = SharedTrafficTracker::new("rmnet");
        assert!(tracker.delta(&report("wlan1", 100, 10), "", 5).is_none());
    }
}

use crate::model::{ClassificationFlag, CompositeKey, TrafficSample};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dimension {
    PerInterface,
    PerUid,
    PerUidSim,
    /// App-reported stats waiting to be merged into PerUid.
    PushedByApp,
    /// Every app-reported sample, merged by uid and ident.
    PushedAll,
}

impl Dimension {
    pub const ALL: [Dimension; 5] = [
        Dimension::PerInterface,
        Dimension::PerUid,
        Dimension::PerUidSim,
        Dimension::PushedByApp,
        Dimension::PushedAll,
    ];

    fn index(self) -> usize {
        match self {
            Dimension::PerInterface => 0,
            Dimension::PerUid => 1,
            Dimension::PerUidSim => 2,
            Dimension::PushedByApp => 3,
            Dimension::PushedAll => 4,
        }
    }

    fn merge_key(self, sample: &TrafficSample) -> CompositeKey {
        match self {
            Dimension::PushedAll => CompositeKey {
                uid: sample.uid,
                iface: String::new(),
                ident: sample.ident.clone(),
                flag: ClassificationFlag::Default,
            },
            _ => sample.key(),
        }
    }
}

#[derive(Default)]
struct Bucket {
    rows: Vec<TrafficSample>,
    index: HashMap<CompositeKey, usize>,
    pending_bytes: u64,
}

impl Bucket {
    fn push(&mut self, key: CompositeKey, sample: TrafficSample) {
        self.pending_bytes = self.pending_bytes.saturating_add(sample.total_bytes());
        match self.index.get(&key) {
            Some(&at) => self.rows[at].absorb(&sample),
            None => {
                self.index.insert(key, self.rows.len());
                self.rows.push(sample);
            }
        }
    }

    fn take(&mut self) -> Vec<TrafficSample> {
        self.index.clear();
        self.pending_bytes = 0;
        std::mem::take(&mut self.rows)
    }
}

/// Deltas accumulated since the last flush, one bucket per dimension.
///
/// Not synchronized on its own; the owner keeps it behind one lock so a
/// snapshot never interleaves with a push.
#[derive(Default)]
pub struct StatsAccumulator {
    buckets: [Bucket; 5],
}

impl StatsAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `sample` to the entry with the same key, or appends it.
    pub fn push(&mut self, dimension: Dimension, sample: TrafficSample) {
        let key = dimension.merge_key(&sample);
        self.buckets[dimension.index()].push(key, sample);
    }

    /// Moves the whole bucket out, leaving it empty.
    pub fn snapshot_and_reset(&mut self, dimension: Dimension) -> Vec<TrafficSample> {
        self.buckets[dimension.index()].take()
    }

    /// Moves only the rows of `uid` out of the bucket.
    pub fn snapshot_and_reset_uid(&mut self, dimension: Dimension, uid: u32) -> Vec<TrafficSample> {
        let bucket = &mut self.buckets[dimension.index()];
        let (taken, kept): (Vec<_>, Vec<_>) = bucket.take().into_iter().partition(|s| s.uid == uid);
        for sample in kept {
            self.push(dimension, sample);
        }
        taken
    }

    /// Puts rows back after a failed flush.
    pub fn restore(&mut self, dimension: Dimension, rows: Vec<TrafficSample>) {
        for sample in rows {
            self.push(dimension, sample);
        }
    }

    pub fn rows(&self, dimension: Dimension) -> &[TrafficSample] {
        &self.buckets[dimension.index()].rows
    }

    pub fn pending_bytes(&self, dimension: Dimension) -> u64 {
        self.buckets[dimension.index()].pending_bytes
    }

    pub fn is_empty(&self, dimension: Dimension) -> bool {
        self.buckets[dimension.index()].rows.is_empty()
    }

    /// Drops every row of `uid` in every dimension.
    pub fn remove_uid(&mut self, uid: u32) {
        for dimension in Dimension::ALL {
            self.snapshot_and_reset_uid(dimension, uid);
        }
    }

    pub fn clear(&mut self) {
        for dimension in Dimension::ALL {
            self.snapshot_and_reset(dimension);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(uid: u32, iface: &str, ident: &str, rx: u64, tx: u64) -> TrafficSample {
        TrafficSample::new(uid, iface, ident, 10).with_bytes(rx, tx)
    }

    #[test]
    fn push_merges_by_composite_key() {
        let mut acc = StatsAccumulator::new();
        acc.push(Dimension::PerUid, sample(1000, "wlan0", "", 100, 50));
        acc.push(Dimension::PerUid, sample(1000, "wlan0", "", 20, 5));
        acc.push(Dimension::PerUid, sample(1000, "rmnet0", "1", 1, 1));

        let rows = acc.rows(Dimension::PerUid);
        assert_eq!(rows.len(), 2);
        assert_eq!((rows[0].rx_bytes, rows[0].tx_bytes), (120, 55));
        assert_eq!(acc.pending_bytes(Dimension::PerUid), 177);
    }

    #[test]
    fn snapshot_is_exactly_the_pushes_since_reset() {
        let mut acc = StatsAccumulator::new();
        for i in 0..10 {
            acc.push(Dimension::PerInterface, sample(0, "wlan0", "", i, 1));
        }
        let first = acc.snapshot_and_reset(Dimension::PerInterface);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].rx_bytes, 45);
        assert_eq!(first[0].tx_bytes, 10);
        assert!(acc.is_empty(Dimension::PerInterface));
        assert_eq!(acc.pending_bytes(Dimension::PerInterface), 0);

        acc.push(Dimension::PerInterface, sample(0, "wlan0", "", 3, 3));
        let second = acc.snapshot_and_reset(Dimension::PerInterface);
        assert_eq!(second[0].rx_bytes, 3);
    }

    #[test]
    fn uid_snapshot_leaves_other_uids() {
        let mut acc = StatsAccumulator::new();
        acc.push(Dimension::PerUid, sample(1000, "wlan0", "", 1, 1));
        acc.push(Dimension::PerUid, sample(1001, "wlan0", "", 2, 2));
        acc.push(Dimension::PerUid, sample(1000, "rmnet0", "1", 3, 3));

        let taken = acc.snapshot_and_reset_uid(Dimension::PerUid, 1000);
        assert_eq!(taken.len(), 2);
        assert_eq!(acc.rows(Dimension::PerUid).len(), 1);
        assert_eq!(acc.pending_bytes(Dimension::PerUid), 4);

        acc.push(Dimension::PerUid, sample(1001, "wlan0", "", 1, 1));
        assert_eq!(acc.rows(Dimension::PerUid)[0].rx_bytes, 3);
    }

    #[test]
    fn pushed_all_merges_across_interfaces() {
        let mut acc = StatsAccumulator::new();
        acc.push(Dimension::PushedAll, sample(1000, "wlan0", "1", 1, 0));
        acc.push(Dimension::PushedAll, sample(1000, "rmnet0", "1", 2, 0));
        acc.push(Dimension::PushedAll, sample(1000, "rmnet0", "2", 4, 0));
        assert_eq!(acc.rows(Dimension::PushedAll).len(), 2);
        assert_eq!(acc.rows(Dimension::PushedAll)[0].rx_bytes, 3);
    }

    #[test]
    fn restore_after_failed_flush_keeps_everything() {
        let mut acc = StatsAccumulator::new();
        acc.push(Dimension::PerUidSim, sample(1000, "rmnet0", "1", 10, 10));
        let rows = acc.snapshot_and_reset(Dimension::PerUidSim);
        acc.restore(Dimension::PerUidSim, rows);
        acc.push(Dimension::PerUidSim, sample(1000, "rmnet0", "1", 5, 5));
        assert_eq!(acc.rows(Dimension::PerUidSim).len(), 1);
        assert_eq!(acc.pending_bytes(Dimension::PerUidSim), 30);
    }
}

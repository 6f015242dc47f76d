use crate::model::TrafficSample;

/// Turns a cumulative reading into the traffic seen since its predecessor.
///
/// The predecessor is the sample in `previous` with the same composite key.
/// Without one, `current` is a baseline and comes back unchanged. A counter
/// that went backwards means the stream was reset, so the lower reading is
/// itself the traffic since the reset and is returned as-is.
pub fn compute_delta(current: &TrafficSample, previous: &[TrafficSample], now: u64) -> TrafficSample {
    let Some(last) = previous.iter().find(|p| p.same_stream(current)) else {
        return current.clone();
    };

    if counters_went_backwards(current, last) {
        return current.clone();
    }

    TrafficSample {
        date: now,
        rx_bytes: current.rx_bytes - last.rx_bytes,
        tx_bytes: current.tx_bytes - last.tx_bytes,
        rx_packets: current.rx_packets - last.rx_packets,
        tx_packets: current.tx_packets - last.tx_packets,
        ..current.clone()
    }
}

fn counters_went_backwards(current: &TrafficSample, last: &TrafficSample) -> bool {
    current.rx_bytes < last.rx_bytes
        || current.tx_bytes < last.tx_bytes
        || current.rx_packets < last.rx_packets
        || current.tx_packets < last.tx_packets
}

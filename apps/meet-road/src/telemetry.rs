//! Prometheus counters for the signaling loop. Without an installed recorder
//! (tests, embedded use) every call is a no-op.

use metrics::{counter, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::warn;

pub fn install_recorder() -> Option<PrometheusHandle> {
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(err) => {
            warn!("metrics recorder unavailable: {err}");
            None
        }
    }
}

pub fn connection_opened() {
    counter!("meet_road_connections_opened_total").increment(1);
    gauge!("meet_road_connections").increment(1.0);
}

pub fn connection_closed() {
    gauge!("meet_road_connections").decrement(1.0);
}

pub fn set_room_count(rooms: usize) {
    gauge!("meet_road_rooms").set(rooms as f64);
}

pub fn chat_relayed() {
    counter!("meet_road_chat_messages_total").increment(1);
}

pub fn signal_relayed() {
    counter!("meet_road_signals_relayed_total").increment(1);
}

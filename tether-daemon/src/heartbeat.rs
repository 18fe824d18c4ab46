//! Lightweight keepalive over the service multiplexer.
//!
//! Connected peers exchange empty heartbeat records so the heard-from
//! timestamps keep advancing on otherwise quiet links. The mux counts
//! any inbound frame as liveness, so receiving needs no handling here.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use tracing::trace;

use tether_stream::{RawMessage, Service, ServiceMux};
use tether_transfer::wire::SERVICE_HEARTBEAT;

/// Heartbeat every this many one-second ticks.
const PERIOD_TICKS: u64 = 20;

pub struct HeartbeatService {
    mux: Arc<ServiceMux>,
    ticks: AtomicU64,
}

impl HeartbeatService {
    pub fn new(mux: Arc<ServiceMux>) -> Arc<Self> {
        Arc::new(Self {
            mux,
            ticks: AtomicU64::new(0),
        })
    }
}

impl Service for HeartbeatService {
    fn service_id(&self) -> u16 {
        SERVICE_HEARTBEAT
    }

    fn tick(&self) {
        let count = self.ticks.fetch_add(1, Ordering::Relaxed);
        if count % PERIOD_TICKS != 0 {
            return;
        }
        for peer in self.mux.attached_peers() {
            let _ = self.mux.queue_message(peer, SERVICE_HEARTBEAT, 0, &[]);
        }
    }

    fn receive(&self, msg: RawMessage) {
        trace!("heartbeat from {}", msg.from);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ticks_without_peers_are_harmless() {
        let mux = ServiceMux::new();
        let heartbeat = HeartbeatService::new(mux);
        for _ in 0..PERIOD_TICKS * 2 {
            heartbeat.tick();
        }
    }
}

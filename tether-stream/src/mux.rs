//! Typed service multiplexer.
//!
//! Every wire record starts with a 2-byte service id and a 2-byte
//! subtype; the body is opaque to this layer. Inbound frames are
//! dispatched to the registered service; outbound records are queued per
//! peer and streamed with a fair-share byte budget so one busy transfer
//! cannot starve the control services or the other peers.

use std::{
    collections::VecDeque,
    sync::Arc,
    time::Duration,
};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use tether_core::DirectoryId;

use crate::handshake::SecureChannel;

/// Bytes each peer may stream per balancing round.
const BALANCE_QUANTUM: usize = 64 * 1024;
/// Pause between balancing rounds.
const BALANCE_INTERVAL: Duration = Duration::from_millis(10);

/// An inbound record, addressed to a service by the sender.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub from: DirectoryId,
    pub subtype: u16,
    pub body: Vec<u8>,
}

/// A registered protocol service.
///
/// `tick` is driven from the main loop; `receive` is invoked from the
/// per-connection read task in send order.
pub trait Service: Send + Sync {
    fn service_id(&self) -> u16;
    fn tick(&self) {}
    fn receive(&self, msg: RawMessage);
}

/// Prefix a body with its service id and subtype.
pub fn encode_record(service: u16, subtype: u16, body: &[u8]) -> Vec<u8> {
    let mut record = Vec::with_capacity(4 + body.len());
    record.extend_from_slice(&service.to_be_bytes());
    record.extend_from_slice(&subtype.to_be_bytes());
    record.extend_from_slice(body);
    record
}

/// Split a record into (service, subtype, body).
pub fn decode_record(data: &[u8]) -> Option<(u16, u16, &[u8])> {
    if data.len() < 4 {
        return None;
    }
    let service = u16::from_be_bytes([data[0], data[1]]);
    let subtype = u16::from_be_bytes([data[2], data[3]]);
    Some((service, subtype, &data[4..]))
}

struct PeerEntry {
    channel: Arc<SecureChannel>,
    queue: Mutex<VecDeque<Vec<u8>>>,
}

type PeerCallback = Box<dyn Fn(DirectoryId) + Send + Sync>;

/// Registry of services plus the set of live encrypted channels.
pub struct ServiceMux {
    services: DashMap<u16, Arc<dyn Service>>,
    peers: DashMap<DirectoryId, Arc<PeerEntry>>,
    on_disconnect: Mutex<Option<PeerCallback>>,
    on_heard: Mutex<Option<PeerCallback>>,
}

impl ServiceMux {
    pub fn new() -> Arc<Self> {
        let mux = Arc::new(Self {
            services: DashMap::new(),
            peers: DashMap::new(),
            on_disconnect: Mutex::new(None),
            on_heard: Mutex::new(None),
        });
        mux.clone().spawn_streamer();
        mux
    }

    /// Install a service. Replaces any previous registration of that id.
    pub fn register_service(&self, service: Arc<dyn Service>) {
        self.services.insert(service.service_id(), service);
    }

    /// Invoked when a peer's connection dies for any reason.
    pub fn set_on_disconnect(&self, callback: impl Fn(DirectoryId) + Send + Sync + 'static) {
        *self.on_disconnect.lock() = Some(Box::new(callback));
    }

    /// Invoked whenever any frame arrives from a peer (feeds the
    /// heard-from timestamps).
    pub fn set_on_heard(&self, callback: impl Fn(DirectoryId) + Send + Sync + 'static) {
        *self.on_heard.lock() = Some(Box::new(callback));
    }

    /// Adopt a freshly handshaken channel for `friend`, spawning its read
    /// task. Any previous channel for the friend is closed first.
    pub fn attach_peer(self: &Arc<Self>, friend: DirectoryId, channel: Arc<SecureChannel>) {
        if let Some((_, old)) = self.peers.remove(&friend) {
            old.channel.close();
        }
        let entry = Arc::new(PeerEntry {
            channel: channel.clone(),
            queue: Mutex::new(VecDeque::new()),
        });
        self.peers.insert(friend, entry);
        self.clone().spawn_reader(friend, channel);
    }

    /// Close and remove a peer's channel, if any.
    pub fn detach_peer(&self, friend: DirectoryId) {
        if let Some((_, entry)) = self.peers.remove(&friend) {
            entry.channel.close();
        }
    }

    pub fn is_attached(&self, friend: DirectoryId) -> bool {
        self.peers.contains_key(&friend)
    }

    pub fn attached_peers(&self) -> Vec<DirectoryId> {
        self.peers.iter().map(|entry| *entry.key()).collect()
    }

    /// Queue a record for a connected friend. Fails when the friend has no
    /// live channel so the caller can fall back to its offline queue.
    pub fn queue_message(
        &self,
        friend: DirectoryId,
        service: u16,
        subtype: u16,
        body: &[u8],
    ) -> Result<(), tether_core::Error> {
        let Some(entry) = self.peers.get(&friend) else {
            return Err(tether_core::Error::ConnectionLost(format!(
                "friend {friend} is not connected"
            )));
        };
        entry
            .queue
            .lock()
            .push_back(encode_record(service, subtype, body));
        Ok(())
    }

    /// Drive every registered service's periodic work.
    pub fn tick_services(&self) {
        for service in self.services.iter() {
            service.value().tick();
        }
    }

    /// Round-robin streamer: each round every peer may send up to
    /// [`BALANCE_QUANTUM`] bytes from its queue.
    fn spawn_streamer(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(BALANCE_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let entries: Vec<(DirectoryId, Arc<PeerEntry>)> = self
                    .peers
                    .iter()
                    .map(|e| (*e.key(), e.value().clone()))
                    .collect();
                for (friend, entry) in entries {
                    let mut budget = BALANCE_QUANTUM;
                    loop {
                        let record = {
                            let mut queue = entry.queue.lock();
                            match queue.front() {
                                Some(front) if front.len() <= budget => queue.pop_front(),
                                // An oversized first record still goes out
                                // alone on a fresh budget.
                                Some(front) if budget == BALANCE_QUANTUM && front.len() > budget => {
                                    queue.pop_front()
                                }
                                _ => None,
                            }
                        };
                        let Some(record) = record else { break };
                        budget = budget.saturating_sub(record.len());
                        if let Err(e) = entry.channel.send_frame(&record).await {
                            debug!("send to {friend} failed: {e}");
                            self.drop_peer_channel(friend, &entry.channel);
                            break;
                        }
                    }
                }
            }
        });
    }

    fn spawn_reader(self: Arc<Self>, friend: DirectoryId, channel: Arc<SecureChannel>) {
        tokio::spawn(async move {
            loop {
                match channel.recv_frame().await {
                    Ok(Some(payload)) => {
                        if let Some(callback) = self.on_heard.lock().as_ref() {
                            callback(friend);
                        }
                        let Some((service, subtype, body)) = decode_record(&payload) else {
                            warn!("malformed record from {friend}, dropping");
                            continue;
                        };
                        match self.services.get(&service) {
                            Some(svc) => svc.receive(RawMessage {
                                from: friend,
                                subtype,
                                body: body.to_vec(),
                            }),
                            None => {
                                trace!(
                                    "record for unregistered service {service:#06x} from {friend}"
                                );
                            }
                        }
                    }
                    Ok(None) => {
                        debug!("peer {friend} closed the stream");
                        break;
                    }
                    Err(e) => {
                        debug!("read from {friend} failed: {e}");
                        break;
                    }
                }
            }
            self.drop_peer_channel(friend, &channel);
        });
    }

    /// Remove the peer only when the dying channel is still the one
    /// registered. A replaced channel's reader must not take down its
    /// successor.
    fn drop_peer_channel(&self, friend: DirectoryId, channel: &Arc<SecureChannel>) {
        let removed = self
            .peers
            .remove_if(&friend, |_, entry| Arc::ptr_eq(&entry.channel, channel));
        if let Some((_, entry)) = removed {
            entry.channel.close();
            if let Some(callback) = self.on_disconnect.lock().as_ref() {
                callback(friend);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::channel_pair;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Collector {
        id: u16,
        got: Mutex<Vec<RawMessage>>,
        ticks: AtomicUsize,
    }

    impl Collector {
        fn new(id: u16) -> Arc<Self> {
            Arc::new(Self {
                id,
                got: Mutex::new(Vec::new()),
                ticks: AtomicUsize::new(0),
            })
        }
    }

    impl Service for Collector {
        fn service_id(&self) -> u16 {
            self.id
        }
        fn tick(&self) {
            self.ticks.fetch_add(1, Ordering::Relaxed);
        }
        fn receive(&self, msg: RawMessage) {
            self.got.lock().push(msg);
        }
    }

    #[test]
    fn record_codec_roundtrip() {
        let record = encode_record(0x0021, 3, b"body");
        let (service, subtype, body) = decode_record(&record).unwrap();
        assert_eq!(service, 0x0021);
        assert_eq!(subtype, 3);
        assert_eq!(body, b"body");
        assert!(decode_record(&[0, 1]).is_none());
    }

    #[tokio::test]
    async fn dispatches_by_service_id() {
        let (chan_a, chan_b, _alice, _bob) = channel_pair().await;
        let mux_a = ServiceMux::new();
        let mux_b = ServiceMux::new();
        let collector = Collector::new(0x0010);
        mux_b.register_service(collector.clone());

        let alice_id = DirectoryId(1);
        let bob_id = DirectoryId(2);
        mux_a.attach_peer(bob_id, chan_a);
        mux_b.attach_peer(alice_id, chan_b);

        mux_a
            .queue_message(bob_id, 0x0010, 7, b"payload")
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if !collector.got.lock().is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let got = collector.got.lock();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].from, alice_id);
        assert_eq!(got[0].subtype, 7);
        assert_eq!(got[0].body, b"payload");
    }

    #[tokio::test]
    async fn queue_to_unattached_peer_fails() {
        let mux = ServiceMux::new();
        assert!(mux
            .queue_message(DirectoryId(9), 1, 0, b"x")
            .is_err());
    }

    #[tokio::test]
    async fn tick_reaches_services() {
        let mux = ServiceMux::new();
        let collector = Collector::new(1);
        mux.register_service(collector.clone());
        mux.tick_services();
        mux.tick_services();
        assert_eq!(collector.ticks.load(Ordering::Relaxed), 2);
    }
}

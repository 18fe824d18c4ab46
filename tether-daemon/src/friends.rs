//! Friends connectivity: the per-second loop that keeps trying to reach
//! everyone on the roster.
//!
//! Times out quiet connections, schedules retry cycles through the
//! friend book, dials TCP and UDP attempts, punches pinholes for
//! firewalled setups, and refreshes the roster from the directory when a
//! peer rejects our certificate.

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use tether_core::{ConnectionKind, DirectoryId, Error, Event, EventBus, PeerId};
use tether_stream::{
    handshake::{self, Identity, SecureChannel},
    link::{PeerLink, TcpLink, TouLink},
    ServiceMux,
};
use tether_transport::TouSocket;

use crate::connection::{
    AttemptDecision, ConnState, FriendBook, CRYPTO_HANDSHAKE_TIMEOUT, TCP_CONNECT_TIMEOUT,
    UDP_CONNECT_TIMEOUT,
};
use crate::directory::{DirectorySession, FriendRecord};
use crate::own_connectivity::OwnConnectivity;

/// Quick retry after a certificate rejection, once the roster refreshed.
const CERT_REJECT_RETRY: Duration = Duration::from_secs(5);
/// Certificate rejections tolerated before the friend is treated as
/// not enrolled.
const PERSISTENT_AUTH_FAILURES: u32 = 3;
/// Pinhole cadence while firewalled.
const TUNNELER_PERIOD_TICKS: u64 = 20;

type PeerCallback = Box<dyn Fn(DirectoryId) + Send + Sync>;

pub struct FriendsManager {
    book: Arc<FriendBook>,
    mux: Arc<ServiceMux>,
    tou: Arc<TouSocket>,
    own: Arc<OwnConnectivity>,
    directory: Arc<DirectorySession>,
    identity: Identity,
    events: EventBus,
    refresh_requested: AtomicBool,
    refresh_running: AtomicBool,
    on_connected: Mutex<Vec<PeerCallback>>,
}

impl FriendsManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        book: Arc<FriendBook>,
        mux: Arc<ServiceMux>,
        tou: Arc<TouSocket>,
        own: Arc<OwnConnectivity>,
        directory: Arc<DirectorySession>,
        identity: Identity,
        events: EventBus,
    ) -> Arc<Self> {
        Arc::new(Self {
            book,
            mux,
            tou,
            own,
            directory,
            identity,
            events,
            refresh_requested: AtomicBool::new(false),
            refresh_running: AtomicBool::new(false),
            on_connected: Mutex::new(Vec::new()),
        })
    }

    /// Invoked after a friend's encrypted channel is attached (offline
    /// queues replay through this).
    pub fn on_peer_connected(&self, callback: impl Fn(DirectoryId) + Send + Sync + 'static) {
        self.on_connected.lock().push(Box::new(callback));
    }

    pub fn book(&self) -> &Arc<FriendBook> {
        &self.book
    }

    /// Merge a roster into the friend book.
    pub fn apply_roster(&self, records: &[FriendRecord]) {
        for record in records {
            self.book.add_update_friend(
                DirectoryId(record.directory_id),
                record.peer_id(),
                record.display_name.clone(),
                record.local_endpoint,
                record.external_endpoint,
            );
        }
    }

    /// One-shot roster refresh (certificate mismatch, peer unknown).
    pub fn request_directory_refresh(&self) {
        self.refresh_requested.store(true, Ordering::Relaxed);
    }

    /// The per-second pass.
    pub fn tick(self: &Arc<Self>, now: Instant, tick_count: u64) {
        // 1. Connected friends gone quiet: force reset and retry soon.
        for id in self.book.timed_out_friends(now) {
            self.mux.detach_peer(id);
            self.book.force_reset(id, now);
            self.events.publish(Event::PeerDisconnected { friend: id });
        }

        // 2. Offline friends whose retry came due.
        let own_state = self.own.state();
        for id in self.book.retry_due(now) {
            self.book.build_attempts(
                id,
                own_state.local_endpoint,
                own_state.external_endpoint,
                now,
            );
            // Firewalled on our side: hint the peer to connect back and
            // open a pinhole for its attempt.
            if self.own.is_firewalled() {
                if let Some(endpoint) =
                    self.book.with_friend(id, |f| f.external_endpoint).flatten()
                {
                    self.tou.send_tunneler(endpoint);
                }
            }
            self.kick(id, now);
        }

        // 3. Requested roster refresh (one in flight at a time).
        if self.refresh_requested.swap(false, Ordering::Relaxed) {
            self.spawn_roster_refresh();
        }

        // 4. Periodic pinholes while firewalled.
        if self.own.is_firewalled() && tick_count % TUNNELER_PERIOD_TICKS == 0 {
            for endpoint in self.book.external_endpoints() {
                self.tou.send_tunneler(endpoint);
            }
        }

        self.book.decay_failures();
    }

    /// Start the next runnable attempt for `id`, if any.
    fn kick(self: &Arc<Self>, id: DirectoryId, now: Instant) {
        match self.book.next_attempt(id, now) {
            AttemptDecision::Start(attempt) => {
                let manager = self.clone();
                tokio::spawn(async move {
                    manager.run_attempt(id, attempt.endpoint, attempt.kind, attempt.delay_secs)
                        .await;
                });
            }
            AttemptDecision::Deferred | AttemptDecision::Empty => {}
        }
    }

    async fn run_attempt(
        self: Arc<Self>,
        id: DirectoryId,
        endpoint: SocketAddr,
        kind: ConnectionKind,
        delay_secs: u32,
    ) {
        if delay_secs > 0 {
            tokio::time::sleep(Duration::from_secs(delay_secs as u64)).await;
        }
        let Some(expected) = self.book.with_friend(id, |f| f.peer_id).flatten() else {
            self.book
                .report_outcome(id, false, Some("friend has no key".into()), Instant::now());
            return;
        };

        let result = match kind {
            ConnectionKind::TcpLocal | ConnectionKind::TcpExternal | ConnectionKind::TcpBack => {
                self.dial_tcp(id, endpoint, expected).await
            }
            ConnectionKind::Udp => self.dial_udp(id, endpoint, expected).await,
        };

        let now = Instant::now();
        match result {
            Ok(channel) => {
                self.book.report_outcome(id, true, None, now);
                self.finalize_connected(id, channel);
            }
            Err(e) => {
                debug!("attempt {kind:?} to {endpoint} for {id} failed: {e}");
                self.handle_attempt_failure(id, &e, now);
                // Try whatever is left in this cycle's queue.
                self.kick(id, now);
            }
        }
    }

    /// Shared failure policy. Certificate mismatch refreshes the roster
    /// and lines up one fast retry; a persistent mismatch demotes the
    /// friend until the directory hands us a fresh key.
    fn handle_attempt_failure(&self, id: DirectoryId, error: &Error, now: Instant) {
        self.book
            .report_outcome(id, false, Some(error.to_string()), now);
        if !matches!(error, Error::PeerAuth { .. }) {
            self.book.with_friend(id, |f| f.auth_failures = 0);
            return;
        }
        warn!("certificate mismatch with {id}; refreshing roster");
        self.request_directory_refresh();
        self.book.with_friend(id, |f| {
            f.auth_failures += 1;
            if f.auth_failures >= PERSISTENT_AUTH_FAILURES {
                // The key we hold is evidently wrong and refreshing has
                // not helped.
                f.friend_state = tether_core::FriendState::NotEnrolled;
                f.peer_id = None;
                f.next_retry_at = None;
            } else {
                f.next_retry_at = Some(now + CERT_REJECT_RETRY);
                f.double_tried = true;
            }
        });
    }

    async fn dial_tcp(
        &self,
        id: DirectoryId,
        endpoint: SocketAddr,
        expected: PeerId,
    ) -> tether_core::Result<SecureChannel> {
        self.book.note_progress(id, ConnState::AwaitingSocket);
        let stream = tokio::time::timeout(TCP_CONNECT_TIMEOUT, TcpStream::connect(endpoint))
            .await
            .map_err(|_| Error::Timeout("tcp connect"))?
            .map_err(|e| Error::ConnectionLost(e.to_string()))?;
        let link: Arc<dyn PeerLink> = Arc::new(TcpLink::new(stream));

        self.book.note_progress(id, ConnState::AwaitingCryptoHandshake);
        let channel = tokio::time::timeout(
            CRYPTO_HANDSHAKE_TIMEOUT,
            handshake::initiate(link, &self.identity, expected),
        )
        .await
        .map_err(|_| Error::Timeout("crypto handshake"))?;
        self.book.note_progress(id, ConnState::AwaitingCertVerify);
        channel.map_err(Into::into)
    }

    /// UDP-tunneled connect. Both ends hole-punch toward each other; the
    /// lexicographically lower peer id plays the crypto initiator.
    async fn dial_udp(
        &self,
        id: DirectoryId,
        endpoint: SocketAddr,
        expected: PeerId,
    ) -> tether_core::Result<SecureChannel> {
        self.book.note_progress(id, ConnState::AwaitingSocket);
        let conn = self
            .tou
            .connect(endpoint, UDP_CONNECT_TIMEOUT)
            .await
            .map_err(|e| Error::ConnectionLost(e.to_string()))?;
        let link: Arc<dyn PeerLink> = Arc::new(TouLink::new(conn));

        self.book.note_progress(id, ConnState::AwaitingCryptoHandshake);
        let we_initiate = self.book.own_peer_id() < expected;
        let handshake_result = if we_initiate {
            tokio::time::timeout(
                CRYPTO_HANDSHAKE_TIMEOUT,
                handshake::initiate(link, &self.identity, expected),
            )
            .await
        } else {
            tokio::time::timeout(
                CRYPTO_HANDSHAKE_TIMEOUT,
                handshake::respond(link, &self.identity, Some(expected)),
            )
            .await
        };
        self.book.note_progress(id, ConnState::AwaitingCertVerify);
        handshake_result
            .map_err(|_| Error::Timeout("crypto handshake"))?
            .map_err(Into::into)
    }

    /// Shared tail for outbound and inbound connections.
    pub fn finalize_connected(&self, id: DirectoryId, channel: SecureChannel) {
        self.mux.attach_peer(id, Arc::new(channel));
        self.events.publish(Event::PeerConnected { friend: id });
        for callback in self.on_connected.lock().iter() {
            callback(id);
        }
    }

    /// An inbound connection completed its handshake. The presented
    /// identity decides whether we adopt it; strangers are dropped.
    /// When both sides raced, the inbound side that finished its
    /// handshake wins: attaching replaces (and closes) the older channel.
    pub fn adopt_inbound(&self, channel: SecureChannel) -> bool {
        let Some(id) = self.book.find_by_peer_id(channel.peer_id()) else {
            info!(
                "dropping inbound connection from unknown peer {}",
                channel.peer_id()
            );
            channel.close();
            // Someone we do not know yet: the roster may be stale.
            self.request_directory_refresh();
            return false;
        };
        let now = Instant::now();
        self.book.inbound_connected(id, now);
        self.finalize_connected(id, channel);
        true
    }

    fn spawn_roster_refresh(self: &Arc<Self>) {
        if self.refresh_running.swap(true, Ordering::Relaxed) {
            return;
        }
        let manager = self.clone();
        tokio::spawn(async move {
            match manager.directory.fetch_friends().await {
                Ok(records) => {
                    info!("roster refreshed: {} friends", records.len());
                    manager.apply_roster(&records);
                }
                Err(e) => warn!("roster refresh failed: {e}"),
            }
            manager.refresh_running.store(false, Ordering::Relaxed);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::StaticDirectory;
    use tether_transport::{stun::StunService, UdpMux};

    async fn manager() -> (Arc<FriendsManager>, Arc<StaticDirectory>) {
        let mux = UdpMux::bind(0).await.unwrap();
        let (tou, _listener) = TouSocket::start(mux.clone());
        let stun = StunService::start(UdpMux::bind(0).await.unwrap());
        let directory = StaticDirectory::new();
        let session = DirectorySession::new(directory.clone());
        let events = EventBus::new(16);
        let own = OwnConnectivity::new(
            stun,
            session.clone(),
            events.clone(),
            Vec::new(),
            false,
            0,
        );
        let identity = Identity::generate();
        let book = Arc::new(FriendBook::new(identity.peer_id()));
        let service_mux = ServiceMux::new();
        let manager = FriendsManager::new(
            book,
            service_mux,
            tou,
            own,
            session,
            identity,
            events,
        );
        (manager, directory)
    }

    #[tokio::test]
    async fn roster_apply_enrolls_friends() {
        let (manager, _) = manager().await;
        manager.apply_roster(&[FriendRecord {
            directory_id: 4,
            display_name: "kim".into(),
            public_key: Some(b"kims-key".to_vec()),
            local_endpoint: None,
            external_endpoint: "203.0.113.2:7100".parse().ok(),
        }]);
        assert!(manager.book().is_friend(DirectoryId(4)));
        assert_eq!(
            manager.book().find_by_peer_id(PeerId::from_public_key(b"kims-key")),
            Some(DirectoryId(4))
        );
    }

    #[tokio::test]
    async fn inbound_from_stranger_is_dropped_and_triggers_refresh() {
        let (manager, _) = manager().await;
        // Build a channel presenting an unknown identity.
        let stranger = Identity::generate();
        let us = Identity::generate();
        let (link_a, link_b) = tether_stream::link::memory_pair();
        let responder = tokio::spawn({
            let us = us.clone();
            async move {
                handshake::respond(link_b as Arc<dyn PeerLink>, &us, None).await
            }
        });
        let _initiator =
            handshake::initiate(link_a as Arc<dyn PeerLink>, &stranger, us.peer_id())
                .await
                .unwrap();
        let inbound = responder.await.unwrap().unwrap();
        assert!(!manager.adopt_inbound(inbound));
        assert!(manager.refresh_requested.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn cert_mismatch_schedules_refresh_and_quick_retry() {
        use tether_core::ConnectionAttempt;

        let (manager, _) = manager().await;
        manager.apply_roster(&[FriendRecord {
            directory_id: 4,
            display_name: "kim".into(),
            public_key: Some(b"kims-key".to_vec()),
            local_endpoint: None,
            external_endpoint: "203.0.113.2:7100".parse().ok(),
        }]);
        let id = DirectoryId(4);
        let now = Instant::now();
        manager.book().queue_attempt(
            id,
            ConnectionAttempt {
                endpoint: "203.0.113.2:7100".parse().unwrap(),
                kind: ConnectionKind::TcpExternal,
                delay_secs: 0,
                timeout_secs: 30,
            },
        );
        let AttemptDecision::Start(_) = manager.book().next_attempt(id, now) else {
            panic!("expected an attempt to start");
        };

        let error = Error::PeerAuth {
            expected: "aa".repeat(20),
            presented: "bb".repeat(20),
        };
        manager.handle_attempt_failure(id, &error, now);

        assert!(manager.refresh_requested.load(Ordering::Relaxed));
        let retry = manager
            .book()
            .with_friend(id, |f| f.next_retry_at)
            .unwrap()
            .expect("quick retry scheduled");
        assert!(
            retry <= now + Duration::from_secs(10),
            "retry lands within ten seconds"
        );

        // Persistent mismatches demote the friend entirely.
        for _ in 0..PERSISTENT_AUTH_FAILURES {
            manager.handle_attempt_failure(id, &error, now);
        }
        let state = manager
            .book()
            .with_friend(id, |f| f.friend_state)
            .unwrap();
        assert_eq!(state, tether_core::FriendState::NotEnrolled);
    }

    #[tokio::test]
    async fn refresh_applies_directory_changes() {
        let (manager, directory) = manager().await;
        directory.set_friends(vec![FriendRecord {
            directory_id: 9,
            display_name: "newcomer".into(),
            public_key: Some(b"new-key".to_vec()),
            local_endpoint: None,
            external_endpoint: None,
        }]);
        manager.request_directory_refresh();
        manager.tick(Instant::now(), 1);
        // The refresh runs on a background task.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(manager.book().is_friend(DirectoryId(9)));
    }
}

//! Per-friend connection state machine and the attempt queue policy.
//!
//! Pure bookkeeping: the async dialing lives in the friends manager. The
//! book decides which attempt runs next, defers attempts whose endpoint
//! another connection already uses, schedules the quick second cycle and
//! the long retry, and times out quiet connections.

use std::{
    collections::{HashMap, VecDeque},
    net::SocketAddr,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use tether_core::{
    ConnectionAttempt, ConnectionKind, DirectoryId, FriendState, PeerId,
};

/// Dial budget for a direct TCP attempt.
pub const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// Handshake budget for the UDP tunnel.
pub const UDP_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// Budget for the cryptographic handshake once a socket exists.
pub const CRYPTO_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
/// Deferral when the candidate endpoint is already in use.
pub const USED_IP_WAIT_TIME: Duration = Duration::from_secs(5);
/// Quick second cycle, giving the peer time to refresh its address book.
pub const DOUBLE_TRY_DELAY: Duration = Duration::from_secs(10);
/// Floor between full retry cycles.
pub const MIN_RETRY_PERIOD: Duration = Duration::from_secs(600);
/// A connected friend quieter than this is declared gone.
pub const LAST_HEARD_TIMEOUT: Duration = Duration::from_secs(300);
/// Outbound TCP delay for the lexicographically greater peer id, so
/// simultaneous opens do not collide.
pub const TCP_DEFAULT_DELAY: Duration = Duration::from_secs(2);

/// Connection progress for one friend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnState {
    #[default]
    Idle,
    AwaitingSocket,
    AwaitingCryptoHandshake,
    AwaitingCertVerify,
    Connected,
    /// Equivalent to idle, but the reason survives one tick for the
    /// owner to schedule a retry.
    Failed,
}

/// Whether an endpoint is merely being dialed or carries a live
/// connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UsedIp {
    Connecting,
    Connected,
}

/// Everything the daemon tracks about one friend.
#[derive(Debug, Default)]
pub struct PeerConnectState {
    pub directory_id: DirectoryId,
    pub peer_id: Option<PeerId>,
    pub display_name: String,
    pub local_endpoint: Option<SocketAddr>,
    pub external_endpoint: Option<SocketAddr>,
    pub friend_state: FriendState,
    pub conn_state: ConnState,
    pub last_contact: Option<Instant>,
    pub last_heard: Option<Instant>,
    pub last_attempt: Option<Instant>,
    pub next_retry_at: Option<Instant>,
    pub queued_attempts: VecDeque<ConnectionAttempt>,
    pub current_attempt: Option<ConnectionAttempt>,
    pub double_tried: bool,
    /// Failure reason preserved for one tick after `Failed`.
    pub failure_reason: Option<String>,
    /// Consecutive certificate rejections; persistent mismatch demotes
    /// the friend to not-enrolled until the roster carries a fresh key.
    pub auth_failures: u32,
}

/// What the attempt queue hands back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptDecision {
    /// Dial this now.
    Start(ConnectionAttempt),
    /// Candidate endpoint busy; re-queued at the tail.
    Deferred,
    /// Nothing to try.
    Empty,
}

/// The friend table plus the used-endpoint registry.
pub struct FriendBook {
    own_peer_id: PeerId,
    friends: Mutex<HashMap<DirectoryId, PeerConnectState>>,
    used_ips: Mutex<HashMap<SocketAddr, UsedIp>>,
}

impl FriendBook {
    pub fn new(own_peer_id: PeerId) -> Self {
        Self {
            own_peer_id,
            friends: Mutex::new(HashMap::new()),
            used_ips: Mutex::new(HashMap::new()),
        }
    }

    pub fn own_peer_id(&self) -> PeerId {
        self.own_peer_id
    }

    /// Insert or refresh a friend from the directory roster. A friend
    /// without a published key stays `NotEnrolled` and is never dialed.
    pub fn add_update_friend(
        &self,
        directory_id: DirectoryId,
        peer_id: Option<PeerId>,
        display_name: String,
        local_endpoint: Option<SocketAddr>,
        external_endpoint: Option<SocketAddr>,
    ) {
        let mut friends = self.friends.lock();
        let entry = friends.entry(directory_id).or_insert_with(|| {
            let mut state = PeerConnectState {
                directory_id,
                ..Default::default()
            };
            state.friend_state = FriendState::NotEnrolled;
            state
        });
        entry.display_name = display_name;
        if let Some(endpoint) = local_endpoint {
            entry.local_endpoint = Some(endpoint);
        }
        if let Some(endpoint) = external_endpoint {
            entry.external_endpoint = Some(endpoint);
        }
        if peer_id.is_some() {
            entry.peer_id = peer_id;
            if entry.friend_state == FriendState::NotEnrolled {
                entry.friend_state = FriendState::Offline;
            }
        }
    }

    pub fn friend_ids(&self) -> Vec<DirectoryId> {
        self.friends.lock().keys().copied().collect()
    }

    pub fn is_friend(&self, id: DirectoryId) -> bool {
        self.friends.lock().contains_key(&id)
    }

    /// Directory id for a verified peer identity, if it belongs to a
    /// friend.
    pub fn find_by_peer_id(&self, peer_id: PeerId) -> Option<DirectoryId> {
        self.friends
            .lock()
            .values()
            .find(|f| f.peer_id == Some(peer_id))
            .map(|f| f.directory_id)
    }

    pub fn with_friend<R>(
        &self,
        id: DirectoryId,
        f: impl FnOnce(&mut PeerConnectState) -> R,
    ) -> Option<R> {
        self.friends.lock().get_mut(&id).map(f)
    }

    /// Visit every friend read-only (the inspection API builds its
    /// snapshots through this).
    pub fn for_each_friend(&self, mut f: impl FnMut(&PeerConnectState)) {
        for friend in self.friends.lock().values() {
            f(friend);
        }
    }

    pub fn snapshot(&self) -> Vec<(DirectoryId, FriendState, ConnState)> {
        self.friends
            .lock()
            .values()
            .map(|f| (f.directory_id, f.friend_state, f.conn_state))
            .collect()
    }

    pub fn connected_ids(&self) -> Vec<DirectoryId> {
        self.friends
            .lock()
            .values()
            .filter(|f| f.friend_state == FriendState::Connected)
            .map(|f| f.directory_id)
            .collect()
    }

    /// Queue an attempt, keeping at most one of each kind per cycle
    /// (counting the one currently running).
    pub fn queue_attempt(&self, id: DirectoryId, attempt: ConnectionAttempt) {
        let mut friends = self.friends.lock();
        let Some(friend) = friends.get_mut(&id) else {
            return;
        };
        let duplicate_kind = friend
            .current_attempt
            .as_ref()
            .map(|a| a.kind == attempt.kind)
            .unwrap_or(false)
            || friend.queued_attempts.iter().any(|a| a.kind == attempt.kind);
        if duplicate_kind {
            return;
        }
        debug!(
            "queueing {:?} attempt to {} for friend {id}",
            attempt.kind, attempt.endpoint
        );
        friend.queued_attempts.push_back(attempt);
    }

    /// Pop the next attempt, applying used-endpoint gating: a candidate
    /// whose (ip, port) is busy goes back to the tail, and when no other
    /// endpoint is available the retry is pushed out by
    /// [`USED_IP_WAIT_TIME`].
    pub fn next_attempt(&self, id: DirectoryId, now: Instant) -> AttemptDecision {
        let mut friends = self.friends.lock();
        let Some(friend) = friends.get_mut(&id) else {
            return AttemptDecision::Empty;
        };
        if friend.current_attempt.is_some() {
            return AttemptDecision::Empty;
        }
        let Some(attempt) = friend.queued_attempts.pop_front() else {
            return AttemptDecision::Empty;
        };

        let mut used_ips = self.used_ips.lock();
        if used_ips.contains_key(&attempt.endpoint) {
            let only_endpoint = friend
                .queued_attempts
                .iter()
                .all(|a| a.endpoint == attempt.endpoint);
            friend.queued_attempts.push_back(attempt);
            if only_endpoint {
                friend.next_retry_at = Some(now + USED_IP_WAIT_TIME);
            }
            return AttemptDecision::Deferred;
        }

        used_ips.insert(attempt.endpoint, UsedIp::Connecting);
        friend.last_attempt = Some(now);
        friend.current_attempt = Some(attempt.clone());
        friend.conn_state = ConnState::AwaitingSocket;
        AttemptDecision::Start(attempt)
    }

    /// Advance the FSM while an attempt is in flight.
    pub fn note_progress(&self, id: DirectoryId, state: ConnState) {
        if let Some(friend) = self.friends.lock().get_mut(&id) {
            friend.conn_state = state;
        }
    }

    /// Record the outcome of the current attempt.
    pub fn report_outcome(&self, id: DirectoryId, success: bool, reason: Option<String>, now: Instant) {
        let mut friends = self.friends.lock();
        let Some(friend) = friends.get_mut(&id) else {
            return;
        };
        let Some(attempt) = friend.current_attempt.take() else {
            return;
        };
        let mut used_ips = self.used_ips.lock();

        if success {
            info!(
                "connected to {} ({}) via {:?}",
                friend.display_name, id, attempt.kind
            );
            friend.queued_attempts.clear();
            used_ips.insert(attempt.endpoint, UsedIp::Connected);
            friend.friend_state = FriendState::Connected;
            friend.conn_state = ConnState::Connected;
            friend.last_contact = Some(now);
            friend.last_heard = Some(now);
            friend.failure_reason = None;
            friend.double_tried = false;
            friend.next_retry_at = None;
            return;
        }

        used_ips.remove(&attempt.endpoint);
        friend.conn_state = ConnState::Failed;
        friend.failure_reason = reason;

        if friend.queued_attempts.is_empty() {
            if !friend.double_tried {
                // One quick second cycle; the friend may have refreshed
                // its addresses in the meantime.
                friend.double_tried = true;
                friend.next_retry_at = Some(now + DOUBLE_TRY_DELAY);
            }
        }
    }

    /// An inbound connection completed its handshake; there was no
    /// outbound attempt to report on. Any outbound attempt still running
    /// loses the race and its endpoint claim is released.
    pub fn inbound_connected(&self, id: DirectoryId, now: Instant) {
        let mut friends = self.friends.lock();
        let Some(friend) = friends.get_mut(&id) else {
            return;
        };
        friend.queued_attempts.clear();
        if let Some(attempt) = friend.current_attempt.take() {
            self.used_ips.lock().remove(&attempt.endpoint);
        }
        friend.friend_state = FriendState::Connected;
        friend.conn_state = ConnState::Connected;
        friend.last_contact = Some(now);
        friend.last_heard = Some(now);
        friend.double_tried = false;
        friend.next_retry_at = None;
        friend.failure_reason = None;
    }

    /// A live connection closed (or was replaced).
    pub fn disconnected(&self, id: DirectoryId, now: Instant) {
        let mut friends = self.friends.lock();
        let Some(friend) = friends.get_mut(&id) else {
            return;
        };
        if friend.friend_state == FriendState::Connected {
            friend.friend_state = FriendState::Offline;
            friend.last_contact = Some(now);
        }
        friend.conn_state = ConnState::Idle;
        // Release the endpoint held by the finished connection.
        if let Some(attempt) = friend.current_attempt.take() {
            self.used_ips.lock().remove(&attempt.endpoint);
        }
        if let Some(endpoint) = friend.external_endpoint {
            let mut used = self.used_ips.lock();
            if used.get(&endpoint) == Some(&UsedIp::Connected) {
                used.remove(&endpoint);
            }
        }
        if let Some(endpoint) = friend.local_endpoint {
            let mut used = self.used_ips.lock();
            if used.get(&endpoint) == Some(&UsedIp::Connected) {
                used.remove(&endpoint);
            }
        }
    }

    /// Any frame from the friend proves liveness.
    pub fn heard_from(&self, id: DirectoryId, now: Instant) {
        if let Some(friend) = self.friends.lock().get_mut(&id) {
            friend.last_heard = Some(now);
        }
    }

    /// Connected friends we have not heard from inside the timeout.
    pub fn timed_out_friends(&self, now: Instant) -> Vec<DirectoryId> {
        self.friends
            .lock()
            .values()
            .filter(|f| f.friend_state == FriendState::Connected)
            .filter(|f| match f.last_heard {
                Some(heard) => now.duration_since(heard) > LAST_HEARD_TIMEOUT,
                None => true,
            })
            .map(|f| f.directory_id)
            .collect()
    }

    /// Force a quiet friend back to offline and line up a quick retry.
    pub fn force_reset(&self, id: DirectoryId, now: Instant) {
        let mut friends = self.friends.lock();
        let Some(friend) = friends.get_mut(&id) else {
            return;
        };
        warn!("connection with {} timed out", friend.display_name);
        friend.friend_state = FriendState::Offline;
        friend.conn_state = ConnState::Idle;
        friend.last_contact = Some(now);
        friend.double_tried = false;
        friend.next_retry_at = Some(now);
        if let Some(attempt) = friend.current_attempt.take() {
            self.used_ips.lock().remove(&attempt.endpoint);
        }
    }

    /// Offline friends whose retry is due: either the floor elapsed since
    /// the last cycle or a scheduled quick retry arrived.
    pub fn retry_due(&self, now: Instant) -> Vec<DirectoryId> {
        self.friends
            .lock()
            .values()
            .filter(|f| f.friend_state == FriendState::Offline)
            .filter(|f| f.current_attempt.is_none())
            .filter(|f| {
                let scheduled = f
                    .next_retry_at
                    .map(|at| now >= at)
                    .unwrap_or(false);
                let stale = f
                    .last_attempt
                    .map(|at| now.duration_since(at) >= MIN_RETRY_PERIOD)
                    .unwrap_or(true);
                scheduled || stale
            })
            .map(|f| f.directory_id)
            .collect()
    }

    /// Build this cycle's attempt queue for one friend. `own_local` and
    /// `own_external` exclude our own endpoints; the tie-break delays the
    /// greater peer id.
    pub fn build_attempts(
        &self,
        id: DirectoryId,
        own_local: Option<SocketAddr>,
        own_external: Option<SocketAddr>,
        now: Instant,
    ) {
        let (local, external, peer_id, fresh_cycle) = {
            let mut friends = self.friends.lock();
            let Some(friend) = friends.get_mut(&id) else {
                return;
            };
            if friend.friend_state != FriendState::Offline {
                return;
            }
            let fresh = friend.next_retry_at.map(|at| now >= at).unwrap_or(true);
            if fresh {
                friend.next_retry_at = None;
            }
            (
                friend.local_endpoint,
                friend.external_endpoint,
                friend.peer_id,
                fresh,
            )
        };
        if !fresh_cycle {
            return;
        }

        let delay = match peer_id {
            // The greater id waits so simultaneous opens do not collide.
            Some(peer) if self.own_peer_id > peer => TCP_DEFAULT_DELAY.as_secs() as u32,
            _ => 0,
        };

        if let Some(endpoint) = local {
            let same_subnet = match (own_local, endpoint) {
                (Some(own), ep) => same_ipv4_subnet(own, ep),
                _ => false,
            };
            if same_subnet && Some(endpoint) != own_local && Some(endpoint) != own_external {
                self.queue_attempt(
                    id,
                    ConnectionAttempt {
                        endpoint,
                        kind: ConnectionKind::TcpLocal,
                        delay_secs: delay,
                        timeout_secs: TCP_CONNECT_TIMEOUT.as_secs() as u32,
                    },
                );
            }
        }
        if let Some(endpoint) = external {
            if Some(endpoint) != own_local && Some(endpoint) != own_external {
                self.queue_attempt(
                    id,
                    ConnectionAttempt {
                        endpoint,
                        kind: ConnectionKind::TcpExternal,
                        delay_secs: delay,
                        timeout_secs: TCP_CONNECT_TIMEOUT.as_secs() as u32,
                    },
                );
                self.queue_attempt(
                    id,
                    ConnectionAttempt {
                        endpoint,
                        kind: ConnectionKind::Udp,
                        delay_secs: 0,
                        timeout_secs: UDP_CONNECT_TIMEOUT.as_secs() as u32,
                    },
                );
            }
        }
    }

    /// Let `Failed` decay to `Idle` after its one-tick grace.
    pub fn decay_failures(&self) {
        for friend in self.friends.lock().values_mut() {
            if friend.conn_state == ConnState::Failed {
                friend.conn_state = ConnState::Idle;
                friend.failure_reason = None;
            }
        }
    }

    /// External endpoints of every enrolled friend (tunneler targets).
    pub fn external_endpoints(&self) -> Vec<SocketAddr> {
        self.friends
            .lock()
            .values()
            .filter(|f| f.friend_state != FriendState::NotEnrolled)
            .filter_map(|f| f.external_endpoint)
            .collect()
    }
}

/// Same /24, the usual home-LAN case.
fn same_ipv4_subnet(a: SocketAddr, b: SocketAddr) -> bool {
    match (a.ip(), b.ip()) {
        (std::net::IpAddr::V4(a), std::net::IpAddr::V4(b)) => {
            a.octets()[..3] == b.octets()[..3]
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book() -> FriendBook {
        FriendBook::new(PeerId([1u8; 20]))
    }

    fn enroll(book: &FriendBook, id: u32, peer_byte: u8, endpoint: &str) -> DirectoryId {
        let id = DirectoryId(id);
        book.add_update_friend(
            id,
            Some(PeerId([peer_byte; 20])),
            format!("friend-{peer_byte}"),
            None,
            endpoint.parse().ok(),
        );
        id
    }

    fn attempt(endpoint: &str, kind: ConnectionKind) -> ConnectionAttempt {
        ConnectionAttempt {
            endpoint: endpoint.parse().unwrap(),
            kind,
            delay_secs: 0,
            timeout_secs: 30,
        }
    }

    #[test]
    fn one_attempt_of_each_kind_per_cycle() {
        let book = book();
        let id = enroll(&book, 1, 2, "203.0.113.5:7000");
        book.queue_attempt(id, attempt("203.0.113.5:7000", ConnectionKind::TcpExternal));
        book.queue_attempt(id, attempt("203.0.113.5:7001", ConnectionKind::TcpExternal));
        book.queue_attempt(id, attempt("203.0.113.5:7000", ConnectionKind::Udp));
        let queued = book
            .with_friend(id, |f| f.queued_attempts.len())
            .unwrap();
        assert_eq!(queued, 2, "duplicate kind rejected");
    }

    #[test]
    fn used_endpoint_defers_to_tail_with_retry_at() {
        let book = book();
        let shared = "203.0.113.9:9000";
        let a = enroll(&book, 1, 2, shared);
        let b = enroll(&book, 2, 3, shared);
        book.queue_attempt(a, attempt(shared, ConnectionKind::TcpExternal));
        book.queue_attempt(b, attempt(shared, ConnectionKind::TcpExternal));

        let now = Instant::now();
        // A's attempt begins and claims the endpoint.
        assert!(matches!(
            book.next_attempt(a, now),
            AttemptDecision::Start(_)
        ));
        // B dequeues, is deferred to the tail, and gets a 5 s retry.
        assert_eq!(book.next_attempt(b, now), AttemptDecision::Deferred);
        let (len, retry_at) = book
            .with_friend(b, |f| (f.queued_attempts.len(), f.next_retry_at))
            .unwrap();
        assert_eq!(len, 1, "reinserted at the tail");
        let retry_at = retry_at.expect("retry scheduled");
        assert_eq!(retry_at, now + USED_IP_WAIT_TIME);

        // A's attempt finishes (failure); the endpoint frees and B may
        // proceed.
        book.report_outcome(a, false, Some("refused".into()), now);
        assert!(matches!(
            book.next_attempt(b, now + USED_IP_WAIT_TIME),
            AttemptDecision::Start(_)
        ));
    }

    #[test]
    fn success_clears_queue_and_marks_connected() {
        let book = book();
        let id = enroll(&book, 1, 2, "203.0.113.5:7000");
        book.queue_attempt(id, attempt("203.0.113.5:7000", ConnectionKind::TcpExternal));
        book.queue_attempt(id, attempt("10.0.0.5:7000", ConnectionKind::TcpLocal));
        let now = Instant::now();
        let AttemptDecision::Start(_) = book.next_attempt(id, now) else {
            panic!("expected start");
        };
        book.report_outcome(id, true, None, now);
        let (state, queued, heard) = book
            .with_friend(id, |f| {
                (f.friend_state, f.queued_attempts.len(), f.last_heard)
            })
            .unwrap();
        assert_eq!(state, FriendState::Connected);
        assert_eq!(queued, 0, "connected friends have an empty queue");
        assert!(heard.is_some());
    }

    #[test]
    fn exhausted_queue_schedules_single_double_try() {
        let book = book();
        let id = enroll(&book, 1, 2, "203.0.113.5:7000");
        let now = Instant::now();
        book.queue_attempt(id, attempt("203.0.113.5:7000", ConnectionKind::TcpExternal));
        let AttemptDecision::Start(_) = book.next_attempt(id, now) else {
            panic!()
        };
        book.report_outcome(id, false, Some("timeout".into()), now);
        let retry_at = book.with_friend(id, |f| f.next_retry_at).unwrap().unwrap();
        assert_eq!(retry_at, now + DOUBLE_TRY_DELAY);

        // Second exhaustion does not reschedule again.
        book.queue_attempt(id, attempt("203.0.113.5:7000", ConnectionKind::TcpExternal));
        let AttemptDecision::Start(_) = book.next_attempt(id, now + DOUBLE_TRY_DELAY) else {
            panic!()
        };
        book.report_outcome(id, false, Some("timeout".into()), now + DOUBLE_TRY_DELAY);
        let retry_at = book.with_friend(id, |f| f.next_retry_at).unwrap();
        assert_eq!(retry_at, Some(now + DOUBLE_TRY_DELAY), "no new quick retry");
    }

    #[test]
    fn retry_discipline_bounds_attempts_per_window() {
        // Initial cycle + double-try + one scheduled retry: an offline
        // friend is eligible at most three times inside ten minutes.
        let book = book();
        let id = enroll(&book, 1, 2, "203.0.113.5:7000");
        let start = Instant::now();
        let mut eligible = 0;
        let mut now = start;
        // Fresh friend (never attempted) is eligible immediately.
        for _ in 0..600 {
            if book.retry_due(now).contains(&id) {
                eligible += 1;
                book.build_attempts(id, None, None, now);
                while let AttemptDecision::Start(_) = book.next_attempt(id, now) {
                    book.report_outcome(id, false, None, now);
                }
            }
            now += Duration::from_secs(1);
        }
        assert!(
            eligible <= 3,
            "expected at most 3 attempts in 10 minutes, saw {eligible}"
        );
    }

    #[test]
    fn timed_out_connected_friend_is_reported_and_reset() {
        let book = book();
        let id = enroll(&book, 1, 2, "203.0.113.5:7000");
        let now = Instant::now();
        book.queue_attempt(id, attempt("203.0.113.5:7000", ConnectionKind::TcpExternal));
        let AttemptDecision::Start(_) = book.next_attempt(id, now) else {
            panic!()
        };
        book.report_outcome(id, true, None, now);

        let quiet = now + LAST_HEARD_TIMEOUT + Duration::from_secs(1);
        assert_eq!(book.timed_out_friends(quiet), vec![id]);
        book.force_reset(id, quiet);
        let (state, retry) = book
            .with_friend(id, |f| (f.friend_state, f.next_retry_at))
            .unwrap();
        assert_eq!(state, FriendState::Offline);
        assert_eq!(retry, Some(quiet), "quick retry queued");
    }

    #[test]
    fn tie_break_delays_greater_peer_id() {
        let book = FriendBook::new(PeerId([9u8; 20]));
        let lesser = DirectoryId(1);
        book.add_update_friend(
            lesser,
            Some(PeerId([2u8; 20])),
            "lesser".into(),
            None,
            "203.0.113.5:7000".parse().ok(),
        );
        let now = Instant::now();
        book.build_attempts(lesser, None, None, now);
        let delay = book
            .with_friend(lesser, |f| f.queued_attempts[0].delay_secs)
            .unwrap();
        assert_eq!(delay, TCP_DEFAULT_DELAY.as_secs() as u32);

        let greater = DirectoryId(2);
        book.add_update_friend(
            greater,
            Some(PeerId([200u8; 20])),
            "greater".into(),
            None,
            "203.0.113.6:7000".parse().ok(),
        );
        book.build_attempts(greater, None, None, now);
        let delay = book
            .with_friend(greater, |f| f.queued_attempts[0].delay_secs)
            .unwrap();
        assert_eq!(delay, 0, "the greater peer id delays itself, not us");
    }

    #[test]
    fn build_attempts_skips_own_endpoints_and_wrong_subnet() {
        let book = book();
        let id = DirectoryId(4);
        book.add_update_friend(
            id,
            Some(PeerId([4u8; 20])),
            "local-friend".into(),
            "192.168.1.20:7000".parse().ok(),
            "203.0.113.5:7000".parse().ok(),
        );
        let now = Instant::now();
        let own_local: SocketAddr = "192.168.1.10:7000".parse().unwrap();
        book.build_attempts(id, Some(own_local), None, now);
        let kinds: Vec<ConnectionKind> = book
            .with_friend(id, |f| {
                f.queued_attempts.iter().map(|a| a.kind).collect()
            })
            .unwrap();
        assert!(kinds.contains(&ConnectionKind::TcpLocal));
        assert!(kinds.contains(&ConnectionKind::TcpExternal));
        assert!(kinds.contains(&ConnectionKind::Udp));

        // A friend on a different subnet gets no local attempt.
        let far = DirectoryId(5);
        book.add_update_friend(
            far,
            Some(PeerId([5u8; 20])),
            "far-friend".into(),
            "10.9.8.7:7000".parse().ok(),
            "203.0.113.6:7000".parse().ok(),
        );
        book.build_attempts(far, Some(own_local), None, now);
        let kinds: Vec<ConnectionKind> = book
            .with_friend(far, |f| {
                f.queued_attempts.iter().map(|a| a.kind).collect()
            })
            .unwrap();
        assert!(!kinds.contains(&ConnectionKind::TcpLocal));
    }

    #[test]
    fn not_enrolled_friend_is_never_retried() {
        let book = book();
        let id = DirectoryId(6);
        book.add_update_friend(id, None, "keyless".into(), None, None);
        assert!(book.retry_due(Instant::now()).is_empty());
    }
}

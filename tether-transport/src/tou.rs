//! Reliable byte stream tunneled over the shared UDP socket.
//!
//! Provides the TCP-like guarantees the encrypted layer needs when a
//! direct TCP connection is impossible: 3-way handshake, ordered delivery,
//! cumulative acknowledgement with per-segment retransmission, a slow-start
//! congestion window, and keepalives while idle. Segment payloads never
//! exceed [`MAX_SEGMENT`].
//!
//! All segment kinds carry the high bit so the first byte can never be
//! mistaken for the 0x00/0x01 leading byte of a STUN message on the shared
//! port.

use std::{
    collections::{BTreeMap, VecDeque},
    io,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, trace, warn};

use crate::{Datagram, UdpMux};

/// Maximum payload bytes per segment.
pub const MAX_SEGMENT: usize = 8192;

/// Fixed segment header size.
const HEADER_LEN: usize = 12;

/// Initial congestion window, in segments.
const INITIAL_CWND: f64 = 4.0;
/// Initial slow-start threshold, in segments.
const INITIAL_SSTHRESH: f64 = 64.0;

/// Retransmission ceiling before the connection is declared dead.
const MAX_RETRANSMITS: u32 = 12;

/// Idle interval after which a keepalive is emitted.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(25);
/// Internal pacing tick.
const TICK_INTERVAL: Duration = Duration::from_millis(50);

const KIND_SYN: u8 = 0x80;
const KIND_SYNACK: u8 = 0x81;
const KIND_ACK: u8 = 0x82;
const KIND_DATA: u8 = 0x83;
const KIND_FIN: u8 = 0x84;
const KIND_KEEPALIVE: u8 = 0x85;
const KIND_RST: u8 = 0x86;
/// Bare pinhole opener; carries no connection state.
pub const KIND_TUNNELER: u8 = 0x90;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Header {
    kind: u8,
    seq: u32,
    ack: u32,
    len: u16,
}

impl Header {
    fn encode(&self, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
        buf.push(self.kind);
        buf.push(0); // reserved flags
        buf.extend_from_slice(&self.seq.to_be_bytes());
        buf.extend_from_slice(&self.ack.to_be_bytes());
        buf.extend_from_slice(&self.len.to_be_bytes());
        buf.extend_from_slice(payload);
        buf
    }

    fn decode(data: &[u8]) -> Option<(Header, &[u8])> {
        if data.len() < HEADER_LEN {
            return None;
        }
        let header = Header {
            kind: data[0],
            seq: u32::from_be_bytes([data[2], data[3], data[4], data[5]]),
            ack: u32::from_be_bytes([data[6], data[7], data[8], data[9]]),
            len: u16::from_be_bytes([data[10], data[11]]),
        };
        let payload = &data[HEADER_LEN..];
        if payload.len() != header.len as usize {
            return None;
        }
        Some((header, payload))
    }
}

/// `a < b` in sequence space (wrapping).
fn seq_lt(a: u32, b: u32) -> bool {
    (b.wrapping_sub(a) as i32) > 0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    SynSent,
    SynReceived,
    Established,
    /// We sent FIN and wait for it to be acknowledged.
    FinWait,
    Closed,
}

/// A segment sitting in the retransmission queue.
#[derive(Debug)]
struct OutSegment {
    seq: u32,
    kind: u8,
    data: Vec<u8>,
    sent_at: Option<Instant>,
    retransmits: u32,
}

#[derive(Debug)]
struct ConnInner {
    state: State,
    /// Oldest unacknowledged sequence number.
    snd_una: u32,
    /// Next sequence number to assign.
    snd_nxt: u32,
    /// Next byte expected from the peer.
    rcv_nxt: u32,
    send_queue: VecDeque<OutSegment>,
    /// Out-of-order payloads keyed by sequence number.
    reorder: BTreeMap<u32, Vec<u8>>,
    /// In-order bytes ready for the reader.
    ready: VecDeque<u8>,
    cwnd: f64,
    ssthresh: f64,
    srtt: Option<Duration>,
    rto: Duration,
    last_send: Instant,
    last_recv: Instant,
    peer_closed: bool,
    local_closed: bool,
    /// Errno-style reason readable by upper layers after failure.
    last_error: Option<io::ErrorKind>,
}

impl ConnInner {
    fn new(isn: u32, state: State) -> Self {
        let now = Instant::now();
        Self {
            state,
            snd_una: isn,
            snd_nxt: isn,
            rcv_nxt: 0,
            send_queue: VecDeque::new(),
            reorder: BTreeMap::new(),
            ready: VecDeque::new(),
            cwnd: INITIAL_CWND,
            ssthresh: INITIAL_SSTHRESH,
            srtt: None,
            rto: Duration::from_millis(500),
            last_send: now,
            last_recv: now,
            peer_closed: false,
            local_closed: false,
            last_error: None,
        }
    }

    fn in_flight(&self) -> usize {
        self.send_queue
            .iter()
            .filter(|s| s.sent_at.is_some())
            .count()
    }

    fn on_rtt_sample(&mut self, sample: Duration) {
        let srtt = match self.srtt {
            None => sample,
            Some(prev) => prev.mul_f64(0.875) + sample.mul_f64(0.125),
        };
        self.srtt = Some(srtt);
        self.rto = (srtt * 2).clamp(Duration::from_millis(200), Duration::from_secs(10));
    }

    /// Cumulative acknowledgement: everything below `ack` leaves the queue.
    fn apply_ack(&mut self, ack: u32) {
        if !seq_lt(self.snd_una, ack.wrapping_add(1)) {
            return;
        }
        let now = Instant::now();
        let mut acked = 0usize;
        while let Some(front) = self.send_queue.front() {
            let end = front.seq.wrapping_add(front.data.len().max(1) as u32);
            if seq_lt(end.wrapping_sub(1), ack) {
                if let Some(sent_at) = front.sent_at {
                    if front.retransmits == 0 {
                        let sample = now.duration_since(sent_at);
                        self.on_rtt_sample(sample);
                    }
                }
                self.send_queue.pop_front();
                acked += 1;
            } else {
                break;
            }
        }
        self.snd_una = ack;
        for _ in 0..acked {
            if self.cwnd < self.ssthresh {
                self.cwnd += 1.0; // slow start
            } else {
                self.cwnd += 1.0 / self.cwnd; // congestion avoidance
            }
        }
    }
}

/// One reliable UDP-tunneled connection.
#[derive(Debug)]
pub struct TouConnection {
    mux: Arc<UdpMux>,
    remote: SocketAddr,
    inner: Mutex<ConnInner>,
    readable: Notify,
    writable: Notify,
    state_change: Notify,
}

impl TouConnection {
    fn new(mux: Arc<UdpMux>, remote: SocketAddr, isn: u32, state: State) -> Arc<Self> {
        Arc::new(Self {
            mux,
            remote,
            inner: Mutex::new(ConnInner::new(isn, state)),
            readable: Notify::new(),
            writable: Notify::new(),
            state_change: Notify::new(),
        })
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn is_established(&self) -> bool {
        self.inner.lock().state == State::Established
    }

    /// The errno-style failure reason, if the connection died.
    pub fn last_error(&self) -> Option<io::ErrorKind> {
        self.inner.lock().last_error
    }

    fn send_control(&self, kind: u8, seq: u32, ack: u32) {
        let header = Header { kind, seq, ack, len: 0 };
        if let Err(e) = self.mux.send_to(self.remote, &header.encode(&[])) {
            debug!("control send to {} failed: {e}", self.remote);
        }
    }

    /// Queue bytes for transmission, waiting while the window is full.
    pub async fn write(&self, data: &[u8]) -> io::Result<()> {
        let mut offset = 0;
        while offset < data.len() {
            let notified = self.writable.notified();
            {
                let mut inner = self.inner.lock();
                if let Some(kind) = inner.last_error {
                    return Err(io::Error::new(kind, "connection failed"));
                }
                if inner.local_closed || inner.state == State::Closed {
                    return Err(io::Error::new(io::ErrorKind::NotConnected, "closed"));
                }
                // Admit as long as fewer than 2*cwnd segments are queued;
                // the pacing tick sends within cwnd.
                if inner.send_queue.len() < (inner.cwnd * 2.0) as usize + 4 {
                    let chunk = &data[offset..(offset + MAX_SEGMENT).min(data.len())];
                    let seq = inner.snd_nxt;
                    inner.snd_nxt = inner.snd_nxt.wrapping_add(chunk.len() as u32);
                    inner.send_queue.push_back(OutSegment {
                        seq,
                        kind: KIND_DATA,
                        data: chunk.to_vec(),
                        sent_at: None,
                        retransmits: 0,
                    });
                    offset += chunk.len();
                    continue;
                }
            }
            notified.await;
        }
        self.pump();
        Ok(())
    }

    /// Read available bytes. Returns 0 once the peer has closed and the
    /// buffer is drained (EOF).
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let notified = self.readable.notified();
            {
                let mut inner = self.inner.lock();
                if !inner.ready.is_empty() {
                    let n = buf.len().min(inner.ready.len());
                    for slot in buf.iter_mut().take(n) {
                        // VecDeque pop is O(1); n is bounded by caller buffer.
                        *slot = inner.ready.pop_front().unwrap_or(0);
                    }
                    return Ok(n);
                }
                if inner.peer_closed {
                    return Ok(0);
                }
                if let Some(kind) = inner.last_error {
                    return Err(io::Error::new(kind, "connection failed"));
                }
                if inner.state == State::Closed {
                    return Ok(0);
                }
            }
            notified.await;
        }
    }

    /// Graceful close: queue a FIN after any pending data.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        if inner.local_closed || inner.state == State::Closed {
            return;
        }
        inner.local_closed = true;
        let seq = inner.snd_nxt;
        inner.snd_nxt = inner.snd_nxt.wrapping_add(1);
        inner.send_queue.push_back(OutSegment {
            seq,
            kind: KIND_FIN,
            data: Vec::new(),
            sent_at: None,
            retransmits: 0,
        });
        inner.state = State::FinWait;
        drop(inner);
        self.pump();
    }

    /// Wait until the handshake completes or `timeout` elapses.
    async fn wait_established(&self, timeout: Duration) -> io::Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.state_change.notified();
            {
                let inner = self.inner.lock();
                match inner.state {
                    State::Established => return Ok(()),
                    State::Closed => {
                        let kind = inner.last_error.unwrap_or(io::ErrorKind::ConnectionRefused);
                        return Err(io::Error::new(kind, "handshake failed"));
                    }
                    _ => {}
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.fail(io::ErrorKind::TimedOut);
                return Err(io::Error::new(io::ErrorKind::TimedOut, "handshake timed out"));
            }
            let _ = tokio::time::timeout(remaining, notified).await;
        }
    }

    fn fail(&self, kind: io::ErrorKind) {
        {
            let mut inner = self.inner.lock();
            if inner.state == State::Closed {
                return;
            }
            inner.state = State::Closed;
            inner.last_error = Some(kind);
        }
        self.mux.unregister_stream(self.remote);
        self.readable.notify_waiters();
        self.writable.notify_waiters();
        self.state_change.notify_waiters();
    }

    /// Transmit queued segments within the congestion window.
    fn pump(&self) {
        let mut to_send: Vec<(Header, Vec<u8>)> = Vec::new();
        {
            let mut inner = self.inner.lock();
            let window = inner.cwnd as usize;
            let mut in_flight = inner.in_flight();
            let ack = inner.rcv_nxt;
            let now = Instant::now();
            for segment in inner.send_queue.iter_mut() {
                if segment.sent_at.is_some() {
                    continue;
                }
                if in_flight >= window {
                    break;
                }
                segment.sent_at = Some(now);
                in_flight += 1;
                to_send.push((
                    Header {
                        kind: segment.kind,
                        seq: segment.seq,
                        ack,
                        len: segment.data.len() as u16,
                    },
                    segment.data.clone(),
                ));
            }
            if !to_send.is_empty() {
                inner.last_send = now;
            }
        }
        for (header, payload) in to_send {
            if let Err(e) = self.mux.send_to(self.remote, &header.encode(&payload)) {
                debug!("segment send to {} failed: {e}", self.remote);
            }
        }
    }

    fn handle_segment(self: &Arc<Self>, header: Header, payload: &[u8]) {
        let mut wake_readable = false;
        let mut wake_writable = false;
        let mut wake_state = false;
        let mut send_ack = false;
        {
            let mut inner = self.inner.lock();
            inner.last_recv = Instant::now();

            match header.kind {
                KIND_SYNACK => {
                    if inner.state == State::SynSent {
                        inner.rcv_nxt = header.seq.wrapping_add(1);
                        inner.apply_ack(header.ack);
                        inner.state = State::Established;
                        wake_state = true;
                        send_ack = true;
                    }
                }
                KIND_ACK | KIND_KEEPALIVE => {
                    if inner.state == State::SynReceived {
                        inner.state = State::Established;
                        wake_state = true;
                    }
                    inner.apply_ack(header.ack);
                    wake_writable = true;
                    if header.kind == KIND_KEEPALIVE {
                        send_ack = true;
                    }
                }
                KIND_DATA => {
                    if inner.state == State::SynReceived {
                        // Our SYNACK's ACK got lost but data arrived: the
                        // peer clearly completed the handshake.
                        inner.state = State::Established;
                        wake_state = true;
                    }
                    inner.apply_ack(header.ack);
                    if !payload.is_empty() && !seq_lt(header.seq, inner.rcv_nxt) {
                        inner.reorder.entry(header.seq).or_insert_with(|| payload.to_vec());
                    }
                    // Drain every in-order run from the reorder buffer.
                    loop {
                        let next = inner.rcv_nxt;
                        let Some(chunk) = inner.reorder.remove(&next) else {
                            break;
                        };
                        inner.rcv_nxt = inner.rcv_nxt.wrapping_add(chunk.len() as u32);
                        inner.ready.extend(chunk);
                        wake_readable = true;
                    }
                    send_ack = true;
                    wake_writable = true;
                }
                KIND_FIN => {
                    if header.seq == inner.rcv_nxt {
                        inner.rcv_nxt = inner.rcv_nxt.wrapping_add(1);
                        inner.peer_closed = true;
                        wake_readable = true;
                    }
                    send_ack = true;
                }
                KIND_RST => {
                    inner.last_error = Some(io::ErrorKind::ConnectionReset);
                    inner.state = State::Closed;
                    wake_readable = true;
                    wake_writable = true;
                    wake_state = true;
                }
                other => trace!("ignoring segment kind {other:#04x} from {}", self.remote),
            }

            if inner.state == State::FinWait
                && inner.send_queue.is_empty()
                && inner.peer_closed
            {
                inner.state = State::Closed;
                wake_state = true;
            }
        }

        if send_ack {
            let (seq, ack) = {
                let inner = self.inner.lock();
                (inner.snd_nxt, inner.rcv_nxt)
            };
            self.send_control(KIND_ACK, seq, ack);
        }
        if wake_readable {
            self.readable.notify_waiters();
        }
        if wake_writable {
            self.writable.notify_waiters();
            self.pump();
        }
        if wake_state {
            self.state_change.notify_waiters();
        }
    }

    /// Periodic work: retransmission, keepalive, death detection.
    fn on_tick(self: &Arc<Self>) {
        let mut retransmit: Vec<(Header, Vec<u8>)> = Vec::new();
        let mut keepalive = None;
        let mut dead = false;
        {
            let mut inner = self.inner.lock();
            if inner.state == State::Closed {
                return;
            }
            let now = Instant::now();
            let rto = inner.rto;
            let ack = inner.rcv_nxt;
            for segment in inner.send_queue.iter_mut() {
                let Some(sent_at) = segment.sent_at else { continue };
                if now.duration_since(sent_at) < rto {
                    continue;
                }
                segment.retransmits += 1;
                if segment.retransmits > MAX_RETRANSMITS {
                    dead = true;
                    break;
                }
                segment.sent_at = Some(now);
                retransmit.push((
                    Header {
                        kind: segment.kind,
                        seq: segment.seq,
                        ack,
                        len: segment.data.len() as u16,
                    },
                    segment.data.clone(),
                ));
            }
            if dead {
                // fall through; fail() below takes the lock again
            } else if !retransmit.is_empty() {
                // Loss signal: back off multiplicatively.
                inner.ssthresh = (inner.cwnd / 2.0).max(2.0);
                inner.cwnd = INITIAL_CWND;
                inner.rto = (inner.rto * 2).min(Duration::from_secs(10));
            } else if inner.state == State::Established
                && now.duration_since(inner.last_send) > KEEPALIVE_INTERVAL
            {
                keepalive = Some((inner.snd_nxt, inner.rcv_nxt));
                inner.last_send = now;
            }
        }
        if dead {
            warn!("connection to {} exceeded retransmission budget", self.remote);
            self.fail(io::ErrorKind::TimedOut);
            return;
        }
        for (header, payload) in retransmit {
            if let Err(e) = self.mux.send_to(self.remote, &header.encode(&payload)) {
                debug!("retransmit to {} failed: {e}", self.remote);
            }
        }
        if let Some((seq, ack)) = keepalive {
            self.send_control(KIND_KEEPALIVE, seq, ack);
        }
    }

    /// Drive the connection: consume routed datagrams and run the pacing
    /// tick until the connection dies.
    fn spawn_driver(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TICK_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    datagram = rx.recv() => {
                        match datagram {
                            Some(data) => {
                                if let Some((header, payload)) = Header::decode(&data) {
                                    self.handle_segment(header, payload);
                                } else {
                                    trace!("undecodable segment from {}", self.remote);
                                }
                            }
                            None => break,
                        }
                    }
                    _ = ticker.tick() => {
                        self.on_tick();
                        if self.inner.lock().state == State::Closed {
                            break;
                        }
                    }
                }
            }
            self.mux.unregister_stream(self.remote);
        });
    }
}

/// Factory and demultiplexer for UDP-tunneled connections on one mux.
pub struct TouSocket {
    mux: Arc<UdpMux>,
}

/// Accept side of [`TouSocket`].
pub struct TouListener {
    incoming: mpsc::UnboundedReceiver<Arc<TouConnection>>,
}

impl TouListener {
    /// Next inbound connection. The final handshake ACK may still be in
    /// flight; reads simply block until data arrives.
    pub async fn accept(&mut self) -> Option<Arc<TouConnection>> {
        self.incoming.recv().await
    }
}

impl TouSocket {
    /// Install on the mux's fallback route. Returns the socket and the
    /// listener for inbound connections.
    pub fn start(mux: Arc<UdpMux>) -> (Arc<Self>, TouListener) {
        let (fallback_tx, fallback_rx) = mpsc::unbounded_channel();
        mux.set_fallback_handler(fallback_tx);
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let socket = Arc::new(Self { mux });
        socket.clone().spawn_acceptor(fallback_rx, accept_tx);
        (socket, TouListener { incoming: accept_rx })
    }

    /// Send a bare pinhole-opening datagram to a friend's last known
    /// external endpoint. The receiver ignores it.
    pub fn send_tunneler(&self, remote: SocketAddr) {
        if let Err(e) = self.mux.send_to(remote, &[KIND_TUNNELER]) {
            debug!("tunneler to {remote} failed: {e}");
        }
    }

    /// Active open with the given handshake budget.
    pub async fn connect(
        &self,
        remote: SocketAddr,
        timeout: Duration,
    ) -> io::Result<Arc<TouConnection>> {
        let isn: u32 = rand::random();
        let rx = self.mux.register_stream(remote);
        let conn = TouConnection::new(self.mux.clone(), remote, isn.wrapping_add(1), State::SynSent);
        conn.clone().spawn_driver(rx);
        conn.send_control(KIND_SYN, isn, 0);
        // SYN retransmission is covered by re-sending on the caller's
        // schedule: queue a phantom retry via the wait loop.
        let retry = {
            let conn = conn.clone();
            tokio::spawn(async move {
                for _ in 0..8 {
                    tokio::time::sleep(Duration::from_millis(750)).await;
                    if conn.is_established() {
                        return;
                    }
                    conn.send_control(KIND_SYN, isn, 0);
                }
            })
        };
        let result = conn.wait_established(timeout).await;
        retry.abort();
        result?;
        Ok(conn)
    }

    fn spawn_acceptor(
        self: Arc<Self>,
        mut fallback_rx: mpsc::UnboundedReceiver<Datagram>,
        accept_tx: mpsc::UnboundedSender<Arc<TouConnection>>,
    ) {
        tokio::spawn(async move {
            while let Some((src, data)) = fallback_rx.recv().await {
                let Some((header, _payload)) = Header::decode(&data) else {
                    if data.first() == Some(&KIND_TUNNELER) {
                        trace!("tunneler pinhole packet from {src}");
                    }
                    continue;
                };
                if header.kind != KIND_SYN {
                    trace!("non-SYN segment from unclaimed endpoint {src}");
                    continue;
                }
                let isn: u32 = rand::random();
                let rx = self.mux.register_stream(src);
                let conn = TouConnection::new(
                    self.mux.clone(),
                    src,
                    isn.wrapping_add(1),
                    State::SynReceived,
                );
                {
                    let mut inner = conn.inner.lock();
                    inner.rcv_nxt = header.seq.wrapping_add(1);
                }
                conn.clone().spawn_driver(rx);
                conn.send_control(KIND_SYNACK, isn, header.seq.wrapping_add(1));
                if accept_tx.send(conn).is_err() {
                    break;
                }
            }
        });
    }
}

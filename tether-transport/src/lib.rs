#![forbid(unsafe_code)]

//! Tether UDP transport adapter.
//!
//! * A single `UdpSocket` shared by every UDP-borne subsystem.
//! * The receive loop classifies datagrams (STUN vs. peer stream) and
//!   routes them by remote endpoint.
//! * Outbound sends are serialized and non-blocking, with per-send TTL
//!   for STUN keepalives.

use std::{
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
};

use dashmap::DashMap;
use parking_lot::Mutex;
use socket2::{Domain, Type};
use tokio::{net::UdpSocket, sync::mpsc};
use tracing::{debug, error, trace};

pub mod stun;
pub mod tou;
pub mod upnp;

pub use tou::{TouConnection, TouListener, TouSocket};

/// Largest datagram we will ever read. Stream segments stay well below
/// this; STUN packets are tiny.
const MAX_DATAGRAM: usize = 9216;

/// Default TTL restored after any per-send override.
const DEFAULT_TTL: u32 = 64;

/// Short TTL used for STUN keepalives: enough hops to traverse the local
/// NAT and open the pinhole, not enough to bother the far end.
pub const STUN_KEEPALIVE_TTL: u32 = 3;

/// A datagram delivered to a subsystem together with its origin.
pub type Datagram = (SocketAddr, Vec<u8>);

/// Single bound UDP port demultiplexing STUN and peer streams.
///
/// Inbound routing: a datagram whose first two bytes form a STUN binding
/// method/class (with a plausible length and the magic cookie) goes to the
/// STUN subsystem; everything else is routed to the stream registered for
/// its remote endpoint, or to the fallback channel (new connections,
/// tunneler pinhole packets) when no stream claims the endpoint.
#[derive(Debug)]
pub struct UdpMux {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    /// Serializes sends so TTL overrides cannot interleave.
    send_lock: Mutex<()>,
    /// Streams keyed by remote endpoint.
    streams: DashMap<SocketAddr, mpsc::UnboundedSender<Vec<u8>>>,
    stun_tx: Mutex<Option<mpsc::UnboundedSender<Datagram>>>,
    fallback_tx: Mutex<Option<mpsc::UnboundedSender<Datagram>>>,
}

impl UdpMux {
    /// Bind on 0.0.0.0:port. Port 0 lets the OS pick.
    pub async fn bind(port: u16) -> io::Result<Arc<Self>> {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
        let domain = Domain::for_address(addr);
        let socket = socket2::Socket::new(domain, Type::DGRAM, None)?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        let std_sock: std::net::UdpSocket = socket.into();
        std_sock.set_nonblocking(true)?;
        let udp = UdpSocket::from_std(std_sock)?;
        udp.set_ttl(DEFAULT_TTL)?;
        let local_addr = udp.local_addr()?;

        let mux = Arc::new(Self {
            socket: Arc::new(udp),
            local_addr,
            send_lock: Mutex::new(()),
            streams: DashMap::new(),
            stun_tx: Mutex::new(None),
            fallback_tx: Mutex::new(None),
        });
        mux.clone().spawn_rx();
        Ok(mux)
    }

    /// The bound local endpoint.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Register the STUN subsystem's inbound channel.
    pub fn set_stun_handler(&self, tx: mpsc::UnboundedSender<Datagram>) {
        *self.stun_tx.lock() = Some(tx);
    }

    /// Register the fallback channel for datagrams no stream claims.
    pub fn set_fallback_handler(&self, tx: mpsc::UnboundedSender<Datagram>) {
        *self.fallback_tx.lock() = Some(tx);
    }

    /// Claim all future datagrams from `remote` for a stream.
    pub fn register_stream(&self, remote: SocketAddr) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.streams.insert(remote, tx);
        rx
    }

    /// Drop the stream claim on `remote`.
    pub fn unregister_stream(&self, remote: SocketAddr) {
        self.streams.remove(&remote);
    }

    /// Non-blocking serialized send at the default TTL.
    pub fn send_to(&self, remote: SocketAddr, data: &[u8]) -> io::Result<usize> {
        let _guard = self.send_lock.lock();
        self.try_send(remote, data)
    }

    /// Non-blocking serialized send with a TTL override for this datagram.
    pub fn send_with_ttl(&self, remote: SocketAddr, data: &[u8], ttl: u32) -> io::Result<usize> {
        let _guard = self.send_lock.lock();
        self.socket.set_ttl(ttl)?;
        let result = self.try_send(remote, data);
        // Restore before releasing the lock so other senders see 64.
        if let Err(e) = self.socket.set_ttl(DEFAULT_TTL) {
            error!("failed to restore default ttl: {e}");
        }
        result
    }

    fn try_send(&self, remote: SocketAddr, data: &[u8]) -> io::Result<usize> {
        match self.socket.try_send_to(data, remote) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                // UDP: a full socket buffer drops the datagram, the
                // reliability layer above retransmits.
                trace!("udp send buffer full, dropping {} bytes to {remote}", data.len());
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }

    fn spawn_rx(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                match self.socket.recv_from(&mut buf).await {
                    Ok((len, src)) => self.route(src, &buf[..len]),
                    Err(e) => {
                        // Transient receive errors (ICMP port unreachable
                        // surfacing on some platforms) are not fatal.
                        debug!("udp recv error: {e}");
                    }
                }
            }
        });
    }

    fn route(&self, src: SocketAddr, data: &[u8]) {
        if stun::is_stun_packet(data) {
            if let Some(tx) = self.stun_tx.lock().as_ref() {
                let _ = tx.send((src, data.to_vec()));
            }
            return;
        }
        if let Some(stream) = self.streams.get(&src) {
            if stream.send(data.to_vec()).is_ok() {
                return;
            }
            // Receiver gone; fall through so a reconnect can be accepted.
        }
        if let Some(tx) = self.fallback_tx.lock().as_ref() {
            let _ = tx.send((src, data.to_vec()));
        } else {
            trace!("dropping {} bytes from unclaimed endpoint {src}", data.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn routes_by_remote_endpoint() {
        let a = UdpMux::bind(0).await.unwrap();
        let b = UdpMux::bind(0).await.unwrap();
        let a_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), a.local_addr().port());
        let b_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), b.local_addr().port());

        let mut rx = b.register_stream(a_addr);
        a.send_to(b_addr, b"\x80hello").unwrap();
        let got = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, b"\x80hello");
    }

    #[tokio::test]
    async fn stun_packets_go_to_stun_handler() {
        let a = UdpMux::bind(0).await.unwrap();
        let b = UdpMux::bind(0).await.unwrap();
        let b_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), b.local_addr().port());

        let (tx, mut rx) = mpsc::unbounded_channel();
        b.set_stun_handler(tx);

        let req = stun::encode_binding_request(&stun::TransactionId::generate(), None);
        a.send_to(b_addr, &req).unwrap();
        let (_src, data) = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(stun::is_binding_request(&data));
    }

    #[tokio::test]
    async fn unclaimed_datagrams_hit_fallback() {
        let a = UdpMux::bind(0).await.unwrap();
        let b = UdpMux::bind(0).await.unwrap();
        let b_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), b.local_addr().port());

        let (tx, mut rx) = mpsc::unbounded_channel();
        b.set_fallback_handler(tx);
        a.send_to(b_addr, b"\x90tunneler").unwrap();
        let (_src, data) = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(data, b"\x90tunneler");
    }
}

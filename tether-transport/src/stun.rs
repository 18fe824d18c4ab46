//! STUN (RFC 5389) binding requests and responses for address discovery.
//!
//! Only the attributes the connectivity core needs are implemented:
//! MAPPED-ADDRESS, XOR-MAPPED-ADDRESS and RESPONSE-PORT. There is no
//! authentication and no ICE. The server role exists so that peers can act
//! as STUN servers for each other during NAT classification.

use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::{
        atomic::{AtomicU16, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::{Buf, BufMut, BytesMut};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use tether_core::NatClass;

use crate::{Datagram, UdpMux, STUN_KEEPALIVE_TTL};

/// STUN magic cookie (RFC 5389 §6).
pub const MAGIC_COOKIE: u32 = 0x2112A442;

const BINDING_REQUEST: u16 = 0x0001;
const BINDING_RESPONSE: u16 = 0x0101;

const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const ATTR_RESPONSE_PORT: u16 = 0x0027;

/// Per-step timeout while talking to one server.
pub const STEP_TIMEOUT: Duration = Duration::from_secs(5);
/// Overall budget for a full NAT classification run.
pub const CLASSIFY_BUDGET: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum StunError {
    #[error("packet too short or malformed")]
    Malformed,
    #[error("not a stun packet")]
    NotStun,
    #[error("unsupported address family {0}")]
    AddressFamily(u8),
    #[error("timed out waiting for binding response")]
    Timeout,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub type StunResult<T> = Result<T, StunError>;

// ---------------------------------------------------------------------------
// Transaction IDs
// ---------------------------------------------------------------------------

/// 96-bit transaction id, rendered as 24 hex characters. The upper ten
/// bytes are fixed per process; the low 16 bits increment per request,
/// giving a ~64k unique in-flight budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId(pub [u8; 12]);

static TXID_PREFIX: Lazy<[u8; 10]> = Lazy::new(|| {
    let mut prefix = [0u8; 10];
    rand::Rng::fill(&mut rand::thread_rng(), &mut prefix[..]);
    prefix
});
static TXID_COUNTER: AtomicU16 = AtomicU16::new(0);

impl TransactionId {
    /// Next id in the per-process sequence.
    pub fn generate() -> Self {
        let counter = TXID_COUNTER.fetch_add(1, Ordering::Relaxed);
        let mut bytes = [0u8; 12];
        bytes[..10].copy_from_slice(&*TXID_PREFIX);
        bytes[10..].copy_from_slice(&counter.to_be_bytes());
        Self(bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

// ---------------------------------------------------------------------------
// Packet classification and codec
// ---------------------------------------------------------------------------

/// Whether a datagram looks like one of the STUN packets we speak: correct
/// header length, the magic cookie, and a binding method/class.
pub fn is_stun_packet(data: &[u8]) -> bool {
    is_binding_request(data) || is_binding_response(data)
}

fn header_matches(data: &[u8], msg_type: u16) -> bool {
    if data.len() < 20 {
        return false;
    }
    let ty = u16::from_be_bytes([data[0], data[1]]);
    let len = u16::from_be_bytes([data[2], data[3]]) as usize;
    let cookie = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    ty == msg_type && len + 20 == data.len() && cookie == MAGIC_COOKIE
}

pub fn is_binding_request(data: &[u8]) -> bool {
    header_matches(data, BINDING_REQUEST)
}

pub fn is_binding_response(data: &[u8]) -> bool {
    header_matches(data, BINDING_RESPONSE)
}

/// Encode a binding request, optionally asking the server to answer from
/// an alternate source port (RESPONSE-PORT, 0x0027).
pub fn encode_binding_request(txid: &TransactionId, response_port: Option<u16>) -> Vec<u8> {
    let attr_len: u16 = if response_port.is_some() { 8 } else { 0 };
    let mut buf = BytesMut::with_capacity(20 + attr_len as usize);
    buf.put_u16(BINDING_REQUEST);
    buf.put_u16(attr_len);
    buf.put_u32(MAGIC_COOKIE);
    buf.put_slice(&txid.0);
    if let Some(port) = response_port {
        buf.put_u16(ATTR_RESPONSE_PORT);
        buf.put_u16(2);
        buf.put_u16(port);
        buf.put_u16(0); // pad to 4-byte boundary
    }
    buf.to_vec()
}

/// Encode a binding response carrying both the XOR and the plain mapped
/// address for `reflexive`, the endpoint the request was seen from.
pub fn encode_binding_response(txid: &TransactionId, reflexive: SocketAddr) -> Vec<u8> {
    let mapped = encode_address(reflexive, None);
    let xored = encode_address(reflexive, Some(txid));
    let attr_len = (4 + mapped.len() + 4 + xored.len()) as u16;
    let mut buf = BytesMut::with_capacity(20 + attr_len as usize);
    buf.put_u16(BINDING_RESPONSE);
    buf.put_u16(attr_len);
    buf.put_u32(MAGIC_COOKIE);
    buf.put_slice(&txid.0);
    buf.put_u16(ATTR_XOR_MAPPED_ADDRESS);
    buf.put_u16(xored.len() as u16);
    buf.put_slice(&xored);
    buf.put_u16(ATTR_MAPPED_ADDRESS);
    buf.put_u16(mapped.len() as u16);
    buf.put_slice(&mapped);
    buf.to_vec()
}

/// Address attribute value; XOR obfuscation applied when `xor` carries the
/// transaction id.
fn encode_address(addr: SocketAddr, xor: Option<&TransactionId>) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(20);
    buf.put_u8(0);
    let port = match xor {
        Some(_) => addr.port() ^ (MAGIC_COOKIE >> 16) as u16,
        None => addr.port(),
    };
    match addr.ip() {
        IpAddr::V4(ip) => {
            buf.put_u8(0x01);
            buf.put_u16(port);
            let mut octets = ip.octets();
            if xor.is_some() {
                for (octet, key) in octets.iter_mut().zip(MAGIC_COOKIE.to_be_bytes()) {
                    *octet ^= key;
                }
            }
            buf.put_slice(&octets);
        }
        IpAddr::V6(ip) => {
            buf.put_u8(0x02);
            buf.put_u16(port);
            let mut octets = ip.octets();
            if let Some(txid) = xor {
                let mut key = [0u8; 16];
                key[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
                key[4..].copy_from_slice(&txid.0);
                for (octet, k) in octets.iter_mut().zip(key) {
                    *octet ^= k;
                }
            }
            buf.put_slice(&octets);
        }
    }
    buf.to_vec()
}

fn decode_address(value: &[u8], xor: Option<&TransactionId>) -> StunResult<SocketAddr> {
    if value.len() < 8 {
        return Err(StunError::Malformed);
    }
    let mut cursor = value;
    cursor.advance(1);
    let family = cursor.get_u8();
    let raw_port = cursor.get_u16();
    let port = match xor {
        Some(_) => raw_port ^ (MAGIC_COOKIE >> 16) as u16,
        None => raw_port,
    };
    match family {
        0x01 => {
            let mut octets = [0u8; 4];
            cursor.copy_to_slice(&mut octets);
            if xor.is_some() {
                for (octet, key) in octets.iter_mut().zip(MAGIC_COOKIE.to_be_bytes()) {
                    *octet ^= key;
                }
            }
            Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
        }
        0x02 => {
            if cursor.len() < 16 {
                return Err(StunError::Malformed);
            }
            let mut octets = [0u8; 16];
            cursor.copy_to_slice(&mut octets);
            if let Some(txid) = xor {
                let mut key = [0u8; 16];
                key[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
                key[4..].copy_from_slice(&txid.0);
                for (octet, k) in octets.iter_mut().zip(key) {
                    *octet ^= k;
                }
            }
            Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        other => Err(StunError::AddressFamily(other)),
    }
}

/// A parsed binding request.
#[derive(Debug, Clone, Copy)]
pub struct ParsedRequest {
    pub transaction_id: TransactionId,
    /// Alternate source port the client asked us to answer from.
    pub response_port: Option<u16>,
}

/// A parsed binding response. Both address attributes are retained so the
/// caller can detect disagreement.
#[derive(Debug, Clone, Copy)]
pub struct ParsedResponse {
    pub transaction_id: TransactionId,
    pub mapped: Option<SocketAddr>,
    pub xor_mapped: Option<SocketAddr>,
}

impl ParsedResponse {
    /// The external endpoint this response reports, preferring the XOR
    /// variant. The second element is true when both attributes are
    /// present and disagree, a sign of router tampering.
    pub fn resolve(&self) -> Option<(SocketAddr, bool)> {
        match (self.xor_mapped, self.mapped) {
            (Some(xor), Some(plain)) => Some((xor, xor != plain)),
            (Some(xor), None) => Some((xor, false)),
            (None, Some(plain)) => Some((plain, false)),
            (None, None) => None,
        }
    }
}

fn transaction_id_of(data: &[u8]) -> TransactionId {
    let mut bytes = [0u8; 12];
    bytes.copy_from_slice(&data[8..20]);
    TransactionId(bytes)
}

/// Walk the attribute section, yielding (type, value) pairs. Values are
/// padded to 4-byte boundaries on the wire; padding is skipped here.
fn attributes(data: &[u8]) -> impl Iterator<Item = (u16, &[u8])> + '_ {
    let mut rest = &data[20..];
    std::iter::from_fn(move || {
        if rest.len() < 4 {
            return None;
        }
        let ty = u16::from_be_bytes([rest[0], rest[1]]);
        let len = u16::from_be_bytes([rest[2], rest[3]]) as usize;
        if rest.len() < 4 + len {
            return None;
        }
        let value = &rest[4..4 + len];
        let padded = 4 + len + ((4 - (len % 4)) % 4);
        rest = if rest.len() >= padded { &rest[padded..] } else { &[] };
        Some((ty, value))
    })
}

pub fn parse_binding_request(data: &[u8]) -> StunResult<ParsedRequest> {
    if !is_binding_request(data) {
        return Err(StunError::NotStun);
    }
    let mut response_port = None;
    for (ty, value) in attributes(data) {
        if ty == ATTR_RESPONSE_PORT {
            if value.len() != 2 {
                return Err(StunError::Malformed);
            }
            response_port = Some(u16::from_be_bytes([value[0], value[1]]));
        } else {
            trace!("ignoring stun request attribute {ty:#06x}");
        }
    }
    Ok(ParsedRequest {
        transaction_id: transaction_id_of(data),
        response_port,
    })
}

pub fn parse_binding_response(data: &[u8]) -> StunResult<ParsedResponse> {
    if !is_binding_response(data) {
        return Err(StunError::NotStun);
    }
    let txid = transaction_id_of(data);
    let mut mapped = None;
    let mut xor_mapped = None;
    for (ty, value) in attributes(data) {
        match ty {
            ATTR_MAPPED_ADDRESS => mapped = Some(decode_address(value, None)?),
            ATTR_XOR_MAPPED_ADDRESS => xor_mapped = Some(decode_address(value, Some(&txid))?),
            other => trace!("ignoring stun response attribute {other:#06x}"),
        }
    }
    Ok(ParsedResponse {
        transaction_id: txid,
        mapped,
        xor_mapped,
    })
}

// ---------------------------------------------------------------------------
// Client + server service over the shared mux
// ---------------------------------------------------------------------------

/// A completed binding exchange.
#[derive(Debug, Clone, Copy)]
pub struct BindingReply {
    /// Our external endpoint as the server saw it.
    pub external: SocketAddr,
    /// The endpoint the response actually arrived from.
    pub responder: SocketAddr,
    /// Both address attributes were present and disagreed.
    pub tampering_suspected: bool,
}

/// STUN over the shared UDP mux: issues binding requests, answers peers'
/// binding requests, and keeps the NAT pinhole warm.
pub struct StunService {
    mux: Arc<UdpMux>,
    pending: DashMap<TransactionId, oneshot::Sender<(SocketAddr, ParsedResponse)>>,
}

impl StunService {
    /// Attach to the mux. Registers the STUN inbound route and spawns the
    /// dispatch task.
    pub fn start(mux: Arc<UdpMux>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        mux.set_stun_handler(tx);
        let service = Arc::new(Self {
            mux,
            pending: DashMap::new(),
        });
        service.clone().spawn_dispatch(rx);
        service
    }

    fn spawn_dispatch(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Datagram>) {
        tokio::spawn(async move {
            while let Some((src, data)) = rx.recv().await {
                self.handle_packet(src, &data).await;
            }
        });
    }

    async fn handle_packet(&self, src: SocketAddr, data: &[u8]) {
        if is_binding_response(data) {
            match parse_binding_response(data) {
                Ok(resp) => {
                    if let Some((_, tx)) = self.pending.remove(&resp.transaction_id) {
                        let _ = tx.send((src, resp));
                    } else {
                        debug!("stun response with unknown transaction from {src}");
                    }
                }
                Err(e) => debug!("bad stun response from {src}: {e}"),
            }
            return;
        }
        // Server role: answer the binding request with the endpoint we saw
        // it from, honouring RESPONSE-PORT by answering from an alternate
        // source port.
        match parse_binding_request(data) {
            Ok(req) => {
                let response = encode_binding_response(&req.transaction_id, src);
                match req.response_port {
                    None => {
                        let _ = self.mux.send_to(src, &response);
                    }
                    Some(port) => {
                        if let Err(e) = respond_from_port(src, response, port).await {
                            debug!("response-port answer from :{port} failed: {e}");
                        }
                    }
                }
            }
            Err(e) => debug!("bad stun request from {src}: {e}"),
        }
    }

    /// One binding round trip against `server`.
    pub async fn binding_request(
        &self,
        server: SocketAddr,
        response_port: Option<u16>,
        timeout: Duration,
    ) -> StunResult<BindingReply> {
        let txid = TransactionId::generate();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(txid, tx);
        let request = encode_binding_request(&txid, response_port);
        self.mux.send_to(server, &request)?;

        let result = tokio::time::timeout(timeout, rx).await;
        self.pending.remove(&txid);
        let (responder, resp) = match result {
            Ok(Ok(pair)) => pair,
            _ => return Err(StunError::Timeout),
        };
        let (external, tampering_suspected) = resp.resolve().ok_or(StunError::Malformed)?;
        if tampering_suspected {
            warn!(
                "stun response from {responder}: mapped and xor-mapped disagree, \
                 tampering suspected; trusting xor"
            );
        }
        Ok(BindingReply {
            external,
            responder,
            tampering_suspected,
        })
    }

    /// Fire-and-forget keepalive with a short TTL: opens the NAT pinhole
    /// without requiring the far end to care.
    pub fn keepalive(&self, server: SocketAddr) {
        let txid = TransactionId::generate();
        let request = encode_binding_request(&txid, None);
        if let Err(e) = self.mux.send_with_ttl(server, &request, STUN_KEEPALIVE_TTL) {
            debug!("stun keepalive to {server} failed: {e}");
        }
    }

    /// Classify the local NAT using two independent servers.
    ///
    /// Mapping test: identical external endpoints reported by both servers
    /// mean the mapping is endpoint-independent; differing endpoints mean
    /// a symmetric NAT. No-translation test: when that mapping equals the
    /// local endpoint, the second server's answer on the direct port
    /// already proves there is no NAT at all. Filtering test: a response
    /// arriving from an alternate source port that we never sent to
    /// distinguishes full-cone from restricted.
    pub async fn classify_nat(
        &self,
        server_a: SocketAddr,
        server_b: SocketAddr,
        local: SocketAddr,
    ) -> (NatClass, Option<SocketAddr>) {
        match tokio::time::timeout(
            CLASSIFY_BUDGET,
            self.classify_inner(server_a, server_b, local),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => (NatClass::Unknown, None),
        }
    }

    async fn classify_inner(
        &self,
        server_a: SocketAddr,
        server_b: SocketAddr,
        local: SocketAddr,
    ) -> (NatClass, Option<SocketAddr>) {
        let first = self.binding_request(server_a, None, STEP_TIMEOUT).await;
        let second = self.binding_request(server_b, None, STEP_TIMEOUT).await;

        let (x1, x2) = match (first, second) {
            (Err(_), Err(_)) => return (NatClass::Unreachable, None),
            (Ok(r), Err(_)) | (Err(_), Ok(r)) => {
                // One server answered; we know our address but cannot
                // judge mapping behaviour.
                return (NatClass::Unknown, Some(r.external));
            }
            (Ok(r1), Ok(r2)) => (r1.external, r2.external),
        };

        if x1 != x2 {
            debug!("port-dependent mapping: {x1} vs {x2}");
            return (NatClass::Symmetric, Some(x2));
        }

        // No-translation test: the mapping equals the local endpoint and
        // the second, independent server's answer already reached the
        // direct port. That alone proves there is no NAT in play; it must
        // not depend on the alternate-port extension below, which many
        // servers ignore.
        if x1 == local {
            return (NatClass::Unrestricted, Some(x1));
        }

        // Filtering test: ask server A to answer from an alternate source
        // port. Receiving that answer means unsolicited inbound passes.
        let alt = self
            .binding_request(server_a, Some(server_a.port().wrapping_add(1)), STEP_TIMEOUT)
            .await;
        let cone_open = matches!(&alt, Ok(reply) if reply.responder != server_a);

        let class = if cone_open {
            NatClass::FullCone
        } else {
            NatClass::RestrictedCone
        };
        (class, Some(x1))
    }
}

/// Send `response` to `dest` from a freshly bound alternate source port.
async fn respond_from_port(dest: SocketAddr, response: Vec<u8>, port: u16) -> StunResult<()> {
    let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
    let socket = tokio::net::UdpSocket::bind(bind_addr).await?;
    socket.send_to(&response, dest).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn txid() -> TransactionId {
        TransactionId(*b"abcdefghijkl")
    }

    #[test]
    fn transaction_ids_are_24_hex_and_increment() {
        let a = TransactionId::generate();
        let b = TransactionId::generate();
        assert_eq!(a.to_hex().len(), 24);
        assert_eq!(a.0[..10], b.0[..10]);
        let ca = u16::from_be_bytes([a.0[10], a.0[11]]);
        let cb = u16::from_be_bytes([b.0[10], b.0[11]]);
        assert_eq!(cb, ca.wrapping_add(1));
    }

    #[test]
    fn request_roundtrip_preserves_transaction_id() {
        let id = txid();
        let req = encode_binding_request(&id, None);
        assert!(is_binding_request(&req));
        let parsed = parse_binding_request(&req).unwrap();
        assert_eq!(parsed.transaction_id, id);
        assert_eq!(parsed.response_port, None);
    }

    #[test]
    fn response_roundtrip_recovers_transaction_id() {
        let id = txid();
        let reflexive: SocketAddr = "203.0.113.7:50000".parse().unwrap();
        let resp = encode_binding_response(&id, reflexive);
        assert!(is_binding_response(&resp));
        let parsed = parse_binding_response(&resp).unwrap();
        assert_eq!(parsed.transaction_id, id);
        assert_eq!(parsed.resolve(), Some((reflexive, false)));
    }

    #[test]
    fn response_port_attribute_roundtrip() {
        let req = encode_binding_request(&txid(), Some(17001));
        let parsed = parse_binding_request(&req).unwrap();
        assert_eq!(parsed.response_port, Some(17001));
    }

    #[test]
    fn xor_mapped_only_resolves_exactly() {
        // Hand-build a response carrying only XOR-MAPPED-ADDRESS.
        let id = txid();
        let endpoint: SocketAddr = "203.0.113.7:50000".parse().unwrap();
        let xored = encode_address(endpoint, Some(&id));
        let mut buf = BytesMut::new();
        buf.put_u16(BINDING_RESPONSE);
        buf.put_u16((4 + xored.len()) as u16);
        buf.put_u32(MAGIC_COOKIE);
        buf.put_slice(&id.0);
        buf.put_u16(ATTR_XOR_MAPPED_ADDRESS);
        buf.put_u16(xored.len() as u16);
        buf.put_slice(&xored);

        let parsed = parse_binding_response(&buf).unwrap();
        assert_eq!(parsed.resolve(), Some((endpoint, false)));
    }

    #[test]
    fn xor_wins_over_disagreeing_mapped_address() {
        let id = txid();
        let xor_endpoint: SocketAddr = "203.0.113.7:50000".parse().unwrap();
        let plain_endpoint: SocketAddr = "198.51.100.1:50000".parse().unwrap();
        let xored = encode_address(xor_endpoint, Some(&id));
        let plain = encode_address(plain_endpoint, None);
        let mut buf = BytesMut::new();
        buf.put_u16(BINDING_RESPONSE);
        buf.put_u16((4 + xored.len() + 4 + plain.len()) as u16);
        buf.put_u32(MAGIC_COOKIE);
        buf.put_slice(&id.0);
        buf.put_u16(ATTR_XOR_MAPPED_ADDRESS);
        buf.put_u16(xored.len() as u16);
        buf.put_slice(&xored);
        buf.put_u16(ATTR_MAPPED_ADDRESS);
        buf.put_u16(plain.len() as u16);
        buf.put_slice(&plain);

        let parsed = parse_binding_response(&buf).unwrap();
        let (resolved, tampering) = parsed.resolve().unwrap();
        assert_eq!(resolved, xor_endpoint);
        assert!(tampering, "disagreement must raise the tampering diagnostic");
    }

    #[test]
    fn non_stun_data_is_rejected() {
        assert!(!is_stun_packet(b"hello"));
        assert!(!is_stun_packet(&[0u8; 19]));
        // Right type and cookie but wrong length field.
        let mut buf = BytesMut::new();
        buf.put_u16(BINDING_REQUEST);
        buf.put_u16(4); // claims 4 attribute bytes that are absent
        buf.put_u32(MAGIC_COOKIE);
        buf.put_slice(b"abcdefghijkl");
        assert!(!is_stun_packet(&buf));
    }

    #[test]
    fn ipv6_xor_address_roundtrip() {
        let id = txid();
        let endpoint: SocketAddr = "[2001:db8::7]:4242".parse().unwrap();
        let value = encode_address(endpoint, Some(&id));
        assert_eq!(decode_address(&value, Some(&id)).unwrap(), endpoint);
    }

    #[tokio::test]
    async fn binding_against_live_peer_mux() {
        use std::net::{IpAddr, Ipv4Addr};
        let a = UdpMux::bind(0).await.unwrap();
        let b = UdpMux::bind(0).await.unwrap();
        let b_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), b.local_addr().port());

        let client = StunService::start(a.clone());
        let _server = StunService::start(b);

        let reply = client
            .binding_request(b_addr, None, Duration::from_secs(2))
            .await
            .unwrap();
        // The peer saw us from loopback at our bound port.
        assert_eq!(reply.external.port(), a.local_addr().port());
        assert!(!reply.tampering_suspected);
    }
}

//! NAT classification, driven through stub servers whose reported
//! mapping and alternate-port behavior are controlled per test so every
//! reachable class is pinned to a concrete assertion.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use tether_core::NatClass;
use tether_transport::{
    stun::{encode_binding_response, parse_binding_request, StunService},
    UdpMux,
};

fn loopback(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}

/// What the stub reports as the client's reflexive endpoint.
#[derive(Clone, Copy)]
enum Mapped {
    /// Echo the endpoint the request actually came from (an honest
    /// no-NAT server).
    Reflect,
    /// Claim this endpoint, simulating a NAT in front of the client.
    Fixed(SocketAddr),
}

/// Minimal STUN server: answers binding requests, reporting `mapped`,
/// and either honours RESPONSE-PORT by answering from a fresh source
/// port or ignores it entirely (as most public servers do).
async fn spawn_stub(mapped: Mapped, honor_response_port: bool) -> SocketAddr {
    let socket = tokio::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))
        .await
        .unwrap();
    let addr = loopback(socket.local_addr().unwrap().port());
    tokio::spawn(async move {
        let mut buf = vec![0u8; 1500];
        loop {
            let Ok((len, src)) = socket.recv_from(&mut buf).await else {
                break;
            };
            let Ok(request) = parse_binding_request(&buf[..len]) else {
                continue;
            };
            let reflexive = match mapped {
                Mapped::Reflect => src,
                Mapped::Fixed(endpoint) => endpoint,
            };
            let response = encode_binding_response(&request.transaction_id, reflexive);
            if honor_response_port && request.response_port.is_some() {
                // Answer from an alternate source port.
                if let Ok(alt) = tokio::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await {
                    let _ = alt.send_to(&response, src).await;
                }
            } else {
                let _ = socket.send_to(&response, src).await;
            }
        }
    });
    addr
}

async fn client() -> (std::sync::Arc<StunService>, SocketAddr) {
    let mux = UdpMux::bind(0).await.unwrap();
    let local = loopback(mux.local_addr().port());
    (StunService::start(mux), local)
}

#[tokio::test]
async fn unrestricted_without_alternate_port_support() {
    // Both servers see the true endpoint; neither implements the
    // alternate-port extension. Direct reachability must still be
    // recognized from the second server's answer alone.
    let server_a = spawn_stub(Mapped::Reflect, false).await;
    let server_b = spawn_stub(Mapped::Reflect, false).await;
    let (stun, local) = client().await;

    let (class, external) = stun.classify_nat(server_a, server_b, local).await;
    assert_eq!(class, NatClass::Unrestricted);
    assert_eq!(external, Some(local));
}

#[tokio::test]
async fn unrestricted_through_real_peer_servers() {
    // Full-stack variant: the peers run the real service (which does
    // honour RESPONSE-PORT); the result is the same.
    let server_a_mux = UdpMux::bind(0).await.unwrap();
    let server_b_mux = UdpMux::bind(0).await.unwrap();
    let server_a = loopback(server_a_mux.local_addr().port());
    let server_b = loopback(server_b_mux.local_addr().port());
    let _a = StunService::start(server_a_mux);
    let _b = StunService::start(server_b_mux);
    let (stun, local) = client().await;

    let (class, external) = stun.classify_nat(server_a, server_b, local).await;
    assert_eq!(class, NatClass::Unrestricted);
    assert_eq!(external, Some(local));
}

#[tokio::test]
async fn full_cone_when_alternate_port_answer_arrives() {
    // Both servers agree on a translated mapping, and server A's
    // alternate-port answer gets through the (pretend) filter.
    let translated = loopback(45_000);
    let server_a = spawn_stub(Mapped::Fixed(translated), true).await;
    let server_b = spawn_stub(Mapped::Fixed(translated), true).await;
    let (stun, local) = client().await;

    let (class, external) = stun.classify_nat(server_a, server_b, local).await;
    assert_eq!(class, NatClass::FullCone);
    assert_eq!(external, Some(translated));
}

#[tokio::test]
async fn restricted_cone_when_alternate_port_is_ignored() {
    // Same stable translated mapping, but server A ignores RESPONSE-PORT
    // and answers from its usual port: the filtering test fails.
    let translated = loopback(45_001);
    let server_a = spawn_stub(Mapped::Fixed(translated), false).await;
    let server_b = spawn_stub(Mapped::Fixed(translated), false).await;
    let (stun, local) = client().await;

    let (class, external) = stun.classify_nat(server_a, server_b, local).await;
    assert_eq!(class, NatClass::RestrictedCone);
    assert_eq!(external, Some(translated));
}

#[tokio::test]
async fn symmetric_when_servers_see_different_mappings() {
    let server_a = spawn_stub(Mapped::Fixed(loopback(45_002)), true).await;
    let server_b = spawn_stub(Mapped::Fixed(loopback(45_003)), true).await;
    let (stun, local) = client().await;

    let (class, _external) = stun.classify_nat(server_a, server_b, local).await;
    assert_eq!(class, NatClass::Symmetric);
}

#[tokio::test]
async fn unreachable_when_no_server_answers() {
    let (stun, local) = client().await;
    // Nobody listens on these.
    let (class, external) = stun.classify_nat(loopback(1), loopback(2), local).await;
    assert_eq!(class, NatClass::Unreachable);
    assert_eq!(external, None);
}

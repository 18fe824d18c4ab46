//! Own-connectivity: a linear state machine that figures out who we are
//! on the network and tells the directory.
//!
//! Runs once at startup and again after an interface change or a long
//! sleep. Each step carries its own timeout; a failed directory publish
//! falls back to asking the directory to record whatever public address
//! it observes.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use parking_lot::Mutex;
use tokio::net::lookup_host;
use tracing::{debug, info, warn};

use tether_core::{Event, EventBus, NatClass};
use tether_transport::{stun::StunService, upnp::UpnpSession};

use crate::directory::DirectorySession;

/// Per-step ceiling; classification has its own internal budget.
const STEP_TIMEOUT: Duration = Duration::from_secs(15);
/// UPnP is best-effort and gets a shorter leash.
const UPNP_TIMEOUT: Duration = Duration::from_secs(10);

/// Where the linear machine currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OwnPhase {
    #[default]
    PickInterface,
    OpenPorts,
    OptionalUpnp,
    StunDiscoverServers,
    StunClassifyNat,
    PublishToDirectory,
    Ready,
}

/// Snapshot of our own reachability.
#[derive(Debug, Clone, Copy, Default)]
pub struct OwnState {
    pub phase: OwnPhase,
    pub local_endpoint: Option<SocketAddr>,
    pub external_endpoint: Option<SocketAddr>,
    pub nat_class: NatClass,
}

pub struct OwnConnectivity {
    stun: Arc<StunService>,
    directory: Arc<DirectorySession>,
    events: EventBus,
    stun_servers: Vec<String>,
    upnp_enabled: bool,
    listen_port: u16,
    state: Mutex<OwnState>,
    upnp: tokio::sync::Mutex<Option<Arc<UpnpSession>>>,
    /// Server kept warm with short-TTL keepalives while firewalled, so
    /// the NAT mapping stays open.
    keepalive_target: Mutex<Option<SocketAddr>>,
}

impl OwnConnectivity {
    pub fn new(
        stun: Arc<StunService>,
        directory: Arc<DirectorySession>,
        events: EventBus,
        stun_servers: Vec<String>,
        upnp_enabled: bool,
        listen_port: u16,
    ) -> Arc<Self> {
        let own = Arc::new(Self {
            stun,
            directory,
            events,
            stun_servers,
            upnp_enabled,
            listen_port,
            state: Mutex::new(OwnState::default()),
            upnp: tokio::sync::Mutex::new(None),
            keepalive_target: Mutex::new(None),
        });
        own.clone().spawn_keepalive();
        own
    }

    /// Periodic short-TTL binding toward the STUN server: keeps the NAT
    /// pinhole for the shared UDP port from expiring while firewalled.
    fn spawn_keepalive(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(25));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if !self.is_firewalled() {
                    continue;
                }
                if let Some(target) = *self.keepalive_target.lock() {
                    self.stun.keepalive(target);
                }
            }
        });
    }

    pub fn state(&self) -> OwnState {
        *self.state.lock()
    }

    pub fn is_ready(&self) -> bool {
        self.state.lock().phase == OwnPhase::Ready
    }

    /// Whether inbound connections need assistance (pinholes, TCP-back).
    pub fn is_firewalled(&self) -> bool {
        self.state.lock().nat_class.firewalled()
    }

    fn set_phase(&self, phase: OwnPhase) {
        self.state.lock().phase = phase;
        debug!("own connectivity phase: {phase:?}");
    }

    /// Run the whole machine front to back. Safe to call again later;
    /// state is rebuilt from scratch.
    pub async fn establish(self: &Arc<Self>) {
        *self.state.lock() = OwnState::default();

        // PickInterface: route probe to learn the preferred local address.
        self.set_phase(OwnPhase::PickInterface);
        let local_ip = preferred_local_ip().await;
        let local_endpoint = SocketAddr::new(local_ip, self.listen_port);
        self.state.lock().local_endpoint = Some(local_endpoint);

        // OpenPorts: the UDP mux and TCP listener were bound at startup;
        // reaching this phase with a port recorded is the check.
        self.set_phase(OwnPhase::OpenPorts);

        // OptionalUpnp: best effort, never fatal.
        self.set_phase(OwnPhase::OptionalUpnp);
        if self.upnp_enabled {
            match tokio::time::timeout(
                UPNP_TIMEOUT,
                UpnpSession::establish(local_endpoint, self.listen_port),
            )
            .await
            {
                Ok(Ok(session)) => {
                    if let Some(external) = session.external_endpoint() {
                        self.state.lock().external_endpoint = Some(external);
                    }
                    *self.upnp.lock().await = Some(session);
                    info!("igd mapping established");
                }
                Ok(Err(e)) => debug!("upnp unavailable: {e}"),
                Err(_) => debug!("upnp discovery timed out"),
            }
        }

        // StunDiscoverServers: resolve the configured names.
        self.set_phase(OwnPhase::StunDiscoverServers);
        let mut servers: Vec<SocketAddr> = Vec::new();
        for name in &self.stun_servers {
            match tokio::time::timeout(STEP_TIMEOUT, lookup_host(name.as_str())).await {
                Ok(Ok(mut addrs)) => {
                    if let Some(addr) = addrs.find(|a| a.is_ipv4()) {
                        servers.push(addr);
                    }
                }
                Ok(Err(e)) => debug!("resolving stun server {name} failed: {e}"),
                Err(_) => debug!("resolving stun server {name} timed out"),
            }
        }

        // StunClassifyNat: needs two independent servers.
        self.set_phase(OwnPhase::StunClassifyNat);
        match servers.as_slice() {
            [a, b, ..] => {
                let (class, external) = self.stun.classify_nat(*a, *b, local_endpoint).await;
                {
                    let mut state = self.state.lock();
                    state.nat_class = class;
                    if external.is_some() {
                        state.external_endpoint = external;
                    }
                }
                *self.keepalive_target.lock() = Some(*a);
                info!("nat classified as {class:?}, external {external:?}");
            }
            [only] => {
                // One server still yields our external address, just not
                // the mapping behaviour.
                *self.keepalive_target.lock() = Some(*only);
                match self
                    .stun
                    .binding_request(*only, None, STEP_TIMEOUT)
                    .await
                {
                    Ok(reply) => {
                        let mut state = self.state.lock();
                        state.nat_class = NatClass::Unknown;
                        state.external_endpoint = Some(reply.external);
                    }
                    Err(e) => {
                        debug!("single-server binding failed: {e}");
                        self.state.lock().nat_class = NatClass::Unreachable;
                    }
                }
            }
            [] => {
                debug!("no stun servers resolvable; nat class unknown");
                self.state.lock().nat_class = NatClass::Unknown;
            }
        }

        // PublishToDirectory, with the observed-address fallback.
        self.set_phase(OwnPhase::PublishToDirectory);
        let (local, external) = {
            let state = self.state.lock();
            (local_endpoint, state.external_endpoint)
        };
        let published = tokio::time::timeout(
            STEP_TIMEOUT,
            self.directory.publish_endpoints(local, external),
        )
        .await;
        match published {
            Ok(Ok(())) => {}
            _ => {
                warn!("publishing endpoints failed; falling back to observed address");
                let fallback = tokio::time::timeout(
                    STEP_TIMEOUT,
                    self.directory.publish_observed_address(),
                )
                .await;
                if !matches!(fallback, Ok(Ok(()))) {
                    warn!("observed-address fallback failed too");
                }
            }
        }

        self.set_phase(OwnPhase::Ready);
        let state = self.state();
        self.events.publish(Event::ConnectivityReady {
            nat: state.nat_class,
            external: state.external_endpoint,
        });
    }

    /// Tear down the session's port mappings on shutdown.
    pub async fn shutdown(&self) {
        if let Some(session) = self.upnp.lock().await.take() {
            session.shutdown().await;
        }
    }
}

/// The local address the default route would use. No packet is sent;
/// connecting a datagram socket just selects the interface.
async fn preferred_local_ip() -> IpAddr {
    match tokio::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await {
        Ok(socket) => match socket.connect("203.0.113.1:9").await {
            Ok(()) => socket
                .local_addr()
                .map(|a| a.ip())
                .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            Err(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
        },
        Err(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
    }
}

//! Construction and wiring of every long-lived component.
//!
//! A single `Services` value built at startup replaces any notion of
//! process-wide globals: components receive exactly the handles they
//! need, and the main loop drives their ticks.

use std::{
    net::SocketAddr,
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use tether_core::{Config, DirectoryId, Error, Event, EventBus, Result};
use tether_stream::{
    handshake::{self, Identity},
    link::{PeerLink, TcpLink, TouLink},
    ServiceMux,
};
use tether_transport::{stun::StunService, TouListener, TouSocket, UdpMux};
use tether_transfer::{
    demux::DataDemux,
    group::{GroupStatus, TransferController},
    service::{Catalog, CatalogFileMethod, ExchangeService},
    share::{off_catalog_share_list, temp_share_list, ShareList},
    state as transfer_state,
    FileTransferService, MuxDataSender,
};

use crate::connection::{FriendBook, CRYPTO_HANDSHAKE_TIMEOUT};
use crate::directory::{self, DirectoryClient, DirectorySession};
use crate::friends::FriendsManager;
use crate::heartbeat::HeartbeatService;
use crate::own_connectivity::OwnConnectivity;

/// Cadence of the persistent-state snapshot.
const PERSIST_PERIOD_TICKS: u64 = 30;
/// Transfer tick while at least one group is downloading.
const TRANSFER_TICK_BUSY: Duration = Duration::from_millis(150);
/// Transfer tick while idle.
const TRANSFER_TICK_IDLE: Duration = Duration::from_secs(1);

/// Everything the daemon owns, built once at startup.
pub struct Services {
    pub config: Config,
    pub identity: Identity,
    pub events: EventBus,
    pub udp: Arc<UdpMux>,
    pub stun: Arc<StunService>,
    pub tou: Arc<TouSocket>,
    pub mux: Arc<ServiceMux>,
    pub book: Arc<FriendBook>,
    pub demux: Arc<DataDemux>,
    pub controller: Arc<TransferController>,
    pub exchange: Arc<ExchangeService>,
    pub friends: Arc<FriendsManager>,
    pub own: Arc<OwnConnectivity>,
    pub directory: Arc<DirectorySession>,
    pub temp_shares: Arc<ShareList>,
    pub off_shares: Arc<ShareList>,
    tou_listener: tokio::sync::Mutex<Option<TouListener>>,
    tick_count: AtomicU64,
}

impl Services {
    /// Build and wire every component. Fatal configuration problems
    /// (unbindable port, unreadable identity) surface here.
    pub async fn build(
        config: Config,
        directory_client: Arc<dyn DirectoryClient>,
        catalog: Arc<dyn Catalog>,
    ) -> Result<Arc<Self>> {
        config.ensure_dirs()?;
        let identity = load_or_create_identity(&config.user_dir.join("identity.key"))?;
        info!("own peer id {}", identity.peer_id());

        let events = EventBus::default();
        let udp = UdpMux::bind(config.listen_port)
            .await
            .map_err(|e| Error::fatal(format!("cannot bind udp port: {e}")))?;
        let listen_port = udp.local_addr().port();
        let stun = StunService::start(udp.clone());
        let (tou, tou_listener) = TouSocket::start(udp.clone());

        let mux = ServiceMux::new();
        let book = Arc::new(FriendBook::new(identity.peer_id()));
        let directory = DirectorySession::new(directory_client);

        // File transfer plumbing.
        let sender = MuxDataSender::new(mux.clone(), identity.peer_id());
        let demux = DataDemux::new(DirectoryId(0), sender.clone());
        let temp_shares = Arc::new(temp_share_list(&config.user_dir));
        let off_shares = Arc::new(off_catalog_share_list(&config.user_dir));
        demux.add_method(temp_shares.clone());
        demux.add_method(CatalogFileMethod::new(catalog.clone()));
        demux.add_method(off_shares.clone());

        let controller = TransferController::new(
            demux.clone(),
            sender,
            events.clone(),
            config.partials_dir(),
            config.downloads_dir(),
            config.auto_remove_completed,
            config.disk_write_retry_limit,
        );
        let exchange =
            ExchangeService::new(mux.clone(), controller.clone(), catalog, events.clone());
        exchange.install();
        mux.register_service(FileTransferService::new(demux.clone()));
        mux.register_service(HeartbeatService::new(mux.clone()));

        let mut adjusted = config.clone();
        adjusted.listen_port = listen_port;
        let own = OwnConnectivity::new(
            stun.clone(),
            directory.clone(),
            events.clone(),
            adjusted.stun_servers.clone(),
            adjusted.upnp_enabled,
            listen_port,
        );
        let friends = FriendsManager::new(
            book.clone(),
            mux.clone(),
            tou.clone(),
            own.clone(),
            directory.clone(),
            identity.clone(),
            events.clone(),
        );

        // Mux callbacks feed the friend book and the offline queues.
        {
            let book = book.clone();
            mux.set_on_heard(move |id| book.heard_from(id, Instant::now()));
        }
        {
            let book = book.clone();
            let controller = controller.clone();
            let events = events.clone();
            mux.set_on_disconnect(move |id| {
                book.disconnected(id, Instant::now());
                controller.set_peer_online(id, false);
                events.publish(Event::PeerDisconnected { friend: id });
            });
        }
        {
            let exchange = exchange.clone();
            let controller = controller.clone();
            friends.on_peer_connected(move |id| {
                controller.set_peer_online(id, true);
                exchange.peer_connected(id);
            });
        }

        let services = Arc::new(Self {
            config: adjusted,
            identity,
            events,
            udp,
            stun,
            tou,
            mux,
            book,
            demux,
            controller,
            exchange,
            friends,
            own,
            directory,
            temp_shares,
            off_shares,
            tou_listener: tokio::sync::Mutex::new(Some(tou_listener)),
            tick_count: AtomicU64::new(0),
        });

        // Roster snapshot first, so connection attempts can start before
        // the directory answers.
        let roster = directory::load_roster(&services.roster_path());
        if !roster.is_empty() {
            info!("loaded {} friends from snapshot", roster.len());
            services.friends.apply_roster(&roster);
        }
        if let Some(persisted) = transfer_state::load(&services.transfer_state_path())? {
            info!(
                "restoring {} pending requests, {} groups",
                persisted.pending.len(),
                persisted.groups.len()
            );
            transfer_state::restore(persisted, &services.exchange, &services.controller);
        }

        Ok(services)
    }

    fn roster_path(&self) -> PathBuf {
        self.config.user_dir.join("friends.list")
    }

    fn transfer_state_path(&self) -> PathBuf {
        self.config.user_dir.join("transfers.state")
    }

    /// Run until `shutdown` completes. Returns cleanly for exit code 0.
    pub async fn run(self: Arc<Self>, shutdown: impl std::future::Future<Output = ()>) -> Result<()> {
        // Direct-TCP accept path shares the port number with UDP.
        let tcp_listener = TcpListener::bind(("0.0.0.0", self.config.listen_port))
            .await
            .map_err(|e| Error::fatal(format!("cannot bind tcp port: {e}")))?;
        info!("listening on tcp/udp port {}", self.config.listen_port);

        self.clone().spawn_tcp_accept(tcp_listener);
        self.clone().spawn_tou_accept().await;
        let demux_worker = self.demux.spawn_worker();

        // Own connectivity settles in the background; friend retries
        // begin as soon as endpoints are known.
        {
            let services = self.clone();
            tokio::spawn(async move {
                services.own.establish().await;
                match services.directory.fetch_friends().await {
                    Ok(records) => {
                        services.friends.apply_roster(&records);
                        if let Err(e) =
                            directory::save_roster(&services.roster_path(), &records)
                        {
                            warn!("saving roster snapshot failed: {e}");
                        }
                    }
                    Err(e) => warn!("initial roster fetch failed: {e}"),
                }
            });
        }

        // Variable-rate transfer ticker.
        {
            let services = self.clone();
            tokio::spawn(async move {
                loop {
                    services.controller.tick(Instant::now());
                    let busy = services
                        .controller
                        .groups()
                        .iter()
                        .any(|g| g.status == GroupStatus::Downloading);
                    let pause = if busy { TRANSFER_TICK_BUSY } else { TRANSFER_TICK_IDLE };
                    tokio::time::sleep(pause).await;
                }
            });
        }

        // Main one-second ticker.
        let ticker = {
            let services = self.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(1));
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    interval.tick().await;
                    let count = services.tick_count.fetch_add(1, Ordering::Relaxed);
                    let now = Instant::now();
                    services.friends.tick(now, count);
                    services.mux.tick_services();
                    if count % PERSIST_PERIOD_TICKS == 0 {
                        services.persist();
                    }
                }
            })
        };

        shutdown.await;
        info!("shutting down");
        ticker.abort();
        self.persist();
        self.own.shutdown().await;
        self.demux.shutdown();
        let _ = demux_worker.join();
        Ok(())
    }

    fn persist(&self) {
        let snapshot = transfer_state::snapshot(&self.exchange, &self.controller);
        if let Err(e) = transfer_state::save(&self.transfer_state_path(), &snapshot) {
            warn!("persisting transfer state failed: {e}");
        }
    }

    fn spawn_tcp_accept(self: Arc<Self>, listener: TcpListener) {
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, from)) => {
                        debug!("inbound tcp connection from {from}");
                        let services = self.clone();
                        tokio::spawn(async move {
                            let link: Arc<dyn PeerLink> = Arc::new(TcpLink::new(stream));
                            services.handshake_inbound(link).await;
                        });
                    }
                    Err(e) => {
                        debug!("tcp accept failed: {e}");
                        tokio::time::sleep(Duration::from_millis(250)).await;
                    }
                }
            }
        });
    }

    async fn spawn_tou_accept(self: Arc<Self>) {
        let Some(mut listener) = self.tou_listener.lock().await.take() else {
            return;
        };
        tokio::spawn(async move {
            while let Some(conn) = listener.accept().await {
                debug!("inbound udp tunnel from {}", conn.remote());
                let services = self.clone();
                tokio::spawn(async move {
                    let link: Arc<dyn PeerLink> = Arc::new(TouLink::new(conn));
                    services.handshake_inbound(link).await;
                });
            }
        });
    }

    /// Respond to an inbound handshake and adopt the peer if known.
    async fn handshake_inbound(&self, link: Arc<dyn PeerLink>) {
        match tokio::time::timeout(
            CRYPTO_HANDSHAKE_TIMEOUT,
            handshake::respond(link, &self.identity, None),
        )
        .await
        {
            Ok(Ok(channel)) => {
                self.friends.adopt_inbound(channel);
            }
            Ok(Err(e)) => debug!("inbound handshake failed: {e}"),
            Err(_) => debug!("inbound handshake timed out"),
        }
    }
}

/// Load the identity key, generating one on first run. An existing but
/// unreadable key is fatal rather than silently replaced.
fn load_or_create_identity(path: &std::path::Path) -> Result<Identity> {
    match std::fs::read_to_string(path) {
        Ok(text) => {
            let raw = hex::decode(text.trim())
                .map_err(|e| Error::fatal(format!("corrupt identity key: {e}")))?;
            let bytes: [u8; 32] = raw
                .try_into()
                .map_err(|_| Error::fatal("identity key must be 32 bytes"))?;
            Ok(Identity::from_secret_bytes(bytes))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let identity = Identity::generate();
            std::fs::write(path, hex::encode(*identity.secret_bytes()))
                .map_err(|e| Error::fatal(format!("cannot store identity key: {e}")))?;
            info!("generated new identity at {}", path.display());
            Ok(identity)
        }
        Err(e) => Err(Error::fatal(format!("cannot read identity key: {e}"))),
    }
}

/// Convenience endpoint accessor used by inspection commands.
pub fn own_endpoints(services: &Services) -> (Option<SocketAddr>, Option<SocketAddr>) {
    let state = services.own.state();
    (state.local_endpoint, state.external_endpoint)
}

/// Catalog stub for running without a shared library attached. Every
/// item resolves to not-found; nothing is served from the catalog.
pub struct NullCatalog;

impl Catalog for NullCatalog {
    fn resolve(&self, _item_id: u32) -> tether_transfer::service::CatalogResolution {
        tether_transfer::service::CatalogResolution::NoSuchItem
    }
    fn find_by_hash(
        &self,
        _hash: &tether_core::FileHash,
        _size: u64,
    ) -> Option<std::path::PathBuf> {
        None
    }
    fn lend_completed(&self, _item_id: u32, _borrow_key: &str) {}
    fn lend_returned(&self, _item_id: u32, _borrow_key: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::StaticDirectory;
    use tempfile::tempdir;

    #[tokio::test]
    async fn build_wires_everything() {
        let dir = tempdir().unwrap();
        let mut config = Config::default();
        config.user_dir = dir.path().to_path_buf();
        config.listen_port = 0;
        config.upnp_enabled = false;

        let services = Services::build(
            config,
            StaticDirectory::new(),
            Arc::new(NullCatalog),
        )
        .await
        .unwrap();

        assert!(services.config.listen_port > 0, "port resolved from the OS");
        assert!(dir.path().join("identity.key").exists());
        // Identity survives a rebuild.
        let first = services.identity.peer_id();
        drop(services);
        let mut config = Config::default();
        config.user_dir = dir.path().to_path_buf();
        config.upnp_enabled = false;
        let services = Services::build(
            config,
            StaticDirectory::new(),
            Arc::new(NullCatalog),
        )
        .await
        .unwrap();
        assert_eq!(services.identity.peer_id(), first);
    }

    #[test]
    fn corrupt_identity_is_fatal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("identity.key");
        std::fs::write(&path, "not-hex").unwrap();
        assert!(matches!(
            load_or_create_identity(&path),
            Err(Error::Fatal(_))
        ));
    }
}

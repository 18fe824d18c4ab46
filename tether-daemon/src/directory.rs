//! Interface to the external directory service.
//!
//! The HTTP client itself lives outside the core; this module defines the
//! operations the core needs, serializes access (at most one outbound
//! call at a time), and persists the roster snapshot (`friends.list`) so
//! connections can be attempted before the directory answers after a
//! restart.

use std::{net::SocketAddr, path::Path, sync::Arc};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use tether_core::{DirectoryId, Error, PeerId, Result};

/// One friend as the directory publishes it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FriendRecord {
    pub directory_id: u32,
    pub display_name: String,
    /// The friend's long-lived public key; absent until they enroll.
    pub public_key: Option<Vec<u8>>,
    pub local_endpoint: Option<SocketAddr>,
    pub external_endpoint: Option<SocketAddr>,
}

impl FriendRecord {
    pub fn peer_id(&self) -> Option<PeerId> {
        self.public_key
            .as_deref()
            .map(PeerId::from_public_key)
    }
}

/// A catalog item as listed by the directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CatalogItem {
    pub item_id: u32,
    pub title: String,
    /// Which recipient the item is matched for, when restricted.
    pub per_recipient_match: Option<u32>,
}

/// Operations the connectivity core needs from the directory service.
#[async_trait]
pub trait DirectoryClient: Send + Sync {
    /// The full friend roster with keys and last-known endpoints.
    async fn fetch_friends(&self) -> Result<Vec<FriendRecord>>;
    /// Upload our current endpoints.
    async fn publish_endpoints(
        &self,
        local: SocketAddr,
        external: Option<SocketAddr>,
    ) -> Result<()>;
    /// Fallback: ask the directory to record whatever public address it
    /// observes on this request.
    async fn publish_observed_address(&self) -> Result<()>;
    /// Catalog listing for the request/offer UI.
    async fn fetch_catalog(&self) -> Result<Vec<CatalogItem>>;
}

/// Serializing wrapper: the directory is called by several subsystems but
/// only one request may be outstanding.
pub struct DirectorySession {
    client: Arc<dyn DirectoryClient>,
    gate: tokio::sync::Mutex<()>,
}

impl DirectorySession {
    pub fn new(client: Arc<dyn DirectoryClient>) -> Arc<Self> {
        Arc::new(Self {
            client,
            gate: tokio::sync::Mutex::new(()),
        })
    }

    pub async fn fetch_friends(&self) -> Result<Vec<FriendRecord>> {
        let _gate = self.gate.lock().await;
        self.client.fetch_friends().await
    }

    pub async fn publish_endpoints(
        &self,
        local: SocketAddr,
        external: Option<SocketAddr>,
    ) -> Result<()> {
        let _gate = self.gate.lock().await;
        self.client.publish_endpoints(local, external).await
    }

    pub async fn publish_observed_address(&self) -> Result<()> {
        let _gate = self.gate.lock().await;
        self.client.publish_observed_address().await
    }

    pub async fn fetch_catalog(&self) -> Result<Vec<CatalogItem>> {
        let _gate = self.gate.lock().await;
        self.client.fetch_catalog().await
    }
}

/// In-memory directory for tests and offline operation.
#[derive(Default)]
pub struct StaticDirectory {
    friends: Mutex<Vec<FriendRecord>>,
    catalog: Mutex<Vec<CatalogItem>>,
    published: Mutex<Option<(SocketAddr, Option<SocketAddr>)>>,
}

impl StaticDirectory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_friends(&self, friends: Vec<FriendRecord>) {
        *self.friends.lock() = friends;
    }

    pub fn set_catalog(&self, catalog: Vec<CatalogItem>) {
        *self.catalog.lock() = catalog;
    }

    pub fn last_published(&self) -> Option<(SocketAddr, Option<SocketAddr>)> {
        self.published.lock().clone()
    }
}

#[async_trait]
impl DirectoryClient for StaticDirectory {
    async fn fetch_friends(&self) -> Result<Vec<FriendRecord>> {
        Ok(self.friends.lock().clone())
    }

    async fn publish_endpoints(
        &self,
        local: SocketAddr,
        external: Option<SocketAddr>,
    ) -> Result<()> {
        *self.published.lock() = Some((local, external));
        Ok(())
    }

    async fn publish_observed_address(&self) -> Result<()> {
        Ok(())
    }

    async fn fetch_catalog(&self) -> Result<Vec<CatalogItem>> {
        Ok(self.catalog.lock().clone())
    }
}

// ---------------------------------------------------------------------------
// Roster snapshot
// ---------------------------------------------------------------------------

/// Save the roster to `friends.list` (atomic temp + rename).
pub fn save_roster(path: &Path, friends: &[FriendRecord]) -> Result<()> {
    let serialized = serde_json::to_vec_pretty(friends)?;
    let tmp = path.with_extension("list.tmp");
    std::fs::write(&tmp, serialized)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Load the snapshot; an unreadable file starts empty rather than
/// failing startup.
pub fn load_roster(path: &Path) -> Vec<FriendRecord> {
    match std::fs::read(path) {
        Ok(raw) => match serde_json::from_slice(&raw) {
            Ok(friends) => friends,
            Err(e) => {
                warn!("unreadable roster {}: {e}", path.display());
                Vec::new()
            }
        },
        Err(e) => {
            debug!("no roster at {}: {e}", path.display());
            Vec::new()
        }
    }
}

/// Helper: the id newtype for records.
pub fn directory_id(record: &FriendRecord) -> DirectoryId {
    DirectoryId(record.directory_id)
}

/// A directory that always fails, for running fully offline.
pub struct OfflineDirectory;

#[async_trait]
impl DirectoryClient for OfflineDirectory {
    async fn fetch_friends(&self) -> Result<Vec<FriendRecord>> {
        Err(Error::ConnectionLost("directory unreachable".into()))
    }
    async fn publish_endpoints(
        &self,
        _local: SocketAddr,
        _external: Option<SocketAddr>,
    ) -> Result<()> {
        Err(Error::ConnectionLost("directory unreachable".into()))
    }
    async fn publish_observed_address(&self) -> Result<()> {
        Err(Error::ConnectionLost("directory unreachable".into()))
    }
    async fn fetch_catalog(&self) -> Result<Vec<CatalogItem>> {
        Err(Error::ConnectionLost("directory unreachable".into()))
    }
}

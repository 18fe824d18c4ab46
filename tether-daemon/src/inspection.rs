//! Read-only snapshots for a front end.
//!
//! The core publishes events for changes; these accessors answer the
//! "what is the state right now" questions a list view asks on redraw.
//! Nothing here holds a lock longer than one copy.

use std::{
    net::SocketAddr,
    time::Instant,
};

use serde::Serialize;

use tether_core::{DirectoryId, FriendState};
use tether_transfer::group::GroupStatus;

use crate::connection::ConnState;
use crate::services::Services;

/// One roster row.
#[derive(Debug, Clone, Serialize)]
pub struct FriendInfo {
    pub id: u32,
    pub name: String,
    pub state: FriendState,
    #[serde(skip)]
    pub conn_state: ConnState,
    /// Seconds since we last heard from them, when connected.
    pub heard_secs_ago: Option<u64>,
    pub external_endpoint: Option<SocketAddr>,
}

/// One file inside a transfer row.
#[derive(Debug, Clone, Serialize)]
pub struct TransferFileInfo {
    pub name: String,
    pub hash: String,
    pub total_bytes: u64,
    pub saved_bytes: u64,
}

/// One download row.
#[derive(Debug, Clone, Serialize)]
pub struct TransferInfo {
    pub group_id: u32,
    pub title: String,
    pub status: String,
    pub files: Vec<TransferFileInfo>,
}

/// One upload row.
#[derive(Debug, Clone, Serialize)]
pub struct UploadInfo {
    pub hash: String,
    pub rate_bps: f64,
    pub last_requestor: Option<DirectoryId>,
}

/// Snapshot of the roster.
pub fn friends(services: &Services) -> Vec<FriendInfo> {
    let now = Instant::now();
    let mut rows = Vec::new();
    services.book.for_each_friend(|friend| {
        rows.push(FriendInfo {
            id: friend.directory_id.0,
            name: friend.display_name.clone(),
            state: friend.friend_state,
            conn_state: friend.conn_state,
            heard_secs_ago: friend
                .last_heard
                .map(|at| now.duration_since(at).as_secs()),
            external_endpoint: friend.external_endpoint,
        });
    });
    rows.sort_by_key(|row| row.id);
    rows
}

/// Snapshot of every download group with per-file progress.
pub fn transfers(services: &Services) -> Vec<TransferInfo> {
    services
        .controller
        .groups()
        .into_iter()
        .map(|group| {
            let files = group
                .files
                .iter()
                .map(|file| {
                    let saved = services
                        .demux
                        .module(&file.hash)
                        .map(|m| m.amount_saved())
                        // No module: either finished and moved, or the
                        // group never started this file.
                        .unwrap_or(match group.status {
                            GroupStatus::Complete => file.size,
                            _ => 0,
                        });
                    TransferFileInfo {
                        name: file.name.clone(),
                        hash: file.hash.to_string(),
                        total_bytes: file.size,
                        saved_bytes: saved,
                    }
                })
                .collect();
            TransferInfo {
                group_id: group.id,
                title: group.title.clone(),
                status: status_label(&group.status),
                files,
            }
        })
        .collect()
}

/// Snapshot of active uploads.
pub fn uploads(services: &Services) -> Vec<UploadInfo> {
    services
        .demux
        .upload_info()
        .into_iter()
        .map(|(hash, rate_bps, last_requestor)| UploadInfo {
            hash: hash.to_string(),
            rate_bps,
            last_requestor,
        })
        .collect()
}

fn status_label(status: &GroupStatus) -> String {
    match status {
        GroupStatus::Downloading => "downloading".to_string(),
        GroupStatus::Stalled => "stalled".to_string(),
        GroupStatus::Paused => "paused".to_string(),
        GroupStatus::Complete => "complete".to_string(),
        GroupStatus::Cancelled => "cancelled".to_string(),
        GroupStatus::Failed(reason) => format!("failed: {reason}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::StaticDirectory;
    use crate::NullCatalog;
    use std::sync::Arc;
    use tempfile::tempdir;
    use tether_core::Config;

    #[tokio::test]
    async fn snapshots_reflect_roster_and_groups() {
        let dir = tempdir().unwrap();
        let mut config = Config::default();
        config.user_dir = dir.path().to_path_buf();
        config.listen_port = 0;
        config.upnp_enabled = false;
        let services = Services::build(config, StaticDirectory::new(), Arc::new(NullCatalog))
            .await
            .unwrap();

        services.friends.apply_roster(&[crate::directory::FriendRecord {
            directory_id: 12,
            display_name: "maria".into(),
            public_key: Some(b"marias-key".to_vec()),
            local_endpoint: None,
            external_endpoint: "203.0.113.8:7000".parse().ok(),
        }]);

        let rows = friends(&services);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, 12);
        assert_eq!(rows[0].state, FriendState::Offline);

        assert!(transfers(&services).is_empty());
        assert!(uploads(&services).is_empty());

        services
            .controller
            .start_group(
                "snapshot me".into(),
                vec![tether_transfer::group::GroupFile {
                    name: "x.bin".into(),
                    hash: tether_core::FileHash::new("12".repeat(20)).unwrap(),
                    size: 1000,
                }],
                vec![DirectoryId(12)],
                None,
                None,
            )
            .unwrap();
        let rows = transfers(&services);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, "downloading");
        assert_eq!(rows[0].files[0].total_bytes, 1000);
        assert_eq!(rows[0].files[0].saved_bytes, 0);
    }
}

//! Persistence of pending item requests and in-flight transfer groups
//! (`transfers.state`).
//!
//! Only group metadata survives a restart: the hash list, sources and
//! destination. Chunk state is deliberately not persisted; the creators
//! recover the saved prefix from the partials' lengths and received-but-
//! unsaved chunks are lost.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use tether_core::{DirectoryId, FileHash, Result};

use crate::group::{GroupFile, GroupStatus, TransferController};
use crate::service::{ExchangeService, PendingRequest};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PersistedRequest {
    pub friend: u32,
    pub item_id: u32,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PersistedFile {
    pub name: String,
    pub hash: String,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PersistedGroup {
    pub title: String,
    pub destination: Option<PathBuf>,
    pub borrow_key: Option<String>,
    pub sources: Vec<u32>,
    pub files: Vec<PersistedFile>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PersistedState {
    pub pending: Vec<PersistedRequest>,
    pub groups: Vec<PersistedGroup>,
}

/// Write atomically: temp file then rename.
pub fn save(path: &Path, state: &PersistedState) -> Result<()> {
    let serialized = serde_json::to_vec_pretty(state)?;
    let tmp = path.with_extension("state.tmp");
    std::fs::write(&tmp, serialized)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// `None` when no state file exists yet.
pub fn load(path: &Path) -> Result<Option<PersistedState>> {
    match std::fs::read(path) {
        Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Capture everything worth restarting.
pub fn snapshot(service: &ExchangeService, controller: &TransferController) -> PersistedState {
    let pending = service
        .pending_requests()
        .into_iter()
        .filter(|p: &PendingRequest| !p.status.is_terminal())
        .map(|p| PersistedRequest {
            friend: p.friend.0,
            item_id: p.item_id,
            name: p.name,
        })
        .collect();
    let groups = controller
        .groups()
        .into_iter()
        .filter(|g| {
            matches!(
                g.status,
                GroupStatus::Downloading | GroupStatus::Stalled | GroupStatus::Paused
            )
        })
        .map(|g| PersistedGroup {
            title: g.title,
            destination: g.final_destination,
            borrow_key: g.borrow_key,
            sources: g.sources.iter().map(|s| s.0).collect(),
            files: g
                .files
                .into_iter()
                .map(|f| PersistedFile {
                    name: f.name,
                    hash: f.hash.to_string(),
                    size: f.size,
                })
                .collect(),
        })
        .collect();
    PersistedState { pending, groups }
}

/// Re-issue pending requests and restart unfinished groups.
pub fn restore(
    state: PersistedState,
    service: &ExchangeService,
    controller: &TransferController,
) {
    for request in state.pending {
        service.request_item(DirectoryId(request.friend), request.item_id, request.name);
    }
    for group in state.groups {
        let files: Vec<GroupFile> = group
            .files
            .iter()
            .filter_map(|f| match FileHash::new(&f.hash) {
                Ok(hash) => Some(GroupFile {
                    name: f.name.clone(),
                    hash,
                    size: f.size,
                }),
                Err(e) => {
                    warn!("skipping persisted file with bad hash: {e}");
                    None
                }
            })
            .collect();
        if files.is_empty() {
            continue;
        }
        let sources = group.sources.into_iter().map(DirectoryId).collect();
        if let Err(e) = controller.start_group(
            group.title,
            files,
            sources,
            group.destination,
            group.borrow_key,
        ) {
            warn!("restarting persisted group failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("transfers.state");
        let state = PersistedState {
            pending: vec![PersistedRequest {
                friend: 3,
                item_id: 77,
                name: "thing".into(),
            }],
            groups: vec![PersistedGroup {
                title: "a group".into(),
                destination: Some(PathBuf::from("/dl")),
                borrow_key: None,
                sources: vec![3, 4],
                files: vec![PersistedFile {
                    name: "f.bin".into(),
                    hash: "aa".repeat(20),
                    size: 42,
                }],
            }],
        };
        save(&path, &state).unwrap();
        let loaded = load(&path).unwrap().unwrap();
        assert_eq!(loaded, state);
    }

    #[test]
    fn load_missing_file_is_none() {
        let dir = tempdir().unwrap();
        assert!(load(&dir.path().join("nope.state")).unwrap().is_none());
    }
}

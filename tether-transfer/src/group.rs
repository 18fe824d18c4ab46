//! Transfer groups: a multi-file download that completes as a unit.
//!
//! A group finishes only when every file finishes; on completion the
//! files move together from the partials area into the final
//! destination. Cancelling frees every chunk buffer, drops queued demux
//! work and deletes the partials; data already on the wire is dropped on
//! arrival by the creators' guards.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Instant,
};

use parking_lot::Mutex;
use tracing::{info, warn};

use tether_core::{DirectoryId, Event, EventBus, FileHash};

use crate::creator::FileCreator;
use crate::demux::DataDemux;
use crate::scheduler::{DataSender, TransferModule, TransferStatus};

/// One file inside a group.
#[derive(Debug, Clone)]
pub struct GroupFile {
    pub name: String,
    pub hash: FileHash,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupStatus {
    Downloading,
    /// Every source is gone; revives when one comes back.
    Stalled,
    Paused,
    Complete,
    Cancelled,
    Failed(String),
}

/// Inspection snapshot of a group.
#[derive(Debug, Clone)]
pub struct TransferGroup {
    pub id: u32,
    pub title: String,
    pub final_destination: Option<PathBuf>,
    pub files: Vec<GroupFile>,
    pub sources: Vec<DirectoryId>,
    pub status: GroupStatus,
    /// Set when this download is a borrow; completion notifies the lender.
    pub borrow_key: Option<String>,
}

type CompletionHook = Box<dyn Fn(&TransferGroup) + Send + Sync>;

/// Owns every in-flight group and drives their modules.
pub struct TransferController {
    demux: Arc<DataDemux>,
    sender: Arc<dyn DataSender>,
    events: EventBus,
    partials_dir: PathBuf,
    downloads_dir: PathBuf,
    auto_remove_completed: bool,
    write_failure_limit: Option<u32>,
    groups: Mutex<HashMap<u32, TransferGroup>>,
    next_id: AtomicU32,
    completion_hooks: Mutex<Vec<CompletionHook>>,
}

impl TransferController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        demux: Arc<DataDemux>,
        sender: Arc<dyn DataSender>,
        events: EventBus,
        partials_dir: PathBuf,
        downloads_dir: PathBuf,
        auto_remove_completed: bool,
        write_failure_limit: Option<u32>,
    ) -> Arc<Self> {
        Arc::new(Self {
            demux,
            sender,
            events,
            partials_dir,
            downloads_dir,
            auto_remove_completed,
            write_failure_limit,
            groups: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
            completion_hooks: Mutex::new(Vec::new()),
        })
    }

    /// Run `hook` whenever a group completes (borrow bookkeeping hangs
    /// off this).
    pub fn on_complete(&self, hook: impl Fn(&TransferGroup) + Send + Sync + 'static) {
        self.completion_hooks.lock().push(Box::new(hook));
    }

    /// Start downloading a group of files from `sources`.
    pub fn start_group(
        &self,
        title: String,
        files: Vec<GroupFile>,
        sources: Vec<DirectoryId>,
        final_destination: Option<PathBuf>,
        borrow_key: Option<String>,
    ) -> tether_core::Result<u32> {
        std::fs::create_dir_all(&self.partials_dir)?;
        for file in &files {
            // A module may already exist when two groups share a file;
            // the new sources simply join it.
            if let Some(module) = self.demux.module(&file.hash) {
                for source in &sources {
                    module.add_source(*source);
                }
                continue;
            }
            let partial = self.partials_dir.join(sanitize_name(&file.name));
            let creator = FileCreator::new(partial, file.size, file.hash.clone())?;
            let module =
                TransferModule::new(creator, self.sender.clone(), self.write_failure_limit);
            for source in &sources {
                module.add_source(*source);
            }
            self.demux.add_module(module);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let group = TransferGroup {
            id,
            title: title.clone(),
            final_destination,
            files,
            sources,
            status: GroupStatus::Downloading,
            borrow_key,
        };
        self.groups.lock().insert(id, group);
        self.events.publish(Event::TransferStarted {
            group_id: id,
            title,
        });
        Ok(id)
    }

    /// Cancel: flip status, free buffers, drop queued work, delete
    /// partials. In-flight requests are not retracted.
    pub fn cancel_group(&self, id: u32) {
        let Some(group) = self.groups.lock().get_mut(&id).map(|g| {
            g.status = GroupStatus::Cancelled;
            g.clone()
        }) else {
            return;
        };
        for file in &group.files {
            if let Some(module) = self.demux.remove_module(&file.hash) {
                module.cancel();
            }
            self.demux.purge_queued(&file.hash);
        }
        info!("cancelled transfer group {id} ({})", group.title);
    }

    pub fn pause_group(&self, id: u32) {
        self.for_each_module(id, |m| m.pause());
        if let Some(group) = self.groups.lock().get_mut(&id) {
            if group.status == GroupStatus::Downloading {
                group.status = GroupStatus::Paused;
            }
        }
    }

    pub fn resume_group(&self, id: u32) {
        self.for_each_module(id, |m| m.resume());
        if let Some(group) = self.groups.lock().get_mut(&id) {
            if group.status == GroupStatus::Paused {
                group.status = GroupStatus::Downloading;
            }
        }
    }

    fn for_each_module(&self, id: u32, f: impl Fn(&Arc<TransferModule>)) {
        let files: Vec<FileHash> = match self.groups.lock().get(&id) {
            Some(group) => group.files.iter().map(|f| f.hash.clone()).collect(),
            None => return,
        };
        for hash in files {
            if let Some(module) = self.demux.module(&hash) {
                f(&module);
            }
        }
    }

    /// Forward a friend's liveness change to every module using them.
    pub fn set_peer_online(&self, peer: DirectoryId, online: bool) {
        for module in self.demux.modules() {
            module.set_peer_online(peer, online);
        }
    }

    /// Drive every active group's modules and settle finished groups.
    pub fn tick(&self, now: Instant) {
        let active: Vec<u32> = self
            .groups
            .lock()
            .values()
            .filter(|g| matches!(g.status, GroupStatus::Downloading | GroupStatus::Stalled))
            .map(|g| g.id)
            .collect();

        for id in active {
            self.for_each_module(id, |module| module.tick(now));
            self.settle_group(id);
        }
    }

    fn settle_group(&self, id: u32) {
        let group = match self.groups.lock().get(&id) {
            Some(g) => g.clone(),
            None => return,
        };
        let mut all_complete = true;
        let mut all_stalled = true;
        let mut failure: Option<String> = None;
        for file in &group.files {
            let module = self.demux.module(&file.hash);
            if let Some(module) = &module {
                if !module.is_stalled() {
                    all_stalled = false;
                }
            }
            match module.map(|m| m.status()) {
                Some(TransferStatus::Complete) => {}
                Some(TransferStatus::Failed(reason)) => {
                    failure = Some(reason);
                    all_complete = false;
                    break;
                }
                Some(_) => all_complete = false,
                // Module already removed: a previous group finished this
                // file and moved it; treat as complete.
                None => {}
            }
        }

        if let Some(reason) = failure {
            warn!("transfer group {id} failed: {reason}");
            if let Some(g) = self.groups.lock().get_mut(&id) {
                g.status = GroupStatus::Failed(reason.clone());
            }
            self.events.publish(Event::TransferFailed {
                group_id: id,
                reason,
            });
            return;
        }
        if !all_complete {
            // Surface a stall once on the transition; recovery flips the
            // status straight back.
            let mut publish_stall = false;
            {
                let mut groups = self.groups.lock();
                if let Some(g) = groups.get_mut(&id) {
                    if all_stalled && g.status == GroupStatus::Downloading {
                        g.status = GroupStatus::Stalled;
                        publish_stall = true;
                    } else if !all_stalled && g.status == GroupStatus::Stalled {
                        g.status = GroupStatus::Downloading;
                    }
                }
            }
            if publish_stall {
                warn!("transfer group {id} stalled: no sources available");
                self.events.publish(Event::TransferStalled { group_id: id });
            }
            return;
        }
        self.finalize_group(id, group);
    }

    /// Move every file into the destination and retire the creators.
    fn finalize_group(&self, id: u32, group: TransferGroup) {
        let destination = group
            .final_destination
            .clone()
            .unwrap_or_else(|| self.downloads_dir.clone());
        if let Err(e) = std::fs::create_dir_all(&destination) {
            warn!("cannot create {}: {e}", destination.display());
            return;
        }

        for file in &group.files {
            let Some(module) = self.demux.module(&file.hash) else {
                continue;
            };
            let moved = module.with_creator(|creator| creator.move_to_directory(&destination));
            match moved {
                Ok(path) => info!("completed {} -> {}", file.hash, path.display()),
                Err(e) => {
                    warn!("moving {} failed: {e}", file.hash);
                    self.events.publish(Event::TransferFailed {
                        group_id: id,
                        reason: e.to_string(),
                    });
                    return;
                }
            }
            if self.auto_remove_completed {
                self.demux.remove_module(&file.hash);
            }
        }

        let snapshot = {
            let mut groups = self.groups.lock();
            let Some(group) = groups.get_mut(&id) else { return };
            group.status = GroupStatus::Complete;
            group.clone()
        };
        self.events.publish(Event::TransferCompleted { group_id: id });
        for hook in self.completion_hooks.lock().iter() {
            hook(&snapshot);
        }
    }

    /// Snapshot of every group, for the inspection API and persistence.
    pub fn groups(&self) -> Vec<TransferGroup> {
        self.groups.lock().values().cloned().collect()
    }

    pub fn group(&self, id: u32) -> Option<TransferGroup> {
        self.groups.lock().get(&id).cloned()
    }
}

/// Keep only the file-name component so a malicious name cannot escape
/// the partials directory.
fn sanitize_name(name: &str) -> String {
    Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty() && n != ".." && n != ".")
        .unwrap_or_else(|| "unnamed.partial".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SOURCE: DirectoryId = DirectoryId(3);

    #[derive(Default)]
    struct NullSender;
    impl DataSender for NullSender {
        fn send_chunk_request(
            &self,
            _peer: DirectoryId,
            _hash: &FileHash,
            _size: u64,
            _offset: u64,
            _chunk_size: u32,
        ) {
        }
        fn send_chunk_data(
            &self,
            _peer: DirectoryId,
            _hash: &FileHash,
            _size: u64,
            _offset: u64,
            _data: Vec<u8>,
        ) {
        }
    }

    fn controller(root: &Path) -> (Arc<TransferController>, Arc<DataDemux>, EventBus) {
        let sender: Arc<dyn DataSender> = Arc::new(NullSender);
        let demux = DataDemux::new(DirectoryId(1), sender.clone());
        let events = EventBus::new(32);
        let controller = TransferController::new(
            demux.clone(),
            sender,
            events.clone(),
            root.join("partials"),
            root.join("downloads"),
            true,
            Some(5),
        );
        (controller, demux, events)
    }

    fn group_file(tag: u8, size: u64) -> GroupFile {
        GroupFile {
            name: format!("file-{tag}.bin"),
            hash: FileHash::new(format!("{tag:02x}").repeat(20)).unwrap(),
            size,
        }
    }

    #[tokio::test]
    async fn group_completes_when_all_files_complete() {
        let dir = tempdir().unwrap();
        let (controller, demux, events) = controller(dir.path());
        let mut rx = events.subscribe();

        let file_a = group_file(0xA1, 64);
        let file_b = group_file(0xB2, 32);
        let id = controller
            .start_group(
                "two files".into(),
                vec![file_a.clone(), file_b.clone()],
                vec![SOURCE],
                None,
                None,
            )
            .unwrap();

        // Feed both files completely.
        let now = Instant::now();
        controller.tick(now); // issues requests
        demux.module(&file_a.hash).unwrap().recv_chunk(
            SOURCE,
            0,
            vec![1u8; 64],
            now,
        );
        demux.module(&file_b.hash).unwrap().recv_chunk(
            SOURCE,
            0,
            vec![2u8; 32],
            now,
        );
        controller.tick(now);
        // One more pass so completion is observed after both flips.
        controller.tick(now);

        let group = controller.group(id).unwrap();
        assert_eq!(group.status, GroupStatus::Complete);
        assert!(dir
            .path()
            .join("downloads")
            .join(sanitize_name(&file_a.name))
            .exists());

        // Events: started, then completed.
        let mut seen_complete = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, Event::TransferCompleted { group_id } if group_id == id) {
                seen_complete = true;
            }
        }
        assert!(seen_complete);
        // auto-remove retired the creators
        assert!(demux.module(&file_a.hash).is_none());
    }

    #[tokio::test]
    async fn partial_progress_keeps_group_downloading() {
        let dir = tempdir().unwrap();
        let (controller, demux, _events) = controller(dir.path());
        let file_a = group_file(0xC1, 64);
        let file_b = group_file(0xD2, 64);
        let id = controller
            .start_group(
                "half done".into(),
                vec![file_a.clone(), file_b],
                vec![SOURCE],
                None,
                None,
            )
            .unwrap();
        let now = Instant::now();
        controller.tick(now);
        demux
            .module(&file_a.hash)
            .unwrap()
            .recv_chunk(SOURCE, 0, vec![1u8; 64], now);
        controller.tick(now);
        assert_eq!(controller.group(id).unwrap().status, GroupStatus::Downloading);
    }

    #[tokio::test]
    async fn cancel_deletes_partials_and_queued_work() {
        let dir = tempdir().unwrap();
        let (controller, demux, _events) = controller(dir.path());
        let file = group_file(0xE3, 1 << 16);
        let id = controller
            .start_group("doomed".into(), vec![file.clone()], vec![SOURCE], None, None)
            .unwrap();
        let now = Instant::now();
        controller.tick(now);
        demux
            .module(&file.hash)
            .unwrap()
            .recv_chunk(SOURCE, 0, vec![1u8; 1024], now);

        controller.cancel_group(id);
        assert_eq!(controller.group(id).unwrap().status, GroupStatus::Cancelled);
        assert!(demux.module(&file.hash).is_none());
        let partial = dir.path().join("partials").join("file-227.bin");
        assert!(!partial.exists(), "partial removed on cancel");
    }

    #[test]
    fn sanitize_strips_directories() {
        assert_eq!(sanitize_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_name("plain.bin"), "plain.bin");
        assert_eq!(sanitize_name(""), "unnamed.partial");
    }

    #[tokio::test]
    async fn completion_hook_sees_borrow_key() {
        let dir = tempdir().unwrap();
        let (controller, demux, _events) = controller(dir.path());
        let observed: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let observed_in_hook = observed.clone();
        controller.on_complete(move |group| {
            *observed_in_hook.lock() = group.borrow_key.clone();
        });

        let file = group_file(0xF4, 16);
        controller
            .start_group(
                "borrowed".into(),
                vec![file.clone()],
                vec![SOURCE],
                None,
                Some("key-123".into()),
            )
            .unwrap();
        let now = Instant::now();
        controller.tick(now);
        demux
            .module(&file.hash)
            .unwrap()
            .recv_chunk(SOURCE, 0, vec![1u8; 16], now);
        controller.tick(now);
        controller.tick(now);
        assert_eq!(observed.lock().clone(), Some("key-123".into()));
    }
}

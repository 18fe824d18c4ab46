//! Routes inbound chunk data and chunk requests to the right creator or
//! provider, and resolves requests for files we are not yet serving.
//!
//! Two ordered queues live under one mutex: the request queue (data and
//! requests for known files) is drained completely every tick; the search
//! queue (requests needing a file-method lookup) advances one entry per
//! tick so slow searches cannot starve transfers. A dedicated worker
//! thread paces itself between 10 ms and 1 s of sleep, relaxing while
//! idle and tightening under load.

use std::{
    collections::{HashMap, VecDeque},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use tracing::{debug, trace};

use tether_core::{DirectoryId, FileHash};

use crate::provider::FileProvider;
use crate::scheduler::{DataSender, TransferModule};

/// Hint bits a chunk request may carry about where the file should be
/// found.
pub mod search_flags {
    /// Ad-hoc temporary shares.
    pub const TEMP: u32 = 0x0001;
    /// Files matched to catalog items.
    pub const CATALOG: u32 = 0x0002;
    /// Persistent shares outside the catalog.
    pub const OFF_CATALOG: u32 = 0x0004;
    /// Consult only methods whose flags intersect the hint.
    pub const SPEC_ONLY: u32 = 0x8000;
}

/// A place files can be found when no creator or provider knows the hash.
pub trait FileMethod: Send + Sync {
    /// Which [`search_flags`] bits this method answers for.
    fn flags(&self) -> u32;
    /// Path of the complete local file with this hash and size, if held.
    fn search(&self, hash: &FileHash, size: u64) -> Option<PathBuf>;
}

/// Worker pacing bounds.
const SLEEP_MIN: Duration = Duration::from_millis(10);
const SLEEP_MAX: Duration = Duration::from_secs(1);

enum QueueItem {
    Data {
        peer: DirectoryId,
        hash: FileHash,
        offset: u64,
        data: Vec<u8>,
    },
    Request {
        peer: DirectoryId,
        hash: FileHash,
        size: u64,
        offset: u64,
        chunk_size: u32,
        flags: u32,
    },
}

#[derive(Default)]
struct Queues {
    request: VecDeque<QueueItem>,
    search: VecDeque<QueueItem>,
}

/// The file-level demultiplexer.
pub struct DataDemux {
    own_id: DirectoryId,
    queues: Mutex<Queues>,
    modules: Mutex<HashMap<FileHash, Arc<TransferModule>>>,
    providers: Mutex<HashMap<FileHash, FileProvider>>,
    methods: Mutex<Vec<Arc<dyn FileMethod>>>,
    sender: Arc<dyn DataSender>,
    running: AtomicBool,
}

impl DataDemux {
    pub fn new(own_id: DirectoryId, sender: Arc<dyn DataSender>) -> Arc<Self> {
        Arc::new(Self {
            own_id,
            queues: Mutex::new(Queues::default()),
            modules: Mutex::new(HashMap::new()),
            providers: Mutex::new(HashMap::new()),
            methods: Mutex::new(Vec::new()),
            sender,
            running: AtomicBool::new(true),
        })
    }

    /// Append a search method; order is consultation order.
    pub fn add_method(&self, method: Arc<dyn FileMethod>) {
        self.methods.lock().push(method);
    }

    /// Register an in-progress transfer. Refuses duplicates.
    pub fn add_module(&self, module: Arc<TransferModule>) -> bool {
        let mut modules = self.modules.lock();
        if modules.contains_key(module.hash()) {
            debug!("transfer for {} already registered", module.hash());
            return false;
        }
        modules.insert(module.hash().clone(), module);
        true
    }

    pub fn remove_module(&self, hash: &FileHash) -> Option<Arc<TransferModule>> {
        self.modules.lock().remove(hash)
    }

    pub fn module(&self, hash: &FileHash) -> Option<Arc<TransferModule>> {
        self.modules.lock().get(hash).cloned()
    }

    pub fn modules(&self) -> Vec<Arc<TransferModule>> {
        self.modules.lock().values().cloned().collect()
    }

    /// Upload inspection: (hash, rate, last requestor) per provider.
    pub fn upload_info(&self) -> Vec<(FileHash, f64, Option<DirectoryId>)> {
        self.providers
            .lock()
            .values()
            .map(|p| (p.hash().clone(), p.transfer_rate(), p.last_requestor()))
            .collect()
    }

    pub fn clear_providers(&self) {
        self.providers.lock().clear();
    }

    /// Inbound chunk data (wire thread): queued for the worker.
    pub fn recv_data(&self, peer: DirectoryId, hash: FileHash, offset: u64, data: Vec<u8>) {
        self.queues.lock().request.push_back(QueueItem::Data {
            peer,
            hash,
            offset,
            data,
        });
    }

    /// Inbound chunk request (wire thread): queued for the worker.
    pub fn recv_request(
        &self,
        peer: DirectoryId,
        hash: FileHash,
        size: u64,
        offset: u64,
        chunk_size: u32,
        flags: u32,
    ) {
        self.queues.lock().request.push_back(QueueItem::Request {
            peer,
            hash,
            size,
            offset,
            chunk_size,
            flags,
        });
    }

    /// Drop queued work naming `hash` (cancellation).
    pub fn purge_queued(&self, hash: &FileHash) {
        let mut queues = self.queues.lock();
        let matches = |item: &QueueItem| match item {
            QueueItem::Data { hash: h, .. } | QueueItem::Request { hash: h, .. } => h == hash,
        };
        queues.request.retain(|item| !matches(item));
        queues.search.retain(|item| !matches(item));
    }

    fn work_queued(&self) -> bool {
        let queues = self.queues.lock();
        !queues.request.is_empty() || !queues.search.is_empty()
    }

    /// Drain the request queue completely, then at most one search.
    /// Returns whether anything was done.
    pub fn tick(&self, now: Instant) -> bool {
        let mut did_work = false;
        loop {
            let item = self.queues.lock().request.pop_front();
            let Some(item) = item else { break };
            did_work = true;
            match item {
                QueueItem::Data {
                    peer,
                    hash,
                    offset,
                    data,
                } => self.handle_data(peer, &hash, offset, data, now),
                QueueItem::Request { .. } => self.handle_request(item, now),
            }
        }

        let search = self.queues.lock().search.pop_front();
        if let Some(item) = search {
            did_work = true;
            self.handle_search(item, now);
        }
        did_work
    }

    fn handle_data(
        &self,
        peer: DirectoryId,
        hash: &FileHash,
        offset: u64,
        data: Vec<u8>,
        now: Instant,
    ) {
        match self.module(hash) {
            Some(module) => module.recv_chunk(peer, offset, data, now),
            None => {
                // Chunk data for an unknown hash: either a cancelled
                // transfer's stragglers or a protocol violation.
                trace!("dropping {} bytes for unknown hash {hash}", data.len());
            }
        }
    }

    fn handle_request(&self, item: QueueItem, now: Instant) {
        let QueueItem::Request {
            peer,
            hash,
            size,
            offset,
            chunk_size,
            flags,
        } = item
        else {
            return;
        };

        // Our own requests skip the creator lookup: they must reach a
        // provider (we would be answering ourselves otherwise).
        if peer != self.own_id {
            if let Some(module) = self.module(&hash) {
                // We are uploading from our own partial.
                let served = module.with_creator(|creator| {
                    creator.read_saved_range(offset, chunk_size).ok()
                });
                match served {
                    Some(data) => {
                        self.sender.send_chunk_data(peer, &hash, size, offset, data);
                    }
                    None => trace!(
                        "partial {hash} cannot serve [{offset}, +{chunk_size}) yet"
                    ),
                }
                return;
            }
        }

        let served = {
            let mut providers = self.providers.lock();
            providers
                .get_mut(&hash)
                .map(|provider| provider.get_file_data(peer, offset, chunk_size, now))
        };
        match served {
            Some(Ok(data)) => {
                self.sender.send_chunk_data(peer, &hash, size, offset, data);
            }
            Some(Err(e)) => debug!("provider for {hash} failed: {e}"),
            None => {
                // Nobody holds this hash yet: queue a search.
                self.queues.lock().search.push_back(QueueItem::Request {
                    peer,
                    hash,
                    size,
                    offset,
                    chunk_size,
                    flags,
                });
            }
        }
    }

    /// Consult the ordered file methods; the first hit becomes a
    /// provider and the request is served immediately.
    fn handle_search(&self, item: QueueItem, now: Instant) {
        let QueueItem::Request {
            peer,
            hash,
            size,
            offset,
            chunk_size,
            flags,
        } = item
        else {
            return;
        };

        let spec_only = flags & search_flags::SPEC_ONLY != 0;
        let hint = flags & !search_flags::SPEC_ONLY;

        let methods: Vec<Arc<dyn FileMethod>> = self.methods.lock().clone();
        for method in methods {
            if spec_only && method.flags() & hint == 0 {
                continue;
            }
            let Some(path) = method.search(&hash, size) else {
                continue;
            };
            debug!("search matched {hash} at {}", path.display());
            let mut provider = FileProvider::new(path, size, hash.clone());
            match provider.get_file_data(peer, offset, chunk_size, now) {
                Ok(data) => {
                    self.providers.lock().insert(hash.clone(), provider);
                    self.sender.send_chunk_data(peer, &hash, size, offset, data);
                }
                Err(e) => debug!("fresh provider for {hash} failed: {e}"),
            }
            return;
        }
        trace!("no method matched {hash}");
    }

    /// Run the demultiplexer on its own self-paced thread.
    pub fn spawn_worker(self: &Arc<Self>) -> std::thread::JoinHandle<()> {
        let demux = self.clone();
        std::thread::spawn(move || {
            let mut sleep = SLEEP_MAX;
            while demux.running.load(Ordering::Relaxed) {
                let worked = demux.tick(Instant::now());
                if worked || demux.work_queued() {
                    sleep = (sleep / 2).max(SLEEP_MIN);
                } else {
                    sleep = (sleep * 2).min(SLEEP_MAX);
                }
                std::thread::sleep(sleep);
            }
        })
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::creator::FileCreator;
    use tempfile::tempdir;

    const REQUESTOR: DirectoryId = DirectoryId(10);
    const OWN: DirectoryId = DirectoryId(1);

    #[derive(Default)]
    struct RecordingSender {
        sent_data: Mutex<Vec<(DirectoryId, FileHash, u64, Vec<u8>)>>,
    }

    impl DataSender for RecordingSender {
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
            peer: DirectoryId,
            hash: &FileHash,
            _size: u64,
            offset: u64,
            data: Vec<u8>,
        ) {
            self.sent_data
                .lock()
                .push((peer, hash.clone(), offset, data));
        }
    }

    struct StaticMethod {
        flags: u32,
        hash: FileHash,
        path: PathBuf,
    }

    impl FileMethod for StaticMethod {
        fn flags(&self) -> u32 {
            self.flags
        }
        fn search(&self, hash: &FileHash, _size: u64) -> Option<PathBuf> {
            (hash == &self.hash).then(|| self.path.clone())
        }
    }

    fn hash() -> FileHash {
        FileHash::new("99".repeat(20)).unwrap()
    }

    #[test]
    fn data_for_unknown_hash_is_dropped() {
        let sender = Arc::new(RecordingSender::default());
        let demux = DataDemux::new(OWN, sender);
        demux.recv_data(REQUESTOR, hash(), 0, vec![0u8; 16]);
        assert!(demux.tick(Instant::now()));
        // Nothing to assert beyond "no panic, queue drained".
        assert!(!demux.work_queued());
    }

    #[test]
    fn request_resolved_through_search_method() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("shared.bin");
        let content: Vec<u8> = (0..64u8).collect();
        std::fs::write(&path, &content).unwrap();

        let sender = Arc::new(RecordingSender::default());
        let demux = DataDemux::new(OWN, sender.clone());
        demux.add_method(Arc::new(StaticMethod {
            flags: search_flags::TEMP,
            hash: hash(),
            path,
        }));

        demux.recv_request(REQUESTOR, hash(), 64, 0, 32, 0);
        let now = Instant::now();
        // First tick moves the request into the search queue and runs
        // the search.
        demux.tick(now);
        let sent = sender.sent_data.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, REQUESTOR);
        assert_eq!(sent[0].3, content[..32].to_vec());
        drop(sent);

        // The provider is now registered; later requests skip the search.
        demux.recv_request(REQUESTOR, hash(), 64, 32, 32, 0);
        demux.tick(now);
        assert_eq!(sender.sent_data.lock().len(), 2);
    }

    #[test]
    fn spec_only_restricts_methods() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("catalog.bin");
        std::fs::write(&path, vec![5u8; 16]).unwrap();

        let sender = Arc::new(RecordingSender::default());
        let demux = DataDemux::new(OWN, sender.clone());
        demux.add_method(Arc::new(StaticMethod {
            flags: search_flags::CATALOG,
            hash: hash(),
            path,
        }));

        // Spec-only search hinting at temp shares must not consult the
        // catalog method.
        demux.recv_request(
            REQUESTOR,
            hash(),
            16,
            0,
            16,
            search_flags::SPEC_ONLY | search_flags::TEMP,
        );
        demux.tick(Instant::now());
        assert!(sender.sent_data.lock().is_empty());

        // The same hint without spec-only falls through to any method.
        demux.recv_request(REQUESTOR, hash(), 16, 0, 16, search_flags::TEMP);
        demux.tick(Instant::now());
        demux.tick(Instant::now());
        assert_eq!(sender.sent_data.lock().len(), 1);
    }

    #[test]
    fn serves_uploads_from_partial_saved_prefix() {
        let dir = tempdir().unwrap();
        let sender = Arc::new(RecordingSender::default());
        let demux = DataDemux::new(OWN, sender.clone());

        let creator =
            FileCreator::new(dir.path().join("part.bin"), 1 << 16, hash()).unwrap();
        let module = TransferModule::new(creator, sender.clone(), None);
        module.add_source(DirectoryId(2));
        let now = Instant::now();
        module.tick(now);
        module.recv_chunk(DirectoryId(2), 0, vec![3u8; 8192], now);
        module.tick(now);
        demux.add_module(module);

        // A friend asks for the start of the file we are downloading.
        demux.recv_request(REQUESTOR, hash(), 1 << 16, 0, 1024, 0);
        demux.tick(now);
        let sent = sender.sent_data.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].3, vec![3u8; 1024]);
        drop(sent);

        // A range we have not saved yet is not served.
        demux.recv_request(REQUESTOR, hash(), 1 << 16, 30_000, 1024, 0);
        demux.tick(now);
        assert_eq!(sender.sent_data.lock().len(), 1);
    }

    #[test]
    fn purge_drops_queued_items_for_hash() {
        let sender = Arc::new(RecordingSender::default());
        let demux = DataDemux::new(OWN, sender);
        demux.recv_data(REQUESTOR, hash(), 0, vec![0u8; 4]);
        demux.recv_request(REQUESTOR, hash(), 8, 0, 4, 0);
        demux.purge_queued(&hash());
        assert!(!demux.work_queued());
    }

    #[test]
    fn duplicate_module_registration_is_refused() {
        let dir = tempdir().unwrap();
        let sender = Arc::new(RecordingSender::default());
        let demux = DataDemux::new(OWN, sender.clone());
        let creator_a =
            FileCreator::new(dir.path().join("a.bin"), 10, hash()).unwrap();
        let creator_b =
            FileCreator::new(dir.path().join("b.bin"), 10, hash()).unwrap();
        assert!(demux.add_module(TransferModule::new(creator_a, sender.clone(), None)));
        assert!(!demux.add_module(TransferModule::new(creator_b, sender, None)));
    }
}

//! Item-level request/offer protocol, one layer above the chunk machinery.
//!
//! Friends exchange catalog item ids; the owner resolves an id into a
//! concrete file set, a lend offer, a message, or an error status. Traffic
//! for offline friends queues locally and replays, in original order, when
//! they connect. The borrow lifecycle lives here too: the borrower tracks
//! each borrowed item from offer to return, the lender keeps a lent-out
//! marker so returned items can be restored.

use std::{
    collections::{HashMap, VecDeque},
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, info, warn};

use tether_core::{DirectoryId, Event, EventBus, FileHash};
use tether_stream::{RawMessage, Service, ServiceMux};

use crate::group::{GroupFile, TransferController, TransferGroup};
use crate::wire::{
    self, BorrowComplete, FileMeta, ItemOutcome, ItemRequest, ItemResponse, ReturnComplete,
    Suggestion, SERVICE_EXCHANGE, SUBTYPE_BORROW_COMPLETE, SUBTYPE_ITEM_REQUEST,
    SUBTYPE_ITEM_RESPONSE, SUBTYPE_RETURN_COMPLETE, SUBTYPE_SUGGESTION,
};

/// How often an unanswered request is re-sent to a connected friend.
const REQUEST_RETRY: Duration = Duration::from_secs(60);

/// Where an item request currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    /// Sent (or waiting to send); no answer yet.
    NoReply,
    InternalError,
    LentOut,
    /// The item resolved to a chat invitation.
    Chat,
    /// The item resolved to a plain message.
    Message,
    NoSuchItem,
    Unmatched,
    BrokenMatch,
}

impl RequestStatus {
    /// Whether this request will never progress on its own.
    pub fn is_terminal(self) -> bool {
        self != RequestStatus::NoReply
    }
}

/// Inspection snapshot of one pending item request.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub friend: DirectoryId,
    pub item_id: u32,
    pub name: String,
    pub status: RequestStatus,
}

/// A file a catalog item resolved to, locally.
#[derive(Debug, Clone)]
pub struct CatalogFile {
    pub path: PathBuf,
    pub hash: FileHash,
    pub size: u64,
}

/// What an item id means on this node.
#[derive(Debug, Clone)]
pub enum CatalogResolution {
    FileSet { title: String, files: Vec<CatalogFile> },
    Lend { title: String, files: Vec<CatalogFile> },
    Chat,
    Message(String),
    LentOut,
    NoSuchItem,
    Unmatched,
    BrokenMatch,
}

/// The catalog of items this node offers. The shared-library UI owns the
/// real data; the core only needs resolution, hash lookup for serving,
/// and the lend markers.
pub trait Catalog: Send + Sync {
    fn resolve(&self, item_id: u32) -> CatalogResolution;
    /// Path of a catalog-linked complete file with this hash and size.
    fn find_by_hash(&self, hash: &FileHash, size: u64) -> Option<PathBuf>;
    /// Borrower finished downloading `item_id`: delete the local files,
    /// keep the metadata.
    fn lend_completed(&self, item_id: u32, borrow_key: &str);
    /// Borrower returned the files: restore the item.
    fn lend_returned(&self, item_id: u32, borrow_key: &str);
}

/// Adapter exposing catalog-linked files as a search method.
pub struct CatalogFileMethod {
    catalog: Arc<dyn Catalog>,
}

impl CatalogFileMethod {
    pub fn new(catalog: Arc<dyn Catalog>) -> Arc<Self> {
        Arc::new(Self { catalog })
    }
}

impl crate::demux::FileMethod for CatalogFileMethod {
    fn flags(&self) -> u32 {
        crate::demux::search_flags::CATALOG
    }
    fn search(&self, hash: &FileHash, size: u64) -> Option<PathBuf> {
        self.catalog.find_by_hash(hash, size)
    }
}

/// Borrower-side state of one borrowed item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BorrowState {
    /// Offer received, awaiting user acknowledgement.
    Pending,
    Downloading,
    Borrowed,
    Returning,
}

#[derive(Debug, Clone)]
pub struct BorrowedItem {
    pub borrow_key: String,
    pub lender: DirectoryId,
    pub title: String,
    pub state: BorrowState,
}

struct PendingEntry {
    friend: DirectoryId,
    item_id: u32,
    name: String,
    status: RequestStatus,
    last_try: Option<Instant>,
}

struct PendingOffer {
    friend: DirectoryId,
    title: String,
    files: Vec<FileMeta>,
}

#[derive(Default)]
struct State {
    pending: Vec<PendingEntry>,
    /// Records for offline friends, replayed in order on connect.
    offline: HashMap<DirectoryId, VecDeque<(u16, Vec<u8>)>>,
    /// Borrower side, keyed by borrow key.
    borrows: HashMap<String, BorrowedItem>,
    /// Offers not yet accepted, keyed by borrow key.
    offers: HashMap<String, PendingOffer>,
    /// Lender side: borrow key -> item id.
    lent_out: HashMap<String, u32>,
}

/// The request/offer service.
pub struct ExchangeService {
    mux: Arc<ServiceMux>,
    controller: Arc<TransferController>,
    catalog: Arc<dyn Catalog>,
    events: EventBus,
    state: Mutex<State>,
}

impl ExchangeService {
    pub fn new(
        mux: Arc<ServiceMux>,
        controller: Arc<TransferController>,
        catalog: Arc<dyn Catalog>,
        events: EventBus,
    ) -> Arc<Self> {
        Arc::new(Self {
            mux,
            controller,
            catalog,
            events,
            state: Mutex::new(State::default()),
        })
    }

    /// Register with the multiplexer and hook group completion for the
    /// borrow lifecycle.
    pub fn install(self: &Arc<Self>) {
        self.mux.register_service(self.clone());
        let weak = Arc::downgrade(self);
        self.controller.on_complete(move |group| {
            if let Some(service) = weak.upgrade() {
                service.handle_group_complete(group);
            }
        });
    }

    // -- outbound API -------------------------------------------------------

    /// Ask `friend` to resolve an item. The request retries until
    /// answered or cancelled.
    pub fn request_item(&self, friend: DirectoryId, item_id: u32, name: impl Into<String>) {
        let name = name.into();
        {
            let mut state = self.state.lock();
            if state
                .pending
                .iter()
                .any(|p| p.friend == friend && p.item_id == item_id)
            {
                return;
            }
            state.pending.push(PendingEntry {
                friend,
                item_id,
                name: name.clone(),
                status: RequestStatus::NoReply,
                last_try: None,
            });
        }
        self.try_send_request(friend, item_id, &name);
    }

    pub fn cancel_request(&self, item_id: u32) {
        self.state.lock().pending.retain(|p| p.item_id != item_id);
    }

    pub fn pending_requests(&self) -> Vec<PendingRequest> {
        self.state
            .lock()
            .pending
            .iter()
            .map(|p| PendingRequest {
                friend: p.friend,
                item_id: p.item_id,
                name: p.name.clone(),
                status: p.status,
            })
            .collect()
    }

    /// Drop every request that ended in an error status.
    pub fn clear_completed(&self) {
        self.state
            .lock()
            .pending
            .retain(|p| !p.status.is_terminal());
    }

    /// Recommend a file set to a friend.
    pub fn send_suggestion(&self, friend: DirectoryId, title: String, files: Vec<FileMeta>) {
        let suggestion = Suggestion { title, files };
        match wire::encode(&suggestion) {
            Ok(body) => self.send_or_queue(friend, SUBTYPE_SUGGESTION, body),
            Err(e) => warn!("encoding suggestion failed: {e}"),
        }
    }

    /// Accept a pending lend offer and start the borrow download.
    pub fn accept_offer(&self, borrow_key: &str) -> tether_core::Result<u32> {
        let offer = self
            .state
            .lock()
            .offers
            .remove(borrow_key)
            .ok_or_else(|| tether_core::Error::protocol(format!("no offer {borrow_key:?}")))?;

        let files = metas_to_group_files(&offer.files)?;
        let group_id = self.controller.start_group(
            offer.title.clone(),
            files,
            vec![offer.friend],
            None,
            Some(borrow_key.to_string()),
        )?;
        self.state.lock().borrows.insert(
            borrow_key.to_string(),
            BorrowedItem {
                borrow_key: borrow_key.to_string(),
                lender: offer.friend,
                title: offer.title,
                state: BorrowState::Downloading,
            },
        );
        Ok(group_id)
    }

    /// Borrower starts giving the files back (the actual bytes ride the
    /// normal transfer machinery, driven by the user).
    pub fn begin_return(&self, borrow_key: &str) {
        if let Some(item) = self.state.lock().borrows.get_mut(borrow_key) {
            item.state = BorrowState::Returning;
        }
    }

    /// Borrower confirms the lender has the files back.
    pub fn complete_return(&self, borrow_key: &str) {
        let lender = {
            let mut state = self.state.lock();
            state.borrows.remove(borrow_key).map(|item| item.lender)
        };
        let Some(lender) = lender else { return };
        let message = ReturnComplete {
            borrow_key: borrow_key.to_string(),
        };
        match wire::encode(&message) {
            Ok(body) => self.send_or_queue(lender, SUBTYPE_RETURN_COMPLETE, body),
            Err(e) => warn!("encoding return-complete failed: {e}"),
        }
    }

    pub fn borrowed_items(&self) -> Vec<BorrowedItem> {
        self.state.lock().borrows.values().cloned().collect()
    }

    /// Number of records queued for an offline friend (inspection).
    pub fn queued_for(&self, friend: DirectoryId) -> usize {
        self.state
            .lock()
            .offline
            .get(&friend)
            .map(|q| q.len())
            .unwrap_or(0)
    }

    /// Replay queued records in their original order now that `friend`
    /// is connected.
    pub fn peer_connected(&self, friend: DirectoryId) {
        let queued = self.state.lock().offline.remove(&friend);
        if let Some(queue) = queued {
            info!("replaying {} queued records to {friend}", queue.len());
            for (subtype, body) in queue {
                if self
                    .mux
                    .queue_message(friend, SERVICE_EXCHANGE, subtype, &body)
                    .is_err()
                {
                    // Went offline again mid-replay: requeue the rest.
                    self.state
                        .lock()
                        .offline
                        .entry(friend)
                        .or_default()
                        .push_back((subtype, body));
                }
            }
        }
        // Unanswered requests to this friend go out again immediately.
        let retries: Vec<(u32, String)> = {
            let state = self.state.lock();
            state
                .pending
                .iter()
                .filter(|p| p.friend == friend && p.status == RequestStatus::NoReply)
                .map(|p| (p.item_id, p.name.clone()))
                .collect()
        };
        for (item_id, name) in retries {
            self.try_send_request(friend, item_id, &name);
        }
    }

    // -- internals ----------------------------------------------------------

    fn try_send_request(&self, friend: DirectoryId, item_id: u32, name: &str) {
        let request = ItemRequest {
            item_id,
            display_name: name.to_string(),
        };
        let Ok(body) = wire::encode(&request) else {
            return;
        };
        let sent = self
            .mux
            .queue_message(friend, SERVICE_EXCHANGE, SUBTYPE_ITEM_REQUEST, &body)
            .is_ok();
        let mut state = self.state.lock();
        if let Some(entry) = state
            .pending
            .iter_mut()
            .find(|p| p.friend == friend && p.item_id == item_id)
        {
            if sent {
                entry.last_try = Some(Instant::now());
            }
        }
    }

    fn send_or_queue(&self, friend: DirectoryId, subtype: u16, body: Vec<u8>) {
        if self
            .mux
            .queue_message(friend, SERVICE_EXCHANGE, subtype, &body)
            .is_err()
        {
            self.state
                .lock()
                .offline
                .entry(friend)
                .or_default()
                .push_back((subtype, body));
        }
    }

    fn handle_item_request(&self, friend: DirectoryId, request: ItemRequest) {
        let resolution = self.catalog.resolve(request.item_id);
        let (title, outcome) = match resolution {
            CatalogResolution::FileSet { title, files } => {
                let files = files_to_metas(&files);
                (title, ItemOutcome::FileSet { files })
            }
            CatalogResolution::Lend { title, files } => {
                let borrow_key = generate_borrow_key();
                self.state
                    .lock()
                    .lent_out
                    .insert(borrow_key.clone(), request.item_id);
                let files = files_to_metas(&files);
                (title, ItemOutcome::LendOffer { files, borrow_key })
            }
            CatalogResolution::Chat => (request.display_name.clone(), ItemOutcome::Chat),
            CatalogResolution::Message(text) => {
                (request.display_name.clone(), ItemOutcome::Message { text })
            }
            CatalogResolution::LentOut => (request.display_name.clone(), ItemOutcome::LentOut),
            CatalogResolution::NoSuchItem => {
                (request.display_name.clone(), ItemOutcome::NoSuchItem)
            }
            CatalogResolution::Unmatched => {
                (request.display_name.clone(), ItemOutcome::Unmatched)
            }
            CatalogResolution::BrokenMatch => {
                (request.display_name.clone(), ItemOutcome::BrokenMatch)
            }
        };
        let response = ItemResponse {
            item_id: request.item_id,
            title,
            outcome,
        };
        match wire::encode(&response) {
            Ok(body) => self.send_or_queue(friend, SUBTYPE_ITEM_RESPONSE, body),
            Err(e) => warn!("encoding item response failed: {e}"),
        }
    }

    fn handle_item_response(&self, friend: DirectoryId, response: ItemResponse) {
        let entry_name = {
            let state = self.state.lock();
            state
                .pending
                .iter()
                .find(|p| p.friend == friend && p.item_id == response.item_id)
                .map(|p| p.name.clone())
        };
        let Some(entry_name) = entry_name else {
            debug!(
                "response for item {} we never asked {friend} about",
                response.item_id
            );
            return;
        };

        let mut resolved = true;
        match response.outcome {
            ItemOutcome::FileSet { files } => match metas_to_group_files(&files) {
                Ok(group_files) => {
                    let title = if response.title.is_empty() {
                        entry_name
                    } else {
                        response.title
                    };
                    if let Err(e) = self.controller.start_group(
                        title,
                        group_files,
                        vec![friend],
                        None,
                        None,
                    ) {
                        warn!("starting transfer for item {} failed: {e}", response.item_id);
                        self.set_pending_status(friend, response.item_id, RequestStatus::InternalError);
                        resolved = false;
                    }
                }
                Err(_) => {
                    self.set_pending_status(friend, response.item_id, RequestStatus::BrokenMatch);
                    resolved = false;
                }
            },
            ItemOutcome::LendOffer { files, borrow_key } => {
                self.state.lock().offers.insert(
                    borrow_key,
                    PendingOffer {
                        friend,
                        title: response.title,
                        files,
                    },
                );
                self.events.publish(Event::RequestAnswered {
                    friend,
                    item_id: response.item_id,
                });
            }
            ItemOutcome::Chat => {
                self.set_pending_status(friend, response.item_id, RequestStatus::Chat);
                self.events.publish(Event::RequestAnswered {
                    friend,
                    item_id: response.item_id,
                });
                resolved = false;
            }
            ItemOutcome::Message { text } => {
                info!("item {} resolved to a message: {text}", response.item_id);
                self.set_pending_status(friend, response.item_id, RequestStatus::Message);
                self.events.publish(Event::RequestAnswered {
                    friend,
                    item_id: response.item_id,
                });
                resolved = false;
            }
            ItemOutcome::LentOut => {
                self.set_pending_status(friend, response.item_id, RequestStatus::LentOut);
                resolved = false;
            }
            ItemOutcome::NoSuchItem => {
                self.set_pending_status(friend, response.item_id, RequestStatus::NoSuchItem);
                resolved = false;
            }
            ItemOutcome::Unmatched => {
                self.set_pending_status(friend, response.item_id, RequestStatus::Unmatched);
                resolved = false;
            }
            ItemOutcome::BrokenMatch => {
                self.set_pending_status(friend, response.item_id, RequestStatus::BrokenMatch);
                resolved = false;
            }
            ItemOutcome::InternalError => {
                self.set_pending_status(friend, response.item_id, RequestStatus::InternalError);
                resolved = false;
            }
        }

        if resolved {
            self.state
                .lock()
                .pending
                .retain(|p| !(p.friend == friend && p.item_id == response.item_id));
        }
    }

    fn set_pending_status(&self, friend: DirectoryId, item_id: u32, status: RequestStatus) {
        let mut state = self.state.lock();
        if let Some(entry) = state
            .pending
            .iter_mut()
            .find(|p| p.friend == friend && p.item_id == item_id)
        {
            entry.status = status;
        }
    }

    fn handle_suggestion(&self, friend: DirectoryId, suggestion: Suggestion) {
        info!(
            "{friend} suggests {:?} ({} files)",
            suggestion.title,
            suggestion.files.len()
        );
        self.events.publish(Event::SuggestionReceived {
            friend,
            title: suggestion.title,
        });
    }

    fn handle_borrow_complete(&self, friend: DirectoryId, message: BorrowComplete) {
        let item_id = self.state.lock().lent_out.get(&message.borrow_key).copied();
        match item_id {
            Some(item_id) => {
                info!(
                    "{friend} finished borrowing item {item_id}; releasing local copy"
                );
                self.catalog.lend_completed(item_id, &message.borrow_key);
            }
            None => debug!("borrow-complete for unknown key from {friend}"),
        }
    }

    fn handle_return_complete(&self, friend: DirectoryId, message: ReturnComplete) {
        let item_id = self.state.lock().lent_out.remove(&message.borrow_key);
        match item_id {
            Some(item_id) => {
                info!("{friend} returned item {item_id}; restoring");
                self.catalog.lend_returned(item_id, &message.borrow_key);
            }
            None => debug!("return-complete for unknown key from {friend}"),
        }
    }

    /// Group completion: a finished borrow download notifies the lender.
    fn handle_group_complete(&self, group: &TransferGroup) {
        let Some(borrow_key) = &group.borrow_key else {
            return;
        };
        let lender = {
            let mut state = self.state.lock();
            match state.borrows.get_mut(borrow_key) {
                Some(item) if item.state == BorrowState::Downloading => {
                    item.state = BorrowState::Borrowed;
                    Some(item.lender)
                }
                _ => None,
            }
        };
        let Some(lender) = lender else { return };
        let message = BorrowComplete {
            borrow_key: borrow_key.clone(),
        };
        match wire::encode(&message) {
            Ok(body) => self.send_or_queue(lender, SUBTYPE_BORROW_COMPLETE, body),
            Err(e) => warn!("encoding borrow-complete failed: {e}"),
        }
    }
}

impl Service for ExchangeService {
    fn service_id(&self) -> u16 {
        SERVICE_EXCHANGE
    }

    /// Periodic retry of unanswered requests to connected friends.
    fn tick(&self) {
        let now = Instant::now();
        let retries: Vec<(DirectoryId, u32, String)> = {
            let state = self.state.lock();
            state
                .pending
                .iter()
                .filter(|p| p.status == RequestStatus::NoReply)
                .filter(|p| match p.last_try {
                    None => true,
                    Some(at) => now.duration_since(at) >= REQUEST_RETRY,
                })
                .filter(|p| self.mux.is_attached(p.friend))
                .map(|p| (p.friend, p.item_id, p.name.clone()))
                .collect()
        };
        for (friend, item_id, name) in retries {
            self.try_send_request(friend, item_id, &name);
        }
    }

    fn receive(&self, msg: RawMessage) {
        let from = msg.from;
        let result: tether_core::Result<()> = (|| {
            match msg.subtype {
                SUBTYPE_ITEM_REQUEST => {
                    self.handle_item_request(from, wire::decode(&msg.body)?)
                }
                SUBTYPE_ITEM_RESPONSE => {
                    self.handle_item_response(from, wire::decode(&msg.body)?)
                }
                SUBTYPE_SUGGESTION => self.handle_suggestion(from, wire::decode(&msg.body)?),
                SUBTYPE_BORROW_COMPLETE => {
                    self.handle_borrow_complete(from, wire::decode(&msg.body)?)
                }
                SUBTYPE_RETURN_COMPLETE => {
                    self.handle_return_complete(from, wire::decode(&msg.body)?)
                }
                other => debug!("unknown exchange subtype {other:#06x} from {from}"),
            }
            Ok(())
        })();
        if let Err(e) = result {
            // Malformed record: drop and log, per the protocol-violation
            // policy.
            debug!("malformed exchange record from {from}: {e}");
        }
    }
}

fn files_to_metas(files: &[CatalogFile]) -> Vec<FileMeta> {
    files
        .iter()
        .map(|f| FileMeta {
            name: f
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| f.hash.to_string()),
            hash: f.hash.to_string(),
            size: f.size,
        })
        .collect()
}

fn metas_to_group_files(files: &[FileMeta]) -> tether_core::Result<Vec<GroupFile>> {
    files
        .iter()
        .map(|meta| {
            Ok(GroupFile {
                name: meta.name.clone(),
                hash: FileHash::new(&meta.hash)?,
                size: meta.size,
            })
        })
        .collect()
}

fn generate_borrow_key() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demux::DataDemux;
    use crate::scheduler::DataSender;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::tempdir;

    const FRIEND: DirectoryId = DirectoryId(7);

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

    struct TestCatalog {
        resolution: CatalogResolution,
        completed: AtomicU32,
        returned: AtomicU32,
    }

    impl TestCatalog {
        fn new(resolution: CatalogResolution) -> Arc<Self> {
            Arc::new(Self {
                resolution,
                completed: AtomicU32::new(0),
                returned: AtomicU32::new(0),
            })
        }
    }

    impl Catalog for TestCatalog {
        fn resolve(&self, _item_id: u32) -> CatalogResolution {
            self.resolution.clone()
        }
        fn find_by_hash(&self, _hash: &FileHash, _size: u64) -> Option<PathBuf> {
            None
        }
        fn lend_completed(&self, _item_id: u32, _borrow_key: &str) {
            self.completed.fetch_add(1, Ordering::Relaxed);
        }
        fn lend_returned(&self, _item_id: u32, _borrow_key: &str) {
            self.returned.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn service(
        root: &std::path::Path,
        catalog: Arc<dyn Catalog>,
    ) -> (Arc<ExchangeService>, Arc<TransferController>) {
        let sender: Arc<dyn DataSender> = Arc::new(NullSender);
        let demux = DataDemux::new(DirectoryId(1), sender.clone());
        let events = EventBus::new(32);
        let controller = TransferController::new(
            demux,
            sender,
            events.clone(),
            root.join("partials"),
            root.join("downloads"),
            true,
            None,
        );
        let mux = ServiceMux::new();
        let service = ExchangeService::new(mux, controller.clone(), catalog, events);
        service.install();
        (service, controller)
    }

    fn meta(tag: &str, size: u64) -> FileMeta {
        FileMeta {
            name: format!("{tag}.bin"),
            hash: tag.repeat(20),
            size,
        }
    }

    #[tokio::test]
    async fn request_to_offline_friend_stays_pending() {
        let dir = tempdir().unwrap();
        let catalog = TestCatalog::new(CatalogResolution::NoSuchItem);
        let (service, _controller) = service(dir.path(), catalog);
        service.request_item(FRIEND, 42, "an item");
        let pending = service.pending_requests();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].status, RequestStatus::NoReply);
    }

    #[tokio::test]
    async fn file_set_response_starts_a_group() {
        let dir = tempdir().unwrap();
        let catalog = TestCatalog::new(CatalogResolution::NoSuchItem);
        let (service, controller) = service(dir.path(), catalog);
        service.request_item(FRIEND, 42, "an item");

        let response = ItemResponse {
            item_id: 42,
            title: "the goods".into(),
            outcome: ItemOutcome::FileSet {
                files: vec![meta("ab", 128)],
            },
        };
        service.receive(RawMessage {
            from: FRIEND,
            subtype: SUBTYPE_ITEM_RESPONSE,
            body: wire::encode(&response).unwrap(),
        });

        let groups = controller.groups();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].title, "the goods");
        assert_eq!(groups[0].sources, vec![FRIEND]);
        // The pending entry resolved away.
        assert!(service.pending_requests().is_empty());
    }

    #[tokio::test]
    async fn error_response_sets_terminal_status() {
        let dir = tempdir().unwrap();
        let catalog = TestCatalog::new(CatalogResolution::NoSuchItem);
        let (service, _controller) = service(dir.path(), catalog);
        service.request_item(FRIEND, 9, "ghost");
        let response = ItemResponse {
            item_id: 9,
            title: String::new(),
            outcome: ItemOutcome::NoSuchItem,
        };
        service.receive(RawMessage {
            from: FRIEND,
            subtype: SUBTYPE_ITEM_RESPONSE,
            body: wire::encode(&response).unwrap(),
        });
        assert_eq!(
            service.pending_requests()[0].status,
            RequestStatus::NoSuchItem
        );
        service.clear_completed();
        assert!(service.pending_requests().is_empty());
    }

    #[tokio::test]
    async fn lend_offer_accept_and_borrow_lifecycle() {
        let dir = tempdir().unwrap();
        let catalog = TestCatalog::new(CatalogResolution::NoSuchItem);
        let (service, controller) = service(dir.path(), catalog);
        service.request_item(FRIEND, 5, "lendable");

        let response = ItemResponse {
            item_id: 5,
            title: "lend me".into(),
            outcome: ItemOutcome::LendOffer {
                files: vec![meta("cd", 64)],
                borrow_key: "key-7".into(),
            },
        };
        service.receive(RawMessage {
            from: FRIEND,
            subtype: SUBTYPE_ITEM_RESPONSE,
            body: wire::encode(&response).unwrap(),
        });

        let group_id = service.accept_offer("key-7").unwrap();
        assert!(controller.group(group_id).is_some());
        let borrows = service.borrowed_items();
        assert_eq!(borrows.len(), 1);
        assert_eq!(borrows[0].state, BorrowState::Downloading);

        // Completion of the borrow group advances the state and queues
        // the notification for the (offline) lender.
        let group = controller.group(group_id).unwrap();
        service.handle_group_complete(&group);
        assert_eq!(service.borrowed_items()[0].state, BorrowState::Borrowed);
        assert_eq!(service.queued_for(FRIEND), 1);

        // Returning clears the ledger.
        service.begin_return("key-7");
        assert_eq!(service.borrowed_items()[0].state, BorrowState::Returning);
        service.complete_return("key-7");
        assert!(service.borrowed_items().is_empty());
        assert_eq!(service.queued_for(FRIEND), 2);
    }

    #[tokio::test]
    async fn lender_side_borrow_complete_and_return() {
        let dir = tempdir().unwrap();
        let shared = dir.path().join("lend.bin");
        std::fs::write(&shared, b"data").unwrap();
        let catalog = TestCatalog::new(CatalogResolution::Lend {
            title: "mine".into(),
            files: vec![CatalogFile {
                path: shared,
                hash: FileHash::new("ef".repeat(20)).unwrap(),
                size: 4,
            }],
        });
        let (service, _controller) = service(dir.path(), catalog.clone());

        // A friend asks for the item; we answer with a lend offer and
        // remember the key.
        service.receive(RawMessage {
            from: FRIEND,
            subtype: SUBTYPE_ITEM_REQUEST,
            body: wire::encode(&ItemRequest {
                item_id: 5,
                display_name: "mine".into(),
            })
            .unwrap(),
        });
        // The response sits in the offline queue (friend not attached);
        // dig the borrow key out of the lender ledger.
        let key = service
            .state
            .lock()
            .lent_out
            .keys()
            .next()
            .cloned()
            .unwrap();

        service.receive(RawMessage {
            from: FRIEND,
            subtype: SUBTYPE_BORROW_COMPLETE,
            body: wire::encode(&BorrowComplete {
                borrow_key: key.clone(),
            })
            .unwrap(),
        });
        assert_eq!(catalog.completed.load(Ordering::Relaxed), 1);

        service.receive(RawMessage {
            from: FRIEND,
            subtype: SUBTYPE_RETURN_COMPLETE,
            body: wire::encode(&ReturnComplete { borrow_key: key }).unwrap(),
        });
        assert_eq!(catalog.returned.load(Ordering::Relaxed), 1);
        assert!(service.state.lock().lent_out.is_empty());
    }

    #[tokio::test]
    async fn malformed_record_is_dropped() {
        let dir = tempdir().unwrap();
        let catalog = TestCatalog::new(CatalogResolution::NoSuchItem);
        let (service, _controller) = service(dir.path(), catalog);
        service.receive(RawMessage {
            from: FRIEND,
            subtype: SUBTYPE_ITEM_RESPONSE,
            body: vec![0xFF; 2],
        });
        // Nothing crashed, nothing queued.
        assert_eq!(service.queued_for(FRIEND), 0);
    }
}

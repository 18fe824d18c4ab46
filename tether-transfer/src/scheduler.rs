//! Per-file transfer scheduling: request pacing, RTT-driven rate
//! adaptation and multi-source rotation.
//!
//! One module pairs with one file creator. Each eligible source carries at
//! most one outstanding request; request sizes grow and shrink with the
//! observed round-trip behaviour, and a stalled source degrades to idle
//! (then to not-online) without failing the transfer.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use tether_core::{DirectoryId, FileHash};

use crate::creator::FileCreator;

/// First request to a fresh source; small so a dead source costs little.
pub const FAST_START_CHUNK: u32 = 8 * 1024;
const MIN_CHUNK: u32 = 1024;
const MAX_CHUNK: u32 = 256 * 1024;

/// Resets before a source is written off as not-online.
const MAX_RESETS: u32 = 5;

/// Outstanding-request timeout until an RTT estimate exists.
const BASE_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Round trips at or under this grow the request size to the maximum.
const RTT_FAST: f64 = 1.0;
/// Round trips at or over this shrink the request size.
const RTT_STD: f64 = 5.0;

/// Floor for the per-file bytes-in-flight window.
const MIN_WINDOW: u64 = 256 * 1024;

/// Eligibility of one source peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Init,
    NotOnline,
    Downloading,
    Idle,
    Suspend,
}

/// Per-source bookkeeping.
#[derive(Debug)]
pub struct PeerTransferInfo {
    pub state: PeerState,
    /// Current request, when one is outstanding.
    outstanding: bool,
    request_offset: u64,
    request_size: u32,
    received_for_request: u32,
    last_request_at: Option<Instant>,
    last_receive_at: Option<Instant>,
    /// Bytes received since the last per-second accounting.
    second_bytes: u64,
    second_marker: Option<Instant>,
    pub reset_count: u32,
    /// Smoothed round trip in seconds; zero until the first sample.
    rtt: f64,
    rtt_active: bool,
    rtt_start: Option<Instant>,
    rtt_end_offset: u64,
    /// Fractional change applied to the next request size, in [-1, +1].
    rate_increase: f64,
    /// Next request uses the fast-start size regardless of history.
    fast_start: bool,
    /// Smoothed delivery rate, bytes per second.
    pub actual_rate: f64,
}

impl PeerTransferInfo {
    fn new() -> Self {
        Self {
            state: PeerState::Init,
            outstanding: false,
            request_offset: 0,
            request_size: FAST_START_CHUNK,
            received_for_request: 0,
            last_request_at: None,
            last_receive_at: None,
            second_bytes: 0,
            second_marker: None,
            reset_count: 0,
            rtt: 0.0,
            rtt_active: false,
            rtt_start: None,
            rtt_end_offset: 0,
            rate_increase: 0.0,
            fast_start: true,
            actual_rate: 0.0,
        }
    }

    fn request_timeout(&self) -> Duration {
        if self.rtt > 0.0 {
            Duration::from_secs_f64((self.rtt * 4.0).max(1.0))
        } else {
            BASE_REQUEST_TIMEOUT
        }
    }

    fn next_chunk_size(&self) -> u32 {
        if self.fast_start {
            return FAST_START_CHUNK;
        }
        let scaled = (self.request_size as f64 * (1.0 + self.rate_increase)) as u32;
        scaled.clamp(MIN_CHUNK, MAX_CHUNK)
    }
}

/// Overall status of the transfer this module drives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferStatus {
    Init,
    Downloading,
    Paused,
    Complete,
    Cancelled,
    Failed(String),
}

/// Emits chunk requests and chunk data onto the wire. Implemented over
/// the service multiplexer; tests record instead.
pub trait DataSender: Send + Sync {
    fn send_chunk_request(
        &self,
        peer: DirectoryId,
        hash: &FileHash,
        size: u64,
        offset: u64,
        chunk_size: u32,
    );
    fn send_chunk_data(
        &self,
        peer: DirectoryId,
        hash: &FileHash,
        size: u64,
        offset: u64,
        data: Vec<u8>,
    );
}

struct Inner {
    creator: FileCreator,
    peers: HashMap<DirectoryId, PeerTransferInfo>,
    /// Round-robin order over sources.
    rotation: Vec<DirectoryId>,
    next_rotation: usize,
    status: TransferStatus,
    /// Consecutive disk-write failures tolerated before giving up;
    /// `None` retries forever.
    write_failure_limit: Option<u32>,
}

/// Scheduler for one in-progress file.
pub struct TransferModule {
    hash: FileHash,
    total_size: u64,
    inner: Mutex<Inner>,
    sender: Arc<dyn DataSender>,
}

impl TransferModule {
    pub fn new(
        creator: FileCreator,
        sender: Arc<dyn DataSender>,
        write_failure_limit: Option<u32>,
    ) -> Arc<Self> {
        let hash = creator.hash().clone();
        let total_size = creator.total_size();
        Arc::new(Self {
            hash,
            total_size,
            inner: Mutex::new(Inner {
                creator,
                peers: HashMap::new(),
                rotation: Vec::new(),
                next_rotation: 0,
                status: TransferStatus::Init,
                write_failure_limit,
            }),
            sender,
        })
    }

    pub fn hash(&self) -> &FileHash {
        &self.hash
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn status(&self) -> TransferStatus {
        self.inner.lock().status.clone()
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.inner.lock().status, TransferStatus::Complete)
    }

    pub fn amount_saved(&self) -> u64 {
        self.inner.lock().creator.amount_saved()
    }

    /// Make `peer` eligible as a source for this file.
    pub fn add_source(&self, peer: DirectoryId) {
        let mut inner = self.inner.lock();
        if inner.peers.contains_key(&peer) {
            return;
        }
        inner.peers.insert(peer, PeerTransferInfo::new());
        inner.rotation.push(peer);
    }

    pub fn sources(&self) -> Vec<DirectoryId> {
        self.inner.lock().rotation.clone()
    }

    /// Flip a source's availability without removing it.
    pub fn set_peer_online(&self, peer: DirectoryId, online: bool) {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let Some(info) = inner.peers.get_mut(&peer) else {
            return;
        };
        if online {
            if info.state != PeerState::Downloading {
                info.state = PeerState::Idle;
                info.fast_start = true;
                info.reset_count = 0;
            }
        } else {
            info.state = PeerState::NotOnline;
            info.outstanding = false;
            inner.creator.invalidate_chunks_requested_from(peer);
        }
    }

    pub fn pause(&self) {
        let mut inner = self.inner.lock();
        if !matches!(inner.status, TransferStatus::Complete | TransferStatus::Cancelled) {
            inner.status = TransferStatus::Paused;
        }
    }

    pub fn resume(&self) {
        let mut inner = self.inner.lock();
        if inner.status == TransferStatus::Paused {
            inner.status = TransferStatus::Downloading;
        }
    }

    /// Abandon the transfer: free every buffer and delete the partial.
    /// Requests already on the wire are not retracted; late data is
    /// dropped by the creator's guards.
    pub fn cancel(&self) {
        let mut inner = self.inner.lock();
        inner.status = TransferStatus::Cancelled;
        for info in inner.peers.values_mut() {
            info.outstanding = false;
            info.state = PeerState::Suspend;
        }
        if let Err(e) = inner.creator.delete_from_disk() {
            warn!("removing cancelled partial failed: {e}");
        }
    }

    /// Accept chunk data routed here by the demultiplexer. The buffer is
    /// handed to the creator when accepted, dropped otherwise.
    pub fn recv_chunk(&self, peer: DirectoryId, offset: u64, data: Vec<u8>, now: Instant) {
        let mut inner = self.inner.lock();
        if matches!(inner.status, TransferStatus::Cancelled | TransferStatus::Complete) {
            // Late data after cancellation is silently dropped.
            return;
        }
        let len = data.len() as u64;
        if let Some(info) = inner.peers.get_mut(&peer) {
            info.last_receive_at = Some(now);
            info.received_for_request = info
                .received_for_request
                .saturating_add(data.len() as u32);
            info.second_bytes += len;
            if info.state == PeerState::Idle {
                info.state = PeerState::Downloading;
            }

            // The final byte of the requested range closes the RTT sample.
            if info.rtt_active && offset + len >= info.rtt_end_offset {
                if let Some(started) = info.rtt_start {
                    let sample = now.duration_since(started).as_secs_f64();
                    info.rtt = if info.rtt > 0.0 {
                        info.rtt * 0.75 + sample * 0.25
                    } else {
                        sample
                    };
                    info.rate_increase = rate_increase_for(sample);
                }
                info.rtt_active = false;
                info.outstanding = false;
                info.reset_count = 0;
            }
        }
        inner.creator.add_file_data(peer, offset, data);
    }

    /// One scheduling pass: write what became contiguous, age out stalled
    /// requests, then offer at most one request per eligible source.
    pub fn tick(&self, now: Instant) {
        let mut inner = self.inner.lock();
        match inner.status {
            TransferStatus::Paused | TransferStatus::Cancelled | TransferStatus::Complete => {
                return
            }
            _ => {}
        }

        inner.creator.tick();

        if let Some(limit) = inner.write_failure_limit {
            if inner.creator.write_failures() > limit {
                let reason = format!(
                    "{} consecutive disk write failures",
                    inner.creator.write_failures()
                );
                warn!("transfer {} failed: {reason}", self.hash);
                inner.status = TransferStatus::Failed(reason);
                return;
            }
        }

        if inner.creator.finished() {
            info!("transfer {} complete", self.hash);
            inner.status = TransferStatus::Complete;
            return;
        }

        // Split the guard so peers and creator borrow independently.
        let inner = &mut *inner;
        self.account_rates(inner, now);
        self.age_out_stalled(inner, now);

        // In-flight window scales with the aggregate observed rate.
        let aggregate_rate: f64 = inner.peers.values().map(|p| p.actual_rate).sum();
        let window = MIN_WINDOW.max((aggregate_rate * 2.0) as u64);

        let rotation_len = inner.rotation.len();
        for _ in 0..rotation_len {
            let index = inner.next_rotation % rotation_len;
            inner.next_rotation = (inner.next_rotation + 1) % rotation_len;
            let peer = inner.rotation[index];

            if inner.creator.requested_bytes() >= window {
                break;
            }

            let Some(info) = inner.peers.get_mut(&peer) else {
                continue;
            };
            if !matches!(info.state, PeerState::Init | PeerState::Idle | PeerState::Downloading)
            {
                continue;
            }
            if info.outstanding {
                continue;
            }

            let chunk_size = info.next_chunk_size();
            let Some((offset, len)) =
                inner.creator.allocate_remaining_chunk(peer, chunk_size, now)
            else {
                continue;
            };
            let Some(info) = inner.peers.get_mut(&peer) else {
                continue;
            };
            info.outstanding = true;
            info.request_offset = offset;
            info.request_size = len;
            info.received_for_request = 0;
            info.last_request_at = Some(now);
            info.rtt_active = true;
            info.rtt_start = Some(now);
            info.rtt_end_offset = offset + len as u64;
            info.fast_start = false;
            info.state = PeerState::Downloading;
            inner.status = TransferStatus::Downloading;

            self.sender
                .send_chunk_request(peer, &self.hash, self.total_size, offset, len);
        }
    }

    fn account_rates(&self, inner: &mut Inner, now: Instant) {
        for info in inner.peers.values_mut() {
            match info.second_marker {
                Some(marker) if now.duration_since(marker) >= Duration::from_secs(1) => {
                    let elapsed = now.duration_since(marker).as_secs_f64();
                    let rate = info.second_bytes as f64 / elapsed;
                    info.actual_rate = info.actual_rate * 0.75 + rate * 0.25;
                    info.second_bytes = 0;
                    info.second_marker = Some(now);
                }
                None => info.second_marker = Some(now),
                _ => {}
            }
        }
    }

    /// A request with no progress for four round trips marks its source
    /// idle (not failed) so rotation can hand the range elsewhere once it
    /// ages. Sources that keep stalling are written off.
    fn age_out_stalled(&self, inner: &mut Inner, now: Instant) {
        let mut invalidate: Vec<DirectoryId> = Vec::new();
        for (peer, info) in inner.peers.iter_mut() {
            if !info.outstanding {
                continue;
            }
            let reference = info
                .last_receive_at
                .or(info.last_request_at)
                .unwrap_or(now);
            if now.duration_since(reference) < info.request_timeout() {
                continue;
            }
            debug!(
                "source {peer} stalled on {} at offset {}",
                self.hash, info.request_offset
            );
            info.outstanding = false;
            info.rtt_active = false;
            info.fast_start = true;
            info.reset_count += 1;
            if info.reset_count > MAX_RESETS {
                info.state = PeerState::NotOnline;
                invalidate.push(*peer);
            } else {
                info.state = PeerState::Idle;
            }
        }
        for peer in invalidate {
            inner.creator.invalidate_chunks_requested_from(peer);
        }
    }

    /// Lock-scoped access to the creator (the demultiplexer serves
    /// uploads from partials through this).
    pub fn with_creator<R>(&self, f: impl FnOnce(&mut FileCreator) -> R) -> R {
        let mut inner = self.inner.lock();
        f(&mut inner.creator)
    }

    /// No source can currently make progress: everyone is written off or
    /// suspended. The transfer is stalled, not failed; a source coming
    /// back online revives it.
    pub fn is_stalled(&self) -> bool {
        let inner = self.inner.lock();
        if matches!(
            inner.status,
            TransferStatus::Complete | TransferStatus::Cancelled
        ) {
            return false;
        }
        !inner.peers.is_empty()
            && inner
                .peers
                .values()
                .all(|p| matches!(p.state, PeerState::NotOnline | PeerState::Suspend))
    }
}

/// Map a completed round trip to the fractional size change of the next
/// request: fast turnarounds double down, slow ones back off.
fn rate_increase_for(rtt_secs: f64) -> f64 {
    if rtt_secs <= RTT_FAST {
        1.0
    } else if rtt_secs >= RTT_STD {
        -0.25
    } else {
        (RTT_STD - rtt_secs) / (RTT_STD - RTT_FAST)
    }
}

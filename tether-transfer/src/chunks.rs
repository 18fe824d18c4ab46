//! In-memory chunk bookkeeping for one in-progress file.
//!
//! Three disjoint regions partition the byte ranges we care about:
//! bytes saved to disk (a contiguous prefix), bytes received but not yet
//! writable (waiting on a gap), and bytes requested from peers. A range
//! lives in at most one region at a time.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use tether_core::DirectoryId;

/// Age at which an outstanding request is handed out again. Must stay
/// well above the scheduler's round-trip estimate, otherwise a transfer
/// that briefly falls behind floods peers with duplicate requests.
pub const CHUNK_MAX_AGE: Duration = Duration::from_secs(20);

/// A byte range we asked a peer for.
#[derive(Debug, Clone)]
pub struct RequestedChunk {
    pub start: u64,
    pub len: u32,
    pub requested_at: Instant,
    pub from_peer: DirectoryId,
}

/// A byte range sitting in memory until its gap closes. The buffer is
/// owned exclusively here until written to disk or invalidated.
#[derive(Debug, Clone)]
pub struct ReceivedChunk {
    pub start: u64,
    pub len: u32,
    pub data: Vec<u8>,
    pub from_peer: DirectoryId,
}

/// Outcome of offering received data to the book.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Accepted,
    /// Same offset already buffered; the new data was dropped.
    Duplicate,
    /// Data we never asked for; dropped.
    Rejected,
}

/// Chunk ledger for one file.
#[derive(Debug)]
pub struct ChunkBook {
    total_size: u64,
    saved_bytes: u64,
    first_unrequested: u64,
    requested: BTreeMap<u64, RequestedChunk>,
    received: BTreeMap<u64, ReceivedChunk>,
}

impl ChunkBook {
    /// A fresh book. `already_saved` is the recovered length of the
    /// partial file on disk.
    pub fn new(total_size: u64, already_saved: u64) -> Self {
        let saved = already_saved.min(total_size);
        Self {
            total_size,
            saved_bytes: saved,
            first_unrequested: saved,
            requested: BTreeMap::new(),
            received: BTreeMap::new(),
        }
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn saved_bytes(&self) -> u64 {
        self.saved_bytes
    }

    pub fn first_unrequested(&self) -> u64 {
        self.first_unrequested
    }

    pub fn fully_saved(&self) -> bool {
        self.saved_bytes == self.total_size
    }

    pub fn requested_chunks(&self) -> impl Iterator<Item = &RequestedChunk> {
        self.requested.values()
    }

    pub fn received_chunks(&self) -> impl Iterator<Item = &ReceivedChunk> {
        self.received.values()
    }

    /// Bytes currently outstanding with peers.
    pub fn requested_bytes(&self) -> u64 {
        self.requested.values().map(|c| c.len as u64).sum()
    }

    /// Allocate work for `peer`: a timed-out request is re-issued before
    /// any new range is carved off the unrequested tail. `None` when the
    /// file is fully saved or nothing remains to request.
    pub fn allocate(&mut self, peer: DirectoryId, max_len: u32, now: Instant) -> Option<(u64, u32)> {
        if self.fully_saved() {
            return None;
        }

        // Aged requests first: the original holder has presumably stalled.
        for chunk in self.requested.values_mut() {
            if chunk.requested_at + CHUNK_MAX_AGE < now {
                chunk.requested_at = now;
                chunk.from_peer = peer;
                return Some((chunk.start, chunk.len));
            }
        }

        let remaining = self.total_size - self.first_unrequested;
        let len = (max_len as u64).min(remaining) as u32;
        if len == 0 {
            return None;
        }
        let start = self.first_unrequested;
        self.first_unrequested += len as u64;
        self.requested.insert(
            start,
            RequestedChunk {
                start,
                len,
                requested_at: now,
                from_peer: peer,
            },
        );
        Some((start, len))
    }

    /// Accept received bytes, moving the covered range out of the
    /// requested set. Data past `first_unrequested` is truncated; data we
    /// never requested is rejected outright.
    pub fn add_received(&mut self, peer: DirectoryId, start: u64, mut data: Vec<u8>) -> AddOutcome {
        if self.requested.is_empty() {
            return AddOutcome::Rejected;
        }
        if start >= self.first_unrequested {
            return AddOutcome::Rejected;
        }
        let end = start + data.len() as u64;
        if end > self.first_unrequested {
            data.truncate((self.first_unrequested - start) as usize);
        }
        if data.is_empty() {
            return AddOutcome::Rejected;
        }
        if self.received.contains_key(&start) {
            return AddOutcome::Duplicate;
        }
        let len = data.len() as u32;
        self.received.insert(
            start,
            ReceivedChunk {
                start,
                len,
                data,
                from_peer: peer,
            },
        );
        self.remove_from_requested(start, len);
        AddOutcome::Accepted
    }

    /// Subtract a received range from the requested set.
    ///
    /// Five cases: the received range fully encloses a request (remove),
    /// sits strictly inside one (split), overlaps its tail (advance the
    /// start), overlaps its head (shrink the length), or misses entirely
    /// (no change). Idempotent over disjoint received ranges.
    pub fn remove_from_requested(&mut self, recv_start: u64, recv_len: u32) {
        let recv_end = recv_start + recv_len as u64;
        // Requests starting at or past the received end cannot overlap.
        let candidates: Vec<u64> = self.requested.range(..recv_end).map(|(k, _)| *k).collect();
        for key in candidates {
            let (cur_start, cur_len, cur_at, cur_peer) = {
                let chunk = &self.requested[&key];
                (chunk.start, chunk.len, chunk.requested_at, chunk.from_peer)
            };
            let cur_end = cur_start + cur_len as u64;
            if recv_start >= cur_end {
                continue;
            }

            if recv_start <= cur_start && recv_end >= cur_end {
                // Fully enclosed by the received range.
                self.requested.remove(&key);
                continue;
            }

            if cur_start < recv_start && cur_end > recv_end {
                // Received range strictly inside: split into head and tail.
                if let Some(chunk) = self.requested.get_mut(&key) {
                    chunk.len = (recv_start - cur_start) as u32;
                }
                self.requested.insert(
                    recv_end,
                    RequestedChunk {
                        start: recv_end,
                        len: (cur_end - recv_end) as u32,
                        requested_at: cur_at,
                        from_peer: cur_peer,
                    },
                );
                return;
            }

            if cur_end > recv_end {
                // Tail of the request survives: move its start forward.
                self.requested.remove(&key);
                self.requested.insert(
                    recv_end,
                    RequestedChunk {
                        start: recv_end,
                        len: (cur_end - recv_end) as u32,
                        requested_at: cur_at,
                        from_peer: cur_peer,
                    },
                );
                return;
            }

            if cur_start < recv_start {
                // Head of the request survives: shrink its length.
                if let Some(chunk) = self.requested.get_mut(&key) {
                    chunk.len = (recv_start - cur_start) as u32;
                }
                continue;
            }
        }
    }

    /// The next received chunk that can be written, i.e. one starting at
    /// or before the saved prefix.
    pub fn next_writable(&self) -> Option<u64> {
        let (&start, _) = self.received.first_key_value()?;
        (start <= self.saved_bytes).then_some(start)
    }

    /// Remove and return a received chunk (for writing or for dropping).
    pub fn take_received(&mut self, start: u64) -> Option<ReceivedChunk> {
        self.received.remove(&start)
    }

    /// Put a chunk back after a failed write so it is retried next tick.
    pub fn restore_received(&mut self, chunk: ReceivedChunk) {
        self.received.insert(chunk.start, chunk);
    }

    /// Advance the saved prefix after a successful write.
    pub fn mark_saved_to(&mut self, new_saved: u64) {
        self.saved_bytes = new_saved.min(self.total_size);
        if self.first_unrequested < self.saved_bytes {
            self.first_unrequested = self.saved_bytes;
        }
    }

    /// Drop every requested and received range attributable to `peer`,
    /// freeing the buffers. Out-of-order data from a vanished peer will
    /// likely never have its gap closed.
    pub fn invalidate_peer(&mut self, peer: DirectoryId) {
        self.requested.retain(|_, chunk| chunk.from_peer != peer);
        self.received.retain(|_, chunk| chunk.from_peer != peer);
    }

    /// Drop everything (cancellation).
    pub fn clear(&mut self) {
        self.requested.clear();
        self.received.clear();
    }

    /// Ranges covered by outstanding requests from `peer`.
    pub fn has_request_from(&self, peer: DirectoryId) -> bool {
        self.requested.values().any(|c| c.from_peer == peer)
    }

    /// Test-facing invariant check: the three regions are pairwise
    /// disjoint and within bounds.
    pub fn invariants_hold(&self) -> bool {
        if self.first_unrequested > self.total_size || self.saved_bytes > self.total_size {
            return false;
        }
        let mut spans: Vec<(u64, u64)> = Vec::new();
        spans.push((0, self.saved_bytes));
        for chunk in self.requested.values() {
            if chunk.start >= self.first_unrequested {
                return false;
            }
            spans.push((chunk.start, chunk.start + chunk.len as u64));
        }
        for chunk in self.received.values() {
            spans.push((chunk.start, chunk.start + chunk.len as u64));
        }
        spans.sort();
        for window in spans.windows(2) {
            if window[0].1 > window[1].0 {
                return false;
            }
        }
        let accounted: u64 = self.saved_bytes
            + self.requested_bytes()
            + self.received.values().map(|c| c.len as u64).sum::<u64>();
        accounted <= self.total_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PEER: DirectoryId = DirectoryId(1);
    const OTHER: DirectoryId = DirectoryId(2);

    #[test]
    fn allocation_walks_the_file() {
        let mut book = ChunkBook::new(100_000, 0);
        let now = Instant::now();
        for i in 0..10u64 {
            let (start, len) = book.allocate(PEER, 8192, now).unwrap();
            assert_eq!(start, i * 8192);
            assert_eq!(len, 8192);
        }
        assert_eq!(book.first_unrequested(), 81_920);
        assert!(book.invariants_hold());
    }

    #[test]
    fn aged_request_is_reissued_before_new_range() {
        let mut book = ChunkBook::new(100_000, 0);
        let now = Instant::now();
        for _ in 0..10 {
            book.allocate(PEER, 8192, now).unwrap();
        }
        // 21 seconds later the oldest entry is handed out again instead
        // of carving new territory.
        let later = now + Duration::from_secs(21);
        let (start, len) = book.allocate(OTHER, 8192, later).unwrap();
        assert_eq!((start, len), (0, 8192));
        assert_eq!(book.first_unrequested(), 81_920, "no new range was carved");
        // The re-issued chunk now belongs to the new requester.
        assert!(book.has_request_from(OTHER));
        assert!(book.invariants_hold());
    }

    #[test]
    fn fresh_requests_do_not_age_out() {
        let mut book = ChunkBook::new(100_000, 0);
        let now = Instant::now();
        book.allocate(PEER, 8192, now).unwrap();
        let (start, _) = book
            .allocate(PEER, 8192, now + Duration::from_secs(5))
            .unwrap();
        assert_eq!(start, 8192, "young request must not be re-issued");
    }

    #[test]
    fn last_chunk_is_clipped_to_remaining() {
        let mut book = ChunkBook::new(10_000, 0);
        let now = Instant::now();
        book.allocate(PEER, 8192, now).unwrap();
        let (start, len) = book.allocate(PEER, 8192, now).unwrap();
        assert_eq!(start, 8192);
        assert_eq!(len, 1808);
        assert!(book.allocate(PEER, 8192, now).is_none());
    }

    #[test]
    fn split_on_partial_receive() {
        let mut book = ChunkBook::new(10_000, 0);
        let now = Instant::now();
        // Force a single request at 1000..2000.
        book.allocate(PEER, 1000, now).unwrap(); // 0..1000, cleanup below
        book.allocate(PEER, 1000, now).unwrap(); // 1000..2000
        book.remove_from_requested(0, 1000); // drop the helper request

        book.add_received(PEER, 1200, vec![0u8; 400]);
        let requested: Vec<(u64, u32)> = book
            .requested_chunks()
            .map(|c| (c.start, c.len))
            .collect();
        assert_eq!(requested, vec![(1000, 200), (1600, 400)]);
        let received: Vec<(u64, u32)> = book
            .received_chunks()
            .map(|c| (c.start, c.len))
            .collect();
        assert_eq!(received, vec![(1200, 400)]);
        assert!(book.invariants_hold());
    }

    #[test]
    fn five_removal_cases() {
        let now = Instant::now();

        // Received fully encloses the request: it is removed.
        let mut book = ChunkBook::new(10_000, 0);
        book.allocate(PEER, 100, now).unwrap(); // 0..100
        book.remove_from_requested(0, 100);
        assert_eq!(book.requested_chunks().count(), 0);

        // Strict containment (split into head and tail) is exercised by
        // `split_on_partial_receive` above.

        // Received consumes the tail: the surviving head shrinks.
        let mut book = ChunkBook::new(10_000, 0);
        book.allocate(PEER, 100, now).unwrap(); // 0..100
        book.remove_from_requested(50, 100);
        let requested: Vec<(u64, u32)> =
            book.requested_chunks().map(|c| (c.start, c.len)).collect();
        assert_eq!(requested, vec![(0, 50)]);

        // Received consumes the head: the surviving tail's start moves
        // forward.
        let mut book = ChunkBook::new(10_000, 0);
        book.allocate(PEER, 100, now).unwrap(); // 0..100
        book.allocate(PEER, 100, now).unwrap(); // 100..200
        book.remove_from_requested(0, 150);
        let requested: Vec<(u64, u32)> =
            book.requested_chunks().map(|c| (c.start, c.len)).collect();
        assert_eq!(requested, vec![(150, 50)]);

        // Disjoint ranges leave the request untouched.
        let mut book = ChunkBook::new(10_000, 0);
        book.allocate(PEER, 100, now).unwrap(); // 0..100
        book.remove_from_requested(500, 100);
        let requested: Vec<(u64, u32)> =
            book.requested_chunks().map(|c| (c.start, c.len)).collect();
        assert_eq!(requested, vec![(0, 100)]);
    }

    #[test]
    fn rejects_data_never_requested() {
        let mut book = ChunkBook::new(10_000, 0);
        assert_eq!(
            book.add_received(PEER, 0, vec![0u8; 10]),
            AddOutcome::Rejected,
            "no outstanding requests at all"
        );
        let now = Instant::now();
        book.allocate(PEER, 100, now).unwrap();
        assert_eq!(
            book.add_received(PEER, 5000, vec![0u8; 10]),
            AddOutcome::Rejected,
            "past the requested frontier"
        );
    }

    #[test]
    fn overrun_is_truncated() {
        let mut book = ChunkBook::new(10_000, 0);
        let now = Instant::now();
        book.allocate(PEER, 100, now).unwrap(); // frontier at 100
        assert_eq!(
            book.add_received(PEER, 50, vec![0u8; 100]),
            AddOutcome::Accepted
        );
        let received: Vec<(u64, u32)> = book
            .received_chunks()
            .map(|c| (c.start, c.len))
            .collect();
        assert_eq!(received, vec![(50, 50)], "clipped at the frontier");
    }

    #[test]
    fn duplicate_offset_is_dropped() {
        let mut book = ChunkBook::new(10_000, 0);
        let now = Instant::now();
        book.allocate(PEER, 200, now).unwrap();
        assert_eq!(book.add_received(PEER, 0, vec![1u8; 50]), AddOutcome::Accepted);
        assert_eq!(book.add_received(PEER, 0, vec![2u8; 50]), AddOutcome::Duplicate);
        let chunk = book.received_chunks().next().unwrap();
        assert_eq!(chunk.data[0], 1, "first arrival wins");
    }

    #[test]
    fn invalidate_drops_both_maps_for_peer() {
        let mut book = ChunkBook::new(10_000, 0);
        let now = Instant::now();
        book.allocate(PEER, 100, now).unwrap(); // 0..100
        book.allocate(OTHER, 100, now).unwrap(); // 100..200
        book.add_received(PEER, 0, vec![0u8; 50]);
        book.invalidate_peer(PEER);
        assert!(!book.has_request_from(PEER));
        assert!(book.has_request_from(OTHER));
        assert_eq!(book.received_chunks().count(), 0);
        assert!(book.invariants_hold());
    }

    #[test]
    fn removal_is_idempotent_over_disjoint_ranges() {
        let mut book = ChunkBook::new(10_000, 0);
        let now = Instant::now();
        book.allocate(PEER, 1000, now).unwrap();
        book.remove_from_requested(200, 100);
        let snapshot: Vec<(u64, u32)> =
            book.requested_chunks().map(|c| (c.start, c.len)).collect();
        book.remove_from_requested(200, 100);
        let again: Vec<(u64, u32)> =
            book.requested_chunks().map(|c| (c.start, c.len)).collect();
        assert_eq!(snapshot, again);
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Applying the same disjoint removal twice equals applying once,
        /// and invariants survive arbitrary interleavings.
        #[test]
        fn removal_idempotent(
            ops in proptest::collection::vec((0u64..9000, 1u32..500), 1..20)
        ) {
            let mut book = ChunkBook::new(10_000, 0);
            let now = Instant::now();
            while book.allocate(DirectoryId(1), 700, now).is_some() {}
            for (start, len) in ops {
                book.remove_from_requested(start, len);
                let snapshot: Vec<(u64, u32)> =
                    book.requested_chunks().map(|c| (c.start, c.len)).collect();
                book.remove_from_requested(start, len);
                let again: Vec<(u64, u32)> =
                    book.requested_chunks().map(|c| (c.start, c.len)).collect();
                prop_assert_eq!(snapshot, again);
            }
        }
    }
}

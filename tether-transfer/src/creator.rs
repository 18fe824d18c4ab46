//! Append-with-holes writer owning one partial file on disk.
//!
//! Received chunks buffer in memory until the contiguous prefix reaches
//! them; the tick walks the buffer in offset order and writes every run
//! that became contiguous, stopping at the first gap or write failure.
//! On restart the saved prefix is recovered from the partial's length;
//! buffered chunks are accepted as lost.

use std::{
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    time::Instant,
};

use tracing::{debug, warn};

use tether_core::{DirectoryId, Error, FileHash, Result};

use crate::chunks::{AddOutcome, ChunkBook};

/// Writer for one in-progress file.
pub struct FileCreator {
    path: PathBuf,
    hash: FileHash,
    book: ChunkBook,
    file: Option<File>,
    /// Consecutive failed writes; the owner surfaces the transfer as
    /// failed once its configured limit is exceeded.
    write_failures: u32,
}

impl FileCreator {
    /// Open (or adopt) the partial at `path`. The amount already on disk
    /// counts as saved; nothing beyond it has been requested yet.
    pub fn new(path: impl Into<PathBuf>, total_size: u64, hash: FileHash) -> Result<Self> {
        let path = path.into();
        let already_saved = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);

        // A zero-byte file will never see add_file_data: create the
        // target and be done at construction.
        if total_size == 0 {
            File::create(&path)?;
        }

        Ok(Self {
            path,
            hash,
            book: ChunkBook::new(total_size, already_saved),
            file: None,
            write_failures: 0,
        })
    }

    pub fn hash(&self) -> &FileHash {
        &self.hash
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn total_size(&self) -> u64 {
        self.book.total_size()
    }

    pub fn amount_saved(&self) -> u64 {
        self.book.saved_bytes()
    }

    pub fn finished(&self) -> bool {
        self.book.fully_saved()
    }

    pub fn write_failures(&self) -> u32 {
        self.write_failures
    }

    /// Bytes outstanding with peers (for the in-flight window).
    pub fn requested_bytes(&self) -> u64 {
        self.book.requested_bytes()
    }

    /// Hand out the next range for `peer`: a timed-out request if one
    /// exists, else fresh territory. `None` when nothing needs requesting.
    pub fn allocate_remaining_chunk(
        &mut self,
        peer: DirectoryId,
        max_len: u32,
        now: Instant,
    ) -> Option<(u64, u32)> {
        self.book.allocate(peer, max_len, now)
    }

    /// Accept a chunk of data from `peer`. The buffer is owned by the
    /// creator from here until written or invalidated.
    pub fn add_file_data(&mut self, peer: DirectoryId, offset: u64, data: Vec<u8>) -> AddOutcome {
        if self.file.is_none() && self.open_file().is_err() {
            return AddOutcome::Rejected;
        }
        let outcome = self.book.add_received(peer, offset, data);
        match outcome {
            AddOutcome::Rejected => debug!(
                "dropping unrequested data at {offset} for {}",
                self.hash
            ),
            AddOutcome::Duplicate => debug!(
                "dropping duplicate data at {offset} for {}",
                self.hash
            ),
            AddOutcome::Accepted => {}
        }
        outcome
    }

    fn open_file(&mut self) -> Result<()> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&self.path)
            .map_err(|e| {
                warn!("cannot open partial {}: {e}", self.path.display());
                Error::Storage(format!("open {}: {e}", self.path.display()))
            })?;
        self.file = Some(file);
        Ok(())
    }

    /// Write every received chunk that became contiguous with the saved
    /// prefix, in offset order, stopping at the first gap or failure.
    /// Failed chunks stay buffered for the next tick.
    pub fn tick(&mut self) {
        while let Some(start) = self.book.next_writable() {
            let Some(chunk) = self.book.take_received(start) else {
                break;
            };
            match self.write_chunk(start, &chunk.data) {
                Ok(()) => {
                    self.write_failures = 0;
                    let end = start + chunk.len as u64;
                    if end > self.book.saved_bytes() {
                        self.book.mark_saved_to(end);
                    }
                    if self.book.fully_saved() {
                        self.finalize();
                    }
                }
                Err(e) => {
                    // Disk full or similar: keep the data and retry later.
                    warn!("write to {} failed: {e}", self.path.display());
                    self.write_failures = self.write_failures.saturating_add(1);
                    self.book.restore_received(chunk);
                    break;
                }
            }
        }
    }

    fn write_chunk(&mut self, start: u64, data: &[u8]) -> Result<()> {
        let saved = self.book.saved_bytes();
        let end = start + data.len() as u64;
        if end <= saved {
            // Pure retransmission of already-written bytes.
            return Ok(());
        }
        // Clip the front if part of the chunk is already on disk.
        let write_from = start.max(saved);
        let skip = (write_from - start) as usize;

        if self.file.is_none() {
            self.open_file()?;
        }
        let Some(file) = self.file.as_mut() else {
            return Err(Error::Storage("partial not open".into()));
        };
        file.seek(SeekFrom::Start(write_from))
            .map_err(|e| Error::Storage(format!("seek: {e}")))?;
        file.write_all(&data[skip..])
            .map_err(|e| Error::Storage(format!("write: {e}")))?;
        Ok(())
    }

    /// Flush and close once the last byte lands; a buffered tail would be
    /// truncated by the completion move otherwise.
    fn finalize(&mut self) {
        if let Some(file) = self.file.as_mut() {
            if let Err(e) = file.flush().and_then(|_| file.sync_all()) {
                warn!("final flush of {} failed: {e}", self.path.display());
                return;
            }
        }
        self.file = None;
    }

    /// Serve a range of the saved prefix (uploading from a partial).
    pub fn read_saved_range(&mut self, offset: u64, max_len: u32) -> Result<Vec<u8>> {
        let saved = self.book.saved_bytes();
        if offset >= saved {
            return Err(Error::protocol(format!(
                "range at {offset} not yet saved (have {saved})"
            )));
        }
        let len = (max_len as u64).min(saved - offset) as usize;
        if self.file.is_none() {
            self.open_file()?;
        }
        let Some(file) = self.file.as_mut() else {
            return Err(Error::Storage("partial not open".into()));
        };
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| Error::Storage(format!("seek: {e}")))?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf)
            .map_err(|e| Error::Storage(format!("read: {e}")))?;
        Ok(buf)
    }

    /// Drop all chunk state attributable to `peer` and free the buffers.
    pub fn invalidate_chunks_requested_from(&mut self, peer: DirectoryId) {
        self.book.invalidate_peer(peer);
    }

    /// Whether `peer` has an outstanding request against this file.
    pub fn has_request_from(&self, peer: DirectoryId) -> bool {
        self.book.has_request_from(peer)
    }

    pub fn close_file(&mut self) {
        self.file = None;
    }

    /// Move the finished (or abandoned) file into `directory`, keeping
    /// its file name. Falls back to copy+remove across filesystems.
    pub fn move_to_directory(&mut self, directory: &Path) -> Result<PathBuf> {
        self.close_file();
        let file_name = self
            .path
            .file_name()
            .ok_or_else(|| Error::Storage(format!("bad partial path {}", self.path.display())))?;
        let destination = directory.join(file_name);
        match std::fs::rename(&self.path, &destination) {
            Ok(()) => {}
            Err(_) => {
                std::fs::copy(&self.path, &destination)
                    .map_err(|e| Error::Storage(format!("copy: {e}")))?;
                std::fs::remove_file(&self.path)
                    .map_err(|e| Error::Storage(format!("remove: {e}")))?;
            }
        }
        self.path = destination.clone();
        Ok(destination)
    }

    /// Remove the partial from disk (cancellation). Buffers are freed.
    pub fn delete_from_disk(&mut self) -> Result<()> {
        self.close_file();
        self.book.clear();
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Storage(format!("delete: {e}"))),
        }
    }
}

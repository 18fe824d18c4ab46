//! Read-only view over a complete local file being uploaded.

use std::{
    fs::File,
    io::{Read, Seek, SeekFrom},
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use tether_core::{DirectoryId, Error, FileHash, Result};

/// Window over which the upload rate estimate is computed.
const RATE_WINDOW: Duration = Duration::from_secs(3);

/// Serves ranged reads of one file, with bookkeeping for the inspection
/// API (who asked last, when, how fast we are feeding them).
pub struct FileProvider {
    path: PathBuf,
    hash: FileHash,
    file_size: u64,
    file: Option<File>,
    last_requestor: Option<DirectoryId>,
    last_request_at: Option<Instant>,
    window_start: Option<Instant>,
    window_bytes: u64,
    rate_bps: f64,
}

impl FileProvider {
    pub fn new(path: impl Into<PathBuf>, file_size: u64, hash: FileHash) -> Self {
        Self {
            path: path.into(),
            hash,
            file_size,
            file: None,
            last_requestor: None,
            last_request_at: None,
            window_start: None,
            window_bytes: 0,
            rate_bps: 0.0,
        }
    }

    pub fn hash(&self) -> &FileHash {
        &self.hash
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn last_requestor(&self) -> Option<DirectoryId> {
        self.last_requestor
    }

    pub fn last_request_at(&self) -> Option<Instant> {
        self.last_request_at
    }

    /// Bytes per second over the most recent window.
    pub fn transfer_rate(&self) -> f64 {
        self.rate_bps
    }

    /// Read `[offset, offset + max_len)` clipped to the file size.
    pub fn get_file_data(
        &mut self,
        requestor: DirectoryId,
        offset: u64,
        max_len: u32,
        now: Instant,
    ) -> Result<Vec<u8>> {
        if offset >= self.file_size {
            return Err(Error::protocol(format!(
                "offset {offset} beyond file of {} bytes",
                self.file_size
            )));
        }
        let len = (max_len as u64).min(self.file_size - offset) as usize;

        if self.file.is_none() {
            let file = File::open(&self.path)
                .map_err(|e| Error::Storage(format!("open {}: {e}", self.path.display())))?;
            self.file = Some(file);
        }
        let Some(file) = self.file.as_mut() else {
            return Err(Error::Storage("provider file not open".into()));
        };
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| Error::Storage(format!("seek: {e}")))?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf)
            .map_err(|e| Error::Storage(format!("read: {e}")))?;

        self.last_requestor = Some(requestor);
        self.last_request_at = Some(now);
        self.account(len as u64, now);
        Ok(buf)
    }

    fn account(&mut self, bytes: u64, now: Instant) {
        match self.window_start {
            Some(start) if now.duration_since(start) < RATE_WINDOW => {
                self.window_bytes += bytes;
            }
            Some(start) => {
                let elapsed = now.duration_since(start).as_secs_f64();
                self.rate_bps = self.window_bytes as f64 / elapsed.max(f64::EPSILON);
                self.window_start = Some(now);
                self.window_bytes = bytes;
            }
            None => {
                self.window_start = Some(now);
                self.window_bytes = bytes;
            }
        }
    }
}

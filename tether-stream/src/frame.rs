//! Length-prefixed framing over an encrypted stream.
//!
//! Every frame starts with an 8-byte header: 2-byte magic, 1-byte
//! version, 1-byte flags, 4-byte total payload length, followed by the
//! payload. The payload of flagged frames is AEAD ciphertext.

use thiserror::Error;

use crate::link::PeerLink;

/// Magic leading every frame.
pub const FRAME_MAGIC: u16 = 0x7E44;
/// Current framing version.
pub const FRAME_VERSION: u8 = 1;
/// Flag: payload is AEAD ciphertext.
pub const FLAG_ENCRYPTED: u8 = 0x01;

/// Header size on the wire.
pub const HEADER_LEN: usize = 8;

/// Upper bound on a single frame's payload; anything larger is a
/// protocol violation and the connection is torn down.
pub const MAX_FRAME_PAYLOAD: usize = 1 << 20;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("bad frame magic {0:#06x}")]
    BadMagic(u16),
    #[error("unsupported frame version {0}")]
    BadVersion(u8),
    #[error("frame of {0} bytes exceeds the payload bound")]
    Oversized(usize),
    #[error("stream closed mid-frame")]
    Truncated,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Encode one frame.
pub fn encode_frame(flags: u8, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&FRAME_MAGIC.to_be_bytes());
    buf.push(FRAME_VERSION);
    buf.push(flags);
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Parse a header. The slice must be exactly [`HEADER_LEN`] bytes.
pub fn decode_header(header: &[u8; HEADER_LEN]) -> Result<(u8, usize), FrameError> {
    let magic = u16::from_be_bytes([header[0], header[1]]);
    if magic != FRAME_MAGIC {
        return Err(FrameError::BadMagic(magic));
    }
    if header[2] != FRAME_VERSION {
        return Err(FrameError::BadVersion(header[2]));
    }
    let flags = header[3];
    let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
    if len > MAX_FRAME_PAYLOAD {
        return Err(FrameError::Oversized(len));
    }
    Ok((flags, len))
}

/// Incremental frame reader over a [`PeerLink`].
///
/// Links deliver arbitrary chunks; this accumulates until whole frames
/// are available.
pub struct FrameReader {
    buffer: Vec<u8>,
}

impl FrameReader {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Read the next complete frame, returning its flags and payload.
    /// An EOF at a frame boundary yields `Ok(None)`.
    pub async fn next_frame(
        &mut self,
        link: &dyn PeerLink,
    ) -> Result<Option<(u8, Vec<u8>)>, FrameError> {
        let mut chunk = vec![0u8; 16 * 1024];
        loop {
            if let Some(frame) = self.try_extract()? {
                return Ok(Some(frame));
            }
            let n = link.recv(&mut chunk).await?;
            if n == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(FrameError::Truncated);
            }
            self.buffer.extend_from_slice(&chunk[..n]);
        }
    }

    fn try_extract(&mut self) -> Result<Option<(u8, Vec<u8>)>, FrameError> {
        if self.buffer.len() < HEADER_LEN {
            return Ok(None);
        }
        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&self.buffer[..HEADER_LEN]);
        let (flags, len) = decode_header(&header)?;
        if self.buffer.len() < HEADER_LEN + len {
            return Ok(None);
        }
        let payload = self.buffer[HEADER_LEN..HEADER_LEN + len].to_vec();
        self.buffer.drain(..HEADER_LEN + len);
        Ok(Some((flags, payload)))
    }
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}

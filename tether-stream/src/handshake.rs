//! Mutual-authentication handshake and the resulting encrypted channel.
//!
//! Three messages establish the session: ephemeral keys are exchanged,
//! then each side reveals its long-lived static key inside the ephemeral
//! encryption and proves possession of it by keying a transcript tag with
//! a static-ephemeral agreement. The accepted static key MUST hash to the
//! expected peer identifier; a mismatch rejects the connection before any
//! payload flows.
//!
//! Directional ChaCha20-Poly1305 keys are derived from the three
//! agreements (ee, es, se) via HKDF-SHA256; nonces are per-direction
//! counters, so a key never sees a nonce twice.

use std::sync::Arc;

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use hkdf::Hkdf;
use parking_lot::Mutex;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use tether_core::PeerId;

use crate::frame::{encode_frame, FrameError, FrameReader, FLAG_ENCRYPTED};
use crate::link::{LinkKind, PeerLink};

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("peer presented identity {presented}, expected {expected}")]
    PeerAuth { expected: PeerId, presented: PeerId },
    #[error("handshake message malformed")]
    Malformed,
    #[error("cryptographic verification failed")]
    Crypto,
    #[error("link closed during handshake")]
    Closed,
    #[error(transparent)]
    Frame(#[from] FrameError),
}

impl From<HandshakeError> for tether_core::Error {
    fn from(e: HandshakeError) -> Self {
        match e {
            HandshakeError::PeerAuth { expected, presented } => tether_core::Error::PeerAuth {
                expected: expected.to_hex(),
                presented: presented.to_hex(),
            },
            other => tether_core::Error::protocol(other.to_string()),
        }
    }
}

type HsResult<T> = Result<T, HandshakeError>;

/// Our long-lived identity: the static keypair and the peer id it hashes
/// to. The directory service distributes the public half to friends.
#[derive(Clone)]
pub struct Identity {
    secret: StaticSecret,
    public: PublicKey,
    peer_id: PeerId,
}

impl Identity {
    /// Generate a fresh identity.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        Self::from_secret(secret)
    }

    /// Rebuild an identity from stored secret bytes.
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        Self::from_secret(StaticSecret::from(bytes))
    }

    fn from_secret(secret: StaticSecret) -> Self {
        let public = PublicKey::from(&secret);
        let peer_id = PeerId::from_public_key(public.as_bytes());
        Self {
            secret,
            public,
            peer_id,
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// Secret bytes for persistence. Handle with care.
    pub fn secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.secret.to_bytes())
    }
}

fn hkdf_key(ikm: &[u8], info: &[u8]) -> Key {
    let hk = Hkdf::<Sha256>::new(Some(b"tether-handshake-v1"), ikm);
    let mut okm = [0u8; 32];
    // 32-byte output from SHA-256 HKDF cannot fail.
    if hk.expand(info, &mut okm).is_err() {
        debug!("hkdf expand failed for info {info:?}");
    }
    *Key::from_slice(&okm)
}

fn seal(key: &Key, plaintext: &[u8]) -> Vec<u8> {
    let cipher = ChaCha20Poly1305::new(key);
    cipher
        .encrypt(Nonce::from_slice(&[0u8; 12]), plaintext)
        .unwrap_or_default()
}

fn open(key: &Key, ciphertext: &[u8]) -> HsResult<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(key);
    cipher
        .decrypt(Nonce::from_slice(&[0u8; 12]), ciphertext)
        .map_err(|_| HandshakeError::Crypto)
}

fn transcript(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

async fn send_msg(link: &dyn PeerLink, payload: &[u8]) -> HsResult<()> {
    link.send(&encode_frame(0, payload))
        .await
        .map_err(FrameError::from)?;
    Ok(())
}

async fn recv_msg(reader: &mut FrameReader, link: &dyn PeerLink) -> HsResult<Vec<u8>> {
    match reader.next_frame(link).await? {
        Some((_flags, payload)) => Ok(payload),
        None => Err(HandshakeError::Closed),
    }
}

fn pubkey_from(bytes: &[u8]) -> HsResult<PublicKey> {
    let array: [u8; 32] = bytes.try_into().map_err(|_| HandshakeError::Malformed)?;
    Ok(PublicKey::from(array))
}

/// 32-byte key || 48-byte sealed static key || 48-byte sealed transcript.
const PEER_MSG_LEN: usize = 32 + 48 + 48;

/// Run the initiator side. `expected` pins the identity the responder
/// must present.
pub async fn initiate(
    link: Arc<dyn PeerLink>,
    identity: &Identity,
    expected: PeerId,
) -> HsResult<SecureChannel> {
    let eph_secret = StaticSecret::random_from_rng(OsRng);
    let eph_public = PublicKey::from(&eph_secret);
    send_msg(link.as_ref(), eph_public.as_bytes()).await?;

    let mut reader = FrameReader::new();
    let msg2 = recv_msg(&mut reader, link.as_ref()).await?;
    if msg2.len() != PEER_MSG_LEN {
        return Err(HandshakeError::Malformed);
    }
    let their_eph = pubkey_from(&msg2[..32])?;
    let ee = eph_secret.diffie_hellman(&their_eph);

    // Recover the responder's static key from the ephemeral encryption.
    let k_e = hkdf_key(ee.as_bytes(), b"msg2-static");
    let their_static_bytes = open(&k_e, &msg2[32..80])?;
    let their_static = pubkey_from(&their_static_bytes)?;
    let presented = PeerId::from_public_key(their_static.as_bytes());
    if presented != expected {
        return Err(HandshakeError::PeerAuth { expected, presented });
    }

    // Possession proof: the tag key mixes es = dh(e_init, s_resp).
    let es = eph_secret.diffie_hellman(&their_static);
    let tag_ikm = [ee.as_bytes().as_slice(), es.as_bytes().as_slice()].concat();
    let k_resp_proof = hkdf_key(&tag_ikm, b"msg2-proof");
    let expected_transcript = transcript(&[
        eph_public.as_bytes(),
        their_eph.as_bytes(),
        their_static.as_bytes(),
    ]);
    let proven = open(&k_resp_proof, &msg2[80..])?;
    if proven != expected_transcript {
        return Err(HandshakeError::Crypto);
    }

    // Reveal our static key and prove we own it via se = dh(s_init, e_resp).
    // A distinct key per message keeps every (key, nonce) pair unique.
    let k_e3 = hkdf_key(ee.as_bytes(), b"msg3-static");
    let sealed_static = seal(&k_e3, identity.public.as_bytes());
    let se = identity.secret.diffie_hellman(&their_eph);
    let proof_ikm = [ee.as_bytes().as_slice(), se.as_bytes().as_slice()].concat();
    let k_init_proof = hkdf_key(&proof_ikm, b"msg3-proof");
    let msg3_transcript = transcript(&[
        eph_public.as_bytes(),
        their_eph.as_bytes(),
        their_static.as_bytes(),
        identity.public.as_bytes(),
    ]);
    let sealed_transcript = seal(&k_init_proof, &msg3_transcript);
    let msg3 = [sealed_static, sealed_transcript].concat();
    send_msg(link.as_ref(), &msg3).await?;

    let session_ikm = [
        ee.as_bytes().as_slice(),
        es.as_bytes().as_slice(),
        se.as_bytes().as_slice(),
    ]
    .concat();
    Ok(SecureChannel::new(
        link,
        presented,
        hkdf_key(&session_ikm, b"init-to-resp"),
        hkdf_key(&session_ikm, b"resp-to-init"),
        reader,
    ))
}

/// Run the responder side. When `expected` is set (outbound-over-UDP with
/// a known target) the initiator's identity is pinned; otherwise the
/// caller checks the returned peer id against the roster.
pub async fn respond(
    link: Arc<dyn PeerLink>,
    identity: &Identity,
    expected: Option<PeerId>,
) -> HsResult<SecureChannel> {
    let mut reader = FrameReader::new();
    let msg1 = recv_msg(&mut reader, link.as_ref()).await?;
    if msg1.len() != 32 {
        return Err(HandshakeError::Malformed);
    }
    let their_eph = pubkey_from(&msg1)?;

    let eph_secret = StaticSecret::random_from_rng(OsRng);
    let eph_public = PublicKey::from(&eph_secret);
    let ee = eph_secret.diffie_hellman(&their_eph);

    let k_e = hkdf_key(ee.as_bytes(), b"msg2-static");
    let sealed_static = seal(&k_e, identity.public.as_bytes());
    let es = identity.secret.diffie_hellman(&their_eph);
    let tag_ikm = [ee.as_bytes().as_slice(), es.as_bytes().as_slice()].concat();
    let k_resp_proof = hkdf_key(&tag_ikm, b"msg2-proof");
    let msg2_transcript = transcript(&[
        their_eph.as_bytes(),
        eph_public.as_bytes(),
        identity.public.as_bytes(),
    ]);
    let sealed_transcript = seal(&k_resp_proof, &msg2_transcript);
    let msg2 = [
        eph_public.as_bytes().to_vec(),
        sealed_static,
        sealed_transcript,
    ]
    .concat();
    send_msg(link.as_ref(), &msg2).await?;

    let msg3 = recv_msg(&mut reader, link.as_ref()).await?;
    if msg3.len() != 96 {
        return Err(HandshakeError::Malformed);
    }
    let k_e3 = hkdf_key(ee.as_bytes(), b"msg3-static");
    let their_static_bytes = open(&k_e3, &msg3[..48])?;
    let their_static = pubkey_from(&their_static_bytes)?;
    let presented = PeerId::from_public_key(their_static.as_bytes());
    if let Some(expected) = expected {
        if presented != expected {
            return Err(HandshakeError::PeerAuth { expected, presented });
        }
    }

    let se = eph_secret.diffie_hellman(&their_static);
    let proof_ikm = [ee.as_bytes().as_slice(), se.as_bytes().as_slice()].concat();
    let k_init_proof = hkdf_key(&proof_ikm, b"msg3-proof");
    let expected_transcript = transcript(&[
        their_eph.as_bytes(),
        eph_public.as_bytes(),
        identity.public.as_bytes(),
        their_static.as_bytes(),
    ]);
    let proven = open(&k_init_proof, &msg3[48..])?;
    if proven != expected_transcript {
        return Err(HandshakeError::Crypto);
    }

    let session_ikm = [
        ee.as_bytes().as_slice(),
        es.as_bytes().as_slice(),
        se.as_bytes().as_slice(),
    ]
    .concat();
    Ok(SecureChannel::new(
        link,
        presented,
        hkdf_key(&session_ikm, b"resp-to-init"),
        hkdf_key(&session_ikm, b"init-to-resp"),
        reader,
    ))
}

struct CipherState {
    cipher: ChaCha20Poly1305,
    counter: u64,
}

impl CipherState {
    fn new(key: Key) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(&key),
            counter: 0,
        }
    }

    fn next_nonce(&mut self) -> Nonce {
        let mut bytes = [0u8; 12];
        bytes[4..].copy_from_slice(&self.counter.to_be_bytes());
        self.counter += 1;
        *Nonce::from_slice(&bytes)
    }
}

/// An authenticated, encrypted frame channel to one verified peer.
pub struct SecureChannel {
    link: Arc<dyn PeerLink>,
    peer_id: PeerId,
    tx: Mutex<CipherState>,
    rx: Mutex<CipherState>,
    reader: tokio::sync::Mutex<FrameReader>,
}

impl std::fmt::Debug for SecureChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureChannel")
            .field("peer_id", &self.peer_id)
            .finish_non_exhaustive()
    }
}

impl SecureChannel {
    fn new(
        link: Arc<dyn PeerLink>,
        peer_id: PeerId,
        tx_key: Key,
        rx_key: Key,
        reader: FrameReader,
    ) -> Self {
        Self {
            link,
            peer_id,
            tx: Mutex::new(CipherState::new(tx_key)),
            rx: Mutex::new(CipherState::new(rx_key)),
            reader: tokio::sync::Mutex::new(reader),
        }
    }

    /// The verified identity at the far end.
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn kind(&self) -> LinkKind {
        self.link.kind()
    }

    pub fn close(&self) {
        self.link.close();
    }

    /// Encrypt and send one frame.
    pub async fn send_frame(&self, plaintext: &[u8]) -> HsResult<()> {
        let ciphertext = {
            let mut tx = self.tx.lock();
            let nonce = tx.next_nonce();
            tx.cipher
                .encrypt(&nonce, plaintext)
                .map_err(|_| HandshakeError::Crypto)?
        };
        self.link
            .send(&encode_frame(FLAG_ENCRYPTED, &ciphertext))
            .await
            .map_err(FrameError::from)?;
        Ok(())
    }

    /// Receive and decrypt the next frame. `None` at clean EOF.
    pub async fn recv_frame(&self) -> HsResult<Option<Vec<u8>>> {
        let mut reader = self.reader.lock().await;
        let Some((_flags, ciphertext)) = reader.next_frame(self.link.as_ref()).await? else {
            return Ok(None);
        };
        drop(reader);
        let plaintext = {
            let mut rx = self.rx.lock();
            let nonce = rx.next_nonce();
            rx.cipher
                .decrypt(&nonce, ciphertext.as_slice())
                .map_err(|_| HandshakeError::Crypto)?
        };
        Ok(Some(plaintext))
    }
}

#![cfg_attr(test, allow(clippy::unwrap_used))]

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::{fmt, net::SocketAddr, str::FromStr};

/// Stable 20-byte peer identifier, the SHA-1 of the peer's long-lived
/// public key. Ordering is lexicographic over the raw bytes; connection
/// role tie-breaking relies on that.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(pub [u8; 20]);

impl PeerId {
    /// Derive the identifier from a long-lived public key.
    pub fn from_public_key(key: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(key);
        let digest = hasher.finalize();
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.to_hex())
    }
}

impl FromStr for PeerId {
    type Err = crate::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = hex::decode(s).map_err(|e| crate::Error::protocol(e.to_string()))?;
        let bytes: [u8; 20] = raw
            .try_into()
            .map_err(|_| crate::Error::protocol("peer id must be 20 bytes"))?;
        Ok(Self(bytes))
    }
}

/// Numeric identifier assigned by the external directory service,
/// one-to-one with a [`PeerId`]. Used as the handle into the friend table.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct DirectoryId(pub u32);

impl fmt::Display for DirectoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for DirectoryId {
    fn from(v: u32) -> Self {
        Self(v)
    }
}

/// 40-hex-character file hash keying the creators and providers maps.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileHash(String);

impl FileHash {
    /// Validate and normalize a 40-hex-character hash string.
    pub fn new(s: impl Into<String>) -> crate::Result<Self> {
        let s = s.into().to_ascii_lowercase();
        if s.len() != 40 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(crate::Error::protocol(format!("bad file hash: {s:?}")));
        }
        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FileHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for FileHash {
    type Err = crate::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Coarse classification of the local network's address translation,
/// used to decide which connection strategies are viable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum NatClass {
    #[default]
    Unknown,
    /// External address equals local address; no translation in play.
    Unrestricted,
    /// Stable mapping, inbound allowed from anywhere.
    FullCone,
    /// Stable mapping, inbound only from endpoints we have sent to.
    RestrictedCone,
    /// Port-dependent mapping; UDP tunneling is the only option.
    Symmetric,
    /// No usable external address could be determined.
    Unreachable,
}

impl NatClass {
    /// Whether peers can open connections to us without assistance.
    pub fn inbound_reachable(self) -> bool {
        matches!(self, NatClass::Unrestricted | NatClass::FullCone)
    }

    /// Whether we sit behind a firewall that needs pinholes punched.
    pub fn firewalled(self) -> bool {
        matches!(
            self,
            NatClass::RestrictedCone | NatClass::Symmetric | NatClass::Unreachable
        )
    }
}

/// Enrollment / liveness state of a friend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum FriendState {
    /// Known to the directory but has never uploaded a certificate.
    #[default]
    NotEnrolled,
    Offline,
    Connected,
}

/// How a connection to a peer is (or would be) carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionKind {
    /// Direct TCP to the peer's LAN address.
    TcpLocal,
    /// Direct TCP to the peer's published external address.
    TcpExternal,
    /// Ask the peer to connect back to us over TCP.
    TcpBack,
    /// Tunneled over the shared UDP socket.
    Udp,
}

/// A single queued attempt the per-peer FSM will try in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionAttempt {
    pub endpoint: SocketAddr,
    pub kind: ConnectionKind,
    /// Seconds to wait before dialing (simultaneous-open tie-break).
    pub delay_secs: u32,
    /// Overall budget for this attempt, seconds.
    pub timeout_secs: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_from_key_is_stable_and_ordered() {
        let a = PeerId::from_public_key(b"key-a");
        let b = PeerId::from_public_key(b"key-a");
        assert_eq!(a, b);
        assert_eq!(a.to_hex().len(), 40);

        let lo = PeerId([0u8; 20]);
        let hi = PeerId([0xFF; 20]);
        assert!(lo < hi);
    }

    #[test]
    fn file_hash_validation() {
        assert!(FileHash::new("ab".repeat(20)).is_ok());
        assert!(FileHash::new("xyz").is_err());
        assert!(FileHash::new("g".repeat(40)).is_err());
        let h = FileHash::new("AB".repeat(20)).unwrap();
        assert_eq!(h.as_str(), "ab".repeat(20));
    }

    #[test]
    fn nat_class_reachability() {
        assert!(NatClass::FullCone.inbound_reachable());
        assert!(!NatClass::Symmetric.inbound_reachable());
        assert!(NatClass::Symmetric.firewalled());
        assert!(!NatClass::Unrestricted.firewalled());
    }
}

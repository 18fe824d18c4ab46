#![forbid(unsafe_code)]

//! Tether daemon: the connectivity brain of the file-exchange client.
//!
//! Owns the per-friend connection state machine, the own-connectivity
//! startup sequence, the friends retry loop, the directory-service
//! interface, and the wiring that assembles the transport, stream and
//! transfer layers into a running process.

pub mod connection;
pub mod directory;
pub mod friends;
pub mod heartbeat;
pub mod inspection;
pub mod own_connectivity;
pub mod services;

pub use connection::{ConnState, FriendBook, PeerConnectState};
pub use directory::{DirectoryClient, DirectorySession, FriendRecord};
pub use friends::FriendsManager;
pub use own_connectivity::{OwnConnectivity, OwnPhase, OwnState};
pub use services::{NullCatalog, Services};

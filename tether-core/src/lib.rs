#![forbid(unsafe_code)]

//! Tether core: shared identifiers, configuration, error taxonomy and the
//! typed event bus the rest of the workspace publishes into.
//!
//! Nothing in this crate touches the network; it exists so that the
//! transport, stream, transfer and daemon crates agree on vocabulary.

pub mod config;
pub mod error;
pub mod events;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use events::{Event, EventBus};
pub use types::{
    ConnectionAttempt, ConnectionKind, DirectoryId, FileHash, FriendState, NatClass, PeerId,
};

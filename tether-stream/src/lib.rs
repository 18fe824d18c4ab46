#![forbid(unsafe_code)]

//! Tether secure stream layer.
//!
//! Wraps either socket kind (direct TCP or the UDP tunnel) in a
//! mutual-authentication encrypted channel pinned to the expected peer
//! identifier, frames the byte stream, and multiplexes typed service
//! messages across every open channel with fair-share balancing.

pub mod frame;
pub mod handshake;
pub mod link;
pub mod mux;

#[cfg(test)]
pub(crate) mod test_util;

pub use frame::{FrameError, FrameReader, FRAME_MAGIC, MAX_FRAME_PAYLOAD};
pub use handshake::{Identity, SecureChannel};
pub use link::{LinkKind, PeerLink, TcpLink, TouLink};
pub use mux::{RawMessage, Service, ServiceMux};

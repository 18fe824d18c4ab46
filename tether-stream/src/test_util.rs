//! Shared helpers for this crate's unit tests.

use std::sync::Arc;

use crate::handshake::{initiate, respond, Identity, SecureChannel};
use crate::link::{memory_pair, PeerLink};

/// Handshake a channel pair over an in-memory link.
pub(crate) async fn channel_pair() -> (
    Arc<SecureChannel>,
    Arc<SecureChannel>,
    Identity,
    Identity,
) {
    let alice = Identity::generate();
    let bob = Identity::generate();
    let (link_a, link_b) = memory_pair();
    let responder = tokio::spawn({
        let bob = bob.clone();
        async move { respond(link_b as Arc<dyn PeerLink>, &bob, None).await }
    });
    let chan_a = initiate(link_a as Arc<dyn PeerLink>, &alice, bob.peer_id())
        .await
        .expect("handshake");
    let chan_b = responder.await.expect("join").expect("handshake");
    (Arc::new(chan_a), Arc::new(chan_b), alice, bob)
}

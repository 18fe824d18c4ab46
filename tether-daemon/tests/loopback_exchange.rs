//! End-to-end over loopback: two daemons find each other through their
//! rosters, complete the encrypted handshake, and move a real file.

use std::{sync::Arc, time::Duration};

use tempfile::tempdir;
use tokio::sync::Notify;

use tether_core::{Config, DirectoryId, Event, FileHash};
use tether_daemon::directory::{FriendRecord, StaticDirectory};
use tether_daemon::{NullCatalog, Services};
use tether_transfer::group::GroupFile;

async fn spawn_node(
    dir: &std::path::Path,
    directory: Arc<StaticDirectory>,
) -> (Arc<Services>, Arc<Notify>) {
    let mut config = Config::default();
    config.user_dir = dir.to_path_buf();
    config.listen_port = 0;
    config.upnp_enabled = false;
    config.stun_servers = Vec::new();

    let services = Services::build(config, directory, Arc::new(NullCatalog))
        .await
        .expect("build");
    let stop = Arc::new(Notify::new());
    {
        let services = services.clone();
        let stop = stop.clone();
        tokio::spawn(async move {
            let shutdown = async move {
                stop.notified().await;
            };
            let _ = services.run(shutdown).await;
        });
    }
    // Give the accept loops a moment to come up.
    tokio::time::sleep(Duration::from_millis(100)).await;
    (services, stop)
}

fn record_for(services: &Services, directory_id: u32) -> FriendRecord {
    FriendRecord {
        directory_id,
        display_name: format!("node-{directory_id}"),
        public_key: Some(services.identity.public_key().as_bytes().to_vec()),
        local_endpoint: None,
        external_endpoint: format!("127.0.0.1:{}", services.config.listen_port)
            .parse()
            .ok(),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn two_nodes_connect_and_transfer_a_file() {
    let dir_a = tempdir().unwrap();
    let dir_b = tempdir().unwrap();
    let (node_a, stop_a) = spawn_node(dir_a.path(), StaticDirectory::new()).await;
    let (node_b, stop_b) = spawn_node(dir_b.path(), StaticDirectory::new()).await;

    let id_a = DirectoryId(1);
    let id_b = DirectoryId(2);

    // Each node learns about the other as a roster entry.
    node_a.friends.apply_roster(&[record_for(&node_b, id_b.0)]);
    node_b.friends.apply_roster(&[record_for(&node_a, id_a.0)]);

    // B offers a file through its temp-share list.
    let payload: Vec<u8> = (0..30_000u32).map(|i| (i % 251) as u8).collect();
    let shared_path = dir_b.path().join("shared.bin");
    std::fs::write(&shared_path, &payload).unwrap();
    let hash = FileHash::new("ab".repeat(20)).unwrap();
    node_b
        .temp_shares
        .add(shared_path, hash.clone(), payload.len() as u64)
        .unwrap();

    // Wait for the connection to come up (driven by the 1 s ticker).
    let mut events_a = node_a.events.subscribe();
    let connected = tokio::time::timeout(Duration::from_secs(15), async {
        loop {
            match events_a.recv().await {
                Ok(Event::PeerConnected { friend }) if friend == id_b => break,
                Ok(_) => continue,
                Err(e) => panic!("event stream died: {e}"),
            }
        }
    })
    .await;
    assert!(connected.is_ok(), "nodes failed to connect in time");

    // A downloads the shared file from B.
    node_a
        .controller
        .start_group(
            "loopback test".into(),
            vec![GroupFile {
                name: "shared.bin".into(),
                hash,
                size: payload.len() as u64,
            }],
            vec![id_b],
            None,
            None,
        )
        .unwrap();

    let completed = tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            match events_a.recv().await {
                Ok(Event::TransferCompleted { .. }) => break,
                Ok(Event::TransferFailed { reason, .. }) => {
                    panic!("transfer failed: {reason}")
                }
                Ok(_) => continue,
                Err(e) => panic!("event stream died: {e}"),
            }
        }
    })
    .await;
    assert!(completed.is_ok(), "transfer did not finish in time");

    let downloaded = dir_a.path().join("downloads").join("shared.bin");
    assert_eq!(std::fs::read(&downloaded).unwrap(), payload);

    stop_a.notify_waiters();
    stop_b.notify_waiters();
}

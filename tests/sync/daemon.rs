use std::sync::Arc;
use std::time::Duration;

use rillsync::daemon::Daemon;
use rillsync::sync::task::SyncAction;

use super::{Dirs, FakeTransport, PeerState};

const MIXED_TARGETS: &str = r#"
[[targets]]
id = "mirror"
address = "m.example"
module = "data"
threads = 2

[[targets]]
id = "peer"
address = "beta.example"
module = "data"
state_module = "state"
threads = 2
bidirectional = true
"#;

fn daemon(dirs: &Dirs, targets: &str) -> (Daemon, Arc<FakeTransport>) {
    let config = dirs.config(targets, "");
    let transport = Arc::new(FakeTransport::new(dirs.root(), dirs.remote.path()));
    let peer = Arc::new(PeerState::new(&transport.remote_dir("peer")));
    let daemon = Daemon::with_transport(config, transport.clone(), peer).unwrap();
    (daemon, transport)
}

async fn wait_for(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test]
async fn test_full_sync_mirrors_one_way_targets_only() {
    let dirs = Dirs::new();
    let (daemon, transport) = daemon(&dirs, MIXED_TARGETS);
    assert!(daemon.coordinator().is_some());

    assert_eq!(daemon.full_sync().await, 0);
    assert_eq!(transport.mirrors(), vec!["mirror".to_string()]);
    daemon.dispatcher().shutdown(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn test_no_coordinator_without_bidirectional_targets() {
    let dirs = Dirs::new();
    let one_way = r#"
[[targets]]
id = "mirror"
address = "m.example"
module = "data"
"#;
    let (daemon, _transport) = daemon(&dirs, one_way);
    assert!(daemon.coordinator().is_none());
    assert!(!dirs.state.path().join("meta").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_run_until_propagates_and_drains() {
    let dirs = Dirs::new();
    dirs.write_remote("peer", "from-peer.txt", b"peer data");
    let (daemon, transport) = daemon(&dirs, MIXED_TARGETS);

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let running = tokio::spawn(daemon.run_until(async {
        let _ = stop_rx.await;
    }));

    // The first reconciliation cycle runs at start.
    let local = dirs.root().join("from-peer.txt");
    wait_for("initial pull", || local.exists()).await;
    assert_eq!(std::fs::read(&local).unwrap(), b"peer data");

    tokio::time::sleep(Duration::from_millis(300)).await;
    dirs.write_local("new.txt", b"fresh");
    wait_for("push to the one-way target", || {
        transport
            .calls_for("mirror")
            .iter()
            .any(|c| c.path == "new.txt" && c.action == SyncAction::Push)
    })
    .await;

    stop_tx.send(()).unwrap();
    let stats = tokio::time::timeout(Duration::from_secs(10), running)
        .await
        .expect("daemon did not stop")
        .unwrap()
        .unwrap();
    assert!(stats.queue.received >= 1);
    assert!(stats.dispatch.succeeded >= 2);
    assert_eq!(dirs.read_remote("mirror", "new.txt").unwrap(), b"fresh");
}

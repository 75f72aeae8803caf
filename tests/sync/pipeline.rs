use std::sync::Arc;
use std::time::Duration;

use rillsync::error::SyncError;
use rillsync::sync::dispatcher::{Dispatcher, Submission};
use rillsync::sync::event::{EventKind, FileEvent};
use rillsync::sync::faillog::FailLog;
use rillsync::sync::queue::EventQueue;
use rillsync::sync::report::Reporter;
use rillsync::sync::task::{SyncAction, SyncTask};

use super::{wait_idle, Dirs, FakeTransport};

const TWO_TARGETS: &str = r#"
[[targets]]
id = "mirror-a"
address = "a.example"
module = "data"
threads = 2

[[targets]]
id = "mirror-b"
address = "b.example"
module = "data"
threads = 2
exclude = ["*.secret"]
"#;

fn start(dirs: &Dirs, transport: Arc<FakeTransport>) -> (Arc<FailLog>, Dispatcher) {
    let config = dirs.config(TWO_TARGETS, "");
    let faillog = Arc::new(FailLog::open(&config.retry.fail_log, config.retry.max_attempts).unwrap());
    let dispatcher = Dispatcher::start(&config, transport, faillog.clone(), Reporter::default());
    (faillog, dispatcher)
}

#[tokio::test]
async fn test_burst_becomes_one_push_per_target() {
    let dirs = Dirs::new();
    dirs.write_local("docs/a.txt", b"v3");
    dirs.write_local("b.txt", b"b");
    let transport = Arc::new(FakeTransport::new(dirs.root(), dirs.remote.path()));
    let (_faillog, dispatcher) = start(&dirs, transport.clone());

    let (queue, mut batches) = EventQueue::spawn(Duration::from_millis(50), 100);
    queue.push(FileEvent::new("docs/a.txt", EventKind::Create, false)).await.unwrap();
    queue.push(FileEvent::new("docs/a.txt", EventKind::Modify, false)).await.unwrap();
    queue.push(FileEvent::new("docs/a.txt", EventKind::Modify, false)).await.unwrap();
    queue.push(FileEvent::new("b.txt", EventKind::Create, false)).await.unwrap();

    let batch = tokio::time::timeout(Duration::from_secs(5), batches.next_batch())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(batch.len(), 2);
    assert_eq!(dispatcher.dispatch_batch(&batch), 4);
    wait_idle(&dispatcher).await;

    for target in ["mirror-a", "mirror-b"] {
        let mut paths: Vec<_> = transport
            .calls_for(target)
            .into_iter()
            .map(|c| {
                assert_eq!(c.action, SyncAction::Push);
                c.path
            })
            .collect();
        paths.sort();
        assert_eq!(paths, vec!["b.txt".to_string(), "docs/a.txt".to_string()]);
    }
    assert_eq!(dirs.read_remote("mirror-a", "docs/a.txt").unwrap(), b"v3");

    let stats = queue.close().await;
    assert_eq!(stats.received, 4);
    assert_eq!(stats.emitted, 2);
}

#[tokio::test]
async fn test_same_path_never_runs_twice_at_once() {
    let dirs = Dirs::new();
    dirs.write_local("a.txt", b"x");
    let transport = Arc::new(FakeTransport::new(dirs.root(), dirs.remote.path()));
    transport.set_delay(Duration::from_millis(100));
    let (_faillog, dispatcher) = start(&dirs, transport.clone());

    let first = dispatcher.submit(SyncTask::new("mirror-a", "a.txt", SyncAction::Push)).unwrap();
    let second = dispatcher.submit(SyncTask::new("mirror-a", "a.txt", SyncAction::Delete)).unwrap();
    assert_eq!(first, Submission::Queued);
    assert_eq!(second, Submission::Waiting);

    wait_idle(&dispatcher).await;
    let actions: Vec<_> = transport.calls_for("mirror-a").into_iter().map(|c| c.action).collect();
    assert_eq!(actions, vec![SyncAction::Push, SyncAction::Delete]);
    assert!(!transport.overlapped());
    assert_eq!(dispatcher.stats().queued_behind, 1);
}

#[tokio::test]
async fn test_target_excludes_apply_per_target() {
    let dirs = Dirs::new();
    dirs.write_local("keys/id.secret", b"k");
    let transport = Arc::new(FakeTransport::new(dirs.root(), dirs.remote.path()));
    let (_faillog, dispatcher) = start(&dirs, transport.clone());

    let a = dispatcher.submit(SyncTask::new("mirror-a", "keys/id.secret", SyncAction::Push)).unwrap();
    let b = dispatcher.submit(SyncTask::new("mirror-b", "keys/id.secret", SyncAction::Push)).unwrap();
    assert_eq!(a, Submission::Queued);
    assert_eq!(b, Submission::Excluded);

    wait_idle(&dispatcher).await;
    assert_eq!(transport.calls_for("mirror-a").len(), 1);
    assert!(transport.calls_for("mirror-b").is_empty());
}

#[tokio::test]
async fn test_delete_local_needs_no_transport() {
    let dirs = Dirs::new();
    dirs.write_local("old/log.txt", b"x");
    let transport = Arc::new(FakeTransport::new(dirs.root(), dirs.remote.path()));
    let (_faillog, dispatcher) = start(&dirs, transport.clone());

    dispatcher
        .submit(SyncTask::new("mirror-a", "old/log.txt", SyncAction::DeleteLocal))
        .unwrap();
    wait_idle(&dispatcher).await;

    assert!(dirs.read_local("old/log.txt").is_none());
    assert!(transport.calls().is_empty());
    assert_eq!(dispatcher.stats().succeeded, 1);
}

#[tokio::test]
async fn test_shutdown_cancels_after_grace_and_keeps_task_for_retry() {
    let dirs = Dirs::new();
    dirs.write_local("big.iso", b"...");
    let transport = Arc::new(FakeTransport::new(dirs.root(), dirs.remote.path()));
    transport.set_delay(Duration::from_secs(30));
    let (faillog, dispatcher) = start(&dirs, transport.clone());

    dispatcher.submit(SyncTask::new("mirror-a", "big.iso", SyncAction::Push)).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let stats = tokio::time::timeout(Duration::from_secs(5), dispatcher.shutdown(Duration::from_millis(100)))
        .await
        .expect("shutdown must not wait for the transfer");
    assert_eq!(stats.failed, 1);
    assert!(faillog.contains("mirror-a", "big.iso", SyncAction::Push).await);

    let err = dispatcher
        .submit(SyncTask::new("mirror-a", "big.iso", SyncAction::Push))
        .unwrap_err();
    assert!(matches!(err, SyncError::ShuttingDown));
}

use std::sync::Arc;
use std::time::Duration;

use rillsync::sync::dispatcher::Dispatcher;
use rillsync::sync::faillog::{read_pending, FailLog, RetryExecutor};
use rillsync::sync::report::{Reporter, SyncReport};
use rillsync::sync::task::{SyncAction, SyncTask};

use super::{drain, wait_idle, Dirs, FakeTransport};

const ONE_TARGET: &str = r#"
[[targets]]
id = "mirror"
address = "m.example"
module = "data"
threads = 1
"#;

struct Setup {
    dirs: Dirs,
    transport: Arc<FakeTransport>,
    faillog: Arc<FailLog>,
    dispatcher: Arc<Dispatcher>,
    reporter: Reporter,
}

fn setup(max_attempts: u32) -> Setup {
    let dirs = Dirs::new();
    let mut config = (*dirs.config(ONE_TARGET, "")).clone();
    config.retry.max_attempts = max_attempts;

    let transport = Arc::new(FakeTransport::new(dirs.root(), dirs.remote.path()));
    let faillog = Arc::new(FailLog::open(&config.retry.fail_log, max_attempts).unwrap());
    let reporter = Reporter::default();
    let dispatcher = Arc::new(Dispatcher::start(&config, transport.clone(), faillog.clone(), reporter.clone()));
    Setup {
        dirs,
        transport,
        faillog,
        dispatcher,
        reporter,
    }
}

impl Setup {
    fn executor(&self) -> RetryExecutor {
        RetryExecutor::new(
            self.faillog.clone(),
            self.dispatcher.clone(),
            self.reporter.clone(),
            Duration::from_secs(1),
        )
    }
}

#[tokio::test]
async fn test_transient_failure_is_retried_until_success() {
    let s = setup(3);
    s.dirs.write_local("a.txt", b"x");
    s.transport.fail("a.txt", 1);

    s.dispatcher.submit(SyncTask::new("mirror", "a.txt", SyncAction::Push)).unwrap();
    wait_idle(&s.dispatcher).await;
    assert!(s.faillog.contains("mirror", "a.txt", SyncAction::Push).await);

    assert_eq!(s.executor().tick().await.unwrap(), 1);
    wait_idle(&s.dispatcher).await;

    assert!(!s.faillog.contains("mirror", "a.txt", SyncAction::Push).await);
    let attempts: Vec<u32> = s.transport.calls().into_iter().map(|c| c.attempt).collect();
    assert_eq!(attempts, vec![1, 2]);
    assert_eq!(s.dirs.read_remote("mirror", "a.txt").unwrap(), b"x");
}

#[tokio::test]
async fn test_gives_up_after_max_attempts_and_reports() {
    let s = setup(2);
    let mut reports = s.reporter.subscribe();
    s.transport.fail("a.txt", u32::MAX);

    s.dispatcher.submit(SyncTask::new("mirror", "a.txt", SyncAction::Push)).unwrap();
    wait_idle(&s.dispatcher).await;
    s.executor().tick().await.unwrap();
    wait_idle(&s.dispatcher).await;

    assert!(s.faillog.pending().await.is_empty());
    assert_eq!(s.dispatcher.stats().given_up, 1);
    // Nothing left to retry.
    assert_eq!(s.executor().tick().await.unwrap(), 0);
    assert_eq!(s.transport.calls().len(), 2);

    let terminal = drain(&mut reports)
        .into_iter()
        .filter_map(|r| match r {
            SyncReport::TerminalFailure(f) => Some(f),
            _ => None,
        })
        .collect::<Vec<_>>();
    assert_eq!(terminal.len(), 1);
    assert_eq!(terminal[0].target.as_deref(), Some("mirror"));
    assert_eq!(terminal[0].path, "a.txt");
    assert!(terminal[0].reason.contains("connection reset"));
}

#[tokio::test]
async fn test_permanent_failure_is_retried_once() {
    let s = setup(10);
    s.transport.fail_permanently("a.txt");

    s.dispatcher.submit(SyncTask::new("mirror", "a.txt", SyncAction::Push)).unwrap();
    wait_idle(&s.dispatcher).await;
    assert!(s.faillog.contains("mirror", "a.txt", SyncAction::Push).await);

    s.executor().tick().await.unwrap();
    wait_idle(&s.dispatcher).await;

    assert!(s.faillog.pending().await.is_empty());
    assert_eq!(s.transport.calls().len(), 2);
    assert_eq!(s.dispatcher.stats().given_up, 1);
}

#[tokio::test]
async fn test_pending_entries_survive_restart() {
    let s = setup(5);
    s.transport.fail("docs/report.pdf", u32::MAX);
    s.dispatcher
        .submit(SyncTask::new("mirror", "docs/report.pdf", SyncAction::Push))
        .unwrap();
    wait_idle(&s.dispatcher).await;

    let path = s.faillog.path().to_path_buf();
    drop(s.faillog);

    let pending = read_pending(&path).unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].relative_path, "docs/report.pdf");
    assert_eq!(pending[0].attempt_count, 1);

    let reopened = FailLog::open(&path, 5).unwrap();
    let due = reopened.due().await;
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].attempt, 2);
    assert_eq!(due[0].action, SyncAction::Push);
}

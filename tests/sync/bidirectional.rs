use std::path::{Path, PathBuf};
use std::sync::Arc;

use rillsync::config::{Config, TargetConfig};
use rillsync::sync::bidirectional::{BidirectionalCoordinator, CycleSummary};
use rillsync::sync::conflict::{ConflictRecord, ConflictType};
use rillsync::sync::dispatcher::Dispatcher;
use rillsync::sync::event::{EventKind, FileEvent};
use rillsync::sync::faillog::FailLog;
use rillsync::sync::metadata::MetadataManager;
use rillsync::sync::report::{Reporter, SyncReport, TerminalFailure};
use rillsync::sync::resolver::Resolution;
use rillsync::sync::task::SyncAction;

use super::{drain, set_mtime, Dirs, FakeTransport, PeerState};

const PEER: &str = "peer";

struct Pair {
    dirs: Dirs,
    config: Arc<Config>,
    transport: Arc<FakeTransport>,
    coordinator: BidirectionalCoordinator,
    reporter: Reporter,
}

fn pair(strategy: &str) -> Pair {
    pair_with(strategy, |_| {})
}

fn pair_with(strategy: &str, tweak: impl FnOnce(&mut Config)) -> Pair {
    let dirs = Dirs::new();
    let targets = format!(
        r#"
[[targets]]
id = "{PEER}"
address = "beta.example"
module = "data"
state_module = "state"
threads = 2
bidirectional = true
strategy = "{strategy}"
"#
    );
    let mut config = (*dirs.config(&targets, "")).clone();
    tweak(&mut config);
    let config = Arc::new(config);

    let transport = Arc::new(FakeTransport::new(dirs.root(), dirs.remote.path()));
    let peer = Arc::new(PeerState::new(&transport.remote_dir(PEER)));
    let faillog = Arc::new(FailLog::open(&config.retry.fail_log, config.retry.max_attempts).unwrap());
    let reporter = Reporter::default();
    let dispatcher = Arc::new(Dispatcher::start(&config, transport.clone(), faillog, reporter.clone()));
    let metadata = Arc::new(
        MetadataManager::open(
            &config.bidirectional.metadata_dir,
            &config.watch.root,
            config.bidirectional.node_id.as_deref(),
            config.bidirectional.signature,
        )
        .unwrap(),
    );
    let coordinator = BidirectionalCoordinator::new(
        config.clone(),
        metadata,
        dispatcher,
        transport.clone(),
        peer,
        reporter.clone(),
    );
    Pair {
        dirs,
        config,
        transport,
        coordinator,
        reporter,
    }
}

impl Pair {
    fn target(&self) -> &TargetConfig {
        self.config.target(PEER).unwrap()
    }

    async fn cycle(&self) -> CycleSummary {
        self.coordinator.sync_target(self.target()).await.unwrap()
    }

    fn write_remote(&self, rel: &str, content: &[u8]) {
        self.dirs.write_remote(PEER, rel, content);
    }

    fn read_remote(&self, rel: &str) -> Option<Vec<u8>> {
        self.dirs.read_remote(PEER, rel)
    }

    fn remote_path(&self, rel: &str) -> PathBuf {
        self.transport.remote_dir(PEER).join(rel)
    }

    /// Contents of every backup whose name contains `marker`.
    fn backups(&self, marker: &str) -> Vec<Vec<u8>> {
        backups_under(&self.config.bidirectional.backup_dir, marker)
    }
}

fn backups_under(dir: &Path, marker: &str) -> Vec<Vec<u8>> {
    let mut found = Vec::new();
    for entry in jwalk::WalkDir::new(dir).skip_hidden(true).into_iter().flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if entry.file_type().is_file() && name.contains(marker) {
            found.push(std::fs::read(entry.path()).unwrap());
        }
    }
    found
}

fn conflicts(reports: &[SyncReport]) -> Vec<ConflictRecord> {
    reports
        .iter()
        .filter_map(|r| match r {
            SyncReport::Conflict(c) => Some(c.clone()),
            _ => None,
        })
        .collect()
}

fn terminal(reports: &[SyncReport]) -> Vec<TerminalFailure> {
    reports
        .iter()
        .filter_map(|r| match r {
            SyncReport::TerminalFailure(f) => Some(f.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_pulls_remote_file_once() {
    let p = pair("keep_newer");
    p.write_remote("docs/a.txt", b"hello");

    let first = p.cycle().await;
    assert_eq!(first.pulled, 1);
    assert_eq!(p.dirs.read_local("docs/a.txt").unwrap(), b"hello");

    let second = p.cycle().await;
    assert_eq!(second.in_sync, 1);
    assert_eq!(second.pulled + second.pushed, 0);
    assert_eq!(p.transport.calls().len(), 1);
}

#[tokio::test]
async fn test_pushed_file_does_not_echo_back() {
    let p = pair("keep_newer");
    p.dirs.write_local("b.txt", b"local");

    let first = p.cycle().await;
    assert_eq!(first.pushed, 1);
    assert_eq!(p.read_remote("b.txt").unwrap(), b"local");

    // The peer now records b.txt as its own change.
    let second = p.cycle().await;
    assert_eq!(second.in_sync, 1);
    assert_eq!(second.conflicts, 0);
    let calls = p.transport.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].action, SyncAction::Push);
}

#[tokio::test]
async fn test_remote_delete_removes_local_copy() {
    let p = pair("keep_newer");
    p.dirs.write_local("gone.txt", b"same");
    p.write_remote("gone.txt", b"same");
    assert_eq!(p.cycle().await.in_sync, 1);

    std::fs::remove_file(p.remote_path("gone.txt")).unwrap();
    let summary = p.cycle().await;
    assert_eq!(summary.deleted, 1);
    assert!(p.dirs.read_local("gone.txt").is_none());
}

#[tokio::test]
async fn test_both_created_keep_newer_takes_later_mtime() {
    let p = pair("keep_newer");
    let mut reports = p.reporter.subscribe();
    p.dirs.write_local("a.txt", b"0123456789");
    set_mtime(&p.dirs.root().join("a.txt"), 100);
    p.write_remote("a.txt", b"abcde");
    set_mtime(&p.remote_path("a.txt"), 200);

    let summary = p.cycle().await;
    assert_eq!(summary.conflicts, 1);
    assert_eq!(p.dirs.read_local("a.txt").unwrap(), b"abcde");
    assert_eq!(p.backups("_local_"), vec![b"0123456789".to_vec()]);

    let found = conflicts(&drain(&mut reports));
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].conflict_type, ConflictType::BothCreated);
    assert_eq!(found[0].resolution, Some(Resolution::KeepRemote));
    assert_eq!(found[0].local.size, 10);
    assert_eq!(found[0].remote.size, 5);

    // The adopted content is agreed; nothing flows back.
    let again = p.cycle().await;
    assert_eq!(again.in_sync, 1);
    assert_eq!(again.conflicts, 0);
}

#[tokio::test]
async fn test_local_delete_against_remote_edit() {
    let p = pair("keep_remote");
    let mut reports = p.reporter.subscribe();
    p.dirs.write_local("c.txt", b"v1");
    p.write_remote("c.txt", b"v1");
    assert_eq!(p.cycle().await.in_sync, 1);

    std::fs::remove_file(p.dirs.root().join("c.txt")).unwrap();
    p.write_remote("c.txt", b"v2 longer");

    let summary = p.cycle().await;
    assert_eq!(summary.conflicts, 1);
    assert_eq!(p.dirs.read_local("c.txt").unwrap(), b"v2 longer");

    let found = conflicts(&drain(&mut reports));
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].conflict_type, ConflictType::LocalDeletedRemoteModified);
    assert!(found[0].local.deleted);
}

#[tokio::test]
async fn test_keep_local_overwrites_remote_after_backup() {
    let p = pair("keep_local");
    p.dirs.write_local("k.txt", b"ours");
    p.write_remote("k.txt", b"theirs");

    assert_eq!(p.cycle().await.conflicts, 1);
    assert_eq!(p.read_remote("k.txt").unwrap(), b"ours");
    assert_eq!(p.backups("_remote_"), vec![b"theirs".to_vec()]);

    assert_eq!(p.cycle().await.in_sync, 1);
}

#[tokio::test]
async fn test_manual_strategy_suspends_until_resumed_or_changed() {
    let p = pair("manual");
    let mut reports = p.reporter.subscribe();
    p.dirs.write_local("x.txt", b"mine");
    p.write_remote("x.txt", b"theirs");

    assert_eq!(p.cycle().await.conflicts, 1);
    let reported = drain(&mut reports);
    let failures = terminal(&reported);
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].path, "x.txt");
    assert!(failures[0].reason.contains("manual"));
    assert_eq!(conflicts(&reported)[0].resolution, Some(Resolution::RequiresManual));

    // Held: no transfers, both sides untouched.
    assert_eq!(p.cycle().await.suspended, 1);
    assert!(p.transport.calls().is_empty());
    assert_eq!(p.dirs.read_local("x.txt").unwrap(), b"mine");
    assert_eq!(p.read_remote("x.txt").unwrap(), b"theirs");

    assert_eq!(p.coordinator.metadata().resume("x.txt").unwrap(), 1);
    assert_eq!(p.coordinator.metadata().resume("x.txt").unwrap(), 0);
    assert_eq!(p.cycle().await.conflicts, 1);
    assert_eq!(p.cycle().await.suspended, 1);

    // A new local revision lifts the hold on its own.
    p.dirs.write_local("x.txt", b"mine, edited");
    assert_eq!(p.cycle().await.conflicts, 1);
}

#[tokio::test]
async fn test_backup_both_keeps_variants_and_trees() {
    let p = pair("backup_both");
    p.dirs.write_local("y.txt", b"L");
    p.write_remote("y.txt", b"R");

    assert_eq!(p.cycle().await.conflicts, 1);
    assert_eq!(p.backups("_local_"), vec![b"L".to_vec()]);
    assert_eq!(p.backups("_remote_"), vec![b"R".to_vec()]);
    assert_eq!(p.dirs.read_local("y.txt").unwrap(), b"L");
    assert_eq!(p.read_remote("y.txt").unwrap(), b"R");
    assert!(p.transport.calls().is_empty());

    assert_eq!(p.cycle().await.suspended, 1);
}

#[tokio::test]
async fn test_failed_backup_aborts_resolution() {
    let p = pair_with("keep_remote", |config| {
        let blocker = config.bidirectional.backup_dir.with_file_name("blocker");
        std::fs::write(&blocker, b"not a directory").unwrap();
        config.bidirectional.backup_dir = blocker.join("backups");
    });
    let mut reports = p.reporter.subscribe();
    p.dirs.write_local("z.txt", b"local");
    p.write_remote("z.txt", b"remote!");

    let summary = p.cycle().await;
    assert_eq!(summary.errors, 1);
    assert_eq!(summary.conflicts, 0);
    assert_eq!(p.dirs.read_local("z.txt").unwrap(), b"local");
    assert!(p.transport.calls().is_empty());
    assert!(p.coordinator.metadata().baseline(PEER, "z.txt").unwrap().is_none());

    let reported = drain(&mut reports);
    // The aborted keep_remote was never announced.
    assert!(conflicts(&reported).is_empty());
    let failures = terminal(&reported);
    assert_eq!(failures.len(), 1);
    assert!(failures[0].reason.contains("backup"));
}

#[tokio::test]
async fn test_failed_transfer_records_no_agreement() {
    let p = pair("keep_newer");
    p.write_remote("f.txt", b"remote");
    p.transport.fail("f.txt", 1);

    let first = p.cycle().await;
    assert_eq!(first.errors, 1);
    assert!(p.dirs.read_local("f.txt").is_none());
    assert!(p.coordinator.metadata().baseline(PEER, "f.txt").unwrap().is_none());

    let second = p.cycle().await;
    assert_eq!(second.pulled, 1);
    assert_eq!(p.dirs.read_local("f.txt").unwrap(), b"remote");
}

#[tokio::test]
async fn test_move_against_remote_edit_is_a_move_conflict() {
    let p = pair("keep_remote");
    let mut reports = p.reporter.subscribe();
    p.dirs.write_local("m.txt", b"v1");
    p.write_remote("m.txt", b"v1");
    assert_eq!(p.cycle().await.in_sync, 1);

    // The rename is seen locally but its remote delete fails.
    std::fs::rename(p.dirs.root().join("m.txt"), p.dirs.root().join("n.txt")).unwrap();
    p.transport.fail("m.txt", 1);
    let mut from = FileEvent::new("m.txt", EventKind::MoveFrom, false);
    from.moved_to = Some("n.txt".to_string());
    let to = FileEvent::new("n.txt", EventKind::MoveTo, false);
    let events = p.coordinator.evaluate_events(&[from, to]).await;
    assert_eq!(events.errors, 1);
    assert_eq!(events.pushed, 1);

    // Meanwhile the peer edits the old name.
    p.write_remote("m.txt", b"v2 from peer");
    drain(&mut reports);
    let summary = p.cycle().await;
    assert_eq!(summary.conflicts, 1);
    assert_eq!(p.dirs.read_local("m.txt").unwrap(), b"v2 from peer");
    assert_eq!(p.dirs.read_local("n.txt").unwrap(), b"v1");

    let found = conflicts(&drain(&mut reports));
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].conflict_type, ConflictType::MoveConflict);
    assert_eq!(found[0].local.moved_to.as_deref(), Some("n.txt"));
}

#[tokio::test]
async fn test_events_wait_for_first_cycle() {
    let p = pair("keep_newer");
    p.dirs.write_local("early.txt", b"x");
    let summary = p
        .coordinator
        .evaluate_events(&[FileEvent::new("early.txt", EventKind::Create, false)])
        .await;
    assert_eq!(summary.total(), 0);
    assert!(p.transport.calls().is_empty());
}

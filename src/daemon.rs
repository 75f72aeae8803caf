//! Daemon wiring: watcher → queue → dispatcher, plus the retry executor,
//! the bidirectional coordinator and the periodic full sync.

use anyhow::{Context, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::sync::bidirectional::{BidirectionalCoordinator, RemoteStateSource, TransportStateSource};
use crate::sync::dispatcher::{DispatchStats, Dispatcher};
use crate::sync::faillog::{FailLog, RetryExecutor};
use crate::sync::metadata::MetadataManager;
use crate::sync::queue::{EventQueue, QueueStats};
use crate::sync::report::{log_reports, Reporter};
use crate::sync::transfer::{RsyncTransport, Transport};
use crate::sync::watcher::{EventNormalizer, FileWatcher};

/// Directory under the metadata dir where peer exports are staged.
const INCOMING_DIR: &str = "incoming";
const LOGGER_DRAIN: Duration = Duration::from_secs(1);

/// Counters collected at shutdown.
#[derive(Debug, Clone, Copy, Default)]
pub struct DaemonStats {
    pub queue: QueueStats,
    pub dispatch: DispatchStats,
}

pub struct Daemon {
    config: Arc<Config>,
    reporter: Reporter,
    transport: Arc<dyn Transport>,
    faillog: Arc<FailLog>,
    dispatcher: Arc<Dispatcher>,
    coordinator: Option<Arc<BidirectionalCoordinator>>,
}

impl Daemon {
    /// Build the daemon with the rsync transport. Must run inside a tokio
    /// runtime.
    pub fn new(config: Arc<Config>) -> Result<Self> {
        let transport: Arc<dyn Transport> =
            Arc::new(RsyncTransport::new(config.transfer.clone(), config.watch.root.clone()));
        let remote = Arc::new(TransportStateSource::new(
            transport.clone(),
            config.bidirectional.metadata_dir.join(INCOMING_DIR),
        ));
        Self::with_transport(config, transport, remote)
    }

    pub fn with_transport(
        config: Arc<Config>,
        transport: Arc<dyn Transport>,
        remote: Arc<dyn RemoteStateSource>,
    ) -> Result<Self> {
        let reporter = Reporter::default();
        let faillog = Arc::new(
            FailLog::open(&config.retry.fail_log, config.retry.max_attempts)
                .context("Failed to open fail log")?,
        );
        let dispatcher = Arc::new(Dispatcher::start(
            &config,
            transport.clone(),
            faillog.clone(),
            reporter.clone(),
        ));

        let coordinator = if config.has_bidirectional_targets() {
            let metadata = MetadataManager::open(
                &config.bidirectional.metadata_dir,
                &config.watch.root,
                config.bidirectional.node_id.as_deref(),
                config.bidirectional.signature,
            )?;
            info!(node_id = %metadata.node_id(), "bidirectional mode enabled");
            Some(Arc::new(BidirectionalCoordinator::new(
                config.clone(),
                Arc::new(metadata),
                dispatcher.clone(),
                transport.clone(),
                remote,
                reporter.clone(),
            )))
        } else {
            None
        };

        Ok(Self {
            config,
            reporter,
            transport,
            faillog,
            dispatcher,
            coordinator,
        })
    }

    pub fn reporter(&self) -> &Reporter {
        &self.reporter
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn coordinator(&self) -> Option<&Arc<BidirectionalCoordinator>> {
        self.coordinator.as_ref()
    }

    /// Run until Ctrl-C.
    pub async fn run(self) -> Result<DaemonStats> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Run until `shutdown` resolves, then drain in order: watcher, queue,
    /// dispatcher.
    pub async fn run_until<F>(self, shutdown: F) -> Result<DaemonStats>
    where
        F: Future<Output = ()>,
    {
        let root = self.config.watch.root.clone();
        let mut watcher = FileWatcher::new(&root)?;
        let normalizer = EventNormalizer::new(
            root.clone(),
            self.config.watch.excludes.clone(),
            self.config.watch.events,
        );
        let (queue, mut batches) = EventQueue::spawn(self.config.watch.window, self.config.watch.max_backlog);
        let (stop_tx, stop_rx) = watch::channel(false);

        let logger = tokio::spawn(log_reports(self.reporter.subscribe()));

        let pump = {
            let sender = queue.sender();
            let mut stop = stop_rx.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        raw = watcher.next_event() => {
                            let Some(raw) = raw else { break };
                            for event in normalizer.normalize(&raw) {
                                if sender.send(event).await.is_err() {
                                    return;
                                }
                            }
                        }
                        _ = stop.changed() => break,
                    }
                }
                debug!("watcher pump stopped");
            })
        };

        let consumer = {
            let dispatcher = self.dispatcher.clone();
            let coordinator = self.coordinator.clone();
            tokio::spawn(async move {
                while let Some(batch) = batches.next_batch().await {
                    let accepted = dispatcher.dispatch_batch(&batch);
                    debug!(events = batch.len(), forced = batch.forced, accepted, "batch dispatched");
                    if let Some(coordinator) = &coordinator {
                        coordinator.evaluate_events(&batch.events).await;
                    }
                }
            })
        };

        let retry = tokio::spawn(
            RetryExecutor::new(
                self.faillog.clone(),
                self.dispatcher.clone(),
                self.reporter.clone(),
                self.config.retry.interval,
            )
            .run(stop_rx.clone()),
        );

        let reconcile: Option<JoinHandle<()>> = self
            .coordinator
            .clone()
            .map(|c| tokio::spawn(c.run(stop_rx.clone())));

        let full_sync = if self.config.full_sync.enabled || self.config.full_sync.on_start {
            Some(tokio::spawn(full_sync_loop(
                self.config.clone(),
                self.transport.clone(),
                self.reporter.clone(),
                stop_rx.clone(),
            )))
        } else {
            None
        };

        info!(
            root = %root.display(),
            targets = self.config.targets.len(),
            "watching for changes"
        );
        shutdown.await;
        info!("shutdown requested");

        let _ = stop_tx.send(true);
        if let Err(e) = pump.await {
            warn!(error = %e, "watcher pump failed");
        }
        let queue_stats = queue.close().await;
        if let Err(e) = consumer.await {
            warn!(error = %e, "batch consumer failed");
        }
        if let Err(e) = retry.await {
            warn!(error = %e, "retry executor failed");
        }

        let dispatch_stats = self.dispatcher.shutdown(self.config.shutdown_grace).await;

        for handle in [reconcile, full_sync].into_iter().flatten() {
            if let Err(e) = handle.await {
                warn!(error = %e, "background task failed");
            }
        }
        if let Err(e) = self.faillog.compact().await {
            warn!(error = %e, "failed to compact fail log");
        }

        info!(
            received = queue_stats.received,
            merged = queue_stats.merged,
            suppressed = queue_stats.suppressed,
            emitted = queue_stats.emitted,
            forced = queue_stats.forced,
            "event queue stopped"
        );

        // The logger ends once the last reporter handle is gone.
        drop(self.reporter);
        drop(self.dispatcher);
        drop(self.coordinator);
        if tokio::time::timeout(LOGGER_DRAIN, logger).await.is_err() {
            debug!("report logger still busy at exit");
        }

        Ok(DaemonStats {
            queue: queue_stats,
            dispatch: dispatch_stats,
        })
    }

    /// Push the whole tree to every one-way target once. Returns the number
    /// of targets that failed.
    pub async fn full_sync(&self) -> usize {
        full_sync_once(&self.config, self.transport.as_ref(), &self.reporter).await
    }
}

async fn full_sync_once(config: &Config, transport: &dyn Transport, reporter: &Reporter) -> usize {
    let mut failed = 0;
    for target in config.targets.iter().filter(|t| !t.bidirectional) {
        info!(target_id = %target.id, remote = %target.display_name(), "full sync started");
        match transport.mirror(target).await {
            Ok(()) => info!(target_id = %target.id, "full sync complete"),
            Err(e) => {
                failed += 1;
                reporter.terminal(Some(&target.id), "/", format!("full sync failed: {}", e));
                error!(target_id = %target.id, error = %e, "full sync failed");
            }
        }
    }
    failed
}

async fn full_sync_loop(
    config: Arc<Config>,
    transport: Arc<dyn Transport>,
    reporter: Reporter,
    mut shutdown: watch::Receiver<bool>,
) {
    if config.full_sync.on_start {
        full_sync_once(&config, transport.as_ref(), &reporter).await;
    }
    if !config.full_sync.enabled {
        return;
    }

    let mut ticker = tokio::time::interval(config.full_sync.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                full_sync_once(&config, transport.as_ref(), &reporter).await;
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

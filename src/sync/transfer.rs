//! External transfer tool invocation.
//!
//! [`RsyncTransport`] builds one rsync command line per task and runs it as a
//! subprocess with a timeout. Exit code 0 is success; anything else, a
//! timeout or a shutdown cancellation is a failure whose message is the
//! captured stderr.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::config::{TargetConfig, TransferConfig};
use crate::error::{Result, SyncError};
use crate::sync::task::{SyncAction, SyncTask};

/// rsync: error starting client-server protocol.
const EXIT_PROTOCOL_START: i32 = 5;
/// rsync: partial transfer due to error.
const EXIT_PARTIAL: i32 = 23;
/// rsync: some source files vanished before they could be transferred.
const EXIT_VANISHED: i32 = 24;

/// Moves content between the watched tree and a target.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Run one task. `cancel` flips to `true` when the daemon gives up
    /// waiting on shutdown; the transfer must stop promptly.
    async fn execute(&self, task: &SyncTask, target: &TargetConfig, cancel: watch::Receiver<bool>) -> Result<()>;

    /// Copy a single remote file from `module` into `dest`.
    async fn fetch(&self, target: &TargetConfig, module: &str, remote_path: &str, dest: &Path) -> Result<()>;

    /// Push the whole tree, deleting what no longer exists locally.
    async fn mirror(&self, target: &TargetConfig) -> Result<()>;
}

/// Transport backed by the rsync binary.
#[derive(Debug, Clone)]
pub struct RsyncTransport {
    config: TransferConfig,
    root: PathBuf,
}

impl RsyncTransport {
    pub fn new(config: TransferConfig, root: impl Into<PathBuf>) -> Self {
        Self {
            config,
            root: root.into(),
        }
    }

    /// `[user@]host::module` (daemon) or `[user@]host:module` (ssh).
    fn remote_base(&self, target: &TargetConfig, module: &str) -> String {
        let user = self
            .config
            .user
            .as_deref()
            .map(|u| format!("{}@", u))
            .unwrap_or_default();
        if self.config.ssh {
            format!("{}{}:{}", user, target.address, module)
        } else {
            format!("{}{}::{}", user, target.address, module)
        }
    }

    fn connection_args(&self) -> Vec<String> {
        let mut args = self.config.common_flags.clone();
        if self.config.ssh {
            args.push("-e".to_string());
            match self.config.port {
                Some(port) => args.push(format!("ssh -p {}", port)),
                None => args.push("ssh".to_string()),
            }
        } else {
            if let Some(port) = self.config.port {
                args.push(format!("--port={}", port));
            }
            if let Some(file) = &self.config.password_file {
                args.push(format!("--password-file={}", file.display()));
            }
        }
        if let Some(timeout) = self.config.timeout {
            args.push(format!("--timeout={}", timeout.as_secs().max(1)));
        }
        if let Some(kbps) = self.config.bwlimit_kbps {
            args.push(format!("--bwlimit={}", kbps));
        }
        args
    }

    /// Arguments for one task, or `None` when nothing needs to run.
    pub fn build_args(&self, task: &SyncTask, target: &TargetConfig) -> Option<Vec<String>> {
        let rel = task.relative_path.trim_matches('/');
        let base = self.remote_base(target, &target.module);
        let mut args = self.connection_args();

        match task.action {
            SyncAction::Push => {
                args.push("-R".to_string());
                if rel.is_empty() {
                    args.push(format!("{}/./", self.root.display()));
                } else {
                    args.push(format!("{}/./{}", self.root.display(), rel));
                }
                args.push(format!("{}/", base));
            }
            SyncAction::Pull => {
                args.push("-R".to_string());
                args.push(format!("{}/./{}", base, rel));
                args.push(format!("{}/", self.root.display()));
            }
            SyncAction::Delete => {
                let (parent, name) = split_parent(rel);
                let local_parent = if parent.is_empty() {
                    self.root.clone()
                } else {
                    self.root.join(parent)
                };
                // A missing parent means an ancestor delete already covers it.
                if !local_parent.is_dir() {
                    return None;
                }
                args.push("--delete".to_string());
                args.push(format!("--include=/{}", name));
                args.push(format!("--include=/{}/**", name));
                args.push("--exclude=*".to_string());
                args.push(format!("{}/", local_parent.display()));
                if parent.is_empty() {
                    args.push(format!("{}/", base));
                } else {
                    args.push(format!("{}/{}/", base, parent));
                }
            }
            SyncAction::DeleteLocal => return None,
        }
        Some(args)
    }

    fn mirror_args(&self, target: &TargetConfig) -> Vec<String> {
        let mut args = self.connection_args();
        args.push("--delete".to_string());
        for pattern in target.excludes.patterns() {
            args.push(format!("--exclude={}", pattern));
        }
        args.push(format!("{}/", self.root.display()));
        args.push(format!("{}/", self.remote_base(target, &target.module)));
        args
    }

    async fn run(
        &self,
        args: Vec<String>,
        target: &TargetConfig,
        path: &str,
        cancel: Option<watch::Receiver<bool>>,
    ) -> std::result::Result<(), Failure> {
        trace!(binary = %self.config.binary, ?args, "spawning transfer");
        let mut child = Command::new(&self.config.binary)
            .args(&args)
            .current_dir(&self.root)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Failure {
                code: None,
                stderr: format!("failed to start {}: {}", self.config.binary, e),
                permanent: e.kind() == std::io::ErrorKind::NotFound,
            })?;

        let stderr = child.stderr.take();
        let stderr_reader = tokio::spawn(async move {
            let mut text = String::new();
            if let Some(mut pipe) = stderr {
                let _ = pipe.read_to_string(&mut text).await;
            }
            text
        });

        let timeout = self.config.timeout;
        let mut cancel = cancel;
        let outcome = tokio::select! {
            status = child.wait() => Outcome::Exited(status),
            _ = sleep_or_forever(timeout) => Outcome::TimedOut,
            _ = cancelled(cancel.as_mut()) => Outcome::Cancelled,
        };

        let aborted = match outcome {
            Outcome::Exited(status) => Ok(status),
            Outcome::TimedOut => Err(format!(
                "timed out after {}ms",
                timeout.map(|t| t.as_millis()).unwrap_or(0)
            )),
            Outcome::Cancelled => Err("cancelled by shutdown".to_string()),
        };
        let status = match aborted {
            Ok(status) => status,
            Err(reason) => {
                let _ = child.kill().await;
                // A grandchild may still hold the pipe open.
                stderr_reader.abort();
                debug!(target_id = %target.id, path, %reason, "transfer aborted");
                return Err(Failure {
                    code: None,
                    stderr: reason,
                    permanent: false,
                });
            }
        };

        let status = status.map_err(|e| Failure {
            code: None,
            stderr: format!("failed to wait for transfer: {}", e),
            permanent: false,
        })?;
        let stderr = stderr_reader.await.unwrap_or_default();

        if status.success() {
            return Ok(());
        }
        let code = status.code();
        let text = stderr.trim().to_string();
        let permanent = code == Some(EXIT_PROTOCOL_START)
            || text.contains("auth failed")
            || text.contains("Unknown module");
        Err(Failure {
            code,
            stderr: if text.is_empty() {
                format!("exited with {}", status)
            } else {
                text
            },
            permanent,
        })
    }
}

#[derive(Debug)]
enum Outcome {
    Exited(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    Cancelled,
}

#[derive(Debug)]
struct Failure {
    code: Option<i32>,
    stderr: String,
    permanent: bool,
}

impl Failure {
    fn into_error(self, target: &TargetConfig, path: &str) -> SyncError {
        if self.permanent {
            SyncError::PermanentTransfer {
                target: target.id.clone(),
                path: path.to_string(),
                message: self.stderr,
            }
        } else {
            SyncError::TransientTransfer {
                target: target.id.clone(),
                path: path.to_string(),
                message: self.stderr,
            }
        }
    }
}

#[async_trait]
impl Transport for RsyncTransport {
    async fn execute(&self, task: &SyncTask, target: &TargetConfig, cancel: watch::Receiver<bool>) -> Result<()> {
        let Some(args) = self.build_args(task, target) else {
            debug!(
                target_id = %target.id,
                path = %task.relative_path,
                action = %task.action,
                "nothing to transfer"
            );
            return Ok(());
        };

        let started = Instant::now();
        let result = self.run(args, target, &task.relative_path, Some(cancel)).await;
        match result {
            Ok(()) => {
                debug!(
                    target_id = %target.id,
                    path = %task.relative_path,
                    action = %task.action,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "transfer complete"
                );
                Ok(())
            }
            Err(failure) if task.action == SyncAction::Delete
                && failure.code == Some(EXIT_PARTIAL)
                && failure.stderr.contains("No such file or directory") =>
            {
                debug!(target_id = %target.id, path = %task.relative_path, "remote path already gone");
                Ok(())
            }
            Err(failure) if task.action == SyncAction::Push && failure.code == Some(EXIT_VANISHED) => {
                debug!(target_id = %target.id, path = %task.relative_path, "source vanished during push");
                Ok(())
            }
            Err(failure) => Err(failure.into_error(target, &task.relative_path)),
        }
    }

    async fn fetch(&self, target: &TargetConfig, module: &str, remote_path: &str, dest: &Path) -> Result<()> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SyncError::io(e, "creating", parent))?;
        }
        let mut args = self.connection_args();
        args.push(format!(
            "{}/{}",
            self.remote_base(target, module),
            remote_path.trim_start_matches('/')
        ));
        args.push(dest.display().to_string());
        self.run(args, target, remote_path, None)
            .await
            .map_err(|f| f.into_error(target, remote_path))
    }

    async fn mirror(&self, target: &TargetConfig) -> Result<()> {
        let args = self.mirror_args(target);
        self.run(args, target, "/", None)
            .await
            .map_err(|f| f.into_error(target, "/"))
    }
}

/// `("a/b", "c")` for `"a/b/c"`, `("", "c")` for `"c"`.
fn split_parent(rel: &str) -> (&str, &str) {
    match rel.rfind('/') {
        Some(idx) => (&rel[..idx], &rel[idx + 1..]),
        None => ("", rel),
    }
}

async fn sleep_or_forever(timeout: Option<std::time::Duration>) {
    match timeout {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending::<()>().await,
    }
}

async fn cancelled(cancel: Option<&mut watch::Receiver<bool>>) {
    let Some(rx) = cancel else {
        return std::future::pending::<()>().await;
    };
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return std::future::pending::<()>().await;
        }
    }
}

//! Copy Driver (C5, §4.5): spawns and supervises the external copy-tool
//! subprocess for one transfer. Grounded in the teacher's
//! `agent_deployer.rs` subprocess-supervision idiom (spawn, stream stdout,
//! classify exit) and its `nix`-based SIGTERM-then-SIGKILL cancellation
//! from `daemon/shutdown.rs`.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;

use crate::error::{EngineError, Result};
use crate::events::{Event, LogLevel, TransferStatus as ProgressStatus};
use crate::events::{ErrorKind, EventBus};
use crate::keymaterial::KeyMaterialStore;
use crate::models::job::{Job, JobOptions};
use crate::models::server::{AuthKind, Server};
use crate::progress::StatefulParser;

const SIGTERM_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferProcessState {
    Pending,
    Starting,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

/// A transfer's terminal result, sent to whoever drives it back into the
/// State Manager/queue (`Engine::run`'s outcome-forwarding task) — the
/// copy driver itself has no reference to `TransferQueue` to avoid an
/// `Arc` cycle (the queue already holds an `Arc<CopyDriver>`).
#[derive(Debug, Clone)]
pub struct TransferOutcome {
    pub transfer_id: String,
    pub job_id: String,
    pub file_id: String,
    pub state: TransferProcessState,
    pub exit_code: Option<i32>,
    pub error_class: Option<String>,
    pub last_stderr_line: Option<String>,
}

pub struct CopyConfig {
    pub source_path: String,
    pub target_path: String,
    pub source_server: Option<Server>,
    pub target_server: Option<Server>,
    pub options: JobOptions,
    pub timeout: Duration,
    pub bwlimit_kbps: Option<u64>,
}

struct ActiveTransfer {
    state: TransferProcessState,
    pid: Option<u32>,
    started: Instant,
    job_id: String,
    file_id: String,
}

/// Classifies rsync/ssh stderr into the taxonomy named in §4.5.
fn classify_error(stderr_tail: &str) -> &'static str {
    let lower = stderr_tail.to_lowercase();
    if lower.contains("no such file") || lower.contains("not found") {
        "file_not_found"
    } else if lower.contains("permission denied") {
        "permission_denied"
    } else if lower.contains("connection refused") || lower.contains("unreachable") {
        "connection_error"
    } else if lower.contains("invalid argument") {
        "invalid_argument"
    } else if lower.contains("ssh") {
        "ssh_error"
    } else if lower.contains("rsync") {
        "rsync_error"
    } else if lower.contains("timeout") {
        "timeout"
    } else {
        "unknown_error"
    }
}

fn ssh_transport_flag(server: &Server, key_path: Option<&std::path::Path>) -> String {
    let mut opts = format!(
        "ssh -p {} -o BatchMode=yes -o StrictHostKeyChecking=no -o UserKnownHostsFile=/dev/null -o Compression=yes -o ConnectTimeout=30 -o ServerAliveInterval=60 -o ServerAliveCountMax=3",
        server.port
    );
    if let Some(path) = key_path {
        opts.push_str(&format!(" -i {}", path.display()));
    }
    opts
}

fn remote_spec(server: &Server, path: &str) -> String {
    format!("{}@{}:{}", server.user, server.host, path)
}

/// Builds the full rsync argv from categorical options, filters, and limits
/// (§4.5); password auth never reaches argv (handled out-of-band via
/// `RSYNC_PASSWORD`/sshpass-equivalent at spawn time, not here).
fn build_argv(config: &CopyConfig, key_path: Option<&std::path::Path>) -> Vec<String> {
    let mut argv = vec![
        "-a".to_string(),
        "-v".to_string(),
        "--progress".to_string(),
        "--partial".to_string(),
        "--stats".to_string(),
        "--human-readable".to_string(),
        "--mkpath".to_string(),
    ];
    if config.options.compress {
        argv.push("-z".into());
    }
    if config.options.dry_run {
        argv.push("-n".into());
    }
    if config.options.delete_extraneous {
        argv.push("--delete".into());
    }
    if let Some(chmod) = &config.options.chmod {
        argv.push(format!("--chmod={chmod}"));
    }
    if let Some(bw) = config.bwlimit_kbps {
        argv.push(format!("--bwlimit={bw}"));
    }
    argv.push(format!("--timeout={}", config.timeout.as_secs()));

    let remote_side = config.source_server.as_ref().or(config.target_server.as_ref());
    if let Some(server) = remote_side {
        argv.push("-e".into());
        argv.push(ssh_transport_flag(server, key_path));
    }

    let source = match &config.source_server {
        Some(srv) => remote_spec(srv, &config.source_path),
        None => config.source_path.clone(),
    };
    let target = match &config.target_server {
        Some(srv) => remote_spec(srv, &config.target_path),
        None => config.target_path.clone(),
    };
    argv.push(source);
    argv.push(target);
    argv
}

pub struct CopyDriver {
    events: Arc<EventBus>,
    keys: Arc<KeyMaterialStore>,
    active: DashMap<String, ActiveTransfer>,
    active_count: AtomicUsize,
    max_concurrent_processes: usize,
    outcomes: mpsc::UnboundedSender<TransferOutcome>,
}

impl CopyDriver {
    pub fn new(
        events: Arc<EventBus>,
        keys: Arc<KeyMaterialStore>,
        max_concurrent_processes: usize,
        outcomes: mpsc::UnboundedSender<TransferOutcome>,
    ) -> Self {
        Self { events, keys, active: DashMap::new(), active_count: AtomicUsize::new(0), max_concurrent_processes, outcomes }
    }

    pub fn list_active(&self) -> Vec<String> {
        self.active.iter().map(|e| e.key().clone()).collect()
    }

    pub fn stats(&self) -> (usize, usize) {
        (self.active_count.load(Ordering::SeqCst), self.max_concurrent_processes)
    }

    fn preflight(config: &CopyConfig) -> Result<()> {
        if which::which("rsync").is_err() {
            return Err(EngineError::Validation("rsync binary not found on PATH".into()));
        }
        if (config.source_server.is_some() || config.target_server.is_some()) && which::which("ssh").is_err() {
            return Err(EngineError::Validation("ssh binary not found on PATH".into()));
        }
        if config.target_server.is_none() {
            let target = std::path::Path::new(&config.target_path);
            let mut ancestor = target.parent();
            while let Some(p) = ancestor {
                if p.exists() {
                    if p.metadata().map(|m| m.permissions().readonly()).unwrap_or(true) {
                        return Err(EngineError::Validation(format!("destination ancestor {} is not writable", p.display())));
                    }
                    break;
                }
                ancestor = p.parent();
            }
        }
        Ok(())
    }

    /// §4.5 `start`: returns once the subprocess has been observed to start
    /// (or failed to). Progress/state continue to update asynchronously via
    /// the event bus and `status()`.
    pub async fn start(
        self: &Arc<Self>,
        job: &Job,
        transfer_id: String,
        file_id: String,
        filename: String,
        config: CopyConfig,
    ) -> Result<String> {
        if self.active_count.load(Ordering::SeqCst) >= self.max_concurrent_processes {
            return Err(EngineError::ResourceExhausted("max_concurrent_processes reached".into()));
        }
        Self::preflight(&config)?;

        self.active.insert(
            transfer_id.clone(),
            ActiveTransfer { state: TransferProcessState::Starting, pid: None, started: Instant::now(), job_id: job.id.clone(), file_id: file_id.clone() },
        );

        let key_path = match config.source_server.as_ref().or(config.target_server.as_ref()) {
            Some(srv) if srv.auth_kind == AuthKind::PrivateKey => Some(self.keys.write(&srv.auth_secret_ref)?),
            _ => None,
        };
        let argv = build_argv(&config, key_path.as_deref());

        let mut cmd = Command::new("rsync");
        cmd.args(&argv).stdout(Stdio::piped()).stderr(Stdio::piped()).kill_on_drop(true);
        if let Some(srv) = config.source_server.as_ref().or(config.target_server.as_ref()) {
            if srv.auth_kind == AuthKind::Password {
                cmd.env("RSYNC_PASSWORD", &srv.auth_secret_ref);
            }
        }

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                self.finish(&transfer_id, TransferProcessState::Failed, None, Some("spawn_error".into()), Some(e.to_string()));
                if let Some(p) = &key_path {
                    self.keys.cleanup(p);
                }
                return Err(EngineError::Spawn(e.to_string()));
            }
        };
        self.active_count.fetch_add(1, Ordering::SeqCst);
        if let Some(mut entry) = self.active.get_mut(&transfer_id) {
            entry.pid = child.id();
            entry.state = TransferProcessState::Running;
        }

        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");
        let driver = Arc::clone(self);
        let job_id = job.id.clone();
        let job_timeout = config.timeout;

        tokio::spawn(async move {
            let stderr_tail: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
            let stderr_tail_writer = Arc::clone(&stderr_tail);
            let stderr_job = job_id.clone();
            let stderr_events = Arc::clone(&driver.events);
            let stderr_task = tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    stderr_events.publish(Event::LogMessage {
                        job_id: Some(stderr_job.clone()),
                        level: LogLevel::Warn,
                        message: line.clone(),
                        source: "copy".into(),
                        ts: chrono::Utc::now(),
                    });
                    let mut tail = stderr_tail_writer.lock().await;
                    tail.push(line);
                    if tail.len() > 20 {
                        tail.remove(0);
                    }
                }
            });

            let started = Instant::now();
            let mut parser = StatefulParser::new();
            let stdout_task = {
                let driver = Arc::clone(&driver);
                let job_id = job_id.clone();
                let transfer_id = transfer_id.clone();
                let file_id = file_id.clone();
                let filename = filename.clone();
                async move {
                    let mut lines = BufReader::new(stdout).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        if let Some(tick) = parser.feed(&line) {
                            driver.events.publish(Event::TransferProgress {
                                transfer_id: transfer_id.clone(),
                                file_id: file_id.clone(),
                                job_id: job_id.clone(),
                                filename: filename.clone(),
                                progress: tick.percent,
                                bytes_transferred: tick.bytes_transferred,
                                total_bytes: tick.bytes_transferred,
                                speed: tick.speed.clone(),
                                speed_bps: 0,
                                eta: tick.eta.clone(),
                                eta_seconds: 0,
                                status: ProgressStatus::Transferring,
                                elapsed_ms: started.elapsed().as_millis() as u64,
                                compression_ratio: None,
                                ts: chrono::Utc::now(),
                            });
                        }
                    }
                }
            };

            let wait_result = timeout(job_timeout, async {
                tokio::join!(stdout_task, stderr_task, child.wait())
            })
            .await;

            let tail_snapshot = stderr_tail.lock().await.join("\n");

            match wait_result {
                Err(_elapsed) => {
                    let _ = child.start_kill();
                    driver.finish(&transfer_id, TransferProcessState::Timeout, None, Some("timeout".into()), Some(tail_snapshot.clone()));
                    driver.events.publish(Event::ErrorOccurred {
                        job_id: Some(job_id),
                        server_id: None,
                        kind: ErrorKind::Transfer,
                        message: "transfer exceeded its configured timeout".into(),
                        details: None,
                        ts: chrono::Utc::now(),
                    });
                }
                Ok((_, _, Ok(status))) => {
                    if status.success() {
                        driver.finish(&transfer_id, TransferProcessState::Completed, status.code(), None, None);
                    } else {
                        let class = classify_error(&tail_snapshot);
                        driver.finish(&transfer_id, TransferProcessState::Failed, status.code(), Some(class.into()), tail_snapshot.lines().last().map(String::from));
                        if matches!(class, "connection_error" | "permission_denied" | "ssh_error" | "rsync_error") {
                            driver.events.publish(Event::ErrorOccurred {
                                job_id: Some(job_id),
                                server_id: None,
                                kind: ErrorKind::Transfer,
                                message: format!("transfer failed: {class}"),
                                details: Some(serde_json::json!({ "stderr_tail": tail_snapshot })),
                                ts: chrono::Utc::now(),
                            });
                        }
                    }
                }
                Ok((_, _, Err(e))) => {
                    driver.finish(&transfer_id, TransferProcessState::Failed, None, Some("spawn_error".into()), Some(e.to_string()));
                }
            }

            if let Some(p) = key_path {
                driver.keys.cleanup(&p);
            }
        });

        Ok(transfer_id)
    }

    /// Updates the in-memory state and forwards the terminal outcome to
    /// whoever is listening on `outcomes` — unless `cancel` already
    /// finalized this transfer and sent its own outcome first.
    fn finish(&self, transfer_id: &str, state: TransferProcessState, exit_code: Option<i32>, error_class: Option<String>, last_stderr_line: Option<String>) {
        let ids = self.active.get_mut(transfer_id).and_then(|mut entry| {
            if entry.state == TransferProcessState::Cancelled {
                return None;
            }
            entry.state = state;
            Some((entry.job_id.clone(), entry.file_id.clone()))
        });
        self.active_count.fetch_sub(1, Ordering::SeqCst);
        if let Some((job_id, file_id)) = ids {
            let _ = self.outcomes.send(TransferOutcome {
                transfer_id: transfer_id.to_string(),
                job_id,
                file_id,
                state,
                exit_code,
                error_class,
                last_stderr_line,
            });
        }
    }

    pub fn status(&self, transfer_id: &str) -> Option<TransferProcessState> {
        self.active.get(transfer_id).map(|e| e.state)
    }

    /// §4.5 `cancel`: SIGTERM, then SIGKILL after a grace period.
    pub async fn cancel(&self, transfer_id: &str) -> bool {
        let pid = match self.active.get(transfer_id) {
            Some(entry) if matches!(entry.state, TransferProcessState::Running | TransferProcessState::Starting) => entry.pid,
            _ => return false,
        };
        let Some(pid) = pid else { return false };
        let nix_pid = Pid::from_raw(pid as i32);
        let _ = signal::kill(nix_pid, Signal::SIGTERM);

        tokio::time::sleep(SIGTERM_GRACE).await;
        if matches!(self.status(transfer_id), Some(TransferProcessState::Running | TransferProcessState::Starting)) {
            let _ = signal::kill(nix_pid, Signal::SIGKILL);
        }

        let Some(mut entry) = self.active.get_mut(transfer_id) else { return true };
        if matches!(
            entry.state,
            TransferProcessState::Completed | TransferProcessState::Failed | TransferProcessState::Cancelled | TransferProcessState::Timeout
        ) {
            return true;
        }
        entry.state = TransferProcessState::Cancelled;
        let job_id = entry.job_id.clone();
        let file_id = entry.file_id.clone();
        drop(entry);
        let _ = self.outcomes.send(TransferOutcome {
            transfer_id: transfer_id.to_string(),
            job_id,
            file_id,
            state: TransferProcessState::Cancelled,
            exit_code: None,
            error_class: None,
            last_stderr_line: None,
        });
        true
    }

    /// Drop bookkeeping for transfers that finished more than `older_than`
    /// ago (§4.5 `cleanup`).
    pub fn cleanup(&self, older_than: Duration) {
        self.active.retain(|_, entry| {
            matches!(entry.state, TransferProcessState::Running | TransferProcessState::Starting | TransferProcessState::Pending)
                || entry.started.elapsed() < older_than
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_known_error_substrings() {
        assert_eq!(classify_error("rsync: No such file or directory"), "file_not_found");
        assert_eq!(classify_error("Permission denied (publickey)"), "permission_denied");
        assert_eq!(classify_error("ssh: connect to host x port 22: Connection refused"), "connection_error");
        assert_eq!(classify_error("some rsync protocol error"), "rsync_error");
        assert_eq!(classify_error("totally unrelated message"), "unknown_error");
    }

    #[test]
    fn argv_omits_password_and_includes_categorical_flags() {
        let config = CopyConfig {
            source_path: "/remote/data".into(),
            target_path: "/local/data".into(),
            source_server: Some(Server {
                id: "s1".into(),
                host: "h".into(),
                port: 22,
                user: "u".into(),
                auth_kind: AuthKind::Password,
                auth_secret_ref: "supersecret".into(),
                torrent_client: None,
                created_at: "now".into(),
                updated_at: "now".into(),
            }),
            target_server: None,
            options: JobOptions::default(),
            timeout: Duration::from_secs(60),
            bwlimit_kbps: Some(500),
        };
        let argv = build_argv(&config, None);
        assert!(argv.iter().any(|a| a == "--bwlimit=500"));
        assert!(!argv.iter().any(|a| a.contains("supersecret")));
        assert!(argv.iter().any(|a| a.starts_with("ssh ")));
    }
}

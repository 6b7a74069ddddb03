//! The root `Engine` value: owns every long-lived subsystem and is built
//! once at boot, replacing the teacher's `AppState` (which held HTTP/UI
//! concerns this daemon doesn't have). No global mutable state — every
//! subsystem reaches the others only through this struct's `Arc` fields.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::concurrency::ConcurrencyController;
use crate::config::AppConfig;
use crate::copydriver::{CopyDriver, TransferOutcome, TransferProcessState};
use crate::db::connection::{self, DbPool};
use crate::error::Result;
use crate::events::EventBus;
use crate::keymaterial::KeyMaterialStore;
use crate::queue::{Priority, TransferQueue};
use crate::recovery::{RecoveryCounters, RecoveryService};
use crate::scanner::Scanner;
use crate::scheduler::Scheduler;
use crate::ssh::RemoteExecutor;
use crate::statemanager::StateManager;

pub struct Engine {
    pub config: AppConfig,
    pub db: DbPool,
    pub events: Arc<EventBus>,
    pub ssh: Arc<RemoteExecutor>,
    pub keys: Arc<KeyMaterialStore>,
    pub concurrency: Arc<ConcurrencyController>,
    pub state: Arc<StateManager>,
    pub copy: Arc<CopyDriver>,
    pub scanner: Arc<Scanner>,
    pub queue: Arc<TransferQueue>,
    pub scheduler: Arc<Scheduler>,
    pub recovery: Arc<RecoveryService>,
    cancel: CancellationToken,
    background: std::sync::Mutex<Vec<JoinHandle<()>>>,
    outcomes: std::sync::Mutex<Option<mpsc::UnboundedReceiver<TransferOutcome>>>,
}

impl Engine {
    pub fn new(config: AppConfig, db: DbPool) -> Arc<Self> {
        let events = Arc::new(EventBus::new());
        let ssh = Arc::new(RemoteExecutor::new());
        let keys = Arc::new(KeyMaterialStore::new("warpsync"));
        let concurrency = Arc::new(ConcurrencyController::new(db.clone()));
        let state = Arc::new(StateManager::new(db.clone(), events.clone()));
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        let copy = Arc::new(CopyDriver::new(events.clone(), keys.clone(), config.max_global_concurrent_processes, outcome_tx));
        let scanner = Arc::new(Scanner::new(db.clone(), ssh.clone(), keys.clone(), events.clone()));
        let queue = Arc::new(TransferQueue::new(db.clone(), concurrency.clone(), state.clone(), copy.clone()));
        let recovery = Arc::new(RecoveryService::new(
            db.clone(),
            state.clone(),
            concurrency.clone(),
            queue.clone(),
            copy.clone(),
            events.clone(),
        ));

        let scanner_for_callback = scanner.clone();
        let queue_for_callback = queue.clone();
        let scheduler = Arc::new(Scheduler::new(db.clone(), scanner.clone(), config.scan_concurrent_max, move |job| {
            let scanner = scanner_for_callback.clone();
            let queue = queue_for_callback.clone();
            let job = job.clone();
            tokio::spawn(async move {
                match scanner.auto_queue_candidates(&job.id, &job.auto_queue) {
                    Ok(candidates) => {
                        for rec in candidates {
                            if let Err(e) = queue.enqueue(&rec.id, &job.id, Priority::Normal, false).await {
                                warn!(job_id = %job.id, file_id = %rec.id, error = %e, "auto-queue enqueue failed");
                            }
                        }
                    }
                    Err(e) => warn!(job_id = %job.id, error = %e, "failed to compute auto-queue candidates"),
                }
            });
        }));

        Arc::new(Self {
            config,
            db,
            events,
            ssh,
            keys,
            concurrency,
            state,
            copy,
            scanner,
            queue,
            scheduler,
            recovery,
            cancel: CancellationToken::new(),
            background: std::sync::Mutex::new(Vec::new()),
            outcomes: std::sync::Mutex::new(Some(outcome_rx)),
        })
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// §4.9 boot sequence, then starts the scheduler and the periodic
    /// queue-reconciliation and recovery-tick background loops.
    pub async fn run(self: &Arc<Self>) -> Result<RecoveryCounters> {
        let counters = self.recovery.run_boot_sequence().await?;
        self.scheduler.start().await?;

        match self.queue.drain_ready().await {
            Ok(dispatched) => info!(dispatched, "initial queue drain"),
            Err(e) => error!(error = %e, "initial queue drain failed"),
        }

        let outcomes_handle = {
            let this = Arc::clone(self);
            let mut rx = self.outcomes.lock().unwrap().take().expect("outcome receiver taken twice");
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = this.cancel.cancelled() => break,
                        outcome = rx.recv() => {
                            let Some(outcome) = outcome else { break };
                            let result = match outcome.state {
                                TransferProcessState::Completed => this.queue.complete(&outcome.job_id, &outcome.file_id).await,
                                TransferProcessState::Cancelled => this.queue.cancel(&outcome.job_id, &outcome.file_id, "cancelled").await,
                                _ => {
                                    let reason = outcome.error_class.clone().unwrap_or_else(|| format!("{:?}", outcome.state));
                                    this.queue.fail(&outcome.job_id, &outcome.file_id, &reason).await
                                }
                            };
                            if let Err(e) = result {
                                error!(transfer_id = %outcome.transfer_id, error = %e, "failed to apply transfer outcome");
                            }
                        }
                    }
                }
            })
        };

        let queue_handle = {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(std::time::Duration::from_millis(this.config.queue_sync_interval_ms));
                loop {
                    tokio::select! {
                        _ = this.cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            match this.queue.sync_with_store().await {
                                Ok(stats) => info!(re_enqueued = stats.re_enqueued, dropped = stats.dropped, "queue reconciled"),
                                Err(e) => error!(error = %e, "queue reconciliation failed"),
                            }
                        }
                    }
                }
            })
        };

        let drain_handle = {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                let mut fallback = tokio::time::interval(std::time::Duration::from_secs(5));
                loop {
                    tokio::select! {
                        _ = this.cancel.cancelled() => break,
                        _ = this.queue.notified() => {}
                        _ = fallback.tick() => {}
                    }
                    match this.queue.drain_ready().await {
                        Ok(dispatched) if dispatched > 0 => info!(dispatched, "queue drained"),
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "queue drain failed"),
                    }
                }
            })
        };

        let recovery_handle = {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(std::time::Duration::from_millis(this.config.recovery_tick_interval_ms));
                loop {
                    tokio::select! {
                        _ = this.cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            if let Err(e) = this.recovery.tick().await {
                                error!(error = %e, "recovery tick failed");
                            }
                            this.ssh.sweep_idle();
                        }
                    }
                }
            })
        };

        self.background.lock().unwrap().extend([outcomes_handle, queue_handle, drain_handle, recovery_handle]);
        Ok(counters)
    }

    /// Graceful shutdown: stop accepting new scan ticks, drain background
    /// loops, and make sure no ephemeral key material survives the process.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.scheduler.stop().await;
        let handles: Vec<_> = self.background.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        self.keys.cleanup_all();
        connection::close_pool(&self.db);
    }
}

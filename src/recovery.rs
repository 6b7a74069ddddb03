//! Recovery Service (C9, §4.9): boot-time and periodic reconciliation of
//! stuck/orphaned transfers and slot bookkeeping. Grounded in the teacher's
//! `db_backup.rs` boot-reconciliation idiom (detect inconsistent rows,
//! force them back to a known-good state, log counters).

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use tracing::info;

use crate::concurrency::ConcurrencyController;
use crate::copydriver::CopyDriver;
use crate::error::{EngineError, Result};
use crate::events::{ErrorKind, Event, EventBus};
use crate::models::file_record::{self, SyncState};
use crate::models::job;
use crate::queue::TransferQueue;
use crate::statemanager::StateManager;

const STUCK_THRESHOLD: ChronoDuration = ChronoDuration::minutes(30);

#[derive(Debug, Default, Clone)]
pub struct RecoveryCounters {
    pub total: usize,
    pub stuck: usize,
    pub orphaned: usize,
    pub recovered: usize,
    pub failures: usize,
    pub released_slots: usize,
}

pub struct RecoveryService {
    pool: Pool<SqliteConnectionManager>,
    state: Arc<StateManager>,
    concurrency: Arc<ConcurrencyController>,
    queue: Arc<TransferQueue>,
    copy: Arc<CopyDriver>,
    events: Arc<EventBus>,
}

impl RecoveryService {
    pub fn new(
        pool: Pool<SqliteConnectionManager>,
        state: Arc<StateManager>,
        concurrency: Arc<ConcurrencyController>,
        queue: Arc<TransferQueue>,
        copy: Arc<CopyDriver>,
        events: Arc<EventBus>,
    ) -> Self {
        Self { pool, state, concurrency, queue, copy, events }
    }

    /// Steps 1-3 of §4.9, shared by the boot sequence and the 5-min tick.
    fn reconcile(&self, counters: &mut RecoveryCounters) -> Result<()> {
        let conn = self.pool.get().map_err(|e| EngineError::System(e.to_string()))?;
        let cutoff = (Utc::now() - STUCK_THRESHOLD).to_rfc3339();

        // Step 1: stuck transfers.
        let stuck = file_record::find_stale_non_terminal(&conn, &cutoff).map_err(EngineError::from)?;
        for rec in &stuck {
            counters.total += 1;
            counters.stuck += 1;
            if let Some(slot) = rec.transfer.job_concurrency_slot {
                self.concurrency.release(&rec.job_id, slot);
                counters.released_slots += 1;
            }
            let applied = self
                .state
                .reset(&rec.id, SyncState::Failed, "stuck_transfer", true)
                .unwrap_or(false);
            if applied {
                counters.recovered += 1;
                self.events.publish(Event::ErrorOccurred {
                    job_id: Some(rec.job_id.clone()),
                    server_id: None,
                    kind: ErrorKind::Transfer,
                    message: format!("transfer for {} stuck past {:?}, marked failed", rec.relative_path, STUCK_THRESHOLD),
                    details: Some(serde_json::json!({ "file_id": rec.id, "reason": "stuck_transfer" })),
                    ts: Utc::now(),
                });
            } else {
                counters.failures += 1;
            }
        }

        // Step 2: orphaned transfers (bound to a transfer_id, no live process).
        let active: std::collections::HashSet<String> = self.copy.list_active().into_iter().collect();
        let mut orphan_candidates = Vec::new();
        for job in job::find_all(&conn).map_err(EngineError::from)? {
            orphan_candidates.extend(
                file_record::find_by_job_and_state(&conn, &job.id, SyncState::Transferring).map_err(EngineError::from)?,
            );
        }
        for rec in orphan_candidates {
            let bound = rec.transfer.active_transfer_id.clone();
            let is_orphaned = match &bound {
                Some(tid) => !active.contains(tid),
                None => true,
            };
            if !is_orphaned {
                continue;
            }
            counters.total += 1;
            counters.orphaned += 1;
            if let Some(slot) = rec.transfer.job_concurrency_slot {
                self.concurrency.release(&rec.job_id, slot);
                counters.released_slots += 1;
            }
            let applied = self
                .state
                .reset(&rec.id, SyncState::RemoteOnly, "orphaned_transfer", true)
                .unwrap_or(false);
            if applied {
                counters.recovered += 1;
            } else {
                counters.failures += 1;
            }
        }

        // Step 3: validate slots against current sync_state and per-job max.
        for job in job::find_all(&conn).map_err(EngineError::from)? {
            let holders = file_record::find_holding_slots(&conn, &job.id).map_err(EngineError::from)?;
            for rec in &holders {
                if !rec.sync_state.holds_slot() {
                    if let Some(slot) = rec.transfer.job_concurrency_slot {
                        self.concurrency.release(&job.id, slot);
                        counters.released_slots += 1;
                    }
                }
            }
            let max = job.parallelism.max_concurrent_transfers as usize;
            if let Some(info) = self.concurrency.slot_info(&job.id) {
                if info.used > max {
                    let mut excess: Vec<_> = holders.iter().filter(|r| r.sync_state.holds_slot()).collect();
                    excess.sort_by(|a, b| a.added_at.cmp(&b.added_at));
                    for rec in excess.into_iter().take(info.used - max) {
                        if let Some(slot) = rec.transfer.job_concurrency_slot {
                            self.concurrency.release(&job.id, slot);
                            counters.released_slots += 1;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// §4.9 full boot sequence: reconcile, then rebuild the queue's
    /// in-memory view, then log `recovery_complete`.
    pub async fn run_boot_sequence(&self) -> Result<RecoveryCounters> {
        let mut counters = RecoveryCounters::default();
        self.reconcile(&mut counters)?;
        self.concurrency.sync_with_store()?;
        self.queue.initialize_from_store().await?;

        info!(
            total = counters.total,
            stuck = counters.stuck,
            orphaned = counters.orphaned,
            recovered = counters.recovered,
            failures = counters.failures,
            released_slots = counters.released_slots,
            "recovery_complete"
        );
        Ok(counters)
    }

    /// Periodic 5-min tick: steps 1-3 only, no queue rebuild.
    pub async fn tick(&self) -> Result<RecoveryCounters> {
        let mut counters = RecoveryCounters::default();
        self.reconcile(&mut counters)?;
        Ok(counters)
    }

    /// Operator-invoked `emergency_reset` (§4.9): every non-terminal record
    /// forced back to `remote_only`, all transfer fields cleared.
    pub fn emergency_reset(&self) -> Result<usize> {
        let conn = self.pool.get().map_err(|e| EngineError::System(e.to_string()))?;
        let mut reset_count = 0;
        for job in job::find_all(&conn).map_err(EngineError::from)? {
            for state in [SyncState::Queued, SyncState::Transferring, SyncState::Failed, SyncState::Desynced] {
                for rec in file_record::find_by_job_and_state(&conn, &job.id, state).map_err(EngineError::from)? {
                    if let Some(slot) = rec.transfer.job_concurrency_slot {
                        self.concurrency.release(&job.id, slot);
                    }
                    if self.state.reset(&rec.id, SyncState::RemoteOnly, "emergency_reset", true).unwrap_or(false) {
                        reset_count += 1;
                    }
                }
            }
        }
        Ok(reset_count)
    }
}

//! State Manager (C6, §4.6): the single place that mutates `FileRecord`
//! sync state, enforcing the permitted-transition table and emitting
//! `file:state:update` / `transfer:status`. Grounded in the teacher's
//! db-backed mutation idiom (read, check, single guarded `UPDATE`) seen
//! across its `models/` layer.

use chrono::Utc;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;

use crate::error::{EngineError, Result};
use crate::events::{Event, EventBus};
use crate::models::file_record::{self, FileRecord, HistoryEntry, SyncState};

pub struct TransitionOptions {
    pub transfer_id: Option<String>,
    pub reason: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub force: bool,
    /// The concurrency slot reserved for this transfer. Only consumed when
    /// `target == Transferring`; §8's invariant requires
    /// `job_concurrency_slot` to be set whenever `sync_state == transferring`.
    pub slot: Option<i64>,
}

impl Default for TransitionOptions {
    fn default() -> Self {
        Self { transfer_id: None, reason: None, metadata: None, force: false, slot: None }
    }
}

fn permitted(from: SyncState, to: SyncState) -> bool {
    use SyncState::*;
    if from == to {
        return true;
    }
    matches!(
        (from, to),
        (RemoteOnly, Queued)
            | (RemoteOnly, Failed)
            | (Queued, Transferring)
            | (Queued, Failed)
            | (Queued, RemoteOnly)
            | (Transferring, Synced)
            | (Transferring, Failed)
            | (Transferring, Queued)
            | (Failed, Queued)
            | (Failed, RemoteOnly)
            | (Synced, Desynced)
            | (Synced, Failed)
            | (Desynced, Queued)
            | (Desynced, Failed)
            | (LocalOnly, Failed)
    )
}

pub struct StateManager {
    pool: Pool<SqliteConnectionManager>,
    events: std::sync::Arc<EventBus>,
}

impl StateManager {
    pub fn new(pool: Pool<SqliteConnectionManager>, events: std::sync::Arc<EventBus>) -> Self {
        Self { pool, events }
    }

    fn apply_entry_effects(rec: &mut FileRecord, to: SyncState, slot: Option<i64>) {
        let now = Utc::now().to_rfc3339();
        match to {
            SyncState::Transferring => {
                rec.transfer.started_at = Some(now.clone());
                rec.transfer.progress = 0;
                rec.transfer.job_concurrency_slot = slot;
            }
            SyncState::Synced => {
                rec.transfer.progress = 100;
                rec.transfer.completed_at = Some(now.clone());
                rec.transfer.job_concurrency_slot = None;
                rec.local.exists = true;
                rec.local.size = rec.remote.size;
                rec.local.mtime = rec.remote.mtime;
            }
            SyncState::Failed => {
                rec.transfer.completed_at = Some(now.clone());
                rec.transfer.retry_count += 1;
                rec.transfer.job_concurrency_slot = None;
            }
            _ => {
                rec.transfer.job_concurrency_slot = None;
            }
        }
        rec.transfer.last_state_change = Some(now);
    }

    /// §4.6 `transition`: guarded single-row compare-and-swap plus the
    /// associated events. Returns `false` (not an error) when the transition
    /// was rejected by the permitted-transition table.
    pub fn transition(&self, file_id: &str, target: SyncState, opts: TransitionOptions) -> Result<bool> {
        let conn = self.pool.get().map_err(|e| EngineError::System(e.to_string()))?;
        let Some(mut rec) = file_record::find_by_id(&conn, file_id).map_err(EngineError::from)? else {
            return Err(EngineError::NotFound(format!("file record {file_id} not found")));
        };

        if !opts.force && !permitted(rec.sync_state, target) {
            return Ok(false);
        }

        let old_state = rec.sync_state;
        if let Some(tid) = &opts.transfer_id {
            rec.transfer.active_transfer_id = Some(tid.clone());
        }
        Self::apply_entry_effects(&mut rec, target, opts.slot);
        rec.transfer.push_history(HistoryEntry {
            from: old_state.as_str().to_string(),
            to: target.as_str().to_string(),
            ts: Utc::now().to_rfc3339(),
            reason: opts.reason.clone(),
            metadata: opts.metadata.clone(),
        });

        let last_seen = Utc::now().to_rfc3339();
        let applied = file_record::compare_and_swap_state(&conn, file_id, old_state, target, &rec.transfer, &rec.local, &last_seen)
            .map_err(EngineError::from)?;
        if !applied {
            return Ok(false);
        }

        self.events.publish(Event::FileStateUpdate {
            job_id: rec.job_id.clone(),
            file_id: rec.id.clone(),
            filename: rec.filename.clone(),
            relative_path: rec.relative_path.clone(),
            old_state: old_state.as_str().to_string(),
            new_state: target.as_str().to_string(),
            ts: Utc::now(),
        });
        if let Some(transfer_id) = rec.transfer.active_transfer_id.clone() {
            self.events.publish(Event::TransferStatus {
                transfer_id,
                file_id: rec.id,
                job_id: rec.job_id,
                filename: rec.filename,
                old_status: old_state.as_str().to_string(),
                new_status: target.as_str().to_string(),
                ts: Utc::now(),
                metadata: opts.metadata,
            });
        }
        Ok(true)
    }

    /// §4.6 `mark_failed`: convenience wrapper binding an error message as
    /// the transition reason.
    pub fn mark_failed(&self, file_id: &str, err: &str, transfer_id: Option<String>) -> Result<bool> {
        self.transition(
            file_id,
            SyncState::Failed,
            TransitionOptions { transfer_id, reason: Some(err.to_string()), metadata: None, force: false, slot: None },
        )
    }

    /// §4.6 `reset`: force a record to `target`, optionally clearing
    /// transfer-scoped fields (used by Recovery).
    pub fn reset(&self, file_id: &str, target: SyncState, reason: &str, clear_transfer_fields: bool) -> Result<bool> {
        let conn = self.pool.get().map_err(|e| EngineError::System(e.to_string()))?;
        let Some(mut rec) = file_record::find_by_id(&conn, file_id).map_err(EngineError::from)? else {
            return Err(EngineError::NotFound(format!("file record {file_id} not found")));
        };
        let old_state = rec.sync_state;

        if clear_transfer_fields {
            rec.transfer.active_transfer_id = None;
            rec.transfer.job_concurrency_slot = None;
            rec.transfer.progress = 0;
            rec.transfer.speed = None;
            rec.transfer.eta = None;
        }
        rec.transfer.push_history(HistoryEntry {
            from: old_state.as_str().to_string(),
            to: target.as_str().to_string(),
            ts: Utc::now().to_rfc3339(),
            reason: Some(reason.to_string()),
            metadata: None,
        });
        rec.transfer.last_state_change = Some(Utc::now().to_rfc3339());

        let local = rec.local;
        let last_seen = Utc::now().to_rfc3339();
        let applied = file_record::force_state(&conn, file_id, target, &rec.transfer, &local, &last_seen)
            .map_err(EngineError::from)?;

        if applied {
            self.events.publish(Event::FileStateUpdate {
                job_id: rec.job_id,
                file_id: rec.id,
                filename: rec.filename,
                relative_path: rec.relative_path,
                old_state: old_state.as_str().to_string(),
                new_state: target.as_str().to_string(),
                ts: Utc::now(),
            });
        }
        Ok(applied)
    }

    pub fn history(&self, file_id: &str, limit: usize) -> Result<Vec<HistoryEntry>> {
        let conn = self.pool.get().map_err(|e| EngineError::System(e.to_string()))?;
        let Some(rec) = file_record::find_by_id(&conn, file_id).map_err(EngineError::from)? else {
            return Err(EngineError::NotFound(format!("file record {file_id} not found")));
        };
        let mut entries = rec.transfer.state_history;
        if entries.len() > limit {
            let start = entries.len() - limit;
            entries.drain(0..start);
        }
        Ok(entries)
    }

    /// Apply several transitions in sequence, collecting the per-id result
    /// rather than aborting the batch on the first rejection.
    pub fn batch_transition(&self, items: Vec<(String, SyncState, TransitionOptions)>) -> Vec<(String, Result<bool>)> {
        items
            .into_iter()
            .map(|(file_id, target, opts)| {
                let result = self.transition(&file_id, target, opts);
                (file_id, result)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permitted_table_matches_spec() {
        assert!(permitted(SyncState::RemoteOnly, SyncState::Queued));
        assert!(permitted(SyncState::Queued, SyncState::Transferring));
        assert!(permitted(SyncState::Transferring, SyncState::Synced));
        assert!(permitted(SyncState::Synced, SyncState::Desynced));
        assert!(permitted(SyncState::Desynced, SyncState::Queued));
        assert!(permitted(SyncState::Failed, SyncState::Queued));
        assert!(!permitted(SyncState::RemoteOnly, SyncState::Synced));
        assert!(!permitted(SyncState::LocalOnly, SyncState::Synced));
    }

    #[test]
    fn identity_transition_always_permitted() {
        assert!(permitted(SyncState::Synced, SyncState::Synced));
        assert!(permitted(SyncState::Failed, SyncState::Failed));
    }
}

//! FileRecord entity (§3): one row per path observed for a job.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

pub const MAX_HISTORY: usize = 10;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Synced,
    RemoteOnly,
    LocalOnly,
    Desynced,
    Queued,
    Transferring,
    Failed,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Synced => "synced",
            SyncState::RemoteOnly => "remote_only",
            SyncState::LocalOnly => "local_only",
            SyncState::Desynced => "desynced",
            SyncState::Queued => "queued",
            SyncState::Transferring => "transferring",
            SyncState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "synced" => SyncState::Synced,
            "remote_only" => SyncState::RemoteOnly,
            "local_only" => SyncState::LocalOnly,
            "desynced" => SyncState::Desynced,
            "queued" => SyncState::Queued,
            "transferring" => SyncState::Transferring,
            "failed" => SyncState::Failed,
            _ => return None,
        })
    }

    /// Slots are held only across these two states (§3 Lifecycle).
    pub fn holds_slot(&self) -> bool {
        matches!(self, SyncState::Queued | SyncState::Transferring)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq)]
pub struct SideMeta {
    pub exists: bool,
    pub size: Option<u64>,
    pub mtime: Option<i64>,
    pub is_directory: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub from: String,
    pub to: String,
    pub ts: String,
    pub reason: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TransferState {
    pub progress: u8,
    pub speed: Option<String>,
    pub eta: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub active_transfer_id: Option<String>,
    pub job_concurrency_slot: Option<i64>,
    pub last_state_change: Option<String>,
    #[serde(default)]
    pub state_history: Vec<HistoryEntry>,
}

impl TransferState {
    pub fn push_history(&mut self, entry: HistoryEntry) {
        self.state_history.push(entry);
        let len = self.state_history.len();
        if len > MAX_HISTORY {
            self.state_history.drain(0..len - MAX_HISTORY);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: String,
    pub job_id: String,
    pub relative_path: String,
    pub filename: String,
    pub is_directory: bool,
    pub parent_path: String,
    pub remote: SideMeta,
    pub local: SideMeta,
    pub sync_state: SyncState,
    pub transfer: TransferState,
    pub directory_size: i64,
    pub file_count: i64,
    pub last_seen: String,
    pub added_at: String,
}

/// Equality rule (§3): synced iff sizes match exactly and mtimes are within 2s.
pub fn is_synced(remote: &SideMeta, local: &SideMeta) -> bool {
    match (remote.size, local.size, remote.mtime, local.mtime) {
        (Some(rs), Some(ls), Some(rm), Some(lm)) => rs == ls && (rm - lm).abs() < 2,
        _ => false,
    }
}

fn row_to_record(row: &Row) -> rusqlite::Result<FileRecord> {
    let remote_json: String = row.get("remote_json")?;
    let local_json: String = row.get("local_json")?;
    let transfer_json: String = row.get("transfer_json")?;
    let sync_state_s: String = row.get("sync_state")?;
    Ok(FileRecord {
        id: row.get("id")?,
        job_id: row.get("job_id")?,
        relative_path: row.get("relative_path")?,
        filename: row.get("filename")?,
        is_directory: row.get::<_, i64>("is_directory")? != 0,
        parent_path: row.get("parent_path")?,
        remote: serde_json::from_str(&remote_json).unwrap_or_default(),
        local: serde_json::from_str(&local_json).unwrap_or_default(),
        sync_state: SyncState::parse(&sync_state_s).unwrap_or(SyncState::RemoteOnly),
        transfer: serde_json::from_str(&transfer_json).unwrap_or_default(),
        directory_size: row.get("directory_size")?,
        file_count: row.get("file_count")?,
        last_seen: row.get("last_seen")?,
        added_at: row.get("added_at")?,
    })
}

pub fn find_by_id(conn: &Connection, id: &str) -> anyhow::Result<Option<FileRecord>> {
    let mut stmt = conn.prepare("SELECT * FROM files WHERE id = ?")?;
    Ok(stmt.query_row(params![id], row_to_record).optional()?)
}

pub fn find_by_job_and_path(
    conn: &Connection,
    job_id: &str,
    relative_path: &str,
) -> anyhow::Result<Option<FileRecord>> {
    let mut stmt = conn.prepare("SELECT * FROM files WHERE job_id = ?1 AND relative_path = ?2")?;
    Ok(stmt
        .query_row(params![job_id, relative_path], row_to_record)
        .optional()?)
}

pub fn find_by_job(conn: &Connection, job_id: &str) -> anyhow::Result<Vec<FileRecord>> {
    let mut stmt = conn.prepare("SELECT * FROM files WHERE job_id = ?")?;
    let rows = stmt.query_map(params![job_id], row_to_record)?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub fn find_by_job_and_state(
    conn: &Connection,
    job_id: &str,
    state: SyncState,
) -> anyhow::Result<Vec<FileRecord>> {
    let mut stmt = conn.prepare("SELECT * FROM files WHERE job_id = ?1 AND sync_state = ?2")?;
    let rows = stmt.query_map(params![job_id, state.as_str()], row_to_record)?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub fn find_stale_non_terminal(
    conn: &Connection,
    older_than: &str,
) -> anyhow::Result<Vec<FileRecord>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM files WHERE sync_state IN ('queued','transferring')
           AND json_extract(transfer_json, '$.last_state_change') < ?1",
    )?;
    let rows = stmt.query_map(params![older_than], row_to_record)?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub fn find_holding_slots(conn: &Connection, job_id: &str) -> anyhow::Result<Vec<FileRecord>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM files WHERE job_id = ?1 AND json_extract(transfer_json, '$.job_concurrency_slot') IS NOT NULL",
    )?;
    let rows = stmt.query_map(params![job_id], row_to_record)?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub fn insert(conn: &Connection, rec: &FileRecord) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO files (id, job_id, relative_path, filename, is_directory, parent_path,
            remote_json, local_json, sync_state, transfer_json, directory_size, file_count,
            last_seen, added_at)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14)",
        params![
            rec.id,
            rec.job_id,
            rec.relative_path,
            rec.filename,
            rec.is_directory as i64,
            rec.parent_path,
            serde_json::to_string(&rec.remote)?,
            serde_json::to_string(&rec.local)?,
            rec.sync_state.as_str(),
            serde_json::to_string(&rec.transfer)?,
            rec.directory_size,
            rec.file_count,
            rec.last_seen,
            rec.added_at,
        ],
    )?;
    Ok(())
}

pub fn update_meta(conn: &Connection, rec: &FileRecord) -> anyhow::Result<()> {
    conn.execute(
        "UPDATE files SET filename=?2, is_directory=?3, parent_path=?4, remote_json=?5, local_json=?6,
            sync_state=?7, last_seen=?8 WHERE id=?1",
        params![
            rec.id,
            rec.filename,
            rec.is_directory as i64,
            rec.parent_path,
            serde_json::to_string(&rec.remote)?,
            serde_json::to_string(&rec.local)?,
            rec.sync_state.as_str(),
            rec.last_seen,
        ],
    )?;
    Ok(())
}

pub fn update_directory_aggregates(
    conn: &Connection,
    id: &str,
    directory_size: i64,
    file_count: i64,
) -> anyhow::Result<()> {
    conn.execute(
        "UPDATE files SET directory_size = ?1, file_count = ?2 WHERE id = ?3",
        params![directory_size, file_count, id],
    )?;
    Ok(())
}

/// Atomic transition primitive for the State Manager (§4.6): the `WHERE`
/// clause's `sync_state = ?` guard makes this a single findAndUpdate-style
/// compare-and-swap, so a concurrent conflicting transition loses cleanly
/// instead of being overwritten silently.
pub fn compare_and_swap_state(
    conn: &Connection,
    id: &str,
    expected_old: SyncState,
    new_state: SyncState,
    transfer: &TransferState,
    local: &SideMeta,
    last_seen: &str,
) -> anyhow::Result<bool> {
    let changed = conn.execute(
        "UPDATE files SET sync_state = ?1, transfer_json = ?2, local_json = ?3, last_seen = ?4
         WHERE id = ?5 AND sync_state = ?6",
        params![
            new_state.as_str(),
            serde_json::to_string(transfer)?,
            serde_json::to_string(local)?,
            last_seen,
            id,
            expected_old.as_str(),
        ],
    )?;
    Ok(changed > 0)
}

/// Force a transition regardless of current state (Recovery only, §4.9).
pub fn force_state(
    conn: &Connection,
    id: &str,
    new_state: SyncState,
    transfer: &TransferState,
    local: &SideMeta,
    last_seen: &str,
) -> anyhow::Result<bool> {
    let changed = conn.execute(
        "UPDATE files SET sync_state = ?1, transfer_json = ?2, local_json = ?3, last_seen = ?4 WHERE id = ?5",
        params![
            new_state.as_str(),
            serde_json::to_string(transfer)?,
            serde_json::to_string(local)?,
            last_seen,
            id,
        ],
    )?;
    Ok(changed > 0)
}

pub fn delete_not_seen_since(conn: &Connection, job_id: &str, since: &str) -> anyhow::Result<usize> {
    Ok(conn.execute(
        "DELETE FROM files WHERE job_id = ?1 AND last_seen < ?2",
        params![job_id, since],
    )?)
}

pub fn delete_by_id(conn: &Connection, id: &str) -> anyhow::Result<bool> {
    Ok(conn.execute("DELETE FROM files WHERE id = ?", params![id])? > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_rule_matches_spec() {
        let remote = SideMeta { exists: true, size: Some(100), mtime: Some(1_000), is_directory: Some(false) };
        let mut local = remote;
        assert!(is_synced(&remote, &local));
        local.mtime = Some(1_001);
        assert!(is_synced(&remote, &local));
        local.mtime = Some(1_002);
        assert!(!is_synced(&remote, &local));
        local.mtime = Some(1_000);
        local.size = Some(101);
        assert!(!is_synced(&remote, &local));
    }

    #[test]
    fn history_ring_buffer_caps_at_ten() {
        let mut t = TransferState::default();
        for i in 0..15 {
            t.push_history(HistoryEntry {
                from: "a".into(),
                to: "b".into(),
                ts: i.to_string(),
                reason: None,
                metadata: None,
            });
        }
        assert_eq!(t.state_history.len(), MAX_HISTORY);
        assert_eq!(t.state_history.first().unwrap().ts, "5");
    }
}

use crate::db::connection::DbPool;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS servers (
  id TEXT PRIMARY KEY,
  host TEXT NOT NULL,
  port INTEGER NOT NULL DEFAULT 22,
  user TEXT NOT NULL,
  auth_kind TEXT NOT NULL CHECK(auth_kind IN ('password','private_key')),
  auth_secret_ref TEXT NOT NULL,
  torrent_client_json TEXT,
  created_at TEXT NOT NULL DEFAULT (datetime('now')),
  updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS jobs (
  id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  source_server TEXT REFERENCES servers(id) ON DELETE CASCADE,
  target_kind TEXT NOT NULL DEFAULT 'local' CHECK(target_kind IN ('local','server')),
  target_server TEXT REFERENCES servers(id) ON DELETE CASCADE,
  source_path TEXT NOT NULL,
  target_path TEXT NOT NULL,
  direction TEXT NOT NULL DEFAULT 'download' CHECK(direction IN ('download','upload','bidirectional')),
  enabled INTEGER NOT NULL DEFAULT 1,
  scan_interval_minutes INTEGER NOT NULL DEFAULT 60,
  options_json TEXT NOT NULL DEFAULT '{}',
  retries_max INTEGER NOT NULL DEFAULT 3,
  retries_delay_ms INTEGER NOT NULL DEFAULT 5000,
  max_concurrent_transfers INTEGER NOT NULL DEFAULT 2,
  max_connections_per_transfer INTEGER NOT NULL DEFAULT 1,
  auto_queue_json TEXT NOT NULL DEFAULT '{}',
  post_action_json TEXT NOT NULL DEFAULT '{}',
  last_scan_at TEXT,
  created_at TEXT NOT NULL DEFAULT (datetime('now')),
  updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS files (
  id TEXT PRIMARY KEY,
  job_id TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
  relative_path TEXT NOT NULL,
  filename TEXT NOT NULL,
  is_directory INTEGER NOT NULL DEFAULT 0,
  parent_path TEXT NOT NULL DEFAULT '',
  remote_json TEXT NOT NULL DEFAULT '{"exists":false}',
  local_json TEXT NOT NULL DEFAULT '{"exists":false}',
  sync_state TEXT NOT NULL DEFAULT 'remote_only',
  transfer_json TEXT NOT NULL DEFAULT '{"progress":0,"retry_count":0,"state_history":[]}',
  directory_size INTEGER NOT NULL DEFAULT 0,
  file_count INTEGER NOT NULL DEFAULT 0,
  last_seen TEXT NOT NULL DEFAULT (datetime('now')),
  added_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_files_job_relpath ON files(job_id, relative_path);
CREATE INDEX IF NOT EXISTS idx_files_job ON files(job_id);
CREATE INDEX IF NOT EXISTS idx_files_sync_state ON files(sync_state);
CREATE INDEX IF NOT EXISTS idx_files_last_seen ON files(last_seen);
CREATE INDEX IF NOT EXISTS idx_files_job_state ON files(job_id, sync_state);
CREATE INDEX IF NOT EXISTS idx_files_retry_count ON files(sync_state, json_extract(transfer_json, '$.retry_count'));
CREATE INDEX IF NOT EXISTS idx_files_active_transfer ON files(json_extract(transfer_json, '$.active_transfer_id'))
  WHERE json_extract(transfer_json, '$.active_transfer_id') IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_files_job_state_slot ON files(job_id, sync_state, json_extract(transfer_json, '$.job_concurrency_slot'));
CREATE INDEX IF NOT EXISTS idx_files_last_state_change ON files(json_extract(transfer_json, '$.last_state_change'));
"#;

/// Create the schema if absent and apply additive, idempotent migrations.
/// Mirrors the teacher's `PRAGMA table_info`-guarded `ALTER TABLE` pattern so
/// new columns can be added across versions without a migration runner.
pub fn migrate(pool: &DbPool) -> anyhow::Result<()> {
    tracing::info!("[DB] starting database migration");

    let conn = pool.get()?;
    conn.execute_batch(SCHEMA)?;

    let has_column = |table: &str, column: &str| -> bool {
        let mut stmt = conn
            .prepare(&format!("PRAGMA table_info({table})"))
            .unwrap();
        let columns: Vec<String> = stmt
            .query_map([], |row| row.get::<_, String>(1))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();
        columns.contains(&column.to_string())
    };

    if !has_column("files", "directory_size") {
        conn.execute_batch(
            "ALTER TABLE files ADD COLUMN directory_size INTEGER NOT NULL DEFAULT 0",
        )?;
    }
    if !has_column("jobs", "last_scan_at") {
        conn.execute_batch("ALTER TABLE jobs ADD COLUMN last_scan_at TEXT")?;
    }

    tracing::info!("[DB] migration completed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use r2d2::Pool;
    use r2d2_sqlite::SqliteConnectionManager;

    #[test]
    fn migrate_is_idempotent() {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder().max_size(1).build(manager).unwrap();
        migrate(&pool).unwrap();
        migrate(&pool).unwrap();

        let conn = pool.get().unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type='table' AND name='files'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }
}

//! Job entity (§3) and its validation rules.

use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Download,
    Upload,
    Bidirectional,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Download => "download",
            Direction::Upload => "upload",
            Direction::Bidirectional => "bidirectional",
        }
    }

    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s {
            "download" => Ok(Direction::Download),
            "upload" => Ok(Direction::Upload),
            "bidirectional" => Ok(Direction::Bidirectional),
            other => anyhow::bail!("unknown direction: {other}"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Local,
    Server,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::Local => "local",
            TargetKind::Server => "server",
        }
    }

    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s {
            "local" => Ok(TargetKind::Local),
            "server" => Ok(TargetKind::Server),
            other => anyhow::bail!("unknown target_kind: {other}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOptions {
    #[serde(default)]
    pub delete_extraneous: bool,
    #[serde(default)]
    pub preserve_timestamps: bool,
    #[serde(default)]
    pub preserve_permissions: bool,
    #[serde(default)]
    pub compress: bool,
    #[serde(default)]
    pub dry_run: bool,
    pub chmod: Option<String>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            delete_extraneous: false,
            preserve_timestamps: true,
            preserve_permissions: true,
            compress: false,
            dry_run: false,
            chmod: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max: u32,
    pub delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max: 3, delay_ms: 5_000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Parallelism {
    pub max_concurrent_transfers: u32,
    pub max_connections_per_transfer: u32,
}

impl Default for Parallelism {
    fn default() -> Self {
        Self {
            max_concurrent_transfers: 2,
            max_connections_per_transfer: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AutoQueueConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub include_patterns: Vec<String>,
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
    pub min_size: Option<u64>,
    pub max_size: Option<u64>,
    #[serde(default)]
    pub include_extensions: Vec<String>,
    #[serde(default)]
    pub exclude_extensions: Vec<String>,
    #[serde(default)]
    pub case_sensitive: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PostActionKind {
    None,
    Remove,
    RemoveData,
    SetLabel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostTransferAction {
    pub kind: PostActionKind,
    pub delay_minutes: u32,
    pub label: Option<String>,
}

impl Default for PostTransferAction {
    fn default() -> Self {
        Self {
            kind: PostActionKind::None,
            delay_minutes: 0,
            label: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub name: String,
    pub source_server: Option<String>,
    pub target_kind: TargetKind,
    pub target_server: Option<String>,
    pub source_path: String,
    pub target_path: String,
    pub direction: Direction,
    pub enabled: bool,
    pub scan_interval_minutes: u32,
    pub options: JobOptions,
    pub retries: RetryPolicy,
    pub parallelism: Parallelism,
    pub auto_queue: AutoQueueConfig,
    pub post_action: PostTransferAction,
    pub last_scan_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Job {
    /// Enforces every per-field bound in §3 and §8's boundary behaviors.
    pub fn validate(&self) -> Result<()> {
        if self.source_server.is_some()
            && self.target_kind == TargetKind::Server
            && self.source_server == self.target_server
        {
            return Err(EngineError::Validation(
                "source_server must differ from target_server".into(),
            ));
        }
        if self.target_kind == TargetKind::Local && self.direction != Direction::Download {
            return Err(EngineError::Validation(
                "local targets only support the download direction".into(),
            ));
        }
        if !(5..=10080).contains(&self.scan_interval_minutes) {
            return Err(EngineError::Validation(
                "scan_interval_minutes must be in [5, 10080]".into(),
            ));
        }
        if let Some(ref chmod) = self.options.chmod {
            let valid = chmod.len() >= 3
                && chmod.len() <= 4
                && chmod.chars().all(|c| ('0'..='7').contains(&c));
            if !valid {
                return Err(EngineError::Validation(
                    "chmod must match ^[0-7]{3,4}$".into(),
                ));
            }
        }
        if self.retries.max > 10 {
            return Err(EngineError::Validation("retries.max must be in [0, 10]".into()));
        }
        if !(1_000..=300_000).contains(&self.retries.delay_ms) {
            return Err(EngineError::Validation(
                "retries.delay_ms must be in [1000, 300000]".into(),
            ));
        }
        if !(1..=10).contains(&self.parallelism.max_concurrent_transfers) {
            return Err(EngineError::Validation(
                "parallelism.max_concurrent_transfers must be in [1, 10]".into(),
            ));
        }
        if !(1..=20).contains(&self.parallelism.max_connections_per_transfer) {
            return Err(EngineError::Validation(
                "parallelism.max_connections_per_transfer must be in [1, 20]".into(),
            ));
        }
        if self.post_action.kind == PostActionKind::SetLabel
            && self.post_action.label.as_deref().unwrap_or("").is_empty()
        {
            return Err(EngineError::Validation(
                "set_label post-action requires a non-empty label".into(),
            ));
        }
        if self.post_action.delay_minutes > 1440 {
            return Err(EngineError::Validation(
                "post_action.delay_minutes must be in [0, 1440]".into(),
            ));
        }
        Ok(())
    }
}

fn row_to_job(row: &Row) -> rusqlite::Result<Job> {
    let direction_s: String = row.get("direction")?;
    let target_kind_s: String = row.get("target_kind")?;
    let options_json: String = row.get("options_json")?;
    let auto_queue_json: String = row.get("auto_queue_json")?;
    let post_action_json: String = row.get("post_action_json")?;
    Ok(Job {
        id: row.get("id")?,
        name: row.get("name")?,
        source_server: row.get("source_server")?,
        target_kind: TargetKind::parse(&target_kind_s).unwrap_or(TargetKind::Local),
        target_server: row.get("target_server")?,
        source_path: row.get("source_path")?,
        target_path: row.get("target_path")?,
        direction: Direction::parse(&direction_s).unwrap_or(Direction::Download),
        enabled: row.get::<_, i64>("enabled")? != 0,
        scan_interval_minutes: row.get::<_, i64>("scan_interval_minutes")? as u32,
        options: serde_json::from_str(&options_json).unwrap_or_default(),
        retries: RetryPolicy {
            max: row.get::<_, i64>("retries_max")? as u32,
            delay_ms: row.get::<_, i64>("retries_delay_ms")? as u64,
        },
        parallelism: Parallelism {
            max_concurrent_transfers: row.get::<_, i64>("max_concurrent_transfers")? as u32,
            max_connections_per_transfer: row.get::<_, i64>("max_connections_per_transfer")? as u32,
        },
        auto_queue: serde_json::from_str(&auto_queue_json).unwrap_or_default(),
        post_action: serde_json::from_str(&post_action_json).unwrap_or_default(),
        last_scan_at: row.get("last_scan_at")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

pub fn find_all_enabled(conn: &Connection) -> anyhow::Result<Vec<Job>> {
    let mut stmt = conn.prepare("SELECT * FROM jobs WHERE enabled = 1 ORDER BY created_at")?;
    let rows = stmt.query_map([], row_to_job)?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub fn find_all(conn: &Connection) -> anyhow::Result<Vec<Job>> {
    let mut stmt = conn.prepare("SELECT * FROM jobs ORDER BY created_at")?;
    let rows = stmt.query_map([], row_to_job)?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub fn find_by_id(conn: &Connection, id: &str) -> anyhow::Result<Option<Job>> {
    let mut stmt = conn.prepare("SELECT * FROM jobs WHERE id = ?")?;
    let mut rows = stmt.query_map(params![id], row_to_job)?;
    Ok(rows.next().transpose()?)
}

pub fn create(conn: &Connection, job: &Job) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO jobs (id, name, source_server, target_kind, target_server, source_path, target_path,
            direction, enabled, scan_interval_minutes, options_json, retries_max, retries_delay_ms,
            max_concurrent_transfers, max_connections_per_transfer, auto_queue_json, post_action_json,
            last_scan_at, created_at, updated_at)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20)",
        params![
            job.id,
            job.name,
            job.source_server,
            job.target_kind.as_str(),
            job.target_server,
            job.source_path,
            job.target_path,
            job.direction.as_str(),
            job.enabled as i64,
            job.scan_interval_minutes,
            serde_json::to_string(&job.options)?,
            job.retries.max,
            job.retries.delay_ms,
            job.parallelism.max_concurrent_transfers,
            job.parallelism.max_connections_per_transfer,
            serde_json::to_string(&job.auto_queue)?,
            serde_json::to_string(&job.post_action)?,
            job.last_scan_at,
            job.created_at,
            job.updated_at,
        ],
    )?;
    Ok(())
}

pub fn set_last_scan_at(conn: &Connection, id: &str, ts: &str) -> anyhow::Result<()> {
    conn.execute(
        "UPDATE jobs SET last_scan_at = ?1, updated_at = datetime('now') WHERE id = ?2",
        params![ts, id],
    )?;
    Ok(())
}

pub fn delete(conn: &Connection, id: &str) -> anyhow::Result<bool> {
    let changes = conn.execute("DELETE FROM jobs WHERE id = ?", params![id])?;
    Ok(changes > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_job() -> Job {
        Job {
            id: "job1".into(),
            name: "test".into(),
            source_server: Some("srv1".into()),
            target_kind: TargetKind::Local,
            target_server: None,
            source_path: "/data".into(),
            target_path: "/local/data".into(),
            direction: Direction::Download,
            enabled: true,
            scan_interval_minutes: 60,
            options: JobOptions::default(),
            retries: RetryPolicy::default(),
            parallelism: Parallelism::default(),
            auto_queue: AutoQueueConfig::default(),
            post_action: PostTransferAction::default(),
            last_scan_at: None,
            created_at: "now".into(),
            updated_at: "now".into(),
        }
    }

    #[test]
    fn rejects_interval_out_of_bounds() {
        let mut job = sample_job();
        job.scan_interval_minutes = 4;
        assert!(job.validate().is_err());
        job.scan_interval_minutes = 10081;
        assert!(job.validate().is_err());
        job.scan_interval_minutes = 10080;
        assert!(job.validate().is_ok());
    }

    #[test]
    fn rejects_bad_chmod() {
        let mut job = sample_job();
        job.options.chmod = Some("9".into());
        assert!(job.validate().is_err());
        job.options.chmod = Some("0755".into());
        assert!(job.validate().is_ok());
    }

    #[test]
    fn set_label_requires_label() {
        let mut job = sample_job();
        job.post_action.kind = PostActionKind::SetLabel;
        assert!(job.validate().is_err());
        job.post_action.label = Some("done".into());
        assert!(job.validate().is_ok());
    }

    #[test]
    fn local_target_requires_download() {
        let mut job = sample_job();
        job.direction = Direction::Upload;
        assert!(job.validate().is_err());
    }
}

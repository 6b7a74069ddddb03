//! Remote executor (C1, §4.1): a pooled SSH/SFTP client used by the scanner
//! and recovery service to test connectivity and list/stat remote paths.
//!
//! Grounded in the teacher's SSH session idiom from `agent_deployer.rs`
//! (`ssh2::Session::new()` / `set_tcp_stream` / `handshake` /
//! `userauth_password`), adapted from one-shot deployment actions to a
//! pooled, read-only `list`/`stat`/`exists` surface and widened with
//! `userauth_pubkey_file` for key-based auth (C12).

use std::collections::HashMap;
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use ssh2::Session;

use crate::error::{EngineError, Result};
use crate::keymaterial::KeyMaterialStore;
use crate::models::server::{AuthKind, Server};

const IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const CONN_TTL: Duration = Duration::from_secs(5 * 60);
const LIST_TIMEOUT: Duration = Duration::from_secs(60);
const STAT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct RemoteFileInfo {
    pub path: String,
    pub name: String,
    pub size: u64,
    pub mtime: i64,
    pub is_directory: bool,
    pub permissions: u32,
}

#[derive(Debug, Clone)]
pub struct TestResult {
    pub ok: bool,
    pub diagnostics: String,
}

struct PooledSession {
    session: Session,
    last_used: Instant,
    created: Instant,
}

impl PooledSession {
    fn expired(&self) -> bool {
        self.last_used.elapsed() > IDLE_TIMEOUT || self.created.elapsed() > CONN_TTL
    }
}

/// One bounded SSH session per server, reused across calls until idle or TTL
/// expiry, at which point the next use reconnects.
pub struct RemoteExecutor {
    sessions: Mutex<HashMap<String, PooledSession>>,
}

fn validate_path(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(EngineError::Validation("remote path must not be empty".into()));
    }
    if path.split('/').any(|seg| seg == "..") {
        return Err(EngineError::Validation("remote path must not contain '..'".into()));
    }
    Ok(())
}

impl RemoteExecutor {
    pub fn new() -> Self {
        Self { sessions: Mutex::new(HashMap::new()) }
    }

    fn connect(server: &Server, keys: &KeyMaterialStore) -> Result<Session> {
        let addr = format!("{}:{}", server.host, server.port);
        let tcp = TcpStream::connect(&addr)
            .map_err(|e| EngineError::Connection(format!("tcp connect to {addr} failed: {e}")))?;
        tcp.set_read_timeout(Some(Duration::from_secs(30))).ok();

        let mut session = Session::new()
            .map_err(|e| EngineError::Connection(format!("ssh session init failed: {e}")))?;
        session.set_tcp_stream(tcp);
        session
            .handshake()
            .map_err(|e| EngineError::Connection(format!("ssh handshake with {addr} failed: {e}")))?;

        match server.auth_kind {
            AuthKind::Password => {
                session
                    .userauth_password(&server.user, &server.auth_secret_ref)
                    .map_err(|e| EngineError::Connection(format!("password auth failed for {}@{}: {e}", server.user, addr)))?;
            }
            AuthKind::PrivateKey => {
                let key_path = keys.write(&server.auth_secret_ref)?;
                let result = session.userauth_pubkey_file(&server.user, None, &key_path, None);
                keys.cleanup(&key_path);
                result.map_err(|e| EngineError::Connection(format!("key auth failed for {}@{}: {e}", server.user, addr)))?;
            }
        }

        if !session.authenticated() {
            return Err(EngineError::Connection(format!("authentication to {addr} was not accepted")));
        }
        Ok(session)
    }

    fn with_session<T>(&self, server: &Server, keys: &KeyMaterialStore, f: impl FnOnce(&Session) -> Result<T>) -> Result<T> {
        let mut sessions = self.sessions.lock().unwrap();

        let needs_reconnect = match sessions.get(&server.id) {
            Some(pooled) => pooled.expired(),
            None => true,
        };
        if needs_reconnect {
            let session = Self::connect(server, keys)?;
            sessions.insert(
                server.id.clone(),
                PooledSession { session, last_used: Instant::now(), created: Instant::now() },
            );
        }

        let pooled = sessions.get_mut(&server.id).expect("just inserted or already present");
        pooled.last_used = Instant::now();
        f(&pooled.session)
    }

    /// §4.1 `test`: connect, authenticate, and run a trivial SFTP round trip.
    pub fn test(&self, server: &Server, keys: &KeyMaterialStore) -> TestResult {
        match self.with_session(server, keys, |session| {
            let sftp = session
                .sftp()
                .map_err(|e| EngineError::Connection(format!("sftp channel open failed: {e}")))?;
            sftp.stat(Path::new("."))
                .map_err(|e| EngineError::Connection(format!("sftp stat '.' failed: {e}")))?;
            Ok(())
        }) {
            Ok(()) => TestResult { ok: true, diagnostics: "connected and authenticated".into() },
            Err(e) => TestResult { ok: false, diagnostics: e.to_string() },
        }
    }

    /// §4.1 `list`: directory entries at `path`, non-recursive.
    pub fn list(&self, server: &Server, path: &str, keys: &KeyMaterialStore) -> Result<Vec<RemoteFileInfo>> {
        validate_path(path)?;
        self.with_session(server, keys, |session| {
            let sftp = session
                .sftp()
                .map_err(|e| EngineError::Connection(format!("sftp channel open failed: {e}")))?;
            let entries = sftp
                .readdir(Path::new(path))
                .map_err(|e| EngineError::Scan(format!("list '{path}' failed: {e}")))?;

            let mut out = Vec::with_capacity(entries.len());
            for (entry_path, stat) in entries {
                let name = entry_path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default();
                if name == "." || name == ".." {
                    continue;
                }
                out.push(RemoteFileInfo {
                    path: format!("{}/{}", path.trim_end_matches('/'), name),
                    name,
                    size: stat.size.unwrap_or(0),
                    mtime: stat.mtime.unwrap_or(0) as i64,
                    is_directory: stat.is_dir(),
                    permissions: stat.perm.unwrap_or(0) & 0o7777,
                });
            }
            Ok(out)
        })
    }

    /// §4.1 `stat`: metadata for a single remote path.
    pub fn stat(&self, server: &Server, path: &str, keys: &KeyMaterialStore) -> Result<RemoteFileInfo> {
        validate_path(path)?;
        self.with_session(server, keys, |session| {
            let sftp = session
                .sftp()
                .map_err(|e| EngineError::Connection(format!("sftp channel open failed: {e}")))?;
            let stat = sftp
                .stat(Path::new(path))
                .map_err(|e| EngineError::NotFound(format!("stat '{path}' failed: {e}")))?;
            let name = PathBuf::from(path)
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| path.to_string());
            Ok(RemoteFileInfo {
                path: path.to_string(),
                name,
                size: stat.size.unwrap_or(0),
                mtime: stat.mtime.unwrap_or(0) as i64,
                is_directory: stat.is_dir(),
                permissions: stat.perm.unwrap_or(0) & 0o7777,
            })
        })
    }

    /// §4.1 `exists`: true unless the remote path is absent.
    pub fn exists(&self, server: &Server, path: &str, keys: &KeyMaterialStore) -> Result<bool> {
        match self.stat(server, path, keys) {
            Ok(_) => Ok(true),
            Err(EngineError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Drop any pooled session whose idle timeout or TTL has elapsed. Called
    /// from the recovery service's periodic tick (§4.9).
    pub fn sweep_idle(&self) {
        let mut sessions = self.sessions.lock().unwrap();
        sessions.retain(|_, pooled| !pooled.expired());
    }
}

impl Default for RemoteExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_parent_traversal_and_empty_paths() {
        assert!(validate_path("").is_err());
        assert!(validate_path("a/../b").is_err());
        assert!(validate_path("a/b/c").is_ok());
    }
}

//! Server connection descriptors (§3). Immutable by the core: the core reads
//! these rows but never originates a create/update of its own — credential
//! storage and the CRUD surface are the out-of-scope HTTP/UI layer's job.

use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuthKind {
    Password,
    PrivateKey,
}

impl AuthKind {
    fn as_str(&self) -> &'static str {
        match self {
            AuthKind::Password => "password",
            AuthKind::PrivateKey => "private_key",
        }
    }

    fn parse(s: &str) -> anyhow::Result<Self> {
        match s {
            "password" => Ok(AuthKind::Password),
            "private_key" => Ok(AuthKind::PrivateKey),
            other => anyhow::bail!("unknown auth_kind: {other}"),
        }
    }
}

/// Opaque, name/delay/label effect descriptor (§1: "specified only as an
/// opaque effect"). The core never interprets `kind`; it only schedules the
/// delayed call-out after a transfer completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TorrentClientRef {
    pub name: String,
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub id: String,
    pub host: String,
    pub port: i64,
    pub user: String,
    pub auth_kind: AuthKind,
    /// Opaque reference into the (out-of-scope) credential store: a password
    /// or a PEM-encoded private key, handed verbatim to C1/C12. The core
    /// treats this as a blob, never logs it.
    pub auth_secret_ref: String,
    pub torrent_client: Option<TorrentClientRef>,
    pub created_at: String,
    pub updated_at: String,
}

fn row_to_server(row: &Row) -> rusqlite::Result<Server> {
    let auth_kind_s: String = row.get("auth_kind")?;
    let torrent_json: Option<String> = row.get("torrent_client_json")?;
    Ok(Server {
        id: row.get("id")?,
        host: row.get("host")?,
        port: row.get("port")?,
        user: row.get("user")?,
        auth_kind: AuthKind::parse(&auth_kind_s)
            .map_err(|e| rusqlite::Error::InvalidColumnType(0, e.to_string(), rusqlite::types::Type::Text))?,
        auth_secret_ref: row.get("auth_secret_ref")?,
        torrent_client: torrent_json.and_then(|j| serde_json::from_str(&j).ok()),
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

pub fn find_all(conn: &Connection) -> anyhow::Result<Vec<Server>> {
    let mut stmt = conn.prepare("SELECT * FROM servers ORDER BY created_at DESC")?;
    let rows = stmt.query_map([], row_to_server)?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub fn find_by_id(conn: &Connection, id: &str) -> anyhow::Result<Option<Server>> {
    let mut stmt = conn.prepare("SELECT * FROM servers WHERE id = ?")?;
    let mut rows = stmt.query_map(params![id], row_to_server)?;
    Ok(rows.next().transpose()?)
}

pub fn create(conn: &Connection, server: &Server) -> anyhow::Result<()> {
    let torrent_json = server
        .torrent_client
        .as_ref()
        .map(|t| serde_json::to_string(t))
        .transpose()?;
    conn.execute(
        "INSERT INTO servers (id, host, port, user, auth_kind, auth_secret_ref, torrent_client_json, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            server.id,
            server.host,
            server.port,
            server.user,
            server.auth_kind.as_str(),
            server.auth_secret_ref,
            torrent_json,
            server.created_at,
            server.updated_at,
        ],
    )?;
    Ok(())
}

pub fn delete(conn: &Connection, id: &str) -> anyhow::Result<bool> {
    let changes = conn.execute("DELETE FROM servers WHERE id = ?", params![id])?;
    Ok(changes > 0)
}

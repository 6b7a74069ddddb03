//! Error taxonomy for the sync engine.
//!
//! Unlike the HTTP-facing `AppError` this type descends from, there is no
//! response layer here: variants map to `code()` strings used in
//! `error:occurred` events and to process exit codes, not to status codes.

use serde_json::Value;

#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("transfer error: {0}")]
    Transfer(String),

    #[error("scan error: {0}")]
    Scan(String),

    #[error("system error: {0}")]
    System(String),

    #[error("spawn error: {0}")]
    Spawn(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    /// The taxonomy code used on `error:occurred` events (§7).
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::NotFound(_) => "not_found",
            EngineError::Conflict(_) => "conflict",
            EngineError::Unauthorized(_) => "unauthorized",
            EngineError::Forbidden(_) => "forbidden",
            EngineError::Connection(_) => "connection",
            EngineError::Transfer(_) => "transfer",
            EngineError::Scan(_) => "scan",
            EngineError::System(_) => "system",
            EngineError::Spawn(_) => "spawn",
            EngineError::Timeout(_) => "timeout",
            EngineError::ResourceExhausted(_) => "resource_exhausted",
            EngineError::Internal(_) => "system",
        }
    }

    /// `error:occurred.type` only covers a subset of the taxonomy (§4.11).
    pub fn event_type(&self) -> Option<&'static str> {
        match self {
            EngineError::Connection(_) => Some("connection"),
            EngineError::Transfer(_) => Some("transfer"),
            EngineError::Scan(_) => Some("scan"),
            EngineError::Validation(_) => Some("validation"),
            EngineError::System(_) | EngineError::Internal(_) => Some("system"),
            EngineError::Spawn(_) => Some("spawn"),
            _ => None,
        }
    }

    pub fn details(&self) -> Option<Value> {
        None
    }

    /// Process exit code per §6: 1 validation failure, 2 store unavailable, 3 config invalid.
    pub fn exit_code(&self) -> i32 {
        match self {
            EngineError::Validation(_) => 1,
            EngineError::Connection(_) | EngineError::ResourceExhausted(_) => 2,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

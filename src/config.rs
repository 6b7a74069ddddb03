//! Environment-derived configuration, in the teacher's `AppConfig::from_env()` idiom.

use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub store_uri: PathBuf,
    pub bind_port: u16,
    pub cors_origin: String,
    pub log_level: String,
    pub max_global_concurrent_processes: usize,
    pub scan_concurrent_max: usize,
    pub transfer_default_timeout_ms: u64,
    pub queue_sync_interval_ms: u64,
    pub recovery_tick_interval_ms: u64,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        Self {
            store_uri: PathBuf::from(
                std::env::var("STORE_URI").unwrap_or_else(|_| "./warpsync.db".into()),
            ),
            bind_port: std::env::var("BIND_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(4173),
            cors_origin: std::env::var("CORS_ORIGIN").unwrap_or_else(|_| "*".into()),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()),
            max_global_concurrent_processes: std::env::var("MAX_GLOBAL_CONCURRENT_PROCESSES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8),
            scan_concurrent_max: std::env::var("SCAN_CONCURRENT_MAX")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(4),
            transfer_default_timeout_ms: std::env::var("TRANSFER_DEFAULT_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3_600_000),
            queue_sync_interval_ms: std::env::var("QUEUE_SYNC_INTERVAL_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(60_000),
            recovery_tick_interval_ms: std::env::var("RECOVERY_TICK_INTERVAL_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(300_000),
        }
    }
}

//! Bridge configuration value object.
//!
//! Loading a configuration *file* (TOML, the interactive setup wizard, a
//! `clap` front end) is explicitly out of scope (spec §1); this module only
//! owns the `Config` struct components are built against, plus the narrow
//! environment reads spec §6 calls out by name. A separate CLI crate is
//! expected to assemble a `Config` (by whatever means it likes) and hand it
//! to `Bridge::run`.

use std::path::PathBuf;

use crate::util::{env_optional, env_u32, env_u64};

#[derive(Debug, Clone)]
pub(crate) struct Config {
    pub(crate) db_path: PathBuf,
    pub(crate) runtime_dir: PathBuf,
    pub(crate) socket_path: PathBuf,
    pub(crate) http_bind: Option<String>,

    pub(crate) default_priority: i32,
    pub(crate) default_max_attempts: u32,
    pub(crate) max_queue_depth: u64,
    pub(crate) batch_max_size: u32,
    pub(crate) retry_base_delay_ms: u64,
    pub(crate) retry_max_delay_ms: u64,

    pub(crate) breaker_threshold: u32,
    pub(crate) breaker_timeout_ms: i64,
    pub(crate) breaker_half_open_success_required: u32,

    pub(crate) container_start_deadline_ms: u64,

    pub(crate) http_proxy: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            db_path: PathBuf::from("/var/lib/armorclaw/bridge.db"),
            runtime_dir: PathBuf::from("/run/armorclaw"),
            socket_path: PathBuf::from("/run/armorclaw/bridge.sock"),
            http_bind: None,
            default_priority: 5,
            default_max_attempts: 3,
            max_queue_depth: 10_000,
            batch_max_size: 100,
            retry_base_delay_ms: 1_000,
            retry_max_delay_ms: 300_000,
            breaker_threshold: 5,
            breaker_timeout_ms: 60_000,
            breaker_half_open_success_required: 3,
            container_start_deadline_ms: 120_000,
            http_proxy: None,
        }
    }
}

impl Config {
    /// Build a `Config` from defaults overridden by the environment reads
    /// spec §6 names explicitly. `ARMORCLAW_CONFIG`, if set, is surfaced on
    /// the returned value as a path override for an external loader to
    /// consume; this crate never parses it.
    pub(crate) fn load() -> (Self, Option<PathBuf>) {
        let mut cfg = Config::default();
        if let Some(dir) = env_optional("ARMORCLAW_RUNTIME_DIR") {
            cfg.runtime_dir = PathBuf::from(dir);
            cfg.socket_path = cfg.runtime_dir.join("bridge.sock");
        }
        if let Some(db) = env_optional("ARMORCLAW_DB_PATH") {
            cfg.db_path = PathBuf::from(db);
        }
        if let Some(bind) = env_optional("ARMORCLAW_HTTP_BIND") {
            cfg.http_bind = Some(bind);
        }
        cfg.max_queue_depth = env_u64("ARMORCLAW_MAX_QUEUE_DEPTH", cfg.max_queue_depth);
        cfg.batch_max_size = env_u32("ARMORCLAW_BATCH_MAX_SIZE", cfg.batch_max_size);
        cfg.breaker_threshold = env_u32("ARMORCLAW_BREAKER_THRESHOLD", cfg.breaker_threshold);
        cfg.http_proxy = env_optional("HTTP_PROXY");

        let config_file_override = env_optional("ARMORCLAW_CONFIG").map(PathBuf::from);
        (cfg, config_file_override)
    }
}

/// `ARMORCLAW_API_KEY` prefix classification, per spec §6: a key present at
/// startup is parsed by prefix and auto-stored as `<provider>-default`.
pub(crate) fn classify_api_key(raw: &str) -> Option<&'static str> {
    if raw.starts_with("sk-ant-") {
        Some("anthropic")
    } else if raw.starts_with("sk-proj-") || raw.starts_with("sk-") {
        Some("openai")
    } else {
        None
    }
}

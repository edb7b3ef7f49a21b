use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// Wire and resource limits shared across crates
pub const DEFAULT_PORT: u16 = 8080;
pub const MAX_PAYLOAD_BYTES: usize = 128 * 1024; // 128 KB hard cap per client frame
pub const OUTBOUND_BUFFER: usize = 100; // correlator → gateway event buffer
pub const TURN_DEADLINE_SECS: u64 = 600; // a turn may run for at most 10 minutes
pub const CONNECT_ATTEMPTS: u32 = 3; // upstream connect tries per turn
pub const MAX_CUSTOM_INSTRUCTIONS_CHARS: usize = 2000;
pub const INLINE_FILE_CAP_BYTES: u64 = 100 * 1024; // text attachments above this go in by path
pub const TITLE_TIMEOUT_SECS: u64 = 30;
pub const TITLE_MAX_CHARS: usize = 50;
pub const LATE_USAGE_GRACE_MS: u64 = 250; // usage frames arriving after `done` still count

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration error: {0}")]
    Invalid(String),
}

/// Top-level config (tiller.toml + bare env overrides).
///
/// Environment keys map 1:1 to fields: `PORT`, `DATABASE_PATH`, `UPLOAD_DIR`,
/// `WORKSPACE_PATH`, `UPSTREAM_URL`, `UPSTREAM_KEY`, `GATEWAY_KEY`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TillerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_db_path")]
    pub database_path: String,
    #[serde(default = "default_upload_dir")]
    pub upload_dir: String,
    /// Path prefix under which the upstream agent sees uploaded files.
    /// Defaults to `upload_dir` when unset.
    #[serde(default)]
    pub workspace_path: Option<String>,
    /// Base URL of the upstream agent. Required.
    #[serde(default)]
    pub upstream_url: String,
    /// Shared secret sent as `X-API-Key` on upstream connects.
    #[serde(default)]
    pub upstream_key: Option<String>,
    /// When set, clients must present this key at WS upgrade time.
    #[serde(default)]
    pub gateway_key: Option<String>,
}

impl Default for TillerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            database_path: default_db_path(),
            upload_dir: default_upload_dir(),
            workspace_path: None,
            upstream_url: String::new(),
            upstream_key: None,
            gateway_key: None,
        }
    }
}

impl TillerConfig {
    /// Load config from an optional TOML file with bare env var overrides.
    pub fn load(config_path: Option<&str>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(TillerConfig::default()));
        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }
        let config: TillerConfig = figment
            .merge(Env::raw().only(&[
                "PORT",
                "DATABASE_PATH",
                "UPLOAD_DIR",
                "WORKSPACE_PATH",
                "UPSTREAM_URL",
                "UPSTREAM_KEY",
                "GATEWAY_KEY",
            ]))
            .extract()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        if config.upstream_url.is_empty() {
            return Err(ConfigError::Invalid(
                "UPSTREAM_URL is required".to_string(),
            ));
        }
        Ok(config)
    }

    /// The path prefix the upstream agent uses to reach uploaded files.
    pub fn workspace_path(&self) -> &str {
        self.workspace_path.as_deref().unwrap_or(&self.upload_dir)
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_db_path() -> String {
    "tiller.db".to_string()
}
fn default_upload_dir() -> String {
    "uploads".to_string()
}

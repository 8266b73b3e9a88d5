// Configuration loading and parsing (client.toml, credentials.toml).

use std::path::{Path, PathBuf};
use std::time::Duration;

use agrobid_core::protocol::AuctionId;
use agrobid_core::reconciler::{DEFAULT_DELTA_BUFFER_CAP, DEFAULT_RECENT_BIDS_CAP};
use agrobid_core::transport::ReconnectPolicy;
use directories::ProjectDirs;
use serde::Deserialize;
use thiserror::Error;

/// Environment variable that overrides `credentials.toml`'s token.
pub const TOKEN_ENV_VAR: &str = "AGROBID_AUTH_TOKEN";

const CLIENT_FILE: &str = "client.toml";

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("validation error for field `{field}`: {message}")]
    ValidationError { field: String, message: String },

    #[error("failed to initialize config from defaults: {message}")]
    DefaultsCopyError { message: String },
}

// ---------------------------------------------------------------------------
// Top-level assembled Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub timing: TimingConfig,
    pub reconnect: ReconnectConfig,
    pub reconciler: ReconcilerConfig,
    pub session: SessionSection,
    pub credentials: CredentialsConfig,
}

// ---------------------------------------------------------------------------
// client.toml structs
// ---------------------------------------------------------------------------

/// Raw deserialization target for the entire client.toml file.
#[derive(Debug, Clone, Deserialize)]
struct ClientFile {
    server: ServerConfig,
    #[serde(default)]
    timing: TimingConfig,
    #[serde(default)]
    reconnect: ReconnectConfig,
    #[serde(default)]
    reconciler: ReconcilerConfig,
    #[serde(default)]
    session: SessionSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Real-time endpoint, `ws://` or `wss://`.
    pub ws_url: String,
    /// Base of the REST API; endpoints hang off `{api_base_url}/auctions/{id}/`.
    pub api_base_url: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub join_timeout_ms: u64,
    pub fallback_grace_ms: u64,
    pub submission_timeout_ms: u64,
    pub countdown_tick_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        TimingConfig {
            join_timeout_ms: 5_000,
            fallback_grace_ms: 3_000,
            submission_timeout_ms: 5_000,
            countdown_tick_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        ReconnectConfig {
            max_attempts: 5,
            base_delay_ms: 1_000,
        }
    }
}

impl ReconnectConfig {
    pub fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    pub recent_bids_cap: usize,
    pub delta_buffer_cap: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        ReconcilerConfig {
            recent_bids_cap: DEFAULT_RECENT_BIDS_CAP,
            delta_buffer_cap: DEFAULT_DELTA_BUFFER_CAP,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    /// Auction to join on startup, if any.
    pub auction_id: Option<String>,
}

impl SessionSection {
    pub fn startup_auction(&self) -> Option<AuctionId> {
        self.auction_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(AuctionId::from)
    }
}

// ---------------------------------------------------------------------------
// credentials.toml structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CredentialsConfig {
    pub auth_token: Option<String>,
}

// ---------------------------------------------------------------------------
// Loading logic
// ---------------------------------------------------------------------------

/// Load and validate `client.toml` and (optionally) `credentials.toml` from
/// `config_dir`.
///
/// This is the lower-level loading primitive: it neither copies defaults nor
/// applies environment overrides. Prefer `load_config()`.
pub fn load_config_from(config_dir: &Path) -> Result<Config, ConfigError> {
    // --- client.toml (required) ---
    let client_path = config_dir.join(CLIENT_FILE);
    let client_text = read_file(&client_path)?;
    let client: ClientFile = toml::from_str(&client_text).map_err(|e| ConfigError::ParseError {
        path: client_path.clone(),
        source: e,
    })?;

    // --- credentials.toml (optional) ---
    let credentials_path = config_dir.join("credentials.toml");
    let credentials = if credentials_path.exists() {
        let text = read_file(&credentials_path)?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseError {
            path: credentials_path.clone(),
            source: e,
        })?
    } else {
        CredentialsConfig::default()
    };

    let config = Config {
        server: client.server,
        timing: client.timing,
        reconnect: client.reconnect,
        reconciler: client.reconciler,
        session: client.session,
        credentials,
    };

    validate(&config)?;

    Ok(config)
}

/// Seed `config/client.toml` from `defaults/` when it is missing. Returns the
/// path written, if any. Credentials are never seeded; only the
/// `.example` template ships.
pub fn seed_client_config(base_dir: &Path) -> Result<Option<PathBuf>, ConfigError> {
    let source = base_dir.join("defaults").join(CLIENT_FILE);
    let target = base_dir.join("config").join(CLIENT_FILE);
    if target.exists() || !source.is_file() {
        return Ok(None);
    }

    let copy_error = |e: std::io::Error| ConfigError::DefaultsCopyError {
        message: format!("failed to copy {}: {e}", source.display()),
    };
    std::fs::create_dir_all(base_dir.join("config")).map_err(copy_error)?;
    std::fs::copy(&source, &target).map_err(copy_error)?;
    Ok(Some(target))
}

/// Load config from `./config` (seeded from `./defaults`), falling back to
/// the platform config directory, then apply environment overrides.
pub fn load_config() -> Result<Config, ConfigError> {
    let cwd = std::env::current_dir().map_err(|_| ConfigError::FileNotFound {
        path: PathBuf::from("."),
    })?;

    let mut config = if cwd.join("config").exists() || cwd.join("defaults").exists() {
        seed_client_config(&cwd)?;
        load_config_from(&cwd.join("config"))?
    } else {
        let dirs = ProjectDirs::from("org", "agrobid", "agrobid").ok_or_else(|| {
            ConfigError::DefaultsCopyError {
                message: "no config/ in the working directory and no home directory".into(),
            }
        })?;
        load_config_from(dirs.config_dir())?
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

/// Apply overrides from the environment. `lookup` is injected for tests.
pub fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(token) = lookup(TOKEN_ENV_VAR).filter(|t| !t.trim().is_empty()) {
        config.credentials.auth_token = Some(token);
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

impl TimingConfig {
    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn fallback_grace(&self) -> Duration {
        Duration::from_millis(self.fallback_grace_ms)
    }

    pub fn submission_timeout(&self) -> Duration {
        Duration::from_millis(self.submission_timeout_ms)
    }

    pub fn countdown_tick(&self) -> Duration {
        Duration::from_millis(self.countdown_tick_ms)
    }
}

fn read_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
        path: path.to_path_buf(),
    })
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn validate(config: &Config) -> Result<(), ConfigError> {
    let ws_url = &config.server.ws_url;
    if !(ws_url.starts_with("ws://") || ws_url.starts_with("wss://")) {
        return Err(ConfigError::ValidationError {
            field: "server.ws_url".into(),
            message: format!("must start with ws:// or wss://, got {ws_url:?}"),
        });
    }

    let api = &config.server.api_base_url;
    if !(api.starts_with("http://") || api.starts_with("https://")) {
        return Err(ConfigError::ValidationError {
            field: "server.api_base_url".into(),
            message: format!("must start with http:// or https://, got {api:?}"),
        });
    }

    let t = &config.timing;
    let timing_fields: &[(&str, u64)] = &[
        ("timing.join_timeout_ms", t.join_timeout_ms),
        ("timing.fallback_grace_ms", t.fallback_grace_ms),
        ("timing.submission_timeout_ms", t.submission_timeout_ms),
        ("timing.countdown_tick_ms", t.countdown_tick_ms),
        ("reconnect.base_delay_ms", config.reconnect.base_delay_ms),
    ];
    for (name, val) in timing_fields {
        if *val == 0 {
            return Err(ConfigError::ValidationError {
                field: name.to_string(),
                message: "must be > 0".into(),
            });
        }
    }

    if config.reconnect.max_attempts == 0 {
        return Err(ConfigError::ValidationError {
            field: "reconnect.max_attempts".into(),
            message: "must be > 0".into(),
        });
    }

    let caps: &[(&str, usize)] = &[
        ("reconciler.recent_bids_cap", config.reconciler.recent_bids_cap),
        ("reconciler.delta_buffer_cap", config.reconciler.delta_buffer_cap),
    ];
    for (name, val) in caps {
        if *val == 0 {
            return Err(ConfigError::ValidationError {
                field: name.to_string(),
                message: "must be > 0".into(),
            });
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

// Configuration loading and parsing (client.toml, credentials.toml).

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::protocol::{MatchRequest, TransportMode, UserId};

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
    pub transport: TransportConfig,
    pub timing: TimingConfig,
    pub matchmaking: MatchmakingConfig,
    pub database: DatabaseConfig,
    pub credentials: CredentialsConfig,
}

// ---------------------------------------------------------------------------
// client.toml structs
// ---------------------------------------------------------------------------

/// Raw deserialization target for the entire client.toml file.
#[derive(Debug, Clone, Deserialize)]
struct ClientFile {
    server: ServerConfig,
    transport: TransportConfig,
    timing: TimingConfig,
    matchmaking: MatchmakingConfig,
    database: DatabaseConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub ws_url: String,
    /// Base URL of the HTTP API. Without it the fallback channel is disabled
    /// and poll mode is unavailable.
    #[serde(default)]
    pub http_base_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    pub mode: TransportMode,
    pub settle_delay_ms: u64,
    pub connect_timeout_ms: u64,
    pub reconnect_delay_ms: u64,
    pub http_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimingConfig {
    pub heartbeat_interval_ms: u64,
    pub deadline_tick_ms: u64,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MatchmakingConfig {
    pub mode: String,
    pub scope: String,
    #[serde(default)]
    pub exam_mode: bool,
}

impl MatchmakingConfig {
    pub fn request(&self) -> MatchRequest {
        MatchRequest {
            mode: self.mode.clone(),
            scope: self.scope.clone(),
            exam_mode: self.exam_mode,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
    /// Resolve a relative `path` under the platform data directory instead
    /// of the working directory.
    #[serde(default)]
    pub use_data_dir: bool,
}

impl DatabaseConfig {
    /// Where the database file lives.
    pub fn resolved_path(&self) -> PathBuf {
        let path = PathBuf::from(&self.path);
        if path.is_absolute() || !self.use_data_dir || self.path == ":memory:" {
            return path;
        }
        match directories::ProjectDirs::from("", "", "quizlink") {
            Some(dirs) => dirs.data_dir().join(path),
            None => path,
        }
    }
}

// ---------------------------------------------------------------------------
// credentials.toml structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CredentialsConfig {
    pub bearer_token: Option<String>,
    pub user_id: Option<UserId>,
}

impl Config {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.transport.settle_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.transport.connect_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.transport.reconnect_delay_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.transport.http_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.timing.heartbeat_interval_ms)
    }

    pub fn deadline_tick(&self) -> Duration {
        Duration::from_millis(self.timing.deadline_tick_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.timing.poll_interval_ms)
    }

    /// Credential with blank values treated as absent.
    pub fn bearer_token(&self) -> Option<String> {
        self.credentials
            .bearer_token
            .as_ref()
            .filter(|token| !token.trim().is_empty())
            .cloned()
    }
}

// ---------------------------------------------------------------------------
// Loading logic
// ---------------------------------------------------------------------------

/// Load and validate configuration from `config/client.toml` and
/// (optionally) `config/credentials.toml`, relative to `base_dir`.
///
/// This is the lower-level loading primitive that does not auto-copy defaults.
/// Prefer `load_config()` which handles default initialization automatically.
pub fn load_config_from(base_dir: &Path) -> Result<Config, ConfigError> {
    let config_dir = base_dir.join("config");

    // --- client.toml (required) ---
    let client_path = config_dir.join("client.toml");
    let client_text = read_file(&client_path)?;
    let client: ClientFile = toml::from_str(&client_text).map_err(|e| ConfigError::ParseError {
        path: client_path.clone(),
        source: e,
    })?;

    // --- credentials.toml (optional) ---
    let credentials_path = config_dir.join("credentials.toml");
    let credentials = if credentials_path.exists() {
        let cred_text = read_file(&credentials_path)?;
        toml::from_str(&cred_text).map_err(|e| ConfigError::ParseError {
            path: credentials_path.clone(),
            source: e,
        })?
    } else {
        CredentialsConfig::default()
    };

    let config = Config {
        server: client.server,
        transport: client.transport,
        timing: client.timing,
        matchmaking: client.matchmaking,
        database: client.database,
        credentials,
    };

    validate(&config)?;

    Ok(config)
}

/// Config files shipped in `defaults/` and copied into `config/` on first
/// run. `credentials.toml` is not among them: its template,
/// `credentials.toml.example`, stays in `defaults/` for the user to fill in.
const SHIPPED_CONFIG: &[&str] = &["client.toml"];

/// Give a fresh checkout a `config/client.toml` copied from `defaults/`.
/// Files already in `config/` are never touched. Returns the copied paths.
pub fn ensure_config_files(base_dir: &Path) -> Result<Vec<PathBuf>, ConfigError> {
    let defaults_dir = base_dir.join("defaults");
    let config_dir = base_dir.join("config");
    let mut copied = Vec::new();

    for name in SHIPPED_CONFIG {
        let target = config_dir.join(name);
        if target.exists() {
            continue;
        }
        let source = defaults_dir.join(name);
        if !source.is_file() {
            return Err(ConfigError::DefaultsCopyError {
                message: format!(
                    "no {name} in {} or {}; run quizlink from its crate directory",
                    config_dir.display(),
                    defaults_dir.display()
                ),
            });
        }

        std::fs::create_dir_all(&config_dir).map_err(|e| ConfigError::DefaultsCopyError {
            message: format!("failed to create {}: {e}", config_dir.display()),
        })?;
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&target)
        {
            Ok(mut dest) => {
                let content =
                    std::fs::read(&source).map_err(|e| ConfigError::DefaultsCopyError {
                        message: format!("failed to read {}: {e}", source.display()),
                    })?;
                std::io::Write::write_all(&mut dest, &content).map_err(|e| {
                    ConfigError::DefaultsCopyError {
                        message: format!("failed to write {}: {e}", target.display()),
                    }
                })?;
                info!("Copied default {} into {}", name, config_dir.display());
                copied.push(target);
            }
            // Another process created it between the check and the open.
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => {
                return Err(ConfigError::DefaultsCopyError {
                    message: format!("failed to create {}: {e}", target.display()),
                });
            }
        }
    }

    Ok(copied)
}

/// Load `config/client.toml` and `config/credentials.toml` from the working
/// directory, seeding `client.toml` from `defaults/` on first run.
pub fn load_config() -> Result<Config, ConfigError> {
    let cwd = std::env::current_dir().map_err(|_| ConfigError::FileNotFound {
        path: PathBuf::from("."),
    })?;
    ensure_config_files(&cwd)?;
    load_config_from(&cwd)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

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
            message: format!("must start with ws:// or wss://, got {ws_url}"),
        });
    }

    match &config.server.http_base_url {
        Some(url) if !(url.starts_with("http://") || url.starts_with("https://")) => {
            return Err(ConfigError::ValidationError {
                field: "server.http_base_url".into(),
                message: format!("must start with http:// or https://, got {url}"),
            });
        }
        None if config.transport.mode == TransportMode::Poll => {
            return Err(ConfigError::ValidationError {
                field: "server.http_base_url".into(),
                message: "required when transport.mode = \"poll\"".into(),
            });
        }
        _ => {}
    }

    let intervals: &[(&str, u64)] = &[
        ("transport.connect_timeout_ms", config.transport.connect_timeout_ms),
        ("transport.reconnect_delay_ms", config.transport.reconnect_delay_ms),
        ("transport.http_timeout_ms", config.transport.http_timeout_ms),
        ("timing.heartbeat_interval_ms", config.timing.heartbeat_interval_ms),
        ("timing.poll_interval_ms", config.timing.poll_interval_ms),
    ];
    for (name, val) in intervals {
        if *val == 0 {
            return Err(ConfigError::ValidationError {
                field: name.to_string(),
                message: "must be > 0".into(),
            });
        }
    }

    let tick = config.timing.deadline_tick_ms;
    if !(50..=1000).contains(&tick) {
        return Err(ConfigError::ValidationError {
            field: "timing.deadline_tick_ms".into(),
            message: format!("must be between 50 and 1000 inclusive, got {tick}"),
        });
    }

    if config.database.path.trim().is_empty() {
        return Err(ConfigError::ValidationError {
            field: "database.path".into(),
            message: "must not be empty".into(),
        });
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

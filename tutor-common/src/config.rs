//! Configuration management for tutor services.
//!
//! The service reads `~/.tutor/config.json` (or the file named by
//! `TUTOR_CONFIG`) and then applies environment overrides.
//!
//! # Configuration Priority
//!
//! 1. Environment variables
//! 2. Explicit config file values
//! 3. Default values
//!
//! # Environment Variable Mapping
//!
//! - `GOOGLE_API_KEY` / `GEMINI_API_KEY` → llm.api_key
//! - `GEMINI_MODEL` → llm.model
//! - `REDIS_URL` → store.redis_url
//! - `ADMIN_USERNAME` / `ADMIN_PASSWORD` → auth.admin_username / auth.admin_password
//! - `AUTH_SECRET` → auth.jwt_secret
//! - `COOKIE_SECURE` → auth.cookie_secure
//! - `HOST` / `PORT` → server.host / server.port
//! - `SUBJECT` → prompt.default_subject
//! - `TUTOR_LOG_LEVEL` / `TUTOR_LOG_FORMAT` → observability.*

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Compiled-in system prompt used when neither the store nor the defaults
/// file holds one.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a board certified computer science teacher who specializes in the Java programming language. \
Break assignments down into small, discrete steps that a student can follow. \
Never hand out the full answer to an exercise: guide the student through each step, \
ask what code they think comes next, praise correct answers and encourage them after incorrect ones. \
Refuse every request for a complete solution. \
Only offer hints for a step after the student has made a genuine attempt at it.";

/// Compiled-in tutoring subject.
pub const DEFAULT_SUBJECT: &str = "Java";

/// Get the configuration directory path.
pub fn config_dir() -> PathBuf {
    directories::UserDirs::new().map_or_else(
        || PathBuf::from(".tutor"),
        |dirs| dirs.home_dir().join(".tutor"),
    )
}

/// Get the configuration file path (`TUTOR_CONFIG` wins).
pub fn config_path() -> PathBuf {
    std::env::var("TUTOR_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| config_dir().join("config.json"))
}

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// HTTP listener
    #[serde(default)]
    pub server: ServerConfig,

    /// Key-value store backend
    #[serde(default)]
    pub store: StoreConfig,

    /// Language model API
    #[serde(default)]
    pub llm: LlmConfig,

    /// Admin authentication
    #[serde(default)]
    pub auth: AuthConfig,

    /// Session lifecycle
    #[serde(default)]
    pub session: SessionConfig,

    /// Prompt defaults
    #[serde(default)]
    pub prompt: PromptConfig,

    /// Frontend deployment hooks
    #[serde(default)]
    pub frontend: FrontendConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Key-value store configuration.
///
/// No `redis_url` means the in-memory store is used.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis URL (redis://host:port)
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Connect + probe timeout in seconds
    #[serde(default = "default_store_timeout")]
    pub timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            timeout_secs: default_store_timeout(),
        }
    }
}

/// Language model configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Gemini API key (required at startup)
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_llm_model")]
    pub model: String,

    #[serde(default)]
    pub temperature: Option<f64>,

    #[serde(default)]
    pub max_tokens: Option<i64>,

    /// HTTP client timeout in seconds
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: default_llm_model(),
            temperature: None,
            max_tokens: None,
            timeout_secs: default_llm_timeout(),
        }
    }
}

/// Admin authentication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_admin_username")]
    pub admin_username: String,

    #[serde(default = "default_admin_password")]
    pub admin_password: String,

    /// Secret used to sign admin cookie tokens
    #[serde(default)]
    pub jwt_secret: Option<String>,

    /// Token expiry in seconds
    #[serde(default = "default_token_expiry")]
    pub token_expiry_secs: u64,

    /// Mark the admin cookie `Secure`
    #[serde(default)]
    pub cookie_secure: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            admin_username: default_admin_username(),
            admin_password: default_admin_password(),
            jwt_secret: None,
            token_expiry_secs: default_token_expiry(),
            cookie_secure: false,
        }
    }
}

impl AuthConfig {
    /// Whether the admin credential pair is still the built-in fallback.
    pub fn uses_default_credentials(&self) -> bool {
        self.admin_username == default_admin_username()
            && self.admin_password == default_admin_password()
    }
}

/// Session lifecycle configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Inactivity period after which a session is swept
    #[serde(default = "default_session_ttl")]
    pub ttl_secs: u64,

    /// Minimum time between two opportunistic sweeps
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_session_ttl(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

/// Prompt defaults configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptConfig {
    #[serde(default = "default_prompt")]
    pub default_prompt: String,

    #[serde(default = "default_subject")]
    pub default_subject: String,

    /// File holding defaults promoted by "set as default"
    #[serde(default = "default_defaults_file")]
    pub defaults_file: PathBuf,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            default_prompt: default_prompt(),
            default_subject: default_subject(),
            defaults_file: default_defaults_file(),
        }
    }
}

/// Frontend deployment hooks.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FrontendConfig {
    /// Command (program followed by arguments) run in the background after
    /// the subject changes, e.g. `["npm", "run", "build"]`
    #[serde(default)]
    pub rebuild_command: Option<Vec<String>>,
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level", alias = "level")]
    pub log_level: String,

    /// Log format (json, pretty)
    #[serde(default = "default_log_format", alias = "format")]
    pub log_format: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from the default path.
    pub fn load() -> Result<Self> {
        let path = config_path();
        if !path.exists() {
            tracing::info!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }

        Self::load_from(&path)
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Load configuration with environment variable overrides.
    pub fn load_with_env() -> Result<Self> {
        let mut config = Self::load()?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary variable source.
    ///
    /// Values that fail to parse are ignored and the previous value is kept.
    pub fn apply_overrides_from<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = var("GOOGLE_API_KEY").or_else(|| var("GEMINI_API_KEY")) {
            if !key.trim().is_empty() {
                self.llm.api_key = Some(key);
            }
        }
        if let Some(model) = var("GEMINI_MODEL") {
            self.llm.model = model;
        }

        if let Some(url) = var("REDIS_URL") {
            if !url.trim().is_empty() {
                self.store.redis_url = Some(url);
            }
        }

        if let Some(user) = var("ADMIN_USERNAME") {
            self.auth.admin_username = user;
        }
        if let Some(pass) = var("ADMIN_PASSWORD") {
            self.auth.admin_password = pass;
        }
        if let Some(secret) = var("AUTH_SECRET") {
            self.auth.jwt_secret = Some(secret);
        }
        if let Some(flag) = var("COOKIE_SECURE") {
            match parse_flag(&flag) {
                Some(secure) => self.auth.cookie_secure = secure,
                None => tracing::warn!(value = %flag, "Ignoring invalid COOKIE_SECURE"),
            }
        }

        if let Some(host) = var("HOST") {
            self.server.host = host;
        }
        if let Some(port) = var("PORT") {
            match port.parse() {
                Ok(p) => self.server.port = p,
                Err(_) => tracing::warn!(value = %port, "Ignoring invalid PORT"),
            }
        }

        if let Some(subject) = var("SUBJECT") {
            self.prompt.default_subject = subject;
        }

        if let Some(level) = var("TUTOR_LOG_LEVEL") {
            self.observability.log_level = level;
        }
        if let Some(format) = var("TUTOR_LOG_FORMAT") {
            self.observability.log_format = format;
        }
    }

    /// Return the problems that make this configuration unusable at startup.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self
            .llm
            .api_key
            .as_deref()
            .map_or(true, |k| k.trim().is_empty())
        {
            problems.push("GOOGLE_API_KEY is not set".to_string());
        }

        if self.session.ttl_secs == 0 {
            problems.push("session.ttl_secs must be greater than zero".to_string());
        }

        problems
    }
}

/// Parse a boolean-ish flag as used by env vars and HTML checkboxes.
pub fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    5000
}
fn default_store_timeout() -> u64 {
    5
}
fn default_llm_model() -> String {
    "gemini-2.0-flash".into()
}
fn default_llm_timeout() -> u64 {
    120
}
fn default_admin_username() -> String {
    "admin".into()
}
fn default_admin_password() -> String {
    "admin".into()
}
fn default_token_expiry() -> u64 {
    86400 // 24 hours
}
fn default_session_ttl() -> u64 {
    86400 // 24 hours
}
fn default_sweep_interval() -> u64 {
    300
}
fn default_prompt() -> String {
    DEFAULT_SYSTEM_PROMPT.into()
}
fn default_subject() -> String {
    DEFAULT_SUBJECT.into()
}
fn default_defaults_file() -> PathBuf {
    config_dir().join("prompt_defaults.json")
}
fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "pretty".into()
}

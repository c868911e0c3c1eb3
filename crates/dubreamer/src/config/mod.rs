//! Typed relay configuration.
//!
//! The file model ([`RawConfig`]) is deserialized leniently and then validated
//! once into a [`Config`] snapshot. A snapshot is never mutated: a reload builds
//! a new one and the supervisor diffs the two.

mod loader;

pub use loader::{ConfigLoader, ENV_PREFIX, LoadedConfig, default_search_paths};

use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::hls::RetryPolicy;

pub const DEFAULT_PORT: u16 = 9090;
pub const DEFAULT_HOSTNAME: &str = "localhost";
pub const DEFAULT_USERNAME: &str = "admin";
pub const DEFAULT_PASSWORD: &str = "adminpass";

const DEFAULT_WINDOW_SIZE: usize = 6;
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_millis(500);
const DEFAULT_RETRY_MAX_DELAY: Duration = Duration::from_secs(8);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_DISCONTINUITY_TOLERANCE: Duration = Duration::from_millis(100);
const DEFAULT_IDLE_POLLS_BEFORE_END: u32 = 10;
const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 3;
const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_COMMAND_BUFFER: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file `{name}` not found (searched: {searched})")]
    NotFound { name: String, searched: String },

    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {}: {reason}", path.display())]
    Parse { path: PathBuf, reason: String },

    #[error("invalid value for `{key}`: {reason}")]
    Invalid { key: String, reason: String },

    #[error(
        "default credentials are in use; set auth.username and auth.password, \
         or start with -allow-default-credentials"
    )]
    InsecureCredentials,
}

impl ConfigError {
    pub fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// Options that influence validation, not the file contents.
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidationOptions {
    pub allow_default_credentials: bool,
}

// --- File model ---

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawConfig {
    pub port: Option<i64>,
    pub hostname: Option<String>,
    pub auth: RawAuth,
    pub stream: BTreeMap<String, RawStream>,
    pub supervisor: RawSupervisor,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawAuth {
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawStream {
    pub url: Option<String>,
    pub output: Option<String>,
    pub window_size: Option<i64>,
    pub max_retries: Option<u32>,
    pub retry_base_delay_ms: Option<u64>,
    pub retry_max_delay_ms: Option<u64>,
    pub retry_jitter: Option<bool>,
    pub request_timeout_ms: Option<u64>,
    pub discontinuity_tolerance_ms: Option<u64>,
    pub idle_polls_before_end: Option<u32>,
    pub max_consecutive_failures: Option<u32>,
    pub poll_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawSupervisor {
    pub drain_timeout_secs: Option<u64>,
    pub command_buffer: Option<usize>,
}

// --- Validated snapshot ---

#[derive(Clone, PartialEq, Eq)]
pub struct AuthConfig {
    pub username: String,
    pub password: String,
}

impl AuthConfig {
    pub fn is_default(&self) -> bool {
        self.username == DEFAULT_USERNAME && self.password == DEFAULT_PASSWORD
    }
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Per-stream settings. Compared by value on reload: any difference restarts
/// the stream's pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    pub name: String,
    pub url: Url,
    /// URI prefix used for segments in the rewritten playlist.
    pub output: String,
    pub window_size: usize,
    pub retry: RetryPolicy,
    pub request_timeout: Duration,
    pub discontinuity_tolerance: Duration,
    /// Consecutive polls without new segments before the stream is considered
    /// ended. Zero disables idle detection.
    pub idle_polls_before_end: u32,
    pub max_consecutive_failures: u32,
    /// Fixed cycle interval; when unset the upstream target duration is used.
    pub poll_interval: Option<Duration>,
}

impl StreamConfig {
    pub fn new(name: impl Into<String>, url: Url) -> Self {
        let name = name.into();
        Self {
            output: name.clone(),
            name,
            url,
            window_size: DEFAULT_WINDOW_SIZE,
            retry: RetryPolicy {
                max_retries: DEFAULT_MAX_RETRIES,
                base_delay: DEFAULT_RETRY_BASE_DELAY,
                max_delay: DEFAULT_RETRY_MAX_DELAY,
                jitter: true,
            },
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            discontinuity_tolerance: DEFAULT_DISCONTINUITY_TOLERANCE,
            idle_polls_before_end: DEFAULT_IDLE_POLLS_BEFORE_END,
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
            poll_interval: None,
        }
    }

    fn from_raw(name: &str, raw: &RawStream) -> Result<Self, ConfigError> {
        let key = |field: &str| format!("stream.{name}.{field}");

        if name.trim().is_empty() {
            return Err(ConfigError::invalid("stream", "stream names must not be empty"));
        }

        let url_str = raw
            .url
            .as_deref()
            .ok_or_else(|| ConfigError::invalid(key("url"), "missing upstream playlist URL"))?;
        let url = Url::parse(url_str).map_err(|e| ConfigError::invalid(key("url"), e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::invalid(
                key("url"),
                format!("unsupported scheme `{}`", url.scheme()),
            ));
        }

        let mut config = StreamConfig::new(name, url);

        if let Some(output) = raw.output.as_deref() {
            let output = output.trim_end_matches('/');
            if output.is_empty() {
                return Err(ConfigError::invalid(key("output"), "must not be empty"));
            }
            config.output = output.to_string();
        }

        if let Some(window_size) = raw.window_size {
            if window_size < 1 {
                return Err(ConfigError::invalid(
                    key("window_size"),
                    format!("must be at least 1, got {window_size}"),
                ));
            }
            config.window_size = usize::try_from(window_size)
                .map_err(|e| ConfigError::invalid(key("window_size"), e.to_string()))?;
        }

        if let Some(max_retries) = raw.max_retries {
            config.retry.max_retries = max_retries;
        }
        if let Some(ms) = raw.retry_base_delay_ms {
            config.retry.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = raw.retry_max_delay_ms {
            config.retry.max_delay = Duration::from_millis(ms);
        }
        if let Some(jitter) = raw.retry_jitter {
            config.retry.jitter = jitter;
        }
        if config.retry.max_delay < config.retry.base_delay {
            return Err(ConfigError::invalid(
                key("retry_max_delay_ms"),
                "must not be lower than retry_base_delay_ms",
            ));
        }

        if let Some(ms) = raw.request_timeout_ms {
            if ms == 0 {
                return Err(ConfigError::invalid(key("request_timeout_ms"), "must be positive"));
            }
            config.request_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = raw.discontinuity_tolerance_ms {
            config.discontinuity_tolerance = Duration::from_millis(ms);
        }
        if let Some(polls) = raw.idle_polls_before_end {
            config.idle_polls_before_end = polls;
        }
        if let Some(failures) = raw.max_consecutive_failures {
            if failures == 0 {
                return Err(ConfigError::invalid(
                    key("max_consecutive_failures"),
                    "must be at least 1",
                ));
            }
            config.max_consecutive_failures = failures;
        }
        if let Some(ms) = raw.poll_interval_ms {
            if ms == 0 {
                return Err(ConfigError::invalid(key("poll_interval_ms"), "must be positive"));
            }
            config.poll_interval = Some(Duration::from_millis(ms));
        }

        Ok(config)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorSettings {
    /// Upper bound on how long a draining pipeline may take before it is killed.
    pub drain_timeout: Duration,
    /// Capacity of the lifecycle command channel.
    pub command_buffer: usize,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            command_buffer: DEFAULT_COMMAND_BUFFER,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub port: u16,
    pub hostname: String,
    pub auth: AuthConfig,
    pub streams: BTreeMap<String, Arc<StreamConfig>>,
    pub supervisor: SupervisorSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            hostname: DEFAULT_HOSTNAME.to_string(),
            auth: AuthConfig {
                username: DEFAULT_USERNAME.to_string(),
                password: DEFAULT_PASSWORD.to_string(),
            },
            streams: BTreeMap::new(),
            supervisor: SupervisorSettings::default(),
        }
    }
}

impl Config {
    /// Validate a file model into a snapshot.
    pub fn from_raw(raw: RawConfig, options: ValidationOptions) -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Some(port) = raw.port {
            config.port = u16::try_from(port)
                .ok()
                .filter(|p| *p != 0)
                .ok_or_else(|| {
                    ConfigError::invalid("port", format!("{port} is not a valid TCP port"))
                })?;
        }

        if let Some(hostname) = raw.hostname {
            if hostname.trim().is_empty() {
                return Err(ConfigError::invalid("hostname", "must not be empty"));
            }
            config.hostname = hostname;
        }

        if let Some(username) = raw.auth.username {
            config.auth.username = username;
        }
        if let Some(password) = raw.auth.password {
            config.auth.password = password;
        }
        if config.auth.username.is_empty() || config.auth.password.is_empty() {
            return Err(ConfigError::invalid(
                "auth",
                "username and password must not be empty",
            ));
        }
        if config.auth.is_default() && !options.allow_default_credentials {
            return Err(ConfigError::InsecureCredentials);
        }

        for (name, raw_stream) in &raw.stream {
            let stream = StreamConfig::from_raw(name, raw_stream)?;
            config.streams.insert(name.clone(), Arc::new(stream));
        }

        if let Some(secs) = raw.supervisor.drain_timeout_secs {
            config.supervisor.drain_timeout = Duration::from_secs(secs);
        }
        if let Some(buffer) = raw.supervisor.command_buffer {
            if buffer == 0 {
                return Err(ConfigError::invalid(
                    "supervisor.command_buffer",
                    "must be at least 1",
                ));
            }
            config.supervisor.command_buffer = buffer;
        }

        Ok(config)
    }

    /// Parse and validate TOML text directly. Environment overrides are not
    /// applied; use [`ConfigLoader`] for that.
    pub fn from_toml_str(input: &str, options: ValidationOptions) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(input).map_err(|e| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            reason: e.to_string(),
        })?;
        Self::from_raw(raw, options)
    }

    pub fn uses_default_credentials(&self) -> bool {
        self.auth.is_default()
    }

    pub fn stream(&self, name: &str) -> Option<&Arc<StreamConfig>> {
        self.streams.get(name)
    }
}

//! Bridge Configuration Settings
//!
//! Configuration types for the bridge, read from the process environment
//! and a `.env` file. Variables already set in the process take precedence.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::streaming::DEFAULT_BOOK_INTERVAL;
use crate::infrastructure::broker::{
    BrokerSettings, DEFAULT_SEND_QUEUE_CAPACITY, MAX_MESSAGE_SIZE, WireFormat,
};
use crate::infrastructure::deribit::Credentials;
use crate::infrastructure::deribit::connector::CONNECT_TIMEOUT;
use crate::infrastructure::deribit::pipeline::{DEFAULT_QUEUE_CAPACITY, PipelineSettings};

/// Instrument used by commands that omit one.
pub const DEFAULT_INSTRUMENT: &str = "BTC-PERPETUAL";

/// Environment file looked up from the working directory upwards.
pub const ENV_FILE_NAME: &str = ".env";

// =============================================================================
// Sections
// =============================================================================

/// Deribit endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeribitSettings {
    /// Base URL of the HTTP API.
    pub base_url: String,
    /// WebSocket host.
    pub ws_host: String,
    /// WebSocket port.
    pub ws_port: u16,
    /// WebSocket path.
    pub ws_path: String,
    /// Bound on the WebSocket opening handshake.
    pub connect_timeout: Duration,
}

impl Default for DeribitSettings {
    fn default() -> Self {
        Self {
            base_url: "https://test.deribit.com".to_string(),
            ws_host: "test.deribit.com".to_string(),
            ws_port: 443,
            ws_path: "/ws/api/v2".to_string(),
            connect_timeout: CONNECT_TIMEOUT,
        }
    }
}

/// Local broker settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenSettings {
    /// Listen address.
    pub addr: IpAddr,
    /// Listen port.
    pub port: u16,
    /// Frame type sent to local subscribers.
    pub wire_format: WireFormat,
    /// Rate suffix of order book channels.
    pub book_interval: String,
    /// Frames queued per local session before payloads are dropped.
    pub send_queue_capacity: usize,
}

impl Default for ListenSettings {
    fn default() -> Self {
        Self {
            addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 8000,
            wire_format: WireFormat::Text,
            book_interval: DEFAULT_BOOK_INTERVAL.to_string(),
            send_queue_capacity: DEFAULT_SEND_QUEUE_CAPACITY,
        }
    }
}

/// Trading request settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestSettings {
    /// Per-request HTTP timeout.
    pub http_timeout: Duration,
    /// Pipeline queue capacity.
    pub queue_capacity: usize,
    /// How long callers wait on a result handle.
    pub call_timeout: Duration,
}

impl Default for RequestSettings {
    fn default() -> Self {
        Self {
            http_timeout: Duration::from_secs(30),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            call_timeout: Duration::from_secs(30),
        }
    }
}

/// Server port settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    /// Health check HTTP port (0 = disabled).
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { health_port: 8082 }
    }
}

// =============================================================================
// Env Source
// =============================================================================

/// Key lookup over the process environment, falling back to the nearest
/// `.env` file.
#[derive(Debug, Clone, Default)]
pub struct EnvSource {
    file: HashMap<String, String>,
    path: Option<PathBuf>,
}

impl EnvSource {
    /// Read the nearest `.env` in the working directory or its ancestors.
    /// A missing file is not an error.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::File` if a file is found but cannot be parsed.
    pub fn load() -> Result<Self, ConfigError> {
        match find_env_file() {
            Some(path) => Ok(Self {
                file: read_env_file(&path)?,
                path: Some(path),
            }),
            None => Ok(Self::default()),
        }
    }

    /// Path of the file that was read, if any.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Value for `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<String> {
        std::env::var(key)
            .ok()
            .or_else(|| self.file.get(key).cloned())
    }
}

// =============================================================================
// Bridge Config
// =============================================================================

/// Complete bridge configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// API credentials.
    pub credentials: Credentials,
    /// Deribit endpoints.
    pub deribit: DeribitSettings,
    /// Local broker.
    pub listen: ListenSettings,
    /// Trading requests.
    pub requests: RequestSettings,
    /// Server ports.
    pub server: ServerSettings,
    /// Instrument used when a command names none.
    pub default_instrument: String,
}

impl BridgeConfig {
    /// Load configuration from the process environment, with the nearest
    /// `.env` file (if any) filling in unset variables.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be parsed or credentials are
    /// missing.
    pub fn from_env() -> Result<Self, ConfigError> {
        let source = EnvSource::load()?;
        Self::from_lookup(|key| source.get(key))
    }

    /// Load configuration from a single env file, ignoring the process
    /// environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or credentials
    /// are missing.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let values = read_env_file(path)?;
        Self::from_lookup(|key| values.get(key).cloned())
    }

    /// Build configuration from a key lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if required credentials are missing or empty.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Lookup(lookup);

        let api_key = env.required(&["API_KEY", "DERIBIT_API_KEY"])?;
        let api_secret = env.required(&["API_SECRET", "DERIBIT_API_SECRET"])?;
        let credentials = Credentials::new(api_key, api_secret)
            .map_err(|e| ConfigError::InvalidCredentials(e.to_string()))?;

        let deribit_defaults = DeribitSettings::default();
        let deribit = DeribitSettings {
            base_url: env
                .first(&["BASE_URL", "DERIBIT_BASE_URL"])
                .map_or(deribit_defaults.base_url, |url| {
                    url.trim_end_matches('/').to_string()
                }),
            ws_host: env.string("DERIBIT_WS_HOST", deribit_defaults.ws_host),
            ws_port: env.parse("DERIBIT_WS_PORT", deribit_defaults.ws_port),
            ws_path: env.string("DERIBIT_WS_PATH", deribit_defaults.ws_path),
            connect_timeout: Duration::from_secs(env.parse(
                "DERIBIT_CONNECT_TIMEOUT_SECS",
                deribit_defaults.connect_timeout.as_secs(),
            )),
        };

        let listen_defaults = ListenSettings::default();
        let listen = ListenSettings {
            addr: env.parse("BRIDGE_LISTEN_ADDR", listen_defaults.addr),
            port: env.parse("BRIDGE_LISTEN_PORT", listen_defaults.port),
            wire_format: WireFormat::from_binary_flag(
                env.get("BINARY_PROTOCOL").as_deref() == Some("true"),
            ),
            book_interval: env.string("BOOK_INTERVAL", listen_defaults.book_interval),
            send_queue_capacity: env
                .parse("SESSION_QUEUE_CAPACITY", listen_defaults.send_queue_capacity)
                .max(1),
        };

        let request_defaults = RequestSettings::default();
        let requests = RequestSettings {
            http_timeout: Duration::from_secs(
                env.parse("HTTP_TIMEOUT_SECS", request_defaults.http_timeout.as_secs()),
            ),
            queue_capacity: env
                .parse("PIPELINE_QUEUE_CAPACITY", request_defaults.queue_capacity)
                .max(1),
            call_timeout: Duration::from_secs(
                env.parse("CALL_TIMEOUT_SECS", request_defaults.call_timeout.as_secs()),
            ),
        };

        let server = ServerSettings {
            health_port: env.parse("HEALTH_PORT", ServerSettings::default().health_port),
        };

        Ok(Self {
            credentials,
            deribit,
            listen,
            requests,
            server,
            default_instrument: env.string("DEFAULT_INSTRUMENT", DEFAULT_INSTRUMENT.to_string()),
        })
    }

    /// Broker settings derived from this configuration.
    #[must_use]
    pub fn broker_settings(&self) -> BrokerSettings {
        BrokerSettings {
            listen_addr: SocketAddr::new(self.listen.addr, self.listen.port),
            wire_format: self.listen.wire_format,
            max_message_size: MAX_MESSAGE_SIZE,
            send_queue_capacity: self.listen.send_queue_capacity,
        }
    }

    /// Pipeline settings derived from this configuration.
    #[must_use]
    pub const fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            queue_capacity: self.requests.queue_capacity,
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    /// Variable is present but empty.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),

    /// Credentials were rejected.
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    /// Env file could not be read or parsed.
    #[error("failed to read {path}: {reason}")]
    File {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        reason: String,
    },
}

// =============================================================================
// Helpers
// =============================================================================

struct Lookup<F>(F);

impl<F> Lookup<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
    }

    /// First key that is set, in order.
    fn first(&self, keys: &[&str]) -> Option<String> {
        keys.iter().find_map(|key| self.get(key))
    }

    fn required(&self, keys: &[&'static str]) -> Result<String, ConfigError> {
        let primary = keys.first().copied().unwrap_or_default();
        for key in keys {
            if let Some(value) = self.get(key) {
                if value.is_empty() {
                    return Err(ConfigError::EmptyValue((*key).to_string()));
                }
                return Ok(value);
            }
        }
        Err(ConfigError::MissingEnvVar(primary.to_string()))
    }

    fn string(&self, key: &str, default: String) -> String {
        self.get(key).filter(|v| !v.is_empty()).unwrap_or(default)
    }

    fn parse<T>(&self, key: &str, default: T) -> T
    where
        T: std::str::FromStr,
    {
        match self.get(key) {
            Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                tracing::warn!(key, value = %raw, "Ignoring unparsable setting");
                default
            }),
            None => default,
        }
    }
}

fn find_env_file() -> Option<PathBuf> {
    let cwd = std::env::current_dir().ok()?;
    cwd.ancestors()
        .map(|dir| dir.join(ENV_FILE_NAME))
        .find(|candidate| candidate.is_file())
}

fn read_env_file(path: &Path) -> Result<HashMap<String, String>, ConfigError> {
    let file_error = |reason: String| ConfigError::File {
        path: path.to_path_buf(),
        reason,
    };

    let entries = dotenvy::from_path_iter(path).map_err(|e| file_error(e.to_string()))?;
    entries
        .map(|entry| entry.map_err(|e| file_error(e.to_string())))
        .collect()
}

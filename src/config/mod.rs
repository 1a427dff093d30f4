//! Configuration module - environment variable parsing

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use uuid::Uuid;

/// Log output format
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(ConfigError::Invalid("LOG_FORMAT")),
        }
    }
}

/// Client configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    /// Game Engine WebSocket URL
    pub ge_url: String,
    /// Authentication token presented in the handshake
    pub token: String,
    /// Robot identifier registered with the Game Engine
    pub robot_id: String,
    /// Client instance identifier, random per process unless pinned
    pub client_id: String,
    /// Protocol version announced in the handshake
    pub protocol_version: u32,

    /// Optional domain socket for the local side channel
    pub local_socket_path: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format
    pub log_format: LogFormat,

    /// Deadline for a single connection attempt
    pub connect_timeout: Duration,
    /// First reconnect delay
    pub backoff_min: Duration,
    /// Reconnect delay cap
    pub backoff_max: Duration,
    /// Spacing between local channel connection attempts
    pub local_retry: Duration,
    /// Seat inactivity timeout before inputs are reset
    pub watchdog_timeout: Duration,
    /// How long to wait for an acknowledgement from the other side
    pub ack_timeout: Duration,

    /// Enable input routing automatically when a game starts
    pub enable_inputs_on_start: bool,
}

impl Config {
    /// Build a configuration with default timings for the given connection parameters
    pub fn new(
        ge_url: impl Into<String>,
        token: impl Into<String>,
        robot_id: impl Into<String>,
    ) -> Self {
        Self {
            ge_url: ge_url.into(),
            token: token.into(),
            robot_id: robot_id.into(),
            client_id: Uuid::new_v4().to_string(),
            protocol_version: 1,
            local_socket_path: None,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            connect_timeout: Duration::from_secs(10),
            backoff_min: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
            local_retry: Duration::from_secs(5),
            watchdog_timeout: Duration::from_secs(5),
            ack_timeout: Duration::from_secs(10),
            enable_inputs_on_start: true,
        }
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::new(
            env::var("GE_URL").map_err(|_| ConfigError::Missing("GE_URL"))?,
            env::var("GE_TOKEN").map_err(|_| ConfigError::Missing("GE_TOKEN"))?,
            env::var("ROBOT_ID").map_err(|_| ConfigError::Missing("ROBOT_ID"))?,
        );

        if let Ok(client_id) = env::var("GE_CLIENT_ID") {
            config.client_id = client_id;
        }
        config.protocol_version = parse_var("GE_PROTOCOL_VERSION", config.protocol_version)?;
        config.local_socket_path = env::var("LOCAL_SOCKET_PATH").ok().map(PathBuf::from);

        config.log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        config.log_format = parse_var("LOG_FORMAT", config.log_format)?;

        config.connect_timeout = secs_var("CONNECT_TIMEOUT_SECS", config.connect_timeout)?;
        config.backoff_min = secs_var("BACKOFF_MIN_SECS", config.backoff_min)?;
        config.backoff_max = secs_var("BACKOFF_MAX_SECS", config.backoff_max)?;
        config.local_retry = secs_var("LOCAL_RETRY_SECS", config.local_retry)?;
        config.watchdog_timeout = secs_var("WATCHDOG_TIMEOUT_SECS", config.watchdog_timeout)?;
        config.ack_timeout = secs_var("ACK_TIMEOUT_SECS", config.ack_timeout)?;

        config.enable_inputs_on_start =
            parse_var("ENABLE_INPUTS_ON_START", config.enable_inputs_on_start)?;

        if config.backoff_min > config.backoff_max {
            return Err(ConfigError::Invalid("BACKOFF_MIN_SECS"));
        }

        Ok(config)
    }
}

fn parse_var<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid(name)),
        Err(_) => Ok(default),
    }
}

fn secs_var(name: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|secs| secs.is_finite() && *secs > 0.0)
            .map(Duration::from_secs_f64)
            .ok_or(ConfigError::Invalid(name)),
        Err(_) => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid value for environment variable: {0}")]
    Invalid(&'static str),

    #[error("Input '{0}' is registered more than once")]
    DuplicateInput(String),
}

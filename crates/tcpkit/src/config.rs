//! Server configuration management

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Process-wide server configuration.
///
/// This holds the plain settings only. Lifecycle callbacks live in
/// [`Hooks`](crate::Hooks) so that a `ServerConfig` can be loaded from a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Run the heartbeat task on every connection
    pub enable_heartbeating: bool,
    /// Seconds of inactivity after which a connection is closed
    pub heartbeat_threshold_secs: u64,
    /// Seconds between two liveness checks
    pub heartbeat_period_secs: u64,
    /// Outbound queue capacity per connection
    pub send_chan_buf: usize,
    /// Inbound queue capacity per connection
    pub receive_chan_buf: usize,
    /// What the read task counts as a sign of life
    pub liveness: LivenessMode,
    /// Pause after a failed accept before trying again
    pub accept_backoff_ms: u64,
    /// Set `TCP_NODELAY` on accepted sockets
    pub tcp_nodelay: bool,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// When the read task refreshes a connection's heartbeat timestamp.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LivenessMode {
    /// Stamp right before each read attempt. Idle time runs from the start
    /// of the latest read, so a packet stuck behind a full inbound queue
    /// counts as idle: a handle task slower than the threshold gets the
    /// connection closed even while the peer keeps sending.
    #[default]
    ReadAttempt,
    /// Stamp as soon as a complete frame has been parsed. Idle time runs from
    /// the last frame, including any wait for room in the inbound queue.
    FrameReceived,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level, overridden by `RUST_LOG` when set
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub structured: bool,
    /// Where log lines go
    pub output: LogOutput,
}

/// Destination for log output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogOutput {
    /// Write to stderr
    #[default]
    Stderr,
    /// Do not install a subscriber
    None,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enable_heartbeating: false,
            heartbeat_threshold_secs: 60,
            heartbeat_period_secs: 10,
            send_chan_buf: 64,
            receive_chan_buf: 64,
            liveness: LivenessMode::default(),
            accept_backoff_ms: 50,
            tcp_nodelay: true,
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            structured: false,
            output: LogOutput::Stderr,
        }
    }
}

impl LoggingConfig {
    /// Errors only, human-readable, on stderr.
    #[must_use]
    pub fn stderr_minimal() -> Self {
        Self {
            level: "error".to_string(),
            structured: false,
            output: LogOutput::Stderr,
        }
    }

    /// Everything down to debug, human-readable, on stderr.
    #[must_use]
    pub fn stderr_debug() -> Self {
        Self {
            level: "debug".to_string(),
            structured: false,
            output: LogOutput::Stderr,
        }
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file not found
    #[error("Configuration file not found: {0}")]
    FileNotFound(PathBuf),

    /// Unsupported file format
    #[error("Unsupported configuration file format. Use .toml, .yaml, .yml, or .json")]
    UnsupportedFormat,

    /// Configuration parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(#[from] config::ConfigError),

    /// A value was parsed but cannot be used
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl ServerConfig {
    /// Load configuration from a file (TOML, YAML, or JSON)
    ///
    /// The format is picked from the file extension. Environment variables
    /// with the `TCPKIT_` prefix override file settings, with `__` separating
    /// nested keys (for example `TCPKIT_LOGGING__LEVEL=debug`).
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use tcpkit::ServerConfig;
    ///
    /// let config = ServerConfig::from_file("tcpkit.toml").expect("Failed to load config");
    /// ```
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_file_with_prefix(path, "TCPKIT")
    }

    /// Load configuration from a file with a custom environment prefix
    pub fn from_file_with_prefix(
        path: impl AsRef<Path>,
        env_prefix: &str,
    ) -> Result<Self, ConfigError> {
        use config::{Config, Environment, File, FileFormat};

        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }

        let format = match path.extension().and_then(|s| s.to_str()) {
            Some("toml") => FileFormat::Toml,
            Some("yaml") | Some("yml") => FileFormat::Yaml,
            Some("json") => FileFormat::Json,
            _ => return Err(ConfigError::UnsupportedFormat),
        };

        let config = Config::builder()
            .add_source(File::new(
                path.to_str().ok_or(ConfigError::UnsupportedFormat)?,
                format,
            ))
            .add_source(
                Environment::with_prefix(env_prefix)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let parsed: Self = config.try_deserialize()?;
        parsed.validate()?;
        Ok(parsed)
    }

    /// Create a configuration builder
    ///
    /// # Example
    ///
    /// ```rust
    /// use tcpkit::ServerConfig;
    ///
    /// let config = ServerConfig::builder()
    ///     .heartbeat(5, 1)
    ///     .send_chan_buf(16)
    ///     .build();
    /// assert!(config.enable_heartbeating);
    /// ```
    pub fn builder() -> ConfigurationBuilder {
        ConfigurationBuilder::new()
    }

    /// Check that the settings can drive a server.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.enable_heartbeating && self.heartbeat_period_secs == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat_period_secs must be greater than zero when heartbeating is enabled"
                    .to_string(),
            ));
        }
        Ok(())
    }

    /// Interval between two heartbeat checks.
    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_secs(self.heartbeat_period_secs.max(1))
    }

    /// Pause applied after a failed accept.
    pub fn accept_backoff(&self) -> Duration {
        Duration::from_millis(self.accept_backoff_ms)
    }

    // mpsc channels cannot be unbuffered
    pub(crate) fn send_capacity(&self) -> usize {
        self.send_chan_buf.max(1)
    }

    pub(crate) fn receive_capacity(&self) -> usize {
        self.receive_chan_buf.max(1)
    }
}

/// Configuration builder
#[derive(Debug)]
pub struct ConfigurationBuilder {
    config: ServerConfig,
}

impl ConfigurationBuilder {
    /// Create a new configuration builder
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: ServerConfig::default(),
        }
    }

    /// Enable heartbeating with a threshold and a check period, in seconds
    pub fn heartbeat(mut self, threshold_secs: u64, period_secs: u64) -> Self {
        self.config.enable_heartbeating = true;
        self.config.heartbeat_threshold_secs = threshold_secs;
        self.config.heartbeat_period_secs = period_secs;
        self
    }

    /// Disable heartbeating
    pub fn no_heartbeat(mut self) -> Self {
        self.config.enable_heartbeating = false;
        self
    }

    /// Set outbound queue capacity
    pub fn send_chan_buf(mut self, capacity: usize) -> Self {
        self.config.send_chan_buf = capacity;
        self
    }

    /// Set inbound queue capacity
    pub fn receive_chan_buf(mut self, capacity: usize) -> Self {
        self.config.receive_chan_buf = capacity;
        self
    }

    /// Set the liveness mode
    pub fn liveness(mut self, mode: LivenessMode) -> Self {
        self.config.liveness = mode;
        self
    }

    /// Set the accept retry pause
    pub fn accept_backoff(mut self, backoff: Duration) -> Self {
        self.config.accept_backoff_ms = backoff.as_millis() as u64;
        self
    }

    /// Enable or disable `TCP_NODELAY` on accepted sockets
    pub fn tcp_nodelay(mut self, enabled: bool) -> Self {
        self.config.tcp_nodelay = enabled;
        self
    }

    /// Set logging configuration
    pub fn logging(mut self, logging: LoggingConfig) -> Self {
        self.config.logging = logging;
        self
    }

    /// Build the configuration
    pub fn build(self) -> ServerConfig {
        self.config
    }
}

impl Default for ConfigurationBuilder {
    fn default() -> Self {
        Self::new()
    }
}

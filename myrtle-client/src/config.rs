//! Connection configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via MYRTLE_CONFIG)
//! 3. Environment variables

use myrtle_protocol::packet::{DEFAULT_BUFFER_CAPACITY, DEFAULT_RECLAIM_THRESHOLD};
use myrtle_protocol::{
    TextEncoding, DEFAULT_COMPRESSION_THRESHOLD, DEFAULT_MAX_ALLOWED_PACKET, DEFAULT_PORT,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Minimum read buffer size (1 KiB).
pub const MIN_READ_BUFFER_SIZE: usize = 1024;

/// Maximum read buffer size (1 MiB).
pub const MAX_READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Smallest accepted max_allowed_packet (1 KiB).
pub const MIN_MAX_ALLOWED_PACKET: usize = 1024;

/// Default number of frames kept by the frame trace.
pub const DEFAULT_TRACE_CAPACITY: usize = 64;

/// TLS configuration for the transport upgrade.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsClientConfig {
    /// Request a TLS upgrade during the handshake.
    pub enabled: bool,
    /// Path to PEM-encoded CA certificate(s) for server verification.
    /// If None, the webpki roots are used.
    pub ca_cert_path: Option<PathBuf>,
    /// Path to PEM-encoded client certificate (for mTLS).
    pub client_cert_path: Option<PathBuf>,
    /// Path to PEM-encoded client private key (for mTLS).
    pub client_key_path: Option<PathBuf>,
    /// Skip server certificate verification (INSECURE - development only).
    pub insecure: bool,
    /// Server name for SNI (defaults to the configured host).
    pub server_name: Option<String>,
}

impl TlsClientConfig {
    pub fn new() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }

    pub fn with_ca_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_cert_path = Some(path.into());
        self.enabled = true;
        self
    }

    pub fn with_client_cert(
        mut self,
        cert_path: impl Into<PathBuf>,
        key_path: impl Into<PathBuf>,
    ) -> Self {
        self.client_cert_path = Some(cert_path.into());
        self.client_key_path = Some(key_path.into());
        self.enabled = true;
        self
    }

    pub fn with_insecure(mut self) -> Self {
        self.insecure = true;
        self.enabled = true;
        self
    }

    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    fn apply_env_overrides(&mut self, env: &impl Fn(&str) -> Option<String>) {
        if let Some(path) = env("MYRTLE_TLS_CA") {
            self.ca_cert_path = Some(PathBuf::from(path));
        }
        if let Some(path) = env("MYRTLE_TLS_CERT") {
            self.client_cert_path = Some(PathBuf::from(path));
        }
        if let Some(path) = env("MYRTLE_TLS_KEY") {
            self.client_key_path = Some(PathBuf::from(path));
        }
        if let Some(insecure) = env("MYRTLE_TLS_INSECURE") {
            self.insecure = parse_flag(&insecure);
        }
        if let Some(name) = env("MYRTLE_TLS_SERVER_NAME") {
            self.server_name = Some(name);
        }
    }

    /// Validates TLS configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.client_cert_path.is_some() != self.client_key_path.is_some() {
            return Err(ConfigError::ValidationError(
                "client certificate and key must be set together".to_string(),
            ));
        }
        Ok(())
    }
}

/// Connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Server host name or address.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Login user.
    pub user: String,
    /// Login password.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Default database selected at login.
    pub database: Option<String>,
    /// TCP connect timeout in seconds.
    pub connect_timeout_secs: u64,
    /// Socket read timeout in milliseconds (0 disables it).
    pub socket_timeout_ms: u64,
    /// Largest message accepted in either direction.
    pub max_allowed_packet: usize,
    /// Encoding used for text command arguments.
    pub encoding: TextEncoding,
    /// Enable protocol compression when the server supports it.
    pub compress: bool,
    /// Payloads at or below this size are sent uncompressed.
    pub compression_threshold: usize,
    /// Validate inbound sequence numbers.
    pub check_sequence: bool,
    /// Keep a ring of recent frames and hex-dump them at trace level.
    pub trace_frames: bool,
    /// Number of frames kept by the frame trace.
    pub trace_capacity: usize,
    /// Default size of the send/receive buffers.
    pub read_buffer_size: usize,
    /// Buffers that grew past this are replaced at the next command.
    pub reclaim_threshold: usize,
    /// TLS configuration (optional).
    pub tls: Option<TlsClientConfig>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            user: "root".to_string(),
            password: None,
            database: None,
            connect_timeout_secs: 10,
            socket_timeout_ms: 30_000,
            max_allowed_packet: DEFAULT_MAX_ALLOWED_PACKET,
            encoding: TextEncoding::default(),
            compress: false,
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
            check_sequence: true,
            trace_frames: false,
            trace_capacity: DEFAULT_TRACE_CAPACITY,
            read_buffer_size: DEFAULT_BUFFER_CAPACITY,
            reclaim_threshold: DEFAULT_RECLAIM_THRESHOLD,
            tls: None,
        }
    }
}

impl ConnectionConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("MYRTLE_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: ConnectionConfig = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }

    /// Applies `MYRTLE_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    fn apply_overrides_from(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(host) = env("MYRTLE_HOST") {
            self.host = host;
        }
        if let Some(port) = env("MYRTLE_PORT").and_then(|v| v.parse().ok()) {
            self.port = port;
        }
        if let Some(user) = env("MYRTLE_USER") {
            self.user = user;
        }
        if let Some(password) = env("MYRTLE_PASSWORD") {
            self.password = Some(password);
        }
        if let Some(database) = env("MYRTLE_DATABASE") {
            self.database = Some(database);
        }
        if let Some(secs) = env("MYRTLE_CONNECT_TIMEOUT").and_then(|v| v.parse().ok()) {
            self.connect_timeout_secs = secs;
        }
        if let Some(ms) = env("MYRTLE_SOCKET_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.socket_timeout_ms = ms;
        }
        if let Some(max) = env("MYRTLE_MAX_ALLOWED_PACKET").and_then(|v| v.parse().ok()) {
            self.max_allowed_packet = max;
        }
        if let Some(encoding) = env("MYRTLE_ENCODING") {
            match encoding.to_lowercase().as_str() {
                "utf8" | "utf-8" | "utf8mb4" => self.encoding = TextEncoding::Utf8,
                "latin1" | "iso-8859-1" => self.encoding = TextEncoding::Latin1,
                other => tracing::warn!("ignoring unknown MYRTLE_ENCODING '{}'", other),
            }
        }
        if let Some(compress) = env("MYRTLE_COMPRESS") {
            self.compress = parse_flag(&compress);
        }
        if let Some(trace) = env("MYRTLE_TRACE_FRAMES") {
            self.trace_frames = parse_flag(&trace);
        }

        if let Some(enabled) = env("MYRTLE_TLS") {
            self.tls.get_or_insert_with(TlsClientConfig::default).enabled = parse_flag(&enabled);
        }
        if let Some(tls) = self.tls.as_mut() {
            tls.apply_env_overrides(&env);
        }
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty() {
            return Err(ConfigError::ValidationError("host is empty".to_string()));
        }
        if self.max_allowed_packet < MIN_MAX_ALLOWED_PACKET {
            return Err(ConfigError::ValidationError(format!(
                "max_allowed_packet {} is below {}",
                self.max_allowed_packet, MIN_MAX_ALLOWED_PACKET
            )));
        }
        if let Some(tls) = &self.tls {
            tls.validate()?;
        }
        Ok(())
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn with_socket_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.socket_timeout_ms = timeout.map(|t| t.as_millis() as u64).unwrap_or(0);
        self
    }

    pub fn with_max_allowed_packet(mut self, max: usize) -> Self {
        self.max_allowed_packet = max;
        self
    }

    pub fn with_encoding(mut self, encoding: TextEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn with_compression(mut self, enabled: bool) -> Self {
        self.compress = enabled;
        self
    }

    pub fn with_compression_threshold(mut self, threshold: usize) -> Self {
        self.compression_threshold = threshold;
        self
    }

    pub fn with_sequence_check(mut self, enabled: bool) -> Self {
        self.check_sequence = enabled;
        self
    }

    pub fn with_frame_trace(mut self, capacity: usize) -> Self {
        self.trace_frames = true;
        self.trace_capacity = capacity;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.clamp(MIN_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE);
        self
    }

    pub fn with_reclaim_threshold(mut self, threshold: usize) -> Self {
        self.reclaim_threshold = threshold;
        self
    }

    pub fn with_tls(mut self, tls_config: TlsClientConfig) -> Self {
        self.tls = Some(tls_config);
        self
    }

    /// `host:port` for connecting.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Socket read timeout; `None` waits forever.
    pub fn socket_timeout(&self) -> Option<Duration> {
        (self.socket_timeout_ms > 0).then(|| Duration::from_millis(self.socket_timeout_ms))
    }

    /// Whether a TLS upgrade should be requested.
    pub fn tls_enabled(&self) -> bool {
        self.tls.as_ref().is_some_and(|tls| tls.enabled)
    }
}

fn parse_flag(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

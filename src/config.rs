//! Configuration system for the fleet console
//!
//! Supports multiple configuration sources with the following precedence (highest to lowest):
//! 1. CLI arguments
//! 2. Environment variables (FLEET_* prefix)
//! 3. Configuration file (TOML)
//! 4. Default values

use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::service::MAX_SCHEDULE_SECS;

/// Main console configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    /// Master listener and routing settings
    pub master: MasterSettings,

    /// Monitor identity and master connection settings
    pub monitor: MonitorSettings,

    /// Admin users and the monitor shared secret
    pub auth: AuthSettings,

    /// Built-in module settings
    pub modules: ModulesSettings,

    /// Logging configuration
    pub logging: LoggingSettings,
}

/// Master settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterSettings {
    /// Interface to listen on
    pub host: String,

    /// WebSocket listen port
    pub port: u16,

    /// Deployment environment passed to the authenticators
    pub env: String,

    /// Accept `reconnect` without re-running server authentication
    pub trust_reconnect: bool,

    /// Outstanding requests kept per monitor for redelivery (0 = unbounded)
    pub redelivery_limit: usize,

    /// Buffered service events per subscriber
    pub event_capacity: usize,
}

/// Monitor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    /// Server id registered with the master
    pub id: String,

    /// Declared server type
    pub server_type: String,

    /// Master WebSocket URL
    pub master_url: String,

    /// Host of this process, sent as registration info
    pub host: String,

    /// Port of this process, sent as registration info
    pub port: u16,

    /// Reconnect after losing the master
    pub reconnect: bool,

    /// Initial reconnection delay in milliseconds
    pub reconnect_interval_ms: u64,

    /// Upper bound for the reconnection backoff in milliseconds
    pub max_reconnect_delay_ms: u64,

    /// Maximum reconnection attempts (0 = infinite)
    pub max_reconnect_attempts: u32,

    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,

    /// Time allowed for the master's registration reply in milliseconds
    pub register_timeout_ms: u64,
}

/// Authentication settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    /// Shared secret monitors present when registering (unset = accept all)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_token: Option<String>,

    /// Admin users allowed to connect as clients
    pub users: Vec<AdminUserEntry>,
}

/// One `[[auth.users]]` entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminUserEntry {
    pub username: String,

    /// Plain text or SHA-256 hex digest
    pub password: String,

    /// 0 and 1 may run commands
    pub level: u64,
}

/// Built-in module settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModulesSettings {
    pub system_info: SystemInfoSettings,
}

/// `systemInfo` module settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemInfoSettings {
    /// Register the module at startup
    pub enabled: bool,

    /// Delay before the first collection in seconds
    pub delay_secs: f64,

    /// Collection interval in seconds
    pub interval_secs: f64,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level: trace, debug, info, warn, error
    pub level: String,

    /// Log file path (empty = no file logging)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,

    /// Maximum log file size in MB before rotation
    pub max_file_size_mb: u64,

    /// Number of rotated log files to keep
    pub max_files: u32,

    /// Enable JSON formatted logging
    pub json_format: bool,
}

// Default implementations

impl Default for MasterSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3005,
            env: "development".to_string(),
            trust_reconnect: true,
            redelivery_limit: 1024,
            event_capacity: 256,
        }
    }
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            id: "monitor-1".to_string(),
            server_type: "server".to_string(),
            master_url: "ws://127.0.0.1:3005".to_string(),
            host: "127.0.0.1".to_string(),
            port: 0,
            reconnect: true,
            reconnect_interval_ms: 1000,
            max_reconnect_delay_ms: 60000,
            max_reconnect_attempts: 0, // Infinite
            connect_timeout_ms: 10000,
            register_timeout_ms: 30000,
        }
    }
}

impl Default for SystemInfoSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            delay_secs: 10.0,
            interval_secs: 300.0,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            max_file_size_mb: 100,
            max_files: 5,
            json_format: false,
        }
    }
}

impl MasterSettings {
    /// `host:port` the master listens on
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl ConsoleConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::default();

        // 1. Load from config file if it exists
        if let Some(path) = Self::find_config_file(config_path)? {
            debug!(path = %path.display(), "Loading configuration file");
            let content = fs::read_to_string(&path).map_err(|e| Error::ConfigNotFound {
                path: path.clone(),
                source: Some(e),
            })?;
            config = Self::from_toml(&content)?;
            info!(path = %path.display(), "Configuration loaded from file");
        }

        // 2. Apply environment variable overrides
        config.apply_env_overrides();

        // 3. Expand paths
        config.expand_paths();

        // 4. Validate
        config.validate()?;

        Ok(config)
    }

    /// Parse a TOML document without consulting the environment
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::ConfigParse {
            message: e.to_string(),
            source: Some(e),
        })
    }

    /// Find the configuration file to use
    fn find_config_file(explicit_path: Option<&str>) -> Result<Option<PathBuf>> {
        // If explicit path provided, use it (error if not found)
        if let Some(path) = explicit_path {
            let path = PathBuf::from(expand_path(path));
            if path.exists() {
                return Ok(Some(path));
            }
            return Err(Error::config_not_found(path));
        }

        // Search in standard locations
        let search_paths = [
            // Current directory
            PathBuf::from("fleet-console.toml"),
            // User config directory
            dirs::config_dir()
                .map(|p| p.join("fleet").join("console.toml"))
                .unwrap_or_default(),
            // Home directory
            dirs::home_dir()
                .map(|p| p.join(".fleet").join("console.toml"))
                .unwrap_or_default(),
            // System config (Linux)
            PathBuf::from("/etc/fleet/console.toml"),
        ];

        for path in &search_paths {
            if !path.as_os_str().is_empty() && path.exists() {
                debug!(path = %path.display(), "Found configuration file");
                return Ok(Some(path.clone()));
            }
        }

        debug!("No configuration file found, using defaults");
        Ok(None)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        // Master settings
        if let Ok(val) = std::env::var("FLEET_MASTER_HOST") {
            self.master.host = val;
        }
        if let Ok(val) = std::env::var("FLEET_MASTER_PORT") {
            if let Ok(n) = val.parse() {
                self.master.port = n;
            }
        }
        if let Ok(val) = std::env::var("FLEET_ENV") {
            self.master.env = val;
        }
        if let Ok(val) = std::env::var("FLEET_TRUST_RECONNECT") {
            self.master.trust_reconnect = parse_bool(&val);
        }
        if let Ok(val) = std::env::var("FLEET_REDELIVERY_LIMIT") {
            if let Ok(n) = val.parse() {
                self.master.redelivery_limit = n;
            }
        }

        // Monitor settings
        if let Ok(val) = std::env::var("FLEET_MONITOR_ID") {
            self.monitor.id = val;
        }
        if let Ok(val) = std::env::var("FLEET_SERVER_TYPE") {
            self.monitor.server_type = val;
        }
        if let Ok(val) = std::env::var("FLEET_MASTER_URL") {
            self.monitor.master_url = val;
        }
        if let Ok(val) = std::env::var("FLEET_MONITOR_HOST") {
            self.monitor.host = val;
        }
        if let Ok(val) = std::env::var("FLEET_MONITOR_PORT") {
            if let Ok(n) = val.parse() {
                self.monitor.port = n;
            }
        }
        if let Ok(val) = std::env::var("FLEET_RECONNECT") {
            self.monitor.reconnect = parse_bool(&val);
        }
        if let Ok(val) = std::env::var("FLEET_MAX_RECONNECT_ATTEMPTS") {
            if let Ok(n) = val.parse() {
                self.monitor.max_reconnect_attempts = n;
            }
        }

        // Auth settings
        if let Ok(val) = std::env::var("FLEET_SERVER_TOKEN") {
            self.auth.server_token = Some(val);
        }

        // Logging settings
        if let Ok(val) = std::env::var("FLEET_LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Ok(val) = std::env::var("FLEET_LOG_FILE") {
            self.logging.file = Some(val);
        }
        if let Ok(val) = std::env::var("FLEET_LOG_JSON") {
            self.logging.json_format = parse_bool(&val);
        }
    }

    /// Expand ~ and other path variables
    fn expand_paths(&mut self) {
        if let Some(ref file) = self.logging.file {
            self.logging.file = Some(expand_path(file));
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.master.port == 0 {
            return Err(Error::config_field_invalid(
                "master.port",
                "master port must be non-zero",
            ));
        }

        let url = &self.monitor.master_url;
        if url.is_empty() {
            return Err(Error::config_field_invalid(
                "monitor.master_url",
                "master URL cannot be empty",
            ));
        }
        if !url.starts_with("ws://") && !url.starts_with("wss://") {
            return Err(Error::config_field_invalid(
                "monitor.master_url",
                "master URL must start with ws:// or wss://",
            ));
        }

        if self.monitor.id.trim().is_empty() {
            return Err(Error::config_field_invalid(
                "monitor.id",
                "monitor id cannot be empty",
            ));
        }

        if let Some(user) = self.auth.users.iter().find(|u| u.username.is_empty()) {
            return Err(Error::config_field_invalid(
                "auth.users",
                format!("admin user with level {} has no username", user.level),
            ));
        }

        let system_info = &self.modules.system_info;
        for (field, secs) in [
            ("modules.system_info.delay_secs", system_info.delay_secs),
            ("modules.system_info.interval_secs", system_info.interval_secs),
        ] {
            if !secs.is_finite() || secs > MAX_SCHEDULE_SECS as f64 {
                return Err(Error::config_field_invalid(
                    field,
                    format!("must be a finite number of seconds up to {}", MAX_SCHEDULE_SECS),
                ));
            }
        }

        // Validate log level
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(Error::config_field_invalid(
                "logging.level",
                format!(
                    "Invalid log level '{}'. Must be one of: {}",
                    self.logging.level,
                    valid_levels.join(", ")
                ),
            ));
        }

        Ok(())
    }
}

fn parse_bool(val: &str) -> bool {
    val.to_lowercase() == "true" || val == "1"
}

/// Expand ~ and environment variables in paths
fn expand_path(path: &str) -> String {
    shellexpand::full(path)
        .unwrap_or_else(|_| std::borrow::Cow::Borrowed(path))
        .into_owned()
}

/// Default location for `config init`
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".fleet")
        .join("console.toml")
}

/// Initialize a new configuration file
pub fn init_config(path: Option<&str>, force: bool) -> Result<PathBuf> {
    let config_path = path
        .map(|p| PathBuf::from(expand_path(p)))
        .unwrap_or_else(default_config_path);

    // Check if file exists
    if config_path.exists() && !force {
        return Err(Error::Config(format!(
            "Configuration file already exists: {}. Use --force to overwrite.",
            config_path.display()
        )));
    }

    // Create parent directories
    if let Some(parent) = config_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| Error::IoWrite {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
    }

    fs::write(&config_path, generate_default_config()).map_err(|e| Error::IoWrite {
        path: config_path.clone(),
        source: e,
    })?;

    Ok(config_path)
}

/// Generate default configuration content with comments
pub fn generate_default_config() -> String {
    r#"# Fleet Console Configuration

[master]
# Interface and port the master listens on
host = "0.0.0.0"
port = 3005

# Deployment environment passed to the authenticators
env = "development"

# Accept monitor reconnects without re-running server authentication
trust_reconnect = true

# Unanswered requests kept per monitor for redelivery (0 = unbounded)
redelivery_limit = 1024

# Buffered service events per subscriber
event_capacity = 256

[monitor]
# Server id registered with the master (must be unique per process)
id = "monitor-1"

# Declared server type
server_type = "server"

# Master WebSocket URL
master_url = "ws://127.0.0.1:3005"

# Host and port of this process, sent to the master
host = "127.0.0.1"
port = 0

# Reconnect after losing the master
reconnect = true

# Initial reconnection delay in milliseconds
reconnect_interval_ms = 1000

# Upper bound for the reconnection backoff in milliseconds
max_reconnect_delay_ms = 60000

# Maximum reconnection attempts (0 = infinite)
max_reconnect_attempts = 0

# Connection timeout in milliseconds
connect_timeout_ms = 10000

# Time allowed for the master's registration reply in milliseconds
register_timeout_ms = 30000

[auth]
# Shared secret monitors present when registering (comment out to accept all)
# server_token = "change-me"

# Admin users; password may be plain text or a SHA-256 hex digest.
# Levels 0 and 1 may run commands.
# [[auth.users]]
# username = "admin"
# password = "admin"
# level = 1

[modules.system_info]
# Register the systemInfo module
enabled = true

# Delay before the first collection in seconds
delay_secs = 10

# Collection interval in seconds
interval_secs = 300

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log file path (comment out to disable file logging)
# file = "~/.fleet/logs/console.log"

# Maximum log file size in MB before rotation
max_file_size_mb = 100

# Number of rotated log files to keep
max_files = 5

# Enable JSON formatted logging
json_format = false
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn test_default_config() {
        let config = ConsoleConfig::default();
        assert_eq!(config.master.port, 3005);
        assert!(config.master.trust_reconnect);
        assert_eq!(config.master.redelivery_limit, 1024);
        assert_eq!(config.monitor.master_url, "ws://127.0.0.1:3005");
        assert_eq!(config.logging.level, "info");
        assert!(config.auth.users.is_empty());
    }

    #[test]
    fn test_env_override() {
        env::set_var("FLEET_MASTER_URL", "wss://master.example.com");
        env::set_var("FLEET_REDELIVERY_LIMIT", "16");
        env::set_var("FLEET_TRUST_RECONNECT", "false");

        let mut config = ConsoleConfig::default();
        config.apply_env_overrides();

        assert_eq!(config.monitor.master_url, "wss://master.example.com");
        assert_eq!(config.master.redelivery_limit, 16);
        assert!(!config.master.trust_reconnect);

        env::remove_var("FLEET_MASTER_URL");
        env::remove_var("FLEET_REDELIVERY_LIMIT");
        env::remove_var("FLEET_TRUST_RECONNECT");
    }

    #[test]
    fn test_validation_invalid_url() {
        let mut config = ConsoleConfig::default();
        config.monitor.master_url = "http://invalid.com".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_zero_port() {
        let mut config = ConsoleConfig::default();
        config.master.port = 0;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, Error::ConfigValidation { field: Some(ref f), .. } if f == "master.port"));
    }

    #[test]
    fn test_validation_empty_monitor_id() {
        let mut config = ConsoleConfig::default();
        config.monitor.id = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_invalid_log_level() {
        let mut config = ConsoleConfig::default();
        config.logging.level = "invalid".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_generated_default_parses() {
        let config = ConsoleConfig::from_toml(&generate_default_config()).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.modules.system_info.interval_secs, 300.0);
    }

    #[test]
    fn test_parse_config_file() {
        let config_str = r#"
[master]
port = 4005
trust_reconnect = false

[monitor]
id = "connector-1"
server_type = "connector"
master_url = "ws://10.0.0.2:4005"

[auth]
server_token = "s3cret"

[[auth.users]]
username = "admin"
password = "admin"
level = 0

[[auth.users]]
username = "viewer"
password = "look"
level = 2

[logging]
level = "debug"
"#;

        let config = ConsoleConfig::from_toml(config_str).unwrap();

        assert_eq!(config.master.port, 4005);
        assert!(!config.master.trust_reconnect);
        assert_eq!(config.monitor.id, "connector-1");
        assert_eq!(config.monitor.server_type, "connector");
        assert_eq!(config.auth.server_token.as_deref(), Some("s3cret"));
        assert_eq!(config.auth.users.len(), 2);
        assert_eq!(config.auth.users[1].level, 2);
        assert_eq!(config.logging.level, "debug");
        // Untouched sections keep their defaults
        assert_eq!(config.monitor.reconnect_interval_ms, 1000);
    }

    #[test]
    fn test_parse_error_is_reported() {
        let err = ConsoleConfig::from_toml("[master]\nport = \"nope\"").unwrap_err();
        assert!(matches!(err, Error::ConfigParse { .. }));
    }
}

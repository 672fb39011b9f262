//! Error types for the fleet console
//!
//! One error type for the crate, carrying:
//! - A stable `E###` code per variant
//! - A hint for the operator where one helps
//! - Classification of connection-fatal vs request-local failures
//! - Exit codes for CLI

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for console operations
pub type Result<T> = std::result::Result<T, Error>;

/// Stable numeric codes, grouped by hundreds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    // Configuration errors (1xx)
    ConfigNotFound = 100,
    ConfigParseError = 101,
    ConfigValidation = 102,

    // IO errors (2xx)
    IoRead = 200,
    IoWrite = 201,
    IoPermission = 202,
    IoNotFound = 203,

    // Connection errors (3xx)
    ConnectionFailed = 300,
    ConnectionTimeout = 301,
    ConnectionLost = 303,
    ChannelClosed = 305,

    // Protocol and registration errors (4xx)
    MalformedEnvelope = 401,
    ProtocolUnexpected = 402,
    AuthenticationFailed = 403,
    DuplicateId = 404,

    // Dispatch errors (5xx)
    UnknownModule = 500,
    ModuleDisabled = 501,
    UnknownMethod = 502,
    UnknownCommand = 503,
    AccessDenied = 504,
    HandlerFailed = 505,
    RemoteError = 506,

    // Routing and agent state errors (6xx)
    UnknownTarget = 600,
    NotRegistered = 601,
    AgentClosed = 602,
    RedeliveryEvicted = 603,

    // Internal errors (9xx)
    InternalError = 900,
}

impl ErrorCode {
    /// Rendered as `E` plus the number
    pub fn as_str(&self) -> String {
        format!("E{}", *self as u16)
    }

    /// Process exit status for the hundred this code falls in
    pub fn exit_code(&self) -> i32 {
        match *self as u16 {
            100..=199 => 10, // Config errors
            200..=299 => 20, // IO errors
            300..=399 => 30, // Connection errors
            400..=499 => 40, // Protocol errors
            500..=599 => 50, // Dispatch errors
            600..=699 => 60, // Routing errors
            900..=999 => 90, // Internal errors
            _ => 1,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Main error type for the console
#[derive(Error, Debug)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────

    /// No readable configuration file
    #[error("Configuration file not found: {path}")]
    ConfigNotFound {
        path: PathBuf,
        #[source]
        source: Option<std::io::Error>,
    },

    /// TOML did not parse or did not match the schema
    #[error("Failed to parse configuration: {message}")]
    ConfigParse {
        message: String,
        #[source]
        source: Option<toml::de::Error>,
    },

    /// A value parsed but is not acceptable
    #[error("Configuration validation failed: {message}")]
    ConfigValidation { message: String, field: Option<String> },

    /// Generic configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    // ─────────────────────────────────────────────────────────────
    // IO Errors
    // ─────────────────────────────────────────────────────────────

    /// File write error
    #[error("Failed to write file: {path}")]
    IoWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Rendering the effective configuration failed
    #[error("TOML serialization error: {0}")]
    Toml(#[from] toml::ser::Error),

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    // ─────────────────────────────────────────────────────────────
    // Connection Errors
    // ─────────────────────────────────────────────────────────────

    /// Connection failed
    #[error("Failed to connect to {url}: {message}")]
    ConnectionFailed { url: String, message: String },

    /// Connection timeout
    #[error("Connection to {url} timed out after {timeout_ms}ms")]
    ConnectionTimeout { url: String, timeout_ms: u64 },

    /// Connection lost while a reply was outstanding
    #[error("Lost connection to master: {message}")]
    ConnectionLost { message: String },

    /// The channel has already been closed
    #[error("Channel {channel_id} is closed")]
    ChannelClosed { channel_id: u64 },

    // ─────────────────────────────────────────────────────────────
    // Protocol / Registration Errors
    // ─────────────────────────────────────────────────────────────

    /// Envelope could not be decoded
    #[error("Malformed envelope: {message}")]
    MalformedEnvelope { message: String },

    /// A well-formed message arrived where it is not allowed
    #[error("Unexpected message: {0}")]
    Protocol(String),

    /// Registration rejected by an auth collaborator
    #[error("Authentication failed: {message}")]
    AuthFailed { message: String },

    /// The id is already held by another registration
    #[error("id has been registered: {id}")]
    DuplicateId { id: String },

    // ─────────────────────────────────────────────────────────────
    // Dispatch Errors
    // ─────────────────────────────────────────────────────────────

    /// No module registered under this id
    #[error("unknown moduleId: {module_id}")]
    UnknownModule { module_id: String },

    /// Module registered but disabled
    #[error("module {module_id} is disabled")]
    ModuleDisabled { module_id: String },

    /// Module does not implement the requested handler
    #[error("module {module_id} does not have a method called {method}")]
    UnknownMethod { module_id: String, method: String },

    /// Administrative command not recognised
    #[error("unknown command: {command}")]
    UnknownCommand { command: String },

    /// Access control denied the call
    #[error("access denied: {reason}")]
    AccessDenied { reason: String },

    /// A module handler reported a failure
    #[error("{0}")]
    Handler(String),

    /// The remote peer answered with an error
    #[error("remote error: {message}")]
    Remote { message: String },

    // ─────────────────────────────────────────────────────────────
    // Routing / Agent State Errors
    // ─────────────────────────────────────────────────────────────

    /// Target id is not in the registry
    #[error("unknown server id: {target}")]
    UnknownTarget { target: String },

    /// Monitor agent is not registered with the master
    #[error("agent can not {operation} now, state: {state}")]
    NotRegistered { operation: String, state: String },

    /// Agent was closed before the operation completed
    #[error("agent is closed")]
    AgentClosed,

    /// Request dropped from the redelivery log to respect its size cap
    #[error("request {req_id} to {target} evicted from the redelivery log")]
    RedeliveryEvicted { target: String, req_id: u64 },

    // ─────────────────────────────────────────────────────────────
    // Internal Errors
    // ─────────────────────────────────────────────────────────────

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    // ─────────────────────────────────────────────────────────────
    // Error Classification
    // ─────────────────────────────────────────────────────────────

    /// Code reported in terminal and log output
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::ConfigNotFound { .. } => ErrorCode::ConfigNotFound,
            Error::ConfigParse { .. } => ErrorCode::ConfigParseError,
            Error::ConfigValidation { .. } => ErrorCode::ConfigValidation,
            Error::Config(_) => ErrorCode::ConfigValidation,

            Error::IoWrite { .. } => ErrorCode::IoWrite,
            Error::Io(e) => match e.kind() {
                std::io::ErrorKind::NotFound => ErrorCode::IoNotFound,
                std::io::ErrorKind::PermissionDenied => ErrorCode::IoPermission,
                _ => ErrorCode::IoRead,
            },
            Error::Toml(_) => ErrorCode::ConfigParseError,
            Error::WebSocket(_) => ErrorCode::ConnectionFailed,

            Error::ConnectionFailed { .. } => ErrorCode::ConnectionFailed,
            Error::ConnectionTimeout { .. } => ErrorCode::ConnectionTimeout,
            Error::ConnectionLost { .. } => ErrorCode::ConnectionLost,
            Error::ChannelClosed { .. } => ErrorCode::ChannelClosed,

            Error::MalformedEnvelope { .. } => ErrorCode::MalformedEnvelope,
            Error::Protocol(_) => ErrorCode::ProtocolUnexpected,
            Error::AuthFailed { .. } => ErrorCode::AuthenticationFailed,
            Error::DuplicateId { .. } => ErrorCode::DuplicateId,

            Error::UnknownModule { .. } => ErrorCode::UnknownModule,
            Error::ModuleDisabled { .. } => ErrorCode::ModuleDisabled,
            Error::UnknownMethod { .. } => ErrorCode::UnknownMethod,
            Error::UnknownCommand { .. } => ErrorCode::UnknownCommand,
            Error::AccessDenied { .. } => ErrorCode::AccessDenied,
            Error::Handler(_) => ErrorCode::HandlerFailed,
            Error::Remote { .. } => ErrorCode::RemoteError,

            Error::UnknownTarget { .. } => ErrorCode::UnknownTarget,
            Error::NotRegistered { .. } => ErrorCode::NotRegistered,
            Error::AgentClosed => ErrorCode::AgentClosed,
            Error::RedeliveryEvicted { .. } => ErrorCode::RedeliveryEvicted,

            Error::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Transport failures that a reconnect may cure
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionFailed { .. }
                | Error::ConnectionTimeout { .. }
                | Error::ConnectionLost { .. }
                | Error::ChannelClosed { .. }
                | Error::WebSocket(_)
                | Error::Io(_)
        )
    }

    /// Check if the error is fatal (the connection or process should stop)
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ConfigNotFound { .. }
                | Error::ConfigParse { .. }
                | Error::ConfigValidation { .. }
                | Error::Config(_)
                | Error::AuthFailed { .. }
                | Error::DuplicateId { .. }
                | Error::Internal(_)
        )
    }

    /// Exit status for `main`
    pub fn exit_code(&self) -> i32 {
        self.code().exit_code()
    }

    // ─────────────────────────────────────────────────────────────
    // User-Friendly Messages
    // ─────────────────────────────────────────────────────────────

    /// Operator hint printed under the error
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Error::ConfigNotFound { .. } => Some(
                "Run 'fleet-console config init' to create a default configuration file."
            ),
            Error::ConfigParse { .. } => Some(
                "Check your configuration file syntax. Run 'fleet-console config validate' to see details."
            ),
            Error::ConfigValidation { .. } => Some(
                "Review the configuration file and fix the invalid values."
            ),

            Error::ConnectionFailed { .. } => Some(
                "Check that the master is running and that monitor.master_url points at it."
            ),
            Error::ConnectionTimeout { .. } => Some(
                "The master may be down or unreachable. Check your firewall settings."
            ),
            Error::ConnectionLost { .. } => Some(
                "The monitor reconnects automatically when monitor.reconnect is enabled."
            ),

            Error::AuthFailed { .. } => Some(
                "Verify auth.server_token on both master and monitor, or the admin user credentials."
            ),
            Error::DuplicateId { .. } => Some(
                "Another process is registered under the same id. Give each monitor a unique id."
            ),

            Error::ModuleDisabled { .. } => Some(
                "Enable the module with the 'enable' command before calling it."
            ),
            Error::AccessDenied { .. } => Some(
                "Only admin users with level 0 or 1 may run commands."
            ),

            _ => None,
        }
    }

    /// Colored multi-line form for stderr
    pub fn format_for_terminal(&self) -> String {
        let code = self.code();
        let suggestion = self.suggestion();

        let mut output = format!(
            "\x1b[31mError [{}]\x1b[0m: {}\n",
            code.as_str(),
            self
        );

        if let Some(hint) = suggestion {
            output.push_str(&format!("\n\x1b[33mHint\x1b[0m: {}\n", hint));
        }

        output
    }

    /// Single-line form without ANSI codes
    pub fn format_for_log(&self) -> String {
        let code = self.code();
        format!("[{}] {}", code.as_str(), self)
    }
}

// ─────────────────────────────────────────────────────────────────
// Error Constructors
// ─────────────────────────────────────────────────────────────────

impl Error {
    /// Missing configuration file at `path`
    pub fn config_not_found(path: impl Into<PathBuf>) -> Self {
        Error::ConfigNotFound {
            path: path.into(),
            source: None,
        }
    }

    /// TOML problem without an underlying source
    pub fn config_parse(message: impl Into<String>) -> Self {
        Error::ConfigParse {
            message: message.into(),
            source: None,
        }
    }

    /// Rejected value of one named field
    pub fn config_field_invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ConfigValidation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Transport could not reach `url`
    pub fn connection_failed(url: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ConnectionFailed {
            url: url.into(),
            message: message.into(),
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Error::MalformedEnvelope {
            message: message.into(),
        }
    }

    pub fn auth_failed(message: impl Into<String>) -> Self {
        Error::AuthFailed {
            message: message.into(),
        }
    }

    pub fn unknown_target(target: impl Into<String>) -> Self {
        Error::UnknownTarget {
            target: target.into(),
        }
    }

    /// Create a handler failure from any displayable message
    pub fn handler(message: impl fmt::Display) -> Self {
        Error::Handler(message.to_string())
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_format() {
        assert_eq!(ErrorCode::ConfigNotFound.as_str(), "E100");
        assert_eq!(ErrorCode::MalformedEnvelope.as_str(), "E401");
        assert_eq!(ErrorCode::UnknownTarget.as_str(), "E600");
        assert_eq!(ErrorCode::InternalError.as_str(), "E900");
    }

    #[test]
    fn test_error_exit_codes() {
        assert_eq!(ErrorCode::ConfigNotFound.exit_code(), 10);
        assert_eq!(ErrorCode::IoRead.exit_code(), 20);
        assert_eq!(ErrorCode::ConnectionFailed.exit_code(), 30);
        assert_eq!(ErrorCode::AuthenticationFailed.exit_code(), 40);
        assert_eq!(ErrorCode::ModuleDisabled.exit_code(), 50);
        assert_eq!(ErrorCode::AgentClosed.exit_code(), 60);
    }

    #[test]
    fn test_dispatch_messages() {
        let err = Error::ModuleDisabled { module_id: "diag".into() };
        assert!(err.to_string().contains("disable"));
        assert_eq!(err.code(), ErrorCode::ModuleDisabled);

        let err = Error::UnknownMethod {
            module_id: "diag".into(),
            method: "clientHandler".into(),
        };
        assert!(err.to_string().contains("clientHandler"));
    }

    #[test]
    fn test_registration_errors_are_fatal() {
        assert!(Error::auth_failed("bad token").is_fatal());
        assert!(Error::DuplicateId { id: "m1".into() }.is_fatal());
        assert!(!Error::unknown_target("m1").is_fatal());
        assert!(!Error::ModuleDisabled { module_id: "x".into() }.is_fatal());
    }

    #[test]
    fn test_error_retryable() {
        assert!(Error::connection_failed("ws://test", "refused").is_retryable());
        assert!(Error::ConnectionLost { message: "eof".into() }.is_retryable());
        assert!(!Error::auth_failed("nope").is_retryable());
        assert!(!Error::AgentClosed.is_retryable());
    }

    #[test]
    fn test_format_for_terminal() {
        let err = Error::config_not_found("/test/console.toml");
        let formatted = err.format_for_terminal();

        assert!(formatted.contains("E100"));
        assert!(formatted.contains("\x1b[31m"));
        assert!(formatted.contains("config init"));
    }

    #[test]
    fn test_format_for_log() {
        let err = Error::unknown_target("connector-1");
        let formatted = err.format_for_log();

        assert!(formatted.contains("[E600]"));
        assert!(formatted.contains("connector-1"));
        assert!(!formatted.contains("\x1b["));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert_eq!(err.code(), ErrorCode::IoNotFound);
    }
}

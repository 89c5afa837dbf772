//! Serial-session error type.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Categorised serial-session error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialError {
    pub kind: SerialErrorKind,
    pub message: String,
    /// Port the error relates to, if known.
    pub port: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SerialErrorKind {
    /// The port could not be claimed (in use, missing, permission denied).
    Connection,
    /// Connection parameters or session settings are invalid.
    InvalidConfig,
    /// The device went away or the OS reported an I/O failure mid-session.
    Transport,
    /// Operation requires an open connection.
    NotConnected,
    /// Outgoing text cannot be represented in the configured encoding,
    /// or hex input is malformed.
    Encoding,
    /// The session log file could not be opened or written.
    Log,
    /// Operation timed out.
    Timeout,
}

pub type SerialResult<T> = Result<T, SerialError>;

// ── Construction helpers ─────────────────────────────────────────────

impl SerialError {
    pub fn new(kind: SerialErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            message: msg.into(),
            port: None,
        }
    }

    pub fn with_port(mut self, port: impl Into<String>) -> Self {
        self.port = Some(port.into());
        self
    }

    // ── Convenience constructors ─────────────────────────────────

    pub fn connection(msg: impl Into<String>) -> Self {
        Self::new(SerialErrorKind::Connection, msg)
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::new(SerialErrorKind::InvalidConfig, msg)
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::new(SerialErrorKind::Transport, msg)
    }

    pub fn not_connected(port: &str) -> Self {
        Self::new(
            SerialErrorKind::NotConnected,
            format!("Port '{}' is not open", port),
        )
        .with_port(port)
    }

    pub fn encoding(msg: impl Into<String>) -> Self {
        Self::new(SerialErrorKind::Encoding, msg)
    }

    pub fn log(msg: impl Into<String>) -> Self {
        Self::new(SerialErrorKind::Log, msg)
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::new(SerialErrorKind::Timeout, msg)
    }

    /// The session stays usable; the caller may simply retry or ignore.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.kind,
            SerialErrorKind::InvalidConfig
                | SerialErrorKind::Encoding
                | SerialErrorKind::Log
                | SerialErrorKind::Timeout
                | SerialErrorKind::NotConnected
        )
    }

    /// The connection is unusable and must be reopened.
    pub fn requires_reopen(&self) -> bool {
        matches!(
            self.kind,
            SerialErrorKind::Connection | SerialErrorKind::Transport
        )
    }
}

impl fmt::Display for SerialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(ref port) => write!(f, "[serial {:?} {}] {}", self.kind, port, self.message),
            None => write!(f, "[serial {:?}] {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for SerialError {}

impl From<std::io::Error> for SerialError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::TimedOut => Self::timeout(format!("I/O timeout: {}", e)),
            _ => Self::transport(e.to_string()),
        }
    }
}

impl From<serialport::Error> for SerialError {
    fn from(e: serialport::Error) -> Self {
        match e.kind() {
            serialport::ErrorKind::InvalidInput => Self::invalid_config(e.description),
            serialport::ErrorKind::Io(std::io::ErrorKind::TimedOut) => {
                Self::timeout(e.description)
            }
            _ => Self::connection(e.description),
        }
    }
}

impl From<SerialError> for String {
    fn from(e: SerialError) -> String {
        e.to_string()
    }
}

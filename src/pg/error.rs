//! Error types for the PostgreSQL driver.

use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Result type for PostgreSQL operations.
pub type PgResult<T> = Result<T, PgError>;

/// Errors that can occur during PostgreSQL operations.
///
/// The error is cheap to clone so that one transport fault can be delivered
/// to every command that was outstanding on the connection.
#[derive(Debug, Clone, Error)]
pub enum PgError {
    /// I/O error during communication.
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    /// Protocol error (unexpected message, invalid format, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Authentication failed.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Server returned an error for a specific command.
    #[error("{}", format_server_error(.severity, .code, .message, .detail.as_deref(), .hint.as_deref()))]
    Server {
        severity: String,
        code: String,
        message: String,
        detail: Option<String>,
        hint: Option<String>,
    },

    /// Type conversion error.
    #[error("Type error: {0}")]
    Type(String),

    /// The transport broke while the command was pending or in flight.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// The connection was closed before the command could be scheduled.
    #[error("Connection is closed")]
    ConnectionClosed,

    /// The call is not valid in the current state (e.g. nested `begin()`).
    #[error("Invalid state: {0}")]
    State(String),

    /// The pool was closed while waiting for, or before, an acquisition.
    #[error("Pool is closed")]
    PoolClosed,

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Timeout waiting for a connection to be established.
    #[error("Operation timed out")]
    Timeout,
}

impl PgError {
    /// Whether this error means the underlying connection is unusable.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, PgError::ConnectionLost(_) | PgError::Io(_))
    }

    /// SQLSTATE code for server errors.
    pub fn code(&self) -> Option<&str> {
        match self {
            PgError::Server { code, .. } => Some(code),
            _ => None,
        }
    }
}

impl From<io::Error> for PgError {
    fn from(e: io::Error) -> Self {
        PgError::Io(Arc::new(e))
    }
}

fn format_server_error(
    severity: &str,
    code: &str,
    message: &str,
    detail: Option<&str>,
    hint: Option<&str>,
) -> String {
    let mut out = format!("{}: {} ({})", severity, message, code);
    if let Some(d) = detail {
        out.push_str("\nDetail: ");
        out.push_str(d);
    }
    if let Some(h) = hint {
        out.push_str("\nHint: ");
        out.push_str(h);
    }
    out
}

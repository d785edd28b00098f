//! Error types for zero-mysql.

use thiserror::Error;

/// Result type for zero-mysql operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Error details from a MySQL ERR packet.
#[derive(Debug, Clone)]
pub struct ServerError {
    /// MySQL error code (e.g. 1045 for access denied)
    pub code: u16,
    /// Five-character SQLSTATE, if the server sent one
    pub sql_state: Option<String>,
    /// Human-readable error message
    pub message: String,
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ERROR {}", self.code)?;
        if let Some(state) = &self.sql_state {
            write!(f, " ({})", state)?;
        }
        write!(f, ": {}", self.message)
    }
}

/// Error type for zero-mysql.
#[derive(Debug, Error)]
pub enum Error {
    /// Server error response (ERR packet)
    #[error("MySQL error: {0}")]
    Server(ServerError),

    /// Protocol error (malformed packet, unexpected message, etc.)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Authentication failed
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// TLS error
    #[cfg(feature = "tls")]
    #[error("TLS error: {0}")]
    Tls(#[from] native_tls::Error),

    /// Operation rejected because of the connection or statement state
    /// (connection closed, statement already executed, no rows bound)
    #[error("Invalid state: {0}")]
    State(String),

    /// A binding row was finalized with an unfilled parameter position
    #[error("Parameter {index} has no binding")]
    BindingIncomplete {
        /// Lowest parameter index without a value
        index: usize,
    },

    /// Invalid usage (unknown parameter name, index out of range, bad URL)
    #[error("Invalid usage: {0}")]
    InvalidUsage(String),

    /// Unsupported feature
    #[error("Unsupported: {0}")]
    Unsupported(String),
}

impl Error {
    /// Returns true if the error compromises the shared inbound stream and
    /// the whole connection must be considered dead.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Io(_) | Error::Protocol(_))
    }

    /// Get the MySQL error code if this is a server error.
    pub fn server_code(&self) -> Option<u16> {
        match self {
            Error::Server(e) => Some(e.code),
            _ => None,
        }
    }
}

impl From<ServerError> for Error {
    fn from(err: ServerError) -> Self {
        Error::Server(err)
    }
}

//! Error types for driver operations.

use std::fmt;

/// The primary error type for all driver operations.
#[derive(Debug)]
pub enum Error {
    /// Connectivity and authentication failures (connect, disconnect, TLS, credentials)
    Connection(ConnectionError),
    /// Error frame returned by the server, carrying a vendor error code
    Server(ServerError),
    /// Malformed or unexpected frames (wire-level)
    Protocol(ProtocolError),
    /// Configuration errors, raised before any network I/O
    Config(ConfigError),
    /// Prepared statement cache invariant violated
    Cache(CacheError),
    /// I/O errors
    Io(std::io::Error),
    /// Operation timed out
    Timeout,
    /// Operation was cancelled via asupersync
    Cancelled,
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to establish connection
    Connect,
    /// Connection refused
    Refused,
    /// DNS resolution failed
    DnsResolution,
    /// Authentication failed on the client side (unsupported mechanism, insecure channel)
    Authentication,
    /// SSL/TLS negotiation failed
    Ssl,
    /// Connection lost during operation
    Disconnected,
    /// Command submitted to a client that is already closed
    Closed,
}

/// An error frame (0xFF) sent by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    /// Vendor error code (e.g. 1045 access denied)
    pub code: u16,
    /// SQLSTATE, empty when the server omitted it
    pub sql_state: String,
    pub message: String,
}

#[derive(Debug)]
pub struct ProtocolError {
    pub message: String,
    pub raw_data: Option<Vec<u8>>,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone)]
pub struct CacheError {
    pub message: String,
}

impl Error {
    /// Vendor error code when this error came from a server error frame.
    pub fn error_code(&self) -> Option<u16> {
        match self {
            Error::Server(e) => Some(e.code),
            _ => None,
        }
    }

    /// Get SQLSTATE if available (e.g., "28000" for access denied)
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Server(e) if !e.sql_state.is_empty() => Some(e.sql_state.as_str()),
            _ => None,
        }
    }

    /// Is this a retryable error (deadlock, lock wait timeout, timeouts)?
    pub fn is_retryable(&self) -> bool {
        match self {
            // ER_LOCK_WAIT_TIMEOUT, ER_LOCK_DEADLOCK
            Error::Server(e) => matches!(e.code, 1205 | 1213),
            Error::Timeout => true,
            _ => false,
        }
    }

    /// Is this a connection error that likely requires reconnection?
    pub fn is_connection_error(&self) -> bool {
        match self {
            Error::Connection(c) => !matches!(c.kind, ConnectionErrorKind::Authentication),
            Error::Protocol(_) | Error::Io(_) | Error::Timeout => true,
            _ => false,
        }
    }

    /// May the orchestrator move on to the next host after this error?
    ///
    /// Configuration errors and cancellation stop the host loop; everything
    /// else ends only the current host attempt.
    pub fn is_failover_eligible(&self) -> bool {
        !matches!(self, Error::Config(_) | Error::Cancelled | Error::Cache(_))
    }

    /// A copy of this error without its source chain.
    ///
    /// One transport failure is reported to every queued command; boxed
    /// sources are not clonable, so each waiter receives this copy.
    pub fn duplicate(&self) -> Error {
        match self {
            Error::Connection(e) => Error::Connection(ConnectionError {
                kind: e.kind,
                message: e.message.clone(),
                source: None,
            }),
            Error::Server(e) => Error::Server(e.clone()),
            Error::Protocol(e) => Error::Protocol(ProtocolError {
                message: e.message.clone(),
                raw_data: e.raw_data.clone(),
                source: None,
            }),
            Error::Config(e) => Error::Config(ConfigError {
                message: e.message.clone(),
                source: None,
            }),
            Error::Cache(e) => Error::Cache(e.clone()),
            Error::Io(e) => Error::Io(std::io::Error::new(e.kind(), e.to_string())),
            Error::Timeout => Error::Timeout,
            Error::Cancelled => Error::Cancelled,
        }
    }
}

impl ServerError {
    /// Access denied for user (ER_ACCESS_DENIED_ERROR).
    pub fn is_access_denied(&self) -> bool {
        self.code == 1045
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Server(e) => write!(f, "Server error: {}", e),
            Error::Protocol(e) => write!(f, "Protocol error: {}", e.message),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Cache(e) => write!(f, "Prepare cache error: {}", e.message),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Timeout => write!(f, "Operation timed out"),
            Error::Cancelled => write!(f, "Operation cancelled"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Protocol(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.sql_state.is_empty() {
            write!(f, "({}) {}", self.code, self.message)
        } else {
            write!(f, "({}) [{}] {}", self.code, self.sql_state, self.message)
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<ServerError> for Error {
    fn from(err: ServerError) -> Self {
        Error::Server(err)
    }
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        Error::Protocol(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<CacheError> for Error {
    fn from(err: CacheError) -> Self {
        Error::Cache(err)
    }
}

/// Result type alias for driver operations.
pub type Result<T> = std::result::Result<T, Error>;

//! Error types for the driftq client library

/// Main error type for driftq client operations
#[derive(Debug, thiserror::Error)]
pub enum DriftqClientError {
    /// Connection-related errors
    #[error("connection error: {message}")]
    Connection { message: String },

    /// Wire protocol errors
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// The reader already has a connection to this broker
    #[error("already connected")]
    AlreadyConnected,

    /// The lookup directory address is already registered
    #[error("lookup address already registered")]
    LookupAddressExists,

    /// A connection was requested before any handler was registered
    #[error("no handlers registered")]
    NoHandlers,

    /// The reader has been stopped
    #[error("reader stopped")]
    Stopped,

    /// Invalid configuration
    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// Lookup directory errors
    #[error("lookup error: {message}")]
    Lookup { message: String },

    /// HTTP transport errors from the lookup client
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// I/O errors
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Timeout errors
    #[error("operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
}

impl DriftqClientError {
    /// Create a new connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a new protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a new invalid config error
    pub fn invalid_config<S: Into<String>>(message: S) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Create a new lookup error
    pub fn lookup<S: Into<String>>(message: S) -> Self {
        Self::Lookup {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(timeout_ms: u64) -> Self {
        Self::Timeout { timeout_ms }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::Timeout { .. }
                | Self::Http(_)
                | Self::Io(_)
                | Self::Lookup { .. }
        )
    }

    /// Check if this error is a connection error
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Io(_))
    }
}

impl From<driftq::DriftqError> for DriftqClientError {
    fn from(err: driftq::DriftqError) -> Self {
        match err {
            driftq::DriftqError::Protocol(message) => Self::Protocol { message },
            driftq::DriftqError::Config(message) => Self::InvalidConfig { message },
            driftq::DriftqError::Storage(e) => Self::Io(e),
            driftq::DriftqError::Exiting => Self::Stopped,
        }
    }
}

use thiserror::Error;

/// Errors that can occur in the mcp-bridge library
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    ConfigParse(String),

    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid state for {id}: {message}")]
    InvalidState {
        /// Server or connection id the operation referred to
        id: String,
        message: String,
    },

    #[error("Failed to start server {server}: {source}")]
    ServerStartFailed {
        server: String,
        #[source]
        source: Box<Error>,
    },

    #[error("Failed to stop server {server}: {source}")]
    ServerStopFailed {
        server: String,
        #[source]
        source: Box<Error>,
    },

    #[error("Connection {connection} failed: {source}")]
    ConnectionFailed {
        connection: String,
        #[source]
        source: Box<Error>,
    },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Unsupported transport combination: {0}")]
    UnsupportedTransport(String),

    #[error("Server process error: {0}")]
    Process(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable error-kind code surfaced in API error envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) | Error::ConfigParse(_) | Error::ConfigInvalid(_) => {
                "ValidationError"
            }
            Error::NotFound(_) => "NotFound",
            Error::AlreadyExists(_) => "AlreadyExists",
            Error::InvalidState { .. } => "InvalidState",
            Error::ServerStartFailed { .. } => "ServerStartFailed",
            Error::ServerStopFailed { .. } => "ServerStopFailed",
            Error::ConnectionFailed { .. } => "ConnectionFailed",
            Error::Transport(_) => "TransportError",
            Error::UnsupportedTransport(_) => "UnsupportedTransport",
            Error::Process(_) => "ProcessError",
            Error::Timeout(_) => "Timeout",
            Error::Io(_) | Error::Serialization(_) | Error::Internal(_) => "InternalError",
        }
    }

    /// Walks the cause chain down to the innermost domain error.
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::ServerStartFailed { source, .. }
            | Error::ServerStopFailed { source, .. }
            | Error::ConnectionFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

/// Result type for mcp-bridge operations
pub type Result<T> = std::result::Result<T, Error>;

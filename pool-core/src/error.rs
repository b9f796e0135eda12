use thiserror::Error;

/// JSON-RPC code returned by the node for an unknown method
pub const RPC_METHOD_NOT_FOUND: i64 = -32601;

/// Core error types for the pool
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Daemon error: {0}")]
    Daemon(String),

    #[error("Template error: {0}")]
    Template(String),

    #[error("Address error: {0}")]
    Address(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Hex decode error: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("Metrics error: {0}")]
    Metrics(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Check if error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::Connection(_) => true,
            Error::Network(_) => true,
            Error::Rpc { .. } => true,
            Error::Daemon(_) => true,
            Error::Io(_) => true,
            _ => false,
        }
    }

    /// Whether the node rejected the call because it does not know the method
    pub fn is_method_not_found(&self) -> bool {
        match self {
            Error::Rpc { code, message } => {
                *code == RPC_METHOD_NOT_FOUND || message == "Method not found"
            }
            _ => false,
        }
    }

    /// Get error category for metrics
    pub fn category(&self) -> &'static str {
        match self {
            Error::Config(_) => "config",
            Error::Protocol(_) => "protocol",
            Error::Connection(_) => "connection",
            Error::Network(_) => "network",
            Error::Rpc { .. } => "rpc",
            Error::Daemon(_) => "daemon",
            Error::Template(_) => "template",
            Error::Address(_) => "address",
            Error::Io(_) => "io",
            Error::Serialization(_) => "serialization",
            Error::Hex(_) => "hex",
            Error::Metrics(_) => "metrics",
            Error::Internal(_) => "internal",
        }
    }
}

impl From<prometheus::Error> for Error {
    fn from(err: prometheus::Error) -> Self {
        Error::Metrics(err.to_string())
    }
}

//! Error types for AgentVM Core

use thiserror::Error;

/// Main error type for AgentVM operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Agent/task registry errors.
///
/// These are the only errors `assign_task` raises; transport failures are
/// folded into a failed `TaskResult` instead.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Maximum agents ({max}) reached")]
    CapacityExceeded { max: usize },

    #[error("Unknown agent type: {0}")]
    UnknownAgentType(String),

    #[error("Agent not found: {0}")]
    UnknownAgent(String),

    #[error("API adapter not configured")]
    AdapterUnavailable,

    #[error("Invalid {field}: {reason}")]
    InvalidRequest { field: &'static str, reason: String },

    #[error("No agent available for assignment")]
    NoAgentAvailable,

    #[error("Conversation not found: {0}")]
    UnknownConversation(String),
}

/// Transport and correlation errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Duplicate correlation key: {0}")]
    DuplicateCorrelationKey(String),

    #[error("Request timeout")]
    Timeout,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Remote execution failed: {0}")]
    RemoteExecutionFailure(String),
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid config value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Transport(TransportError::ConnectionFailed(err.to_string()))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::Transport(TransportError::ConnectionFailed(err.to_string()))
    }
}

impl serde::Serialize for Error {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

//! Error types for the gateway engine

use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while managing modules and host state
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error (missing artifacts, bad values)
    #[error("configuration error: {0}")]
    Config(String),

    /// Failed to parse configuration file
    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Host network error
    #[error("network error: {0}")]
    Net(#[from] tungate_net::Error),

    /// Settings could not be written
    #[error("persistence error: {0}")]
    Persistence(String),

    /// External process could not be started
    #[error("failed to spawn {program}: {message}")]
    Spawn { program: String, message: String },

    /// Unknown module name
    #[error("module {0} not found")]
    ModuleNotFound(String),

    /// Unknown server record
    #[error("server {0} not found")]
    ServerNotFound(String),

    /// Unknown endpoint within a server record
    #[error("endpoint {endpoint} not found on server {server}")]
    EndpointNotFound { server: String, endpoint: String },

    /// A module with this name is already registered
    #[error("module {0} is already registered")]
    AlreadyRegistered(String),

    /// Signal delivery or registration failure
    #[error("signal error: {0}")]
    Signal(String),

    /// Script execution error
    #[error("script error: {0}")]
    Script(String),

    /// Malformed management request
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Control socket failure, or an error reported by the daemon
    #[error("control error: {message}")]
    Control { message: String, not_found: bool },
}

impl Error {
    /// Check if this error names something that does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::ModuleNotFound(_)
                | Error::ServerNotFound(_)
                | Error::EndpointNotFound { .. }
                | Error::Control {
                    not_found: true,
                    ..
                }
        )
    }

    /// Check if this is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::Config(_) | Error::ConfigParse(_))
    }
}

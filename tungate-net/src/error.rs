//! Error types for tungate-net

use std::io;
use thiserror::Error;

/// Result type alias for host network operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while changing host network state
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from underlying system calls
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A host command could not be run or exited unsuccessfully
    #[error("command `{command}` failed: {message}")]
    Command { command: String, message: String },

    /// Route management error
    #[error("route error: {0}")]
    Route(String),

    /// Firewall rule error
    #[error("firewall error: {0}")]
    Firewall(String),

    /// Resolver file error
    #[error("resolver error: {0}")]
    Resolver(String),

    /// Invalid IP address
    #[error("invalid IP address: {0}")]
    InvalidAddress(String),
}

impl Error {
    /// Check if the error is a permission-related error
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Error::Io(e) if e.kind() == io::ErrorKind::PermissionDenied)
    }

    /// Check if the error is a not-found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Io(e) if e.kind() == io::ErrorKind::NotFound)
    }
}

//! Error types for edge-rs

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for edge operations
pub type Result<T> = std::result::Result<T, EdgeError>;

/// Edge error types
#[derive(Error, Debug)]
pub enum EdgeError {
    /// Configuration error (CLI, rules file)
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS error
    #[error("TLS error: {0}")]
    Tls(String),

    /// No certificate bundle under the live directory
    #[error("There are no certs in {}", .0.display())]
    NoCertificate(PathBuf),

    /// Host header with no routing rule
    #[error("Unknown domain '{0}'")]
    RouteNotFound(String),

    /// Certificate issuing subprocess failed
    #[error("Renewal failed: {0}")]
    Renewal(String),
}

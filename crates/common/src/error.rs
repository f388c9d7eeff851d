use thiserror::Error;

use crate::config::ConfigError;
use crate::DomainError;

/// Common error types for the Tor client
#[derive(Debug, Error)]
pub enum TorError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Directory error: {0}")]
    Directory(String),

    #[error("No usable consensus could be obtained")]
    NoConsensus,

    #[error("Router not found: {0}")]
    RouterNotFound(String),

    #[error("Circuit error: {0}")]
    Circuit(String),

    #[error("Circuit is not established")]
    CircuitNotEstablished,

    #[error("Circuit destroyed by relay (reason {0})")]
    CircuitDestroyed(u8),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Stream closed by exit (reason {0})")]
    StreamRefused(u8),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Onion service error: {0}")]
    OnionService(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Operation timed out")]
    Timeout,

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type for Tor client operations
pub type Result<T> = std::result::Result<T, TorError>;

impl TorError {
    pub fn network(msg: impl Into<String>) -> Self {
        Self::Network(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn directory(msg: impl Into<String>) -> Self {
        Self::Directory(msg.into())
    }

    pub fn circuit(msg: impl Into<String>) -> Self {
        Self::Circuit(msg.into())
    }

    pub fn stream(msg: impl Into<String>) -> Self {
        Self::Stream(msg.into())
    }

    pub fn tls(msg: impl Into<String>) -> Self {
        Self::Tls(msg.into())
    }

    pub fn http(msg: impl Into<String>) -> Self {
        Self::Http(msg.into())
    }

    pub fn onion(msg: impl Into<String>) -> Self {
        Self::OnionService(msg.into())
    }

    /// Whether this error invalidates the circuit it occurred on
    pub fn is_circuit_fatal(&self) -> bool {
        matches!(
            self,
            Self::Circuit(_)
                | Self::CircuitDestroyed(_)
                | Self::CircuitNotEstablished
                | Self::Protocol(_)
                | Self::Io(_)
                | Self::Timeout
        )
    }
}

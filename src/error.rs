use thiserror::Error;

/// Failures talking to one of the three HTTP endpoints.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("Request timed out")]
    Timeout,

    #[error("HTTP error: {0}")]
    Status(u16),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Failed to read response: {0}")]
    Body(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            TransportError::Timeout
        } else if let Some(status) = e.status() {
            TransportError::Status(status.as_u16())
        } else {
            TransportError::Network(e.to_string())
        }
    }
}

/// Durable key-value store errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage I/O error on '{key}': {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt value under '{key}': {reason}")]
    Corrupt { key: String, reason: String },

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// Position source errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LocationError {
    #[error("Location permission denied")]
    PermissionDenied,

    #[error("Location provider unavailable: {0}")]
    Unavailable(String),

    #[error("Timed out waiting for a position fix")]
    Timeout,
}

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("Notification update failed: {0}")]
    Failed(String),
}

/// Top-level error for the telemetry service
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Location source failed: {0}")]
    Location(#[from] LocationError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, TelemetryError>;

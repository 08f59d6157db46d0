//! Unified error handling for the sync client.

use std::time::Duration;

use crate::config::ConfigError;

/// Client error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Engine error: {0}")]
    Engine(#[from] tether_engine::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Hub responded with status {0}")]
    HubStatus(u16),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Queue item not found: {0}")]
    ItemNotFound(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl Error {
    /// Whether a retry later might succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Transport(_) | Error::Timeout(_) => true,
            Error::HubStatus(code) => *code >= 500 || *code == 408 || *code == 429,
            _ => false,
        }
    }
}

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        assert_eq!(
            Error::HubStatus(503).to_string(),
            "Hub responded with status 503"
        );
        assert_eq!(
            Error::ItemNotFound("item-1".into()).to_string(),
            "Queue item not found: item-1"
        );
    }

    #[test]
    fn transient_classification() {
        assert!(Error::Timeout(Duration::from_secs(30)).is_transient());
        assert!(Error::HubStatus(502).is_transient());
        assert!(Error::HubStatus(429).is_transient());
        assert!(!Error::HubStatus(400).is_transient());
        assert!(!Error::ItemNotFound("x".into()).is_transient());
    }
}

//! Error types for the mail relay.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Mailbox error: {0}")]
    Mailbox(#[from] MailboxError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),
}

impl Error {
    /// Whether a retry of the same job would fail the same way.
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::Config(_) => true,
            Self::Platform(e) => e.is_permanent(),
            Self::Mailbox(e) => matches!(
                e,
                MailboxError::AuthFailed { .. }
                    | MailboxError::NotFound { .. }
                    | MailboxError::Parse { .. }
            ),
            Self::Database(_) | Self::Queue(_) => false,
        }
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),
}

/// Mailbox (IMAP) errors.
#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    #[error("Could not connect to {host} after {attempts} attempt(s): {reason}")]
    ConnectFailed {
        host: String,
        attempts: u32,
        reason: String,
    },

    #[error("Authentication rejected for {address}")]
    AuthFailed { address: String },

    #[error("IMAP protocol error: {0}")]
    Protocol(String),

    #[error("Message {id} not found in mailbox")]
    NotFound { id: u32 },

    #[error("Failed to parse message {id}")]
    Parse { id: u32 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Durable queue errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Fetch failed: {0}")]
    Fetch(String),

    #[error("Ack failed: {0}")]
    Ack(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Chat platform (Telegram Bot API) errors.
#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Thread not found: {0}")]
    ThreadNotFound(String),

    #[error("API error {code}: {description}")]
    Api { code: u16, description: String },

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PlatformError {
    /// Errors that will not go away by sending the same request again.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::Forbidden(_) | Self::BadRequest(_) | Self::ThreadNotFound(_)
        )
    }
}

/// Result type alias for the relay.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permanent_platform_errors() {
        assert!(PlatformError::Forbidden("kicked".into()).is_permanent());
        assert!(PlatformError::BadRequest("chat not found".into()).is_permanent());
        assert!(!PlatformError::RateLimited { retry_after: Duration::from_secs(3) }.is_permanent());
        assert!(!PlatformError::Http("timeout".into()).is_permanent());
    }

    #[test]
    fn top_level_permanence_follows_source() {
        assert!(Error::from(PlatformError::Forbidden("kicked".into())).is_permanent());
        assert!(Error::from(MailboxError::NotFound { id: 3 }).is_permanent());
        assert!(!Error::from(MailboxError::ConnectFailed {
            host: "imap.example.com".into(),
            attempts: 3,
            reason: "timed out".into(),
        })
        .is_permanent());
        assert!(!Error::from(QueueError::Ack("locked".into())).is_permanent());
    }

    #[test]
    fn top_level_wraps_sources() {
        let err: Error = MailboxError::NotFound { id: 7 }.into();
        assert_eq!(err.to_string(), "Mailbox error: Message 7 not found in mailbox");
    }
}

//! Error and Result types shared across the crate.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong in the library.
///
/// Infrastructure failures convert via `#[from]`; domain rules get their
/// own variants so callers can match on them.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("An active session already exists for {target_type}:{target_value}")]
    DuplicateSession {
        target_type: String,
        target_value: String,
    },

    #[error("Invalid state transition: cannot transition {entity} from {from} to {to}")]
    InvalidStateTransition {
        entity: String,
        from: String,
        to: String,
    },

    #[error("{entity_type} not found: {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Event emitter has been shut down")]
    EmitterClosed,

    #[error("Session {session_id} has no pending work to resume")]
    NoPendingWork { session_id: String },

    #[error("Download error: {0}")]
    Download(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity.into(),
            id: id.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn transition(
        entity: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
    ) -> Self {
        Self::InvalidStateTransition {
            entity: entity.into(),
            from: from.into(),
            to: to.into(),
        }
    }

    pub fn download(message: impl Into<String>) -> Self {
        Self::Download(message.into())
    }
}

//! Error types for the pickup tracker.

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Message source error: {0}")]
    Source(#[from] SourceError),

    #[error("Output error: {0}")]
    Output(#[from] serde_json::Error),

    #[error("{0}")]
    Usage(String),
}

impl Error {
    /// Process exit code for the command-line front end.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Source(e) if e.is_permission_denied() => 2,
            Self::Usage(_) => 64,
            _ => 1,
        }
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Invalid parser pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
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

    /// Insert rejected by the unique index on the business key.
    #[error("Duplicate key: {key}")]
    DuplicateKey { key: String },

    #[error("Migration failed: {0}")]
    Migration(String),
}

/// Errors raised while reading raw messages.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// The message store exists but we are not allowed to read it.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SourceError {
    /// Whether the boundary layer should ask the user for access.
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Self::PermissionDenied(_))
    }
}

/// Result type alias for the tracker.
pub type Result<T> = std::result::Result<T, Error>;

//! Error types for gridbroker.

use uuid::Uuid;

/// Top-level error type for the broker.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Lease error: {0}")]
    Lease(#[from] LeaseError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Caller-facing lease/lifecycle errors.
///
/// Every mutating subtask operation fails with exactly one of these.
/// None of them is retried internally — retry policy belongs to the
/// calling provider.
#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    /// The referenced subtask does not exist.
    #[error("Subtask {0} not found")]
    NotFound(Uuid),

    /// Caller is not the current assignee and never held this lease.
    #[error("Subtask {id} is assigned to another provider")]
    OwnershipConflict { id: Uuid },

    /// Presented concurrency token is stale; caller must re-fetch.
    #[error("Stale concurrency token for subtask {id}")]
    ConcurrencyConflict { id: Uuid },

    /// The requested change is not legal from the current status
    /// (includes "already terminal").
    #[error("Subtask {id} cannot transition from {from} to {to}")]
    InvalidTransition { id: Uuid, from: String, to: String },

    /// The lease was already reclaimed; re-claiming (not retrying the
    /// same subtask) is the right recovery.
    #[error("Lease on subtask {id} has expired")]
    LeaseExpired { id: Uuid },

    /// Request payload failed validation (empty update, out-of-range
    /// progress, ...).
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Result type alias for the broker.
pub type Result<T> = std::result::Result<T, Error>;

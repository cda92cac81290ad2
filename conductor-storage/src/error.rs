//! Error types for storage operations

use thiserror::Error;

/// Storage layer error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Core domain error: {0}")]
    Core(#[from] conductor_core::Error),

    #[error("Not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Corrupt row in {table}: {message}")]
    CorruptRow { table: String, message: String },

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl Error {
    pub fn not_found<S1: Into<String>, S2: Into<String>>(entity: S1, id: S2) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    pub fn corrupt<S1: Into<String>, S2: Into<String>>(table: S1, message: S2) -> Self {
        Self::CorruptRow {
            table: table.into(),
            message: message.into(),
        }
    }

    pub fn is_claim_denied(&self) -> bool {
        matches!(self, Error::Core(e) if e.is_claim_denied())
    }

    /// The store cannot currently be reached or written
    ///
    /// Pool exhaustion, I/O failures and SQLite busy/locked/cantopen codes
    /// all halt the current pass.
    pub fn is_unavailable(&self) -> bool {
        match self {
            Error::Database(sqlx::Error::PoolTimedOut)
            | Error::Database(sqlx::Error::PoolClosed)
            | Error::Database(sqlx::Error::Io(_)) => true,
            Error::Database(sqlx::Error::Database(db)) => matches!(
                db.code().as_deref(),
                Some("5") | Some("6") | Some("14") | Some("261") | Some("517")
            ),
            Error::Core(conductor_core::Error::StoreUnavailable(_)) => true,
            _ => false,
        }
    }
}

/// Convenience result type for storage operations
pub type Result<T> = std::result::Result<T, Error>;

use thiserror::Error;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The addressed row does not exist.
    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },

    /// A uniqueness constraint was violated (duplicate session id, …).
    #[error("{what} already exists: {id}")]
    Conflict { what: &'static str, id: String },

    /// A SQLite operation failed.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Credential encryption or decryption failed.
    #[error(transparent)]
    Crypto(#[from] crate::crypto::CryptoError),

    /// Applying the schema migration ladder failed; fatal at startup.
    #[error("schema migration {version} failed: {source}")]
    Schema {
        version: usize,
        source: rusqlite::Error,
    },
}

// Constructors used throughout store.rs; kept here so call sites stay short.
pub(crate) fn not_found(what: &'static str, id: impl Into<String>) -> StoreError {
    StoreError::NotFound {
        what,
        id: id.into(),
    }
}

pub(crate) fn conflict(what: &'static str, id: impl Into<String>) -> StoreError {
    StoreError::Conflict {
        what,
        id: id.into(),
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

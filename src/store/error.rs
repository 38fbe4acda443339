//! Query layer errors
//!
//! Driver errors are classified once, here, into a store-agnostic kind so
//! nothing above the query layer inspects sqlx types.

use thiserror::Error;

/// Store-agnostic classification of a failed statement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreErrorKind {
    NotFound,
    UniqueViolation,
    Other,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("{entity} not found")]
    NotFound { entity: &'static str },

    #[error("{entity} already exists ({constraint})")]
    UniqueViolation {
        entity: &'static str,
        constraint: String,
    },

    #[error("database error: {0}")]
    Other(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    pub fn kind(&self) -> StoreErrorKind {
        match self {
            StoreError::NotFound { .. } => StoreErrorKind::NotFound,
            StoreError::UniqueViolation { .. } => StoreErrorKind::UniqueViolation,
            StoreError::Other(_) => StoreErrorKind::Other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == StoreErrorKind::NotFound
    }

    pub fn is_unique_violation(&self) -> bool {
        self.kind() == StoreErrorKind::UniqueViolation
    }

    /// Classify a sqlx error raised while operating on `entity`
    pub fn from_sqlx(err: sqlx::Error, entity: &'static str) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound { entity },
            sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::UniqueViolation {
                entity,
                constraint: db.constraint().unwrap_or("unique").to_string(),
            },
            other => StoreError::Other(other.to_string()),
        }
    }
}

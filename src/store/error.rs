use thiserror::Error;

use crate::storage::DatabaseError;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Name already in use: {0}")]
    NameCollision(String),
    #[error("Invalid name: {0}")]
    InvalidName(String),
    /// A marker that should not exist yet already does. Indicates a bug or a
    /// locking violation rather than a user error.
    #[error("Reference {logical_id} to {content_hash} already exists")]
    AlreadyReferenced {
        content_hash: String,
        logical_id: String,
    },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl StoreError {
    /// Environment faults, as opposed to conditions the caller can correct.
    pub fn is_fault(&self) -> bool {
        matches!(
            self,
            StoreError::AlreadyReferenced { .. } | StoreError::Io(_) | StoreError::Database(_)
        )
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

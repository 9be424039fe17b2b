use thiserror::Error;

use crate::store::StoreError;

/// Why an upload did not produce a link.
///
/// Everything except [`UploadOutcome::StorageFault`] and
/// [`UploadOutcome::ConsistencyFault`] is a rejection the uploader can correct;
/// nothing is written to disk for a rejection.
#[derive(Debug, Error)]
pub enum UploadOutcome {
    #[error("Invalid upload: {0}")]
    InvalidInput(String),
    #[error("File type '{0}' is not supported")]
    UnsupportedType(String),
    #[error("File is not a recognized image")]
    NotAnImage,
    #[error("A file named '{0}' already exists")]
    NameCollision(String),
    #[error("File size {size} exceeds the maximum of {max} bytes")]
    TooLarge { size: u64, max: u64 },
    #[error("File failed virus scan ({0})")]
    Infected(String),
    #[error("Virus scanner unavailable")]
    ScannerUnavailable,
    #[error("Storage fault: {0}")]
    StorageFault(#[source] StoreError),
    #[error("Consistency fault: {0}")]
    ConsistencyFault(#[source] StoreError),
}

impl UploadOutcome {
    pub fn is_rejection(&self) -> bool {
        !self.is_fault()
    }

    pub fn is_fault(&self) -> bool {
        matches!(
            self,
            UploadOutcome::StorageFault(_) | UploadOutcome::ConsistencyFault(_)
        )
    }
}

impl From<StoreError> for UploadOutcome {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NameCollision(name) => UploadOutcome::NameCollision(name),
            StoreError::InvalidName(reason) => UploadOutcome::InvalidInput(reason),
            StoreError::Io(_) | StoreError::Database(_) => UploadOutcome::StorageFault(e),
            // A blob vanishing while its lock is held is never a user error
            StoreError::NotFound(_) | StoreError::AlreadyReferenced { .. } => {
                UploadOutcome::ConsistencyFault(e)
            }
        }
    }
}

use thiserror::Error;

use batchforge_core::{CoreError, MasterJobId};
use batchforge_storage::StorageError;

pub type FactoryResult<T> = Result<T, FactoryError>;

/// Errors returned by [`crate::DataFactory`] operations.
///
/// Per-record failures never surface here; they are classified and counted by the
/// scheduler. These are the run-level outcomes a caller has to act on.
#[derive(Debug, Error)]
pub enum FactoryError {
    #[error("invalid input: {0}")]
    Input(String),

    #[error("no records completed: {0}")]
    Output(String),

    #[error("master job cannot be resumed: {0}")]
    NotResumable(String),

    #[error("master job not found: {0}")]
    NotFound(MasterJobId),

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("run interrupted")]
    Interrupted,
}

impl From<CoreError> for FactoryError {
    fn from(value: CoreError) -> Self {
        FactoryError::Input(value.to_string())
    }
}

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("shared store backend error: {0}")]
    Backend(#[from] redis::RedisError),

    #[error("invalid id {id:?}: {reason}")]
    InvalidId { id: String, reason: &'static str },

    #[error("malformed record at key {key}: {reason}")]
    Malformed { key: String, reason: String },

    #[error("transaction aborted after {attempts} attempts")]
    TransactionConflict { attempts: u32 },
}

impl From<StoreError> for pulsemesh_common::EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::TransactionConflict { .. } => pulsemesh_common::EngineError::precondition(
                pulsemesh_common::PreconditionCode::MetadataConflict,
                err.to_string(),
            ),
            other => pulsemesh_common::EngineError::Store(other.to_string()),
        }
    }
}

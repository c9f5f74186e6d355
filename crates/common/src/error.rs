use thiserror::Error;

/// Error codes surfaced to callers for precondition failures, so the
/// transport layer's ack serialization is a pure match, never a string
/// heuristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreconditionCode {
    MetadataConflict,
    MetadataLock,
    MetadataInvalid,
}

impl PreconditionCode {
    pub fn as_str(self) -> &'static str {
        match self {
            PreconditionCode::MetadataConflict => "METADATA_CONFLICT",
            PreconditionCode::MetadataLock => "METADATA_LOCK",
            PreconditionCode::MetadataInvalid => "METADATA_INVALID",
        }
    }
}

impl std::fmt::Display for PreconditionCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The error type returned by every public presence-engine operation.
///
/// Public library surfaces use `thiserror` for a typed, matchable error;
/// wiring glue in the daemon binary uses `anyhow` on top of this.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("precondition failed ({code}): {message}")]
    Precondition {
        code: PreconditionCode,
        message: String,
    },

    #[error("heartbeat rejected: stale epoch")]
    StaleEpoch,

    #[error("shared store error: {0}")]
    Store(String),

    #[error("subscriber handler error: {0}")]
    Handler(String),
}

impl EngineError {
    pub fn precondition(code: PreconditionCode, message: impl Into<String>) -> Self {
        EngineError::Precondition {
            code,
            message: message.into(),
        }
    }

    /// The error code surfaced to the transport layer, if any.
    pub fn code(&self) -> Option<&'static str> {
        match self {
            EngineError::Precondition { code, .. } => Some(code.as_str()),
            _ => None,
        }
    }
}

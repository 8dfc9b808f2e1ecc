use std::sync::Arc;

use thiserror::Error;

pub type LbxResult<T> = Result<T, LbxError>;

/// Error taxonomy shared by every lockbox crate.
///
/// `Clone` so one failed decrypt can be handed to every caller awaiting it;
/// non-clone sources are held behind `Arc`.
#[derive(Debug, Clone, Error)]
pub enum LbxError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid key: expected {expected} bytes, got {actual}")]
    InvalidKey { expected: usize, actual: usize },

    #[error("cannot decrypt {context}: wrong password or corrupted data")]
    AuthenticationFailure { context: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("corrupted: {0}")]
    Corrupted(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    #[error(transparent)]
    Other(Arc<anyhow::Error>),
}

impl LbxError {
    pub fn auth(context: impl Into<String>) -> Self {
        LbxError::AuthenticationFailure {
            context: context.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, LbxError::NotFound(_))
    }

    pub fn is_auth_failure(&self) -> bool {
        matches!(self, LbxError::AuthenticationFailure { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, LbxError::Cancelled)
    }

    /// Re-label an authentication failure with the step that hit it,
    /// e.g. `"chunk 3 of <uuid>"`. Other variants pass through.
    pub fn with_context(self, context: impl Into<String>) -> Self {
        match self {
            LbxError::AuthenticationFailure { .. } => LbxError::auth(context),
            other => other,
        }
    }
}

impl From<std::io::Error> for LbxError {
    fn from(e: std::io::Error) -> Self {
        LbxError::Io(Arc::new(e))
    }
}

impl From<anyhow::Error> for LbxError {
    fn from(e: anyhow::Error) -> Self {
        LbxError::Other(Arc::new(e))
    }
}

impl From<serde_json::Error> for LbxError {
    fn from(e: serde_json::Error) -> Self {
        LbxError::Serialization(e.to_string())
    }
}

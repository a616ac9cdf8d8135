//! Error types for the GGUF model provider

use crate::error::EvalError;

/// Errors that can occur while loading or running a GGUF model.
#[derive(Debug, thiserror::Error)]
pub enum LmError {
    #[error("unknown model variant: '{0}'")]
    UnknownVariant(String),

    #[error("download failed")]
    Download(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("model load failed")]
    ModelLoad(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("inference failed")]
    Inference(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("sequence of {len} tokens exceeds context size {n_ctx}")]
    ContextOverflow { len: usize, n_ctx: u32 },
}

pub type Result<T> = std::result::Result<T, LmError>;

impl From<LmError> for EvalError {
    fn from(e: LmError) -> Self {
        EvalError::Model(Box::new(e))
    }
}

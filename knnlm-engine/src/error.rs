//! Error types for evaluation, scoring and datastore operations

/// Errors that can occur while scoring batches or managing the datastore.
#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    #[error("conflicting configuration: {0}")]
    ConfigurationConflict(String),

    #[error("unsupported configuration: {0}")]
    UnsupportedConfiguration(String),

    #[error("missing configuration: {0}")]
    MissingConfiguration(String),

    #[error("invalid configuration value: {0}")]
    InvalidConfiguration(String),

    #[error("missing input: {0}")]
    MissingInput(String),

    #[error("shape mismatch: {0}")]
    Shape(String),

    #[error("model forward failed")]
    Model(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("retrieval failed")]
    Retrieval(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("invalid vocabulary: {0}")]
    Vocabulary(String),

    #[error("tokenizer failed")]
    Tokenizer(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("invalid datastore: {0}")]
    Datastore(String),

    #[error("evaluation already finalized")]
    Finalized,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("JSON error")]
    Json(#[from] serde_json::Error),

    #[error("config parse error")]
    Config(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, EvalError>;

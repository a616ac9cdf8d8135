//! GGUF language models via llama.cpp

pub mod error;
pub mod hf_download;
pub mod llamacpp;
pub mod model_config;

pub use error::LmError;
pub use hf_download::{download_file, get_tokenizer_path, get_variant_path, resolve_variant};
pub use llamacpp::LlamaCppModel;
pub use model_config::{ModelFamily, ModelRegistry, VariantConfig, registry};

//! HuggingFace model download utilities
//!
//! Files are cached in the HuggingFace cache directory (~/.cache/huggingface/hub/).
//! Model definitions come from `models.toml` via [`super::model_config`].

use super::error::{LmError, Result};
use super::model_config::{ModelFamily, VariantConfig, registry};
use hf_hub::{Repo, RepoType, api::sync::ApiBuilder};
use std::path::PathBuf;

/// Download one file from a HuggingFace model repo and return its local path.
///
/// `HF_TOKEN` is used when set (required for private repositories).
pub fn download_file(repo_id: &str, filename: &str) -> Result<PathBuf> {
    let mut builder = ApiBuilder::new();
    if let Ok(token) = std::env::var("HF_TOKEN") {
        builder = builder.with_token(Some(token));
    }
    let api = builder.build().map_err(|e| LmError::Download(e.into()))?;

    let repo = api.repo(Repo::new(repo_id.to_string(), RepoType::Model));

    tracing::info!("Downloading {} from {}...", filename, repo_id);
    let path = repo
        .get(filename)
        .map_err(|e| LmError::Download(e.into()))?;
    tracing::info!("Downloaded to {:?}", path);

    Ok(path)
}

/// Local GGUF path for a variant, downloading if not cached.
pub fn get_variant_path(family: &ModelFamily, variant: &VariantConfig) -> Result<PathBuf> {
    download_file(&family.repo_id, &variant.filename)
}

/// Local `tokenizer.json` path for a model family, downloading if necessary.
pub fn get_tokenizer_path(family: &ModelFamily) -> Result<PathBuf> {
    download_file(family.tokenizer_repo(), "tokenizer.json")
}

/// Look up a variant id in the registry, or the default when `None`.
pub fn resolve_variant(
    variant_id: Option<&str>,
) -> Result<(&'static ModelFamily, &'static VariantConfig)> {
    let reg = registry();
    let id = variant_id.unwrap_or(&reg.default_model);
    reg.find_variant(id)
        .ok_or_else(|| LmError::UnknownVariant(id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_default() {
        let (_, variant) = resolve_variant(None).unwrap();
        assert_eq!(variant.id, registry().default_model);
    }

    #[test]
    fn test_resolve_unknown() {
        assert!(matches!(
            resolve_variant(Some("nonexistent-model-id")),
            Err(LmError::UnknownVariant(_))
        ));
    }
}

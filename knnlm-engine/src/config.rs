//! Evaluation configuration
//!
//! Default values are defined in `config/default.toml`; user files are merged
//! over them key by key.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::combine::validate_lambda;
use crate::datastore::KeyPrecision;
use crate::error::{EvalError, Result};
use crate::knn::KnnConfig;
use crate::sample::KeyType;
use crate::scorer::ScorerConfig;
use crate::tensor::TokenId;

/// Default configuration TOML embedded from config/default.toml
const DEFAULT_CONFIG_TOML: &str = include_str!("../config/default.toml");

/// Complete evaluation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalConfig {
    pub model: ModelSettings,
    pub scoring: ScoringSettings,
    pub eval: EvalSettings,
    pub knnlm: KnnlmSettings,
    pub datastore: DatastoreSettings,
}

/// Which models to load and how.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSettings {
    /// GGUF files forming the ensemble
    #[serde(default)]
    pub paths: Vec<PathBuf>,
    /// Registry variant id, used when `paths` is empty
    pub variant: Option<String>,
    /// HuggingFace tokenizer.json (overrides the registry tokenizer)
    pub tokenizer: Option<PathBuf>,
    /// Plain dict.txt vocabulary, used instead of a tokenizer
    pub dict: Option<PathBuf>,
    /// llama.cpp context size
    pub n_ctx: u32,
    /// Inference threads (0 = llama.cpp default)
    pub n_threads: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringSettings {
    /// Maximum positions normalized at once (unset = whole batch)
    pub softmax_batch: Option<usize>,
    pub compute_alignment: bool,
    /// Predicted tokens kept per position
    pub top_k: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalSettings {
    /// Blocks per batch
    pub batch_size: usize,
    /// Tokens per block including the context window
    pub tokens_per_sample: usize,
    /// Previous tokens prepended to every block as unscored context
    pub context_window: usize,
    /// Every block starts with beginning-of-sentence, excluded from the loss
    pub add_bos_token: bool,
    /// Subword continuation marker, e.g. "@@ "
    pub remove_bpe: Option<String>,
    pub output_word_probs: bool,
    pub output_word_stats: bool,
    /// Where to save top-K predictions and references as JSON
    pub predictions_path: Option<PathBuf>,
    /// Batches between throughput log lines (0 = only at the end)
    pub log_interval: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnnlmSettings {
    /// Interpolate retrieval probabilities into the model's
    pub enabled: bool,
    /// Weight of the retrieval distribution
    pub lambda: f32,
    pub k: usize,
    pub temperature: f32,
    #[serde(default)]
    pub key_type: KeyType,
    /// Datastore to retrieve from
    pub dstore_prefix: Option<PathBuf>,
    pub exclude_same_sample: bool,
    /// Also interpolate the full vocabulary distribution (affects top-K predictions)
    pub full_vocab: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatastoreSettings {
    /// Build a datastore from the evaluated split
    pub save: bool,
    pub prefix: Option<PathBuf>,
    /// Rows to allocate
    pub capacity: Option<usize>,
    /// Key width (defaults to the model's hidden size)
    pub embed_dim: Option<usize>,
    /// Store keys as f16 instead of f32
    pub fp16: bool,
}

impl DatastoreSettings {
    pub fn precision(&self) -> KeyPrecision {
        if self.fp16 {
            KeyPrecision::Fp16
        } else {
            KeyPrecision::Fp32
        }
    }
}

impl Default for EvalConfig {
    fn default() -> Self {
        toml::from_str(DEFAULT_CONFIG_TOML).expect("embedded default.toml must be valid")
    }
}

/// Recursively merge `overlay` TOML values on top of `base`.
fn merge_toml(base: &mut toml::Value, overlay: &toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base_table), toml::Value::Table(overlay_table)) => {
            for (key, value) in overlay_table {
                if let Some(base_value) = base_table.get_mut(key) {
                    merge_toml(base_value, value);
                } else {
                    base_table.insert(key.clone(), value.clone());
                }
            }
        }
        (base, _) => {
            *base = overlay.clone();
        }
    }
}

impl EvalConfig {
    /// Parse user TOML content merged on top of default.toml.
    pub fn parse_with_defaults(user_content: &str) -> Result<Self> {
        let mut base: toml::Value = toml::from_str(DEFAULT_CONFIG_TOML)?;
        let user: toml::Value = toml::from_str(user_content)?;
        merge_toml(&mut base, &user);
        Ok(base.try_into()?)
    }

    /// Load settings from a file, merged on top of defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        debug!("Loading config from {:?}", path);
        let content = fs::read_to_string(path)?;
        Self::parse_with_defaults(&content)
    }

    /// Reject settings that cannot produce a run.
    pub fn validate(&self) -> Result<()> {
        if self.knnlm.enabled && self.datastore.save {
            return Err(EvalError::ConfigurationConflict(
                "cannot use kNN-LM retrieval while building the datastore".to_string(),
            ));
        }
        if self.scoring.softmax_batch == Some(0) {
            return Err(EvalError::InvalidConfiguration(
                "softmax_batch must be positive".to_string(),
            ));
        }
        if self.eval.batch_size == 0 {
            return Err(EvalError::InvalidConfiguration(
                "batch_size must be positive".to_string(),
            ));
        }
        if self.eval.tokens_per_sample <= self.eval.context_window {
            return Err(EvalError::InvalidConfiguration(format!(
                "tokens_per_sample ({}) must exceed context_window ({})",
                self.eval.tokens_per_sample, self.eval.context_window
            )));
        }

        if self.knnlm.enabled {
            validate_lambda(self.knnlm.lambda)?;
            if self.knnlm.dstore_prefix.is_none() {
                return Err(EvalError::MissingConfiguration(
                    "knnlm.dstore_prefix is required with kNN-LM".to_string(),
                ));
            }
            if self.knnlm.k == 0 {
                return Err(EvalError::InvalidConfiguration(
                    "knnlm.k must be positive".to_string(),
                ));
            }
            if self.knnlm.temperature.is_nan() || self.knnlm.temperature <= 0.0 {
                return Err(EvalError::InvalidConfiguration(
                    "knnlm.temperature must be positive".to_string(),
                ));
            }
        }

        if self.datastore.save {
            if self.datastore.prefix.is_none() {
                return Err(EvalError::MissingConfiguration(
                    "datastore.prefix is required to save a datastore".to_string(),
                ));
            }
            match self.datastore.capacity {
                None => {
                    return Err(EvalError::MissingConfiguration(
                        "datastore.capacity is required to save a datastore".to_string(),
                    ));
                }
                Some(0) => {
                    return Err(EvalError::InvalidConfiguration(
                        "datastore.capacity must be positive".to_string(),
                    ));
                }
                Some(_) => {}
            }
            if self.datastore.embed_dim == Some(0) {
                return Err(EvalError::InvalidConfiguration(
                    "datastore.embed_dim must be positive".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Tokens per block once the context window is reserved.
    pub fn block_size(&self) -> usize {
        self.eval
            .tokens_per_sample
            .saturating_sub(self.eval.context_window)
    }

    pub fn scorer_config(&self, pad: TokenId, eos: TokenId) -> ScorerConfig {
        let mut config = ScorerConfig::new(pad, eos);
        config.softmax_batch = self.scoring.softmax_batch.unwrap_or(usize::MAX);
        config.compute_alignment = self.scoring.compute_alignment;
        config.top_k = self.scoring.top_k;
        config.key_type = self.knnlm.key_type;
        config.save_dstore_keys = self.datastore.save;
        config
    }

    pub fn knn_config(&self) -> KnnConfig {
        KnnConfig {
            k: self.knnlm.k,
            temperature: self.knnlm.temperature,
            exclude_same_sample: self.knnlm.exclude_same_sample,
        }
    }

    /// Serialize to TOML, e.g. to show the effective configuration.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| EvalError::InvalidConfiguration(format!("cannot serialize config: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = EvalConfig::default();
        assert_eq!(config.scoring.top_k, 100);
        assert_eq!(config.scoring.softmax_batch, None);
        assert_eq!(config.eval.batch_size, 1);
        assert!(!config.knnlm.enabled);
        assert_eq!(config.knnlm.key_type, KeyType::LastFfnOutput);
        assert!(!config.datastore.save);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_config() {
        let config = EvalConfig::parse_with_defaults(
            r#"
[knnlm]
enabled = true
lambda = 0.3
dstore_prefix = "dstore/train"
"#,
        )
        .unwrap();
        assert!(config.knnlm.enabled);
        assert!((config.knnlm.lambda - 0.3).abs() < 1e-6);
        assert_eq!(config.knnlm.k, 1024);
        assert_eq!(config.eval.tokens_per_sample, 512);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[scoring]
softmax_batch = 64

[eval]
context_window = 256
"#
        )
        .unwrap();

        let config = EvalConfig::load_from(file.path()).unwrap();
        assert_eq!(config.scoring.softmax_batch, Some(64));
        assert_eq!(config.block_size(), 256);
        assert_eq!(config.scorer_config(1, 2).softmax_batch, 64);
    }

    #[test]
    fn test_knnlm_and_save_conflict() {
        let mut config = EvalConfig::default();
        config.knnlm.enabled = true;
        config.knnlm.dstore_prefix = Some("a".into());
        config.datastore.save = true;
        config.datastore.prefix = Some("b".into());
        config.datastore.capacity = Some(10);
        assert!(matches!(
            config.validate(),
            Err(EvalError::ConfigurationConflict(_))
        ));
    }

    #[test]
    fn test_missing_datastore_settings() {
        let mut config = EvalConfig::default();
        config.datastore.save = true;
        assert!(matches!(
            config.validate(),
            Err(EvalError::MissingConfiguration(_))
        ));
        config.datastore.prefix = Some("ds".into());
        assert!(matches!(
            config.validate(),
            Err(EvalError::MissingConfiguration(_))
        ));
        config.datastore.capacity = Some(100);
        assert!(config.validate().is_ok());
        assert!(config.scorer_config(1, 2).save_dstore_keys);
    }

    #[test]
    fn test_invalid_values() {
        let mut config = EvalConfig::default();
        config.scoring.softmax_batch = Some(0);
        assert!(config.validate().is_err());

        let mut config = EvalConfig::default();
        config.knnlm.enabled = true;
        config.knnlm.dstore_prefix = Some("a".into());
        config.knnlm.lambda = 1.0;
        assert!(config.validate().is_err());

        let mut config = EvalConfig::default();
        config.eval.context_window = 512;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_round_trip_toml() {
        let config = EvalConfig::default();
        let text = config.to_toml_string().unwrap();
        let loaded: EvalConfig = toml::from_str(&text).unwrap();
        assert_eq!(loaded, config);
    }
}

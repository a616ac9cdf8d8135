//! llama.cpp based GGUF language model
//!
//! Runs every position of a sequence in one decode and reads back both the
//! logits and the final hidden state (the model's embedding output, taken
//! after the output norm) for each position.

use super::error::{LmError, Result};
use crate::error::Result as EvalResult;
use crate::provider::LanguageModel;
use crate::sample::{DecoderOutput, KeyType, NetInput};
use crate::tensor::Tensor3;
use llama_cpp_2::context::params::{LlamaContextParams, LlamaPoolingType};
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::LlamaModel;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::token::LlamaToken;
use std::num::NonZeroU32;
use std::path::Path;
use std::sync::OnceLock;
use tracing::debug;

/// Global llama.cpp backend (can only be initialized once)
static LLAMA_BACKEND: OnceLock<std::result::Result<LlamaBackend, String>> = OnceLock::new();

/// Get or initialize the global llama.cpp backend
fn get_backend() -> Result<&'static LlamaBackend> {
    let result = LLAMA_BACKEND.get_or_init(|| {
        let mut backend = LlamaBackend::init().map_err(|e| e.to_string())?;
        backend.void_logs();
        Ok(backend)
    });
    match result {
        Ok(backend) => Ok(backend),
        Err(e) => Err(LmError::ModelLoad(
            format!("Failed to initialize llama.cpp backend: {}", e).into(),
        )),
    }
}

/// A GGUF causal language model scored position by position.
pub struct LlamaCppModel {
    model: LlamaModel,
    n_ctx: u32,
    /// Number of threads for inference (0 = use llama.cpp default)
    n_threads: u32,
    vocab_size: usize,
    hidden_dim: usize,
}

impl LlamaCppModel {
    /// Load a GGUF model with the default context size.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_file_with_n_ctx(path, 1024)
    }

    /// Load a GGUF model with an explicit context window size.
    pub fn from_file_with_n_ctx<P: AsRef<Path>>(path: P, n_ctx: u32) -> Result<Self> {
        if n_ctx == 0 {
            return Err(LmError::ModelLoad("n_ctx must be non-zero".into()));
        }
        let backend = get_backend()?;

        let model_params = LlamaModelParams::default().with_n_gpu_layers(0);
        let model = LlamaModel::load_from_file(backend, path.as_ref(), &model_params)
            .map_err(|e| LmError::ModelLoad(e.into()))?;

        let vocab_size = model.n_vocab() as usize;
        let hidden_dim = model.n_embd() as usize;
        debug!(
            "Loaded {:?}: vocab {}, hidden {}",
            path.as_ref(),
            vocab_size,
            hidden_dim
        );

        Ok(Self {
            model,
            n_ctx,
            n_threads: 0,
            vocab_size,
            hidden_dim,
        })
    }

    /// Set the number of threads for inference.
    /// 0 means use llama.cpp default (typically all cores).
    pub fn set_n_threads(&mut self, n: u32) {
        self.n_threads = n;
    }

    pub fn n_ctx(&self) -> u32 {
        self.n_ctx
    }

    /// Context parameters with per-token embeddings enabled and no pooling.
    fn context_params(&self) -> Result<LlamaContextParams> {
        let n_ctx = NonZeroU32::new(self.n_ctx)
            .ok_or_else(|| LmError::ModelLoad("n_ctx must be non-zero".into()))?;
        let params = LlamaContextParams::default()
            .with_n_ctx(Some(n_ctx))
            .with_n_batch(self.n_ctx)
            .with_n_ubatch(self.n_ctx)
            .with_embeddings(true)
            .with_pooling_type(LlamaPoolingType::None);
        if self.n_threads > 0 {
            Ok(params
                .with_n_threads(self.n_threads as i32)
                .with_n_threads_batch(self.n_threads as i32))
        } else {
            Ok(params)
        }
    }

    /// Logits `(bsz, tsz, vocab)` and final hidden states `(bsz, tsz, dim)` for a batch.
    ///
    /// Each row is decoded independently after clearing the KV cache. Padding
    /// positions past a row's length are left at zero.
    pub fn run(&self, input: &NetInput) -> Result<(Tensor3, Tensor3)> {
        let bsz = input.src_tokens.rows();
        let tsz = input.src_tokens.cols();
        let mut logits = Tensor3::zeros([bsz, tsz, self.vocab_size]);
        let mut hidden = Tensor3::zeros([bsz, tsz, self.hidden_dim]);

        let backend = get_backend()?;
        let mut ctx = self
            .model
            .new_context(backend, self.context_params()?)
            .map_err(|e| LmError::Inference(e.into()))?;

        for i in 0..bsz {
            let len = input.src_lengths.get(i).copied().unwrap_or(tsz).min(tsz);
            if len == 0 {
                continue;
            }
            if len > self.n_ctx as usize {
                return Err(LmError::ContextOverflow {
                    len,
                    n_ctx: self.n_ctx,
                });
            }
            let tokens: Vec<LlamaToken> = input.src_tokens.row(i)[..len]
                .iter()
                .map(|&id| LlamaToken(id as i32))
                .collect();

            ctx.clear_kv_cache();
            let mut batch = LlamaBatch::new(len.max(512), 1);
            batch
                .add_sequence(&tokens, 0, true)
                .map_err(|e| LmError::Inference(e.into()))?;
            ctx.decode(&mut batch)
                .map_err(|e| LmError::Inference(e.into()))?;

            for t in 0..len {
                let row_logits = ctx.get_logits_ith(t as i32);
                let n = self.vocab_size.min(row_logits.len());
                logits.row_mut(i, t)[..n].copy_from_slice(&row_logits[..n]);

                let row_hidden = ctx
                    .embeddings_ith(t as i32)
                    .map_err(|e| LmError::Inference(e.into()))?;
                let n = self.hidden_dim.min(row_hidden.len());
                hidden.row_mut(i, t)[..n].copy_from_slice(&row_hidden[..n]);
            }
        }

        Ok((logits, hidden))
    }
}

impl LanguageModel for LlamaCppModel {
    fn forward(&self, input: &NetInput) -> EvalResult<DecoderOutput> {
        let (logits, hidden) = self.run(input)?;
        Ok(DecoderOutput::new(logits).with_hidden(KeyType::LastFfnOutput, hidden))
    }

    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn hidden_dim(&self) -> usize {
        self.hidden_dim
    }
}

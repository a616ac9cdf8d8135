//! Batches flowing into the scorer and the per-sequence results flowing out.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{EvalError, Result};
use crate::tensor::{Matrix, Tensor3, TokenId};

/// Model inputs for one batch.
#[derive(Debug, Clone)]
pub struct NetInput {
    /// Source tokens, `(bsz, srclen)`, right-padded.
    pub src_tokens: Matrix<TokenId>,
    /// Unpadded length of each source row.
    pub src_lengths: Vec<usize>,
}

/// One evaluation batch.
#[derive(Debug, Clone)]
pub struct Sample {
    /// Dataset identifier of each sequence in the batch.
    pub ids: Vec<u64>,
    /// `None` marks a batch the iterator could not fill; such batches are skipped.
    pub net_input: Option<NetInput>,
    /// Target tokens, `(bsz, tsz)`, right-padded.
    pub target: Matrix<TokenId>,
    /// Offset of the first scored target position per sequence (context-window trimming).
    pub start_indices: Option<Vec<usize>>,
    /// Number of non-pad target tokens in the batch.
    pub ntokens: usize,
}

impl Sample {
    pub fn batch_size(&self) -> usize {
        self.target.rows()
    }

    pub fn start_index(&self, i: usize) -> usize {
        self.start_indices.as_ref().map_or(0, |s| s[i])
    }

    /// Check that ids, start offsets and source rows all agree with the target batch size.
    pub fn validate(&self) -> Result<()> {
        let bsz = self.batch_size();
        if self.ids.len() != bsz {
            return Err(EvalError::Shape(format!(
                "{} sample ids for batch of {}",
                self.ids.len(),
                bsz
            )));
        }
        if let Some(starts) = &self.start_indices {
            if starts.len() != bsz {
                return Err(EvalError::Shape(format!(
                    "{} start indices for batch of {}",
                    starts.len(),
                    bsz
                )));
            }
            if let Some(&bad) = starts.iter().find(|&&s| s > self.target.cols()) {
                return Err(EvalError::Shape(format!(
                    "start index {} beyond target length {}",
                    bad,
                    self.target.cols()
                )));
            }
        }
        if let Some(input) = &self.net_input
            && input.src_tokens.rows() != bsz
        {
            return Err(EvalError::Shape(format!(
                "{} source rows for batch of {}",
                input.src_tokens.rows(),
                bsz
            )));
        }
        Ok(())
    }
}

/// Where in the network the datastore keys are taken from.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyType {
    /// Input of the final feed-forward block.
    LastFfnInput,
    /// Output of the final layer (after the output norm for GGUF models).
    #[default]
    LastFfnOutput,
}

impl std::fmt::Display for KeyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyType::LastFfnInput => write!(f, "last_ffn_input"),
            KeyType::LastFfnOutput => write!(f, "last_ffn_output"),
        }
    }
}

/// Result of a model forward pass.
#[derive(Debug, Clone)]
pub struct DecoderOutput {
    /// Unnormalized scores, `(bsz, tsz, vocab)`.
    pub logits: Tensor3,
    /// Attention over source positions, `(bsz, tsz, srclen)`.
    pub attn: Option<Tensor3>,
    /// Hidden states by extraction point, each `(bsz, tsz, dim)`.
    pub hidden: HashMap<KeyType, Tensor3>,
}

impl DecoderOutput {
    pub fn new(logits: Tensor3) -> Self {
        Self {
            logits,
            attn: None,
            hidden: HashMap::new(),
        }
    }

    pub fn with_hidden(mut self, key_type: KeyType, states: Tensor3) -> Self {
        self.hidden.insert(key_type, states);
        self
    }

    pub fn with_attn(mut self, attn: Tensor3) -> Self {
        self.attn = Some(attn);
        self
    }

    /// Hidden states at `key_type`, or an error naming the missing extraction point.
    pub fn keys(&self, key_type: KeyType) -> Result<&Tensor3> {
        self.hidden.get(&key_type).ok_or_else(|| {
            EvalError::UnsupportedConfiguration(format!(
                "decoder output has no hidden states for key type '{}'",
                key_type
            ))
        })
    }
}

/// Scoring result for one sequence.
#[derive(Debug, Clone)]
pub struct Hypothesis {
    /// Reference tokens with padding removed.
    pub tokens: Vec<TokenId>,
    /// Mean positional log-probability.
    pub score: f32,
    /// Log-probability of each reference token.
    pub positional_scores: Vec<f32>,
    /// Averaged attention, `(tsz, srclen)`.
    pub attention: Option<Matrix<f32>>,
    /// `(source, target)` word index pairs.
    pub alignment: Option<Vec<(usize, usize)>>,
    /// Hidden-state key per reference position, `(len, dim)`; only when building a datastore.
    pub dstore_keys: Option<Matrix<f32>>,
    /// Most probable token ids at each reference position, best first.
    pub predicted_topk: Vec<Vec<TokenId>>,
}

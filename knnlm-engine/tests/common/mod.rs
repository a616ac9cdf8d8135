//! Mock models and providers shared by the integration tests.

#![allow(dead_code)]

use knnlm_engine::error::Result;
use knnlm_engine::provider::{LanguageModel, RetrievalOutput, RetrievalProvider, RetrievalQuery};
use knnlm_engine::sample::{DecoderOutput, KeyType, NetInput};
use knnlm_engine::tensor::{Matrix, Tensor3};

/// Zero logits (a uniform distribution) and a one-hot key of the source token.
pub struct UniformModel {
    pub vocab: usize,
    pub dim: usize,
}

impl LanguageModel for UniformModel {
    fn forward(&self, input: &NetInput) -> Result<DecoderOutput> {
        let (bsz, tsz) = (input.src_tokens.rows(), input.src_tokens.cols());
        let logits = Tensor3::zeros([bsz, tsz, self.vocab]);
        let mut hidden = Tensor3::zeros([bsz, tsz, self.dim]);
        for i in 0..bsz {
            for t in 0..tsz {
                let tok = input.src_tokens.get(i, t) as usize;
                hidden.row_mut(i, t)[tok % self.dim] = 1.0;
            }
        }
        Ok(DecoderOutput::new(logits).with_hidden(KeyType::LastFfnOutput, hidden))
    }

    fn vocab_size(&self) -> usize {
        self.vocab
    }

    fn hidden_dim(&self) -> usize {
        self.dim
    }
}

/// Emits the same per-position distribution for every row, given as probabilities.
pub struct FixedModel {
    /// `(tsz, vocab)` probabilities
    pub probs: Vec<Vec<f32>>,
}

impl LanguageModel for FixedModel {
    fn forward(&self, input: &NetInput) -> Result<DecoderOutput> {
        let bsz = input.src_tokens.rows();
        let tsz = self.probs.len();
        let vocab = self.vocab_size();
        let mut data = Vec::with_capacity(bsz * tsz * vocab);
        for _ in 0..bsz {
            for row in &self.probs {
                data.extend(row.iter().map(|p| p.ln()));
            }
        }
        let hidden = Tensor3::zeros([bsz, tsz, 2]);
        Ok(DecoderOutput::new(Tensor3::new([bsz, tsz, vocab], data)?)
            .with_hidden(KeyType::LastFfnOutput, hidden))
    }

    fn vocab_size(&self) -> usize {
        self.probs.first().map_or(0, Vec::len)
    }

    fn hidden_dim(&self) -> usize {
        2
    }
}

/// Returns a constant retrieval log-probability for every position.
pub struct ConstantRetrieval {
    pub log_prob: f32,
    pub calls: usize,
}

impl RetrievalProvider for ConstantRetrieval {
    fn query(&mut self, query: &RetrievalQuery<'_>) -> Result<RetrievalOutput> {
        self.calls += 1;
        let (bsz, tsz) = (query.targets.rows(), query.targets.cols());
        Ok(RetrievalOutput {
            target_log_probs: Matrix::filled(bsz, tsz, self.log_prob),
            vocab_log_probs: None,
        })
    }
}

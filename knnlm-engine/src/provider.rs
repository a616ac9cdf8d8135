//! Capabilities the scorer consumes: language models and retrieval providers.

use crate::combine::log_sum_exp;
use crate::error::Result;
use crate::sample::{DecoderOutput, NetInput};
use crate::tensor::{Matrix, Tensor3, TensorView, TokenId};

/// A language model the scorer can run.
pub trait LanguageModel {
    /// Run the network over a batch.
    fn forward(&self, input: &NetInput) -> Result<DecoderOutput>;

    /// Normalize logits over the vocabulary axis.
    ///
    /// `target` holds the token ids for the rows in `logits` (flattened in the
    /// same order). Models with target-dependent output layers may use it; the
    /// default softmax ignores it.
    fn normalize(
        &self,
        logits: TensorView<'_>,
        log_probs: bool,
        target: &[TokenId],
    ) -> Result<Tensor3> {
        let _ = target;
        Ok(normalize_rows(logits, log_probs))
    }

    fn vocab_size(&self) -> usize;

    /// Width of the hidden states the model exposes as datastore keys.
    fn hidden_dim(&self) -> usize;
}

/// Everything a retrieval provider needs to score one batch.
#[derive(Debug, Clone, Copy)]
pub struct RetrievalQuery<'a> {
    /// Query keys, `(bsz, tsz, dim)`.
    pub keys: &'a Tensor3,
    /// Target tokens, `(bsz, tsz)`.
    pub targets: &'a Matrix<TokenId>,
    pub sample_ids: &'a [u64],
    pub pad: TokenId,
    pub vocab_size: usize,
    /// Model log-probability of each target, `(bsz, tsz)`.
    pub model_log_probs: &'a Matrix<f32>,
    /// Also return a distribution over the whole vocabulary.
    pub full_vocab: bool,
}

/// Retrieval log-probabilities aligned with the query.
#[derive(Debug, Clone)]
pub struct RetrievalOutput {
    /// `(bsz, tsz)`
    pub target_log_probs: Matrix<f32>,
    /// `(bsz, tsz, vocab)`, present when the query asked for it.
    pub vocab_log_probs: Option<Tensor3>,
}

/// A nearest-neighbor service producing retrieval log-probabilities.
pub trait RetrievalProvider {
    fn query(&mut self, query: &RetrievalQuery<'_>) -> Result<RetrievalOutput>;
}

/// Softmax (or log-softmax) of every row along the last axis.
pub fn normalize_rows(logits: TensorView<'_>, log_probs: bool) -> Tensor3 {
    let mut out = logits.to_tensor();
    let width = logits.dims()[2];
    if width == 0 {
        return out;
    }
    for row in out.as_mut_slice().chunks_mut(width) {
        let lse = log_sum_exp(row);
        if log_probs {
            row.iter_mut().for_each(|x| *x -= lse);
        } else {
            row.iter_mut().for_each(|x| *x = (*x - lse).exp());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_softmax_rows_sum_to_one() {
        let t = Tensor3::new([1, 2, 3], vec![1.0, 2.0, 3.0, 0.0, 0.0, 0.0]).unwrap();
        let lp = normalize_rows(t.view(), true);
        for j in 0..2 {
            let total: f32 = lp.row(0, j).iter().map(|x| x.exp()).sum();
            assert!((total - 1.0).abs() < 1e-6);
        }
        assert!((lp.row(0, 1)[0] - (1.0f32 / 3.0).ln()).abs() < 1e-6);
    }

    #[test]
    fn test_softmax_linear() {
        let t = Tensor3::new([1, 1, 2], vec![0.0, 0.0]).unwrap();
        let p = normalize_rows(t.view(), false);
        assert_eq!(p.as_slice(), &[0.5, 0.5]);
    }

    #[test]
    fn test_softmax_large_logits_stable() {
        let t = Tensor3::new([1, 1, 2], vec![1000.0, 1000.0]).unwrap();
        let p = normalize_rows(t.view(), false);
        assert!((p.as_slice()[0] - 0.5).abs() < 1e-6);
    }
}

//! Ensemble scoring of target sequences with optional kNN-LM fusion.

use tracing::{debug, trace};

use crate::alignment::{extract_hard_alignment, strip_pad};
use crate::combine::{combine_in_place, validate_lambda};
use crate::error::{EvalError, Result};
use crate::provider::{LanguageModel, RetrievalProvider, RetrievalQuery};
use crate::sample::{DecoderOutput, Hypothesis, KeyType, Sample};
use crate::softmax_batch::batch_for_softmax;
use crate::tensor::{Matrix, Tensor3, TokenId};

/// Number of predicted tokens kept per position.
pub const DEFAULT_TOP_K: usize = 100;

/// Log value substituted for zero probabilities before ranking.
pub const ZERO_PROB_FLOOR: f32 = -1e4;

/// Scorer settings.
#[derive(Debug, Clone)]
pub struct ScorerConfig {
    pub pad: TokenId,
    pub eos: TokenId,
    /// Maximum positions normalized at once (`usize::MAX` = whole batch).
    pub softmax_batch: usize,
    pub compute_alignment: bool,
    pub top_k: usize,
    /// Extraction point for retrieval queries and datastore keys.
    pub key_type: KeyType,
    /// Attach per-position keys to each hypothesis.
    pub save_dstore_keys: bool,
}

impl ScorerConfig {
    pub fn new(pad: TokenId, eos: TokenId) -> Self {
        Self {
            pad,
            eos,
            softmax_batch: usize::MAX,
            compute_alignment: false,
            top_k: DEFAULT_TOP_K,
            key_type: KeyType::default(),
            save_dstore_keys: false,
        }
    }
}

/// A retrieval provider and how strongly to trust it.
pub struct Retrieval<'a> {
    pub provider: &'a mut dyn RetrievalProvider,
    /// Weight of the retrieval distribution, in `(0, 1)`.
    pub lambda: f32,
    /// Also fuse the full vocabulary distribution used for top-K predictions.
    pub full_vocab: bool,
}

/// Scores the targets of a batch under an ensemble of models.
#[derive(Debug, Clone)]
pub struct SequenceScorer {
    config: ScorerConfig,
}

impl SequenceScorer {
    pub fn new(config: ScorerConfig) -> Result<Self> {
        if config.softmax_batch == 0 {
            return Err(EvalError::InvalidConfiguration(
                "softmax batch size must be positive".to_string(),
            ));
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &ScorerConfig {
        &self.config
    }

    /// Score every sequence of `sample`, returning one hypothesis per sequence in batch order.
    pub fn score(
        &self,
        models: &[Box<dyn LanguageModel>],
        sample: &Sample,
        mut retrieval: Option<Retrieval<'_>>,
    ) -> Result<Vec<Hypothesis>> {
        if models.is_empty() {
            return Err(EvalError::UnsupportedConfiguration(
                "ensemble must contain at least one model".to_string(),
            ));
        }
        if let Some(r) = &retrieval {
            if models.len() != 1 {
                return Err(EvalError::UnsupportedConfiguration(
                    "retrieval fusion needs log-probabilities and cannot be averaged across an ensemble"
                        .to_string(),
                ));
            }
            validate_lambda(r.lambda)?;
        }
        sample.validate()?;
        let input = sample
            .net_input
            .as_ref()
            .ok_or_else(|| EvalError::MissingInput("batch has no net_input".to_string()))?;

        let target = &sample.target;
        let (bsz, tsz) = (target.rows(), target.cols());
        let single = models.len() == 1;

        let mut sum_probs: Option<Matrix<f32>> = None;
        let mut sum_vocab: Option<Tensor3> = None;
        let mut sum_attn: Option<Tensor3> = None;
        let mut keys: Option<Tensor3> = None;

        for model in models {
            let mut out = model.forward(input)?;
            check_leading_dims("logits", &out.logits, bsz, tsz)?;
            if let Some(attn) = &out.attn {
                check_leading_dims("attention", attn, bsz, tsz)?;
            }
            if retrieval.is_some() || self.config.save_dstore_keys {
                check_leading_dims("hidden states", out.keys(self.config.key_type)?, bsz, tsz)?;
            }

            let (mut probs, mut vocab) = self.normalize(model.as_ref(), &out, target, single)?;

            if let Some(r) = retrieval.as_mut() {
                let query_keys = out.keys(self.config.key_type)?;
                let query = RetrievalQuery {
                    keys: query_keys,
                    targets: target,
                    sample_ids: &sample.ids,
                    pad: self.config.pad,
                    vocab_size: vocab.dims()[2],
                    model_log_probs: &probs,
                    full_vocab: r.full_vocab,
                };
                let fused = r
                    .provider
                    .query(&query)
                    .map_err(|e| EvalError::Retrieval(Box::new(e)))?;
                check_target_dims("retrieval log-probs", &fused.target_log_probs, bsz, tsz)?;
                combine_in_place(
                    probs.as_mut_slice(),
                    fused.target_log_probs.as_slice(),
                    r.lambda,
                )?;
                if let Some(knn_vocab) = fused.vocab_log_probs {
                    combine_in_place(vocab.as_mut_slice(), knn_vocab.as_slice(), r.lambda)?;
                }
            }

            accumulate("target probabilities", &mut sum_probs, probs)?;
            accumulate("distributions", &mut sum_vocab, vocab)?;
            if let Some(attn) = out.attn.take() {
                accumulate("attention", &mut sum_attn, attn)?;
            }
            if self.config.save_dstore_keys {
                keys = Some(take_keys(&mut out, self.config.key_type)?);
            }
        }

        let mut avg_probs = sum_probs.ok_or_else(|| EvalError::Shape("no model output".into()))?;
        let mut avg_vocab = sum_vocab.ok_or_else(|| EvalError::Shape("no model output".into()))?;
        if !single {
            let n = models.len() as f32;
            avg_probs
                .as_mut_slice()
                .iter_mut()
                .for_each(|p| *p = (*p / n).ln());
            avg_vocab.as_mut_slice().iter_mut().for_each(|p| *p /= n);
            if let Some(attn) = sum_attn.as_mut() {
                attn.as_mut_slice().iter_mut().for_each(|a| *a /= n);
            }
        }
        floor_zero_probs(&mut avg_vocab, single);

        let hypos = (0..bsz)
            .map(|i| {
                self.build_hypothesis(
                    i,
                    sample,
                    &avg_probs,
                    &avg_vocab,
                    sum_attn.as_ref(),
                    keys.as_ref(),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        debug!(
            "scored {} sequences with {} model(s){}",
            bsz,
            models.len(),
            if retrieval.is_some() { " and retrieval" } else { "" }
        );
        Ok(hypos)
    }

    /// Normalize a model's logits chunk by chunk.
    ///
    /// Returns the target probabilities `(bsz, tsz)` and the full distribution
    /// `(bsz, tsz, vocab)`, both in original batch order.
    fn normalize(
        &self,
        model: &dyn LanguageModel,
        out: &DecoderOutput,
        target: &Matrix<TokenId>,
        log_probs: bool,
    ) -> Result<(Matrix<f32>, Tensor3)> {
        let [bsz, tsz, vocab_size] = out.logits.dims();
        let mut target_probs = vec![0.0f32; bsz * tsz];
        let mut full: Option<Tensor3> = None;

        for chunk in batch_for_softmax(out.logits.view(), target, self.config.softmax_batch)? {
            let probs = model.normalize(chunk.logits, log_probs, chunk.target)?;
            if probs.dims() != chunk.logits.dims() {
                return Err(EvalError::Shape(format!(
                    "normalized chunk {:?} does not match logits {:?}",
                    probs.dims(),
                    chunk.logits.dims()
                )));
            }
            gather_target_probs(
                probs.as_slice(),
                chunk.target,
                vocab_size,
                &mut target_probs[chunk.offset..chunk.offset + chunk.target.len()],
            )?;

            if chunk.whole_batch {
                full = Some(probs);
            } else {
                trace!(
                    "normalized rows {}..{}",
                    chunk.offset,
                    chunk.offset + chunk.target.len()
                );
                let full = full.get_or_insert_with(|| Tensor3::zeros([1, bsz * tsz, vocab_size]));
                let start = chunk.offset * vocab_size;
                full.as_mut_slice()[start..start + probs.as_slice().len()]
                    .copy_from_slice(probs.as_slice());
            }
        }

        let full = match full {
            Some(f) => f.reshape([bsz, tsz, vocab_size])?,
            None => Tensor3::zeros([bsz, tsz, vocab_size]),
        };
        Ok((Matrix::new(bsz, tsz, target_probs)?, full))
    }

    fn build_hypothesis(
        &self,
        i: usize,
        sample: &Sample,
        probs: &Matrix<f32>,
        vocab: &Tensor3,
        attn: Option<&Tensor3>,
        keys: Option<&Tensor3>,
    ) -> Result<Hypothesis> {
        let start = sample.start_index(i);
        let target_row = sample.target.row(i);
        let tokens = strip_pad(&target_row[start..], self.config.pad);
        let len = tokens.len();
        let end = start + len;

        let positional_scores = probs.row(i)[start..end].to_vec();
        let score = if len == 0 {
            0.0
        } else {
            positional_scores.iter().sum::<f32>() / len as f32
        };

        let predicted_topk = (start..end)
            .map(|t| top_k(vocab.row(i, t), self.config.top_k))
            .collect();

        let attention = attn.map(|a| a.plane(i));
        let alignment = match (&attention, self.config.compute_alignment, &sample.net_input) {
            (Some(att), true, Some(input)) => Some(extract_hard_alignment(
                att,
                input.src_tokens.row(i),
                target_row,
                self.config.pad,
                self.config.eos,
            )),
            _ => None,
        };

        let dstore_keys = keys
            .map(|k| {
                let dim = k.dims()[2];
                let mut rows = Vec::with_capacity(len * dim);
                for t in start..end {
                    rows.extend_from_slice(k.row(i, t));
                }
                Matrix::new(len, dim, rows)
            })
            .transpose()?;

        Ok(Hypothesis {
            tokens,
            score,
            positional_scores,
            attention,
            alignment,
            dstore_keys,
            predicted_topk,
        })
    }
}

trait FloatBuffer {
    fn shape(&self) -> &[usize];
    fn values(&self) -> &[f32];
    fn values_mut(&mut self) -> &mut [f32];
}

impl FloatBuffer for Matrix<f32> {
    fn shape(&self) -> &[usize] {
        self.array().shape()
    }

    fn values(&self) -> &[f32] {
        self.as_slice()
    }

    fn values_mut(&mut self) -> &mut [f32] {
        self.as_mut_slice()
    }
}

impl FloatBuffer for Tensor3 {
    fn shape(&self) -> &[usize] {
        self.array().shape()
    }

    fn values(&self) -> &[f32] {
        self.as_slice()
    }

    fn values_mut(&mut self) -> &mut [f32] {
        self.as_mut_slice()
    }
}

/// Add `value` into `slot`, or store it when `slot` is empty.
///
/// Ensemble members must agree on the shape of everything that is averaged.
fn accumulate<T: FloatBuffer>(what: &str, slot: &mut Option<T>, value: T) -> Result<()> {
    match slot {
        None => *slot = Some(value),
        Some(acc) => {
            if acc.shape() != value.shape() {
                return Err(EvalError::Shape(format!(
                    "ensemble {} {:?} and {:?} differ",
                    what,
                    acc.shape(),
                    value.shape()
                )));
            }
            for (a, &v) in acc.values_mut().iter_mut().zip(value.values()) {
                *a += v;
            }
        }
    }
    Ok(())
}

/// `tensor` must be `(bsz, tsz, _)`.
fn check_leading_dims(what: &str, tensor: &Tensor3, bsz: usize, tsz: usize) -> Result<()> {
    let [b, t, _] = tensor.dims();
    if b != bsz || t != tsz {
        return Err(EvalError::Shape(format!(
            "model produced {} {:?} for targets {}x{}",
            what,
            tensor.dims(),
            bsz,
            tsz
        )));
    }
    Ok(())
}

fn check_target_dims(what: &str, m: &Matrix<f32>, bsz: usize, tsz: usize) -> Result<()> {
    if m.rows() != bsz || m.cols() != tsz {
        return Err(EvalError::Shape(format!(
            "{} {}x{} for targets {}x{}",
            what,
            m.rows(),
            m.cols(),
            bsz,
            tsz
        )));
    }
    Ok(())
}

fn take_keys(out: &mut DecoderOutput, key_type: KeyType) -> Result<Tensor3> {
    out.keys(key_type)?;
    out.hidden
        .remove(&key_type)
        .ok_or_else(|| EvalError::Shape(format!("hidden states for '{}' vanished", key_type)))
}

/// Pick `probs[row, target[row]]` for every row of a flattened chunk.
fn gather_target_probs(
    probs: &[f32],
    target: &[TokenId],
    vocab_size: usize,
    out: &mut [f32],
) -> Result<()> {
    for (row, (&tok, slot)) in target.iter().zip(out.iter_mut()).enumerate() {
        let tok = tok as usize;
        if tok >= vocab_size {
            return Err(EvalError::Shape(format!(
                "target token {} outside vocabulary of {}",
                tok, vocab_size
            )));
        }
        *slot = probs[row * vocab_size + tok];
    }
    Ok(())
}

/// Replace probabilities of exactly zero with [`ZERO_PROB_FLOOR`].
///
/// In log space a zero probability is `-inf`; NaN is treated the same way.
fn floor_zero_probs(vocab: &mut Tensor3, log_space: bool) {
    for p in vocab.as_mut_slice() {
        let degenerate = if log_space {
            p.is_nan() || *p == f32::NEG_INFINITY
        } else {
            p.is_nan() || *p == 0.0
        };
        if degenerate {
            *p = ZERO_PROB_FLOOR;
        }
    }
}

/// Indices of the `k` largest values, best first; ties go to the lower index.
pub fn top_k(row: &[f32], k: usize) -> Vec<TokenId> {
    let k = k.min(row.len());
    if k == 0 {
        return Vec::new();
    }
    let cmp = |a: &usize, b: &usize| row[*b].total_cmp(&row[*a]).then(a.cmp(b));
    let mut idx: Vec<usize> = (0..row.len()).collect();
    if k < idx.len() {
        idx.select_nth_unstable_by(k - 1, cmp);
        idx.truncate(k);
    }
    idx.sort_unstable_by(cmp);
    idx.into_iter().map(|i| i as TokenId).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::NetInput;

    const PAD: TokenId = 1;
    const EOS: TokenId = 2;

    /// Emits fixed log-probabilities as logits, so log-softmax is the identity.
    struct TableModel {
        logits: Tensor3,
        hidden: Option<Tensor3>,
        attn: Option<Tensor3>,
    }

    impl LanguageModel for TableModel {
        fn forward(&self, _input: &NetInput) -> Result<DecoderOutput> {
            let mut out = DecoderOutput::new(self.logits.clone());
            if let Some(h) = &self.hidden {
                out = out.with_hidden(KeyType::LastFfnOutput, h.clone());
            }
            if let Some(a) = &self.attn {
                out = out.with_attn(a.clone());
            }
            Ok(out)
        }

        fn vocab_size(&self) -> usize {
            self.logits.dims()[2]
        }

        fn hidden_dim(&self) -> usize {
            self.hidden.as_ref().map_or(0, |h| h.dims()[2])
        }
    }

    fn sample(target: Vec<Vec<TokenId>>) -> Sample {
        let target = Matrix::from_rows(target).unwrap();
        let bsz = target.rows();
        let src = Matrix::filled(bsz, target.cols(), 4);
        Sample {
            ids: (0..bsz as u64).collect(),
            net_input: Some(NetInput {
                src_lengths: vec![target.cols(); bsz],
                src_tokens: src,
            }),
            ntokens: target.as_slice().iter().filter(|&&t| t != PAD).count(),
            target,
            start_indices: None,
        }
    }

    fn dist_logits(rows: &[[f32; 5]], bsz: usize) -> Tensor3 {
        let tsz = rows.len() / bsz;
        let data = rows.iter().flat_map(|r| r.map(f32::ln)).collect();
        Tensor3::new([bsz, tsz, 5], data).unwrap()
    }

    #[test]
    fn test_top_k_order_and_ties() {
        assert_eq!(top_k(&[0.1, 0.5, 0.5, 0.2], 3), vec![1, 2, 3]);
        assert_eq!(top_k(&[0.3, 0.1], 10), vec![0, 1]);
        assert!(top_k(&[0.3], 0).is_empty());
    }

    #[test]
    fn test_floor_zero_probs() {
        let mut t = Tensor3::new([1, 1, 3], vec![0.0, 0.5, f32::NAN]).unwrap();
        floor_zero_probs(&mut t, false);
        assert_eq!(t.as_slice(), &[ZERO_PROB_FLOOR, 0.5, ZERO_PROB_FLOOR]);

        let mut t = Tensor3::new([1, 1, 2], vec![0.0, f32::NEG_INFINITY]).unwrap();
        floor_zero_probs(&mut t, true);
        assert_eq!(t.as_slice(), &[0.0, ZERO_PROB_FLOOR]);
    }

    #[test]
    fn test_chunked_matches_whole_batch() {
        let rows = [
            [0.1, 0.2, 0.3, 0.3, 0.1],
            [0.2, 0.2, 0.2, 0.2, 0.2],
            [0.05, 0.05, 0.1, 0.4, 0.4],
            [0.6, 0.1, 0.1, 0.1, 0.1],
            [0.1, 0.1, 0.6, 0.1, 0.1],
            [0.3, 0.3, 0.2, 0.1, 0.1],
        ];
        let models: Vec<Box<dyn LanguageModel>> = vec![Box::new(TableModel {
            logits: dist_logits(&rows, 2),
            hidden: None,
            attn: None,
        })];
        let s = sample(vec![vec![3, 0, 4], vec![2, 4, PAD]]);

        let whole = SequenceScorer::new(ScorerConfig::new(PAD, EOS)).unwrap();
        let mut cfg = ScorerConfig::new(PAD, EOS);
        cfg.softmax_batch = 4;
        let chunked = SequenceScorer::new(cfg).unwrap();

        let a = whole.score(&models, &s, None).unwrap();
        let b = chunked.score(&models, &s, None).unwrap();
        assert_eq!(a.len(), 2);
        for (x, y) in a.iter().zip(&b) {
            assert_eq!(x.tokens, y.tokens);
            assert_eq!(x.predicted_topk, y.predicted_topk);
            for (p, q) in x.positional_scores.iter().zip(&y.positional_scores) {
                assert!((p - q).abs() < 1e-6);
            }
        }
        assert_eq!(a[1].tokens, vec![2, 4]);
        assert_eq!(a[1].positional_scores.len(), 2);
    }

    #[test]
    fn test_ensemble_averages_in_linear_space() {
        let a_rows = [[0.1, 0.2, 0.3, 0.3, 0.1]];
        let b_rows = [[0.1, 0.2, 0.1, 0.5, 0.1]];
        let models: Vec<Box<dyn LanguageModel>> = vec![
            Box::new(TableModel {
                logits: dist_logits(&a_rows, 1),
                hidden: None,
                attn: None,
            }),
            Box::new(TableModel {
                logits: dist_logits(&b_rows, 1),
                hidden: None,
                attn: None,
            }),
        ];
        let s = sample(vec![vec![3]]);
        let scorer = SequenceScorer::new(ScorerConfig::new(PAD, EOS)).unwrap();
        let hypos = scorer.score(&models, &s, None).unwrap();
        assert!((hypos[0].score - 0.4f32.ln()).abs() < 1e-5);
        assert_eq!(hypos[0].predicted_topk[0][0], 3);
    }

    #[test]
    fn test_empty_ensemble_rejected() {
        let scorer = SequenceScorer::new(ScorerConfig::new(PAD, EOS)).unwrap();
        let s = sample(vec![vec![3]]);
        assert!(matches!(
            scorer.score(&[], &s, None),
            Err(EvalError::UnsupportedConfiguration(_))
        ));
    }

    #[test]
    fn test_missing_net_input() {
        let models: Vec<Box<dyn LanguageModel>> = vec![Box::new(TableModel {
            logits: dist_logits(&[[0.2; 5]], 1),
            hidden: None,
            attn: None,
        })];
        let mut s = sample(vec![vec![3]]);
        s.net_input = None;
        let scorer = SequenceScorer::new(ScorerConfig::new(PAD, EOS)).unwrap();
        assert!(matches!(
            scorer.score(&models, &s, None),
            Err(EvalError::MissingInput(_))
        ));
    }

    #[test]
    fn test_start_offset_and_keys() {
        let rows = [[0.2; 5], [0.1, 0.1, 0.1, 0.1, 0.6], [0.6, 0.1, 0.1, 0.1, 0.1]];
        let hidden = Tensor3::new([1, 3, 2], vec![0.0, 0.1, 1.0, 1.1, 2.0, 2.1]).unwrap();
        let models: Vec<Box<dyn LanguageModel>> = vec![Box::new(TableModel {
            logits: dist_logits(&rows, 1),
            hidden: Some(hidden),
            attn: None,
        })];
        let mut s = sample(vec![vec![PAD, 4, 0]]);
        s.start_indices = Some(vec![1]);

        let mut cfg = ScorerConfig::new(PAD, EOS);
        cfg.save_dstore_keys = true;
        let hypos = SequenceScorer::new(cfg).unwrap().score(&models, &s, None).unwrap();
        let h = &hypos[0];
        assert_eq!(h.tokens, vec![4, 0]);
        assert!((h.score - 0.6f32.ln()).abs() < 1e-5);
        let keys = h.dstore_keys.as_ref().unwrap();
        assert_eq!(keys.rows(), 2);
        assert_eq!(keys.row(0), &[1.0, 1.1]);
        assert_eq!(keys.row(1), &[2.0, 2.1]);
    }

    fn with_src(mut s: Sample, src: Vec<Vec<TokenId>>) -> Sample {
        let src = Matrix::from_rows(src).unwrap();
        if let Some(input) = s.net_input.as_mut() {
            input.src_lengths = vec![src.cols(); src.rows()];
            input.src_tokens = src;
        }
        s
    }

    fn attn(bsz: usize, rows: &[[f32; 4]]) -> Tensor3 {
        let tsz = rows.len() / bsz;
        Tensor3::new([bsz, tsz, 4], rows.iter().flatten().copied().collect()).unwrap()
    }

    fn attending(rows: &[[f32; 4]], tsz: usize) -> Box<dyn LanguageModel> {
        Box::new(TableModel {
            logits: dist_logits(&vec![[0.2; 5]; tsz], 1),
            hidden: None,
            attn: Some(attn(1, rows)),
        })
    }

    #[test]
    fn test_ensemble_attention_average_and_alignment() {
        // the first model alone would align target 0 to source 0
        let a = [
            [0.8, 0.2, 0.0, 0.0],
            [0.3, 0.1, 0.6, 0.0],
            [0.25, 0.25, 0.25, 0.25],
        ];
        let b = [
            [0.0, 1.0, 0.0, 0.0],
            [0.5, 0.1, 0.4, 0.0],
            [0.25, 0.25, 0.25, 0.25],
        ];
        let models = vec![attending(&a, 3), attending(&b, 3)];
        let s = with_src(sample(vec![vec![3, 0, EOS]]), vec![vec![4, 3, EOS, PAD]]);

        let mut cfg = ScorerConfig::new(PAD, EOS);
        cfg.compute_alignment = true;
        let hypos = SequenceScorer::new(cfg).unwrap().score(&models, &s, None).unwrap();
        let h = &hypos[0];

        let att = h.attention.as_ref().unwrap();
        assert_eq!((att.rows(), att.cols()), (3, 4));
        assert!((att.get(0, 0) - 0.4).abs() < 1e-6);
        assert!((att.get(0, 1) - 0.6).abs() < 1e-6);
        assert!((att.get(1, 2) - 0.5).abs() < 1e-6);
        // eos target is not aligned and the eos source column is never chosen
        assert_eq!(h.alignment.as_ref().unwrap(), &vec![(1, 0), (0, 1)]);
    }

    #[test]
    fn test_alignment_off_keeps_attention_only() {
        let rows = [[0.25; 4], [0.25; 4]];
        let models = vec![attending(&rows, 2)];
        let s = with_src(sample(vec![vec![3, 4]]), vec![vec![4, 3, 0, 0]]);
        let hypos = SequenceScorer::new(ScorerConfig::new(PAD, EOS))
            .unwrap()
            .score(&models, &s, None)
            .unwrap();
        assert!(hypos[0].attention.is_some());
        assert!(hypos[0].alignment.is_none());
    }

    #[test]
    fn test_attention_time_axis_must_match_targets() {
        let models = vec![Box::new(TableModel {
            logits: dist_logits(&[[0.2; 5]; 3], 1),
            hidden: None,
            attn: Some(attn(1, &[[0.25; 4]; 2])),
        }) as Box<dyn LanguageModel>];
        let s = sample(vec![vec![3, 0, 4]]);
        let scorer = SequenceScorer::new(ScorerConfig::new(PAD, EOS)).unwrap();
        assert!(matches!(
            scorer.score(&models, &s, None),
            Err(EvalError::Shape(_))
        ));
    }

    #[test]
    fn test_ensemble_attention_widths_must_agree() {
        let narrow = Tensor3::new([1, 1, 3], vec![0.2, 0.3, 0.5]).unwrap();
        let models: Vec<Box<dyn LanguageModel>> = vec![
            attending(&[[0.25; 4]], 1),
            Box::new(TableModel {
                logits: dist_logits(&[[0.2; 5]], 1),
                hidden: None,
                attn: Some(narrow),
            }),
        ];
        let s = sample(vec![vec![3]]);
        let scorer = SequenceScorer::new(ScorerConfig::new(PAD, EOS)).unwrap();
        assert!(matches!(
            scorer.score(&models, &s, None),
            Err(EvalError::Shape(_))
        ));
    }

    #[test]
    fn test_short_hidden_states_rejected() {
        let mut cfg = ScorerConfig::new(PAD, EOS);
        cfg.save_dstore_keys = true;
        let scorer = SequenceScorer::new(cfg).unwrap();

        // one sequence: the key for t=2 would run past the buffer
        let models = vec![Box::new(TableModel {
            logits: dist_logits(&[[0.2; 5]; 3], 1),
            hidden: Some(Tensor3::zeros([1, 2, 2])),
            attn: None,
        }) as Box<dyn LanguageModel>];
        let s = sample(vec![vec![3, 0, 4]]);
        assert!(matches!(
            scorer.score(&models, &s, None),
            Err(EvalError::Shape(_))
        ));

        // two sequences: the key for t=2 would be read from the next sequence
        let models = vec![Box::new(TableModel {
            logits: dist_logits(&[[0.2; 5]; 6], 2),
            hidden: Some(Tensor3::zeros([2, 2, 2])),
            attn: None,
        }) as Box<dyn LanguageModel>];
        let s = sample(vec![vec![3, 0, 4], vec![4, 3, 0]]);
        assert!(matches!(
            scorer.score(&models, &s, None),
            Err(EvalError::Shape(_))
        ));
    }

    struct FailingRetrieval;

    impl RetrievalProvider for FailingRetrieval {
        fn query(&mut self, _query: &RetrievalQuery<'_>) -> Result<crate::provider::RetrievalOutput> {
            Err(EvalError::Datastore("keys file truncated".to_string()))
        }
    }

    #[test]
    fn test_provider_failure_reported_as_retrieval_error() {
        let models = vec![Box::new(TableModel {
            logits: dist_logits(&[[0.2; 5]], 1),
            hidden: Some(Tensor3::zeros([1, 1, 2])),
            attn: None,
        }) as Box<dyn LanguageModel>];
        let s = sample(vec![vec![3]]);
        let mut provider = FailingRetrieval;
        let retrieval = Retrieval {
            provider: &mut provider,
            lambda: 0.25,
            full_vocab: false,
        };
        let scorer = SequenceScorer::new(ScorerConfig::new(PAD, EOS)).unwrap();
        match scorer.score(&models, &s, Some(retrieval)) {
            Err(EvalError::Retrieval(source)) => {
                assert!(source.to_string().contains("keys file truncated"));
            }
            other => panic!("expected a retrieval error, got {:?}", other.map(|h| h.len())),
        }
    }

    #[test]
    fn test_zero_softmax_batch_rejected() {
        let mut cfg = ScorerConfig::new(PAD, EOS);
        cfg.softmax_batch = 0;
        assert!(SequenceScorer::new(cfg).is_err());
    }
}

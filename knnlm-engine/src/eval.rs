//! Perplexity evaluation over a stream of batches.
//!
//! An [`Evaluator`] scores each batch, folds subword scores into whole words,
//! accumulates the loss, optionally streams keys into a datastore, and
//! reports average negative log-likelihood (base 2) and perplexity.

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::EvalConfig;
use crate::datastore::{DatastoreSummary, DatastoreWriter};
use crate::error::{EvalError, Result};
use crate::predictions::PredictionLog;
use crate::provider::{LanguageModel, RetrievalProvider};
use crate::sample::{Hypothesis, Sample};
use crate::scorer::{Retrieval, SequenceScorer};
use crate::tensor::TokenId;
use crate::vocab::Vocabulary;
use crate::word_stats::{WordProb, WordStats};

/// Lifecycle of an [`Evaluator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalPhase {
    Init,
    Iterating,
    Finalizing,
    Done,
}

/// What happened to one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    /// The batch had no model input.
    Skipped,
    Scored { sequences: usize, ntokens: usize },
}

/// Running totals.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct EvalState {
    /// Sum of folded positional log-probabilities (natural log).
    pub score_sum: f64,
    /// Tokens counted in the loss (continuation pieces excluded).
    pub count: usize,
    pub batches: usize,
    pub skipped_batches: usize,
    pub sequences: usize,
    /// Non-pad target tokens passed through the scorer.
    pub ntokens: usize,
    /// Time spent scoring.
    pub elapsed: Duration,
}

impl EvalState {
    pub fn tokens_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.ntokens as f64 / secs
        } else {
            0.0
        }
    }
}

/// Final metrics of a run.
#[derive(Debug, Clone)]
pub struct EvalReport {
    pub avg_nll_base2: f64,
    pub perplexity: f64,
    pub state: EvalState,
    pub datastore: Option<DatastoreSummary>,
}

/// `-score_sum / count / ln 2`; NaN when nothing was counted.
pub fn average_nll_base2(score_sum: f64, count: usize) -> f64 {
    if count == 0 {
        return f64::NAN;
    }
    -score_sum / count as f64 / std::f64::consts::LN_2
}

/// `2^avg_nll_base2`
pub fn perplexity(avg_nll_base2: f64) -> f64 {
    2f64.powf(avg_nll_base2)
}

/// Move the score of every continuation piece onto the following piece.
///
/// The last piece of a word ends up carrying the whole word's log-probability
/// and continuation pieces carry zero. Returns the number of zeroed pieces.
pub fn fold_subword_scores(
    tokens: &[TokenId],
    scores: &mut [f32],
    is_continuation: impl Fn(TokenId) -> bool,
) -> usize {
    let mut skipped = 0;
    for i in 0..tokens.len().saturating_sub(1) {
        if is_continuation(tokens[i]) {
            skipped += 1;
            scores[i + 1] += scores[i];
            scores[i] = 0.0;
        }
    }
    skipped
}

/// Drives scoring over batches and owns all accumulators of a run.
pub struct Evaluator {
    config: EvalConfig,
    scorer: SequenceScorer,
    models: Vec<Box<dyn LanguageModel>>,
    vocab: Vocabulary,
    retrieval: Option<Box<dyn RetrievalProvider>>,
    writer: Option<DatastoreWriter>,
    predictions: PredictionLog,
    word_stats: WordStats,
    state: EvalState,
    phase: EvalPhase,
}

impl Evaluator {
    /// Validate the configuration and set up accumulators and the datastore writer.
    pub fn new(
        config: EvalConfig,
        models: Vec<Box<dyn LanguageModel>>,
        vocab: Vocabulary,
        retrieval: Option<Box<dyn RetrievalProvider>>,
    ) -> Result<Self> {
        config.validate()?;
        if models.is_empty() {
            return Err(EvalError::MissingConfiguration(
                "at least one model is required".to_string(),
            ));
        }
        if config.knnlm.enabled && models.len() > 1 {
            return Err(EvalError::UnsupportedConfiguration(format!(
                "kNN-LM retrieval needs a single model, got an ensemble of {}",
                models.len()
            )));
        }
        let retrieval = match (config.knnlm.enabled, retrieval) {
            (true, None) => {
                return Err(EvalError::MissingConfiguration(
                    "kNN-LM is enabled but no retrieval provider was given".to_string(),
                ));
            }
            (false, Some(_)) => {
                warn!("Retrieval provider given but kNN-LM is disabled, ignoring it");
                None
            }
            (_, retrieval) => retrieval,
        };

        let scorer = SequenceScorer::new(config.scorer_config(vocab.pad(), vocab.eos()))?;

        let writer = if config.datastore.save {
            let prefix = config.datastore.prefix.as_deref().ok_or_else(|| {
                EvalError::MissingConfiguration("datastore.prefix".to_string())
            })?;
            let capacity = config.datastore.capacity.ok_or_else(|| {
                EvalError::MissingConfiguration("datastore.capacity".to_string())
            })?;
            let dim = config
                .datastore
                .embed_dim
                .unwrap_or_else(|| models[0].hidden_dim());
            info!("Key type being saved: {}", config.knnlm.key_type);
            Some(DatastoreWriter::create(
                prefix,
                capacity,
                dim,
                config.datastore.precision(),
            )?)
        } else {
            None
        };

        info!(
            "Evaluating with {} model(s){}{}",
            models.len(),
            if retrieval.is_some() { ", kNN-LM" } else { "" },
            if writer.is_some() {
                ", saving datastore"
            } else {
                ""
            }
        );

        Ok(Self {
            config,
            scorer,
            models,
            vocab,
            retrieval,
            writer,
            predictions: PredictionLog::new(),
            word_stats: WordStats::new(),
            state: EvalState::default(),
            phase: EvalPhase::Init,
        })
    }

    pub fn phase(&self) -> EvalPhase {
        self.phase
    }

    pub fn state(&self) -> &EvalState {
        &self.state
    }

    pub fn config(&self) -> &EvalConfig {
        &self.config
    }

    pub fn vocab(&self) -> &Vocabulary {
        &self.vocab
    }

    pub fn word_stats(&self) -> &WordStats {
        &self.word_stats
    }

    pub fn predictions(&self) -> &PredictionLog {
        &self.predictions
    }

    pub fn datastore(&self) -> Option<&DatastoreWriter> {
        self.writer.as_ref()
    }

    /// Score one batch and fold its results into the running totals.
    pub fn process_batch(&mut self, sample: &Sample) -> Result<BatchOutcome> {
        match self.phase {
            EvalPhase::Finalizing | EvalPhase::Done => return Err(EvalError::Finalized),
            EvalPhase::Init => self.phase = EvalPhase::Iterating,
            EvalPhase::Iterating => {}
        }
        if sample.net_input.is_none() {
            debug!("Skipping batch {:?} without net_input", sample.ids);
            self.state.skipped_batches += 1;
            return Ok(BatchOutcome::Skipped);
        }

        let started = Instant::now();
        let retrieval = self.retrieval.as_mut().map(|provider| Retrieval {
            provider: provider.as_mut(),
            lambda: self.config.knnlm.lambda,
            full_vocab: self.config.knnlm.full_vocab,
        });
        let hypos = self.scorer.score(&self.models, sample, retrieval)?;
        // a rejected batch leaves the totals and the datastore untouched
        for (hypo, &sample_id) in hypos.iter().zip(&sample.ids) {
            self.check_hypothesis(hypo, sample_id)?;
        }
        self.state.elapsed += started.elapsed();
        self.state.ntokens += sample.ntokens;

        for (hypo, &sample_id) in hypos.iter().zip(&sample.ids) {
            if let (Some(writer), Some(keys)) = (self.writer.as_mut(), &hypo.dstore_keys) {
                writer.write(sample_id, keys, &hypo.tokens)?;
            }
            if self.config.eval.predictions_path.is_some() {
                self.predictions.push(hypo);
            }
            self.account(hypo, sample_id);
        }

        self.state.batches += 1;
        self.state.sequences += hypos.len();
        let interval = self.config.eval.log_interval;
        if interval > 0 && self.state.batches % interval == 0 {
            info!(
                "batch {}: wps {:.0}, loss (base 2) {:.4}",
                self.state.batches,
                self.state.tokens_per_sec(),
                average_nll_base2(self.state.score_sum, self.state.count)
            );
        }

        Ok(BatchOutcome::Scored {
            sequences: hypos.len(),
            ntokens: sample.ntokens,
        })
    }

    /// Reject a hypothesis that cannot be accounted or written.
    fn check_hypothesis(&self, hypo: &Hypothesis, sample_id: u64) -> Result<()> {
        if self.config.eval.add_bos_token && hypo.tokens.first() != Some(&self.vocab.bos()) {
            return Err(EvalError::Shape(format!(
                "sample {} does not start with the beginning-of-sentence token",
                sample_id
            )));
        }
        if self.writer.is_some() && hypo.dstore_keys.is_none() {
            return Err(EvalError::Shape(format!(
                "no datastore keys for sample {}",
                sample_id
            )));
        }
        Ok(())
    }

    /// Add one checked hypothesis to the loss and the word statistics.
    fn account(&mut self, hypo: &Hypothesis, sample_id: u64) {
        let mut tokens = hypo.tokens.as_slice();
        let mut scores = hypo.positional_scores.clone();
        if self.config.eval.add_bos_token {
            tokens = &tokens[1..];
            scores.remove(0);
        }

        let vocab = &self.vocab;
        let skipped = fold_subword_scores(tokens, &mut scores, |t| vocab.is_continuation(t));
        self.state.score_sum += scores.iter().map(|&s| f64::from(s)).sum::<f64>();
        self.state.count += scores.len() - skipped;

        let eval = &self.config.eval;
        if eval.output_word_probs || eval.output_word_stats {
            let words = self.word_stats.observe(tokens, &scores, vocab);
            if eval.output_word_probs {
                info!(
                    "{} {}",
                    sample_id,
                    words
                        .iter()
                        .map(WordProb::to_string)
                        .collect::<Vec<_>>()
                        .join("\t")
                );
            }
        }
    }

    /// Persist artifacts and compute the final metrics.
    pub fn finalize(&mut self) -> Result<EvalReport> {
        match self.phase {
            EvalPhase::Finalizing | EvalPhase::Done => return Err(EvalError::Finalized),
            _ => self.phase = EvalPhase::Finalizing,
        }

        let datastore = self.writer.take().map(DatastoreWriter::finish).transpose()?;

        if let Some(path) = &self.config.eval.predictions_path {
            self.predictions.save(path)?;
            info!(
                "Saved predictions for {} sequences to {:?}",
                self.predictions.len(),
                path
            );
        }

        if self.config.eval.output_word_stats {
            for stat in self.word_stats.sorted() {
                info!("{}", stat);
            }
        }

        let avg_nll_base2 = average_nll_base2(self.state.score_sum, self.state.count);
        let ppl = perplexity(avg_nll_base2);
        if self.state.count == 0 {
            warn!("No tokens were scored");
        }
        info!(
            "Evaluated {} tokens in {:.1}s ({:.2} tokens/s)",
            self.state.ntokens,
            self.state.elapsed.as_secs_f64(),
            self.state.tokens_per_sec()
        );
        info!(
            "Loss (base 2): {:.4}, Perplexity: {:.2}",
            avg_nll_base2, ppl
        );

        self.phase = EvalPhase::Done;
        Ok(EvalReport {
            avg_nll_base2,
            perplexity: ppl,
            state: self.state.clone(),
            datastore,
        })
    }

    /// Process every batch, then finalize.
    pub fn run<I>(&mut self, batches: I) -> Result<EvalReport>
    where
        I: IntoIterator<Item = Result<Sample>>,
    {
        for sample in batches {
            self.process_batch(&sample?)?;
        }
        self.finalize()
    }
}

//! Per-word probability accounting over subword-folded scores.

use std::collections::HashMap;
use std::fmt;
use std::io::Write;

use crate::error::Result;
use crate::tensor::TokenId;
use crate::vocab::Vocabulary;

/// Accumulated statistics for one surface word.
#[derive(Debug, Clone, PartialEq)]
pub struct WordStat {
    pub word: String,
    /// The word was assembled from more than one subword piece.
    pub is_bpe: bool,
    pub log_prob: f64,
    /// Sum of the log-probabilities of the word that followed.
    pub next_word_prob: f64,
    pub count: u64,
    /// Occurrences with no following word (end of sequence).
    pub missing_next_words: u64,
}

impl WordStat {
    pub fn new(word: impl Into<String>, is_bpe: bool) -> Self {
        Self {
            word: word.into(),
            is_bpe,
            log_prob: 0.0,
            next_word_prob: 0.0,
            count: 0,
            missing_next_words: 0,
        }
    }

    pub fn add(&mut self, log_prob: f64, next_word_prob: Option<f64>) {
        match next_word_prob {
            Some(p) => self.next_word_prob += p,
            None => self.missing_next_words += 1,
        }
        self.log_prob += log_prob;
        self.count += 1;
    }
}

impl fmt::Display for WordStat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}\t{}\t{}\t{}\t{}\t{}",
            self.word,
            self.count,
            self.log_prob,
            self.is_bpe,
            self.next_word_prob,
            self.count - self.missing_next_words
        )
    }
}

/// A word and its folded log-probability, as reported per sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct WordProb {
    pub word: String,
    pub log_prob: f32,
}

impl fmt::Display for WordProb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{:.6}]", self.word, self.log_prob)
    }
}

/// Statistics for every word seen during a run.
#[derive(Debug, Default, Clone)]
pub struct WordStats {
    stats: HashMap<String, WordStat>,
}

impl WordStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.stats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }

    pub fn get(&self, word: &str) -> Option<&WordStat> {
        self.stats.get(word)
    }

    /// Reassemble words from `tokens` and record each one.
    ///
    /// `scores` must already be subword-folded: a continuation piece carries
    /// zero and the final piece of a word carries the word's total. The next
    /// word probability is the next non-zero score in the sequence. Returns the
    /// words with their scores in order.
    pub fn observe(
        &mut self,
        tokens: &[TokenId],
        scores: &[f32],
        vocab: &Vocabulary,
    ) -> Vec<WordProb> {
        let marker = vocab.continuation_marker();
        let mut words = Vec::new();
        let mut word = String::new();
        let mut is_bpe = false;

        for (i, &tok) in tokens.iter().enumerate() {
            word.push_str(vocab.symbol(tok));
            if vocab.is_continuation(tok) {
                if let Some(m) = marker {
                    word.truncate(word.len().saturating_sub(m.len()));
                }
                is_bpe = true;
                continue;
            }

            let next = scores[i + 1..]
                .iter()
                .find(|&&s| s != 0.0)
                .map(|&s| f64::from(s));
            self.stats
                .entry(word.clone())
                .or_insert_with(|| WordStat::new(word.clone(), is_bpe))
                .add(f64::from(scores[i]), next);
            words.push(WordProb {
                word: std::mem::take(&mut word),
                log_prob: scores[i],
            });
            is_bpe = false;
        }
        words
    }

    /// All entries, most frequent first; ties sorted by word.
    pub fn sorted(&self) -> Vec<&WordStat> {
        let mut all: Vec<&WordStat> = self.stats.values().collect();
        all.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.word.cmp(&b.word)));
        all
    }

    /// Write one tab-separated line per word, most frequent first.
    pub fn write_report<W: Write>(&self, out: &mut W) -> Result<()> {
        for stat in self.sorted() {
            writeln!(out, "{}", stat)?;
        }
        Ok(())
    }
}

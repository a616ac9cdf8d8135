//! Top-K predictions and references saved for offline analysis.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::sample::Hypothesis;
use crate::tensor::TokenId;

/// One entry per scored sequence, in evaluation order.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionLog {
    /// Per sequence, per position: predicted token ids, best first.
    pub topk: Vec<Vec<Vec<TokenId>>>,
    /// Reference tokens of each sequence.
    #[serde(rename = "ref")]
    pub references: Vec<Vec<TokenId>>,
}

impl PredictionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.references.len()
    }

    pub fn is_empty(&self) -> bool {
        self.references.is_empty()
    }

    pub fn push(&mut self, hypo: &Hypothesis) {
        self.topk.push(hypo.predicted_topk.clone());
        self.references.push(hypo.tokens.clone());
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer(&mut writer, self)?;
        writer.flush()?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        Ok(serde_json::from_reader(BufReader::new(File::open(path)?))?)
    }

    /// Fraction of positions whose reference token is the top prediction.
    pub fn top1_accuracy(&self) -> Option<f64> {
        let mut hits = 0usize;
        let mut total = 0usize;
        for (preds, refs) in self.topk.iter().zip(&self.references) {
            for (p, r) in preds.iter().zip(refs) {
                total += 1;
                if p.first() == Some(r) {
                    hits += 1;
                }
            }
        }
        (total > 0).then(|| hits as f64 / total as f64)
    }
}

//! Splitting decoder logits into bounded chunks for vocabulary normalization.
//!
//! Normalizing over the vocabulary allocates `rows × vocab` floats, which is
//! the peak of a scoring step. When a batch has at least `max_rows` positions
//! the logits are flattened to `(1, bsz * tsz, vocab)` and handed out in
//! contiguous slices of at most `max_rows` rows.

use crate::error::{EvalError, Result};
use crate::tensor::{Matrix, TensorView, TokenId};

/// One unit of work for the normalization step.
#[derive(Debug, Clone, Copy)]
pub struct SoftmaxChunk<'a> {
    /// `(bsz, tsz, vocab)` for a whole batch, `(1, rows, vocab)` for a sub-chunk.
    pub logits: TensorView<'a>,
    /// Targets for exactly the rows in `logits`, flattened.
    pub target: &'a [TokenId],
    /// First flattened row covered by this chunk.
    pub offset: usize,
    /// The chunk is the untouched input batch.
    pub whole_batch: bool,
}

/// Lazy iterator over [`SoftmaxChunk`]s.
#[derive(Debug, Clone)]
pub struct SoftmaxBatches<'a> {
    logits: TensorView<'a>,
    target: &'a [TokenId],
    max_rows: usize,
    cursor: usize,
    whole_batch: bool,
    done: bool,
}

/// Split `logits` (`(bsz, tsz, vocab)`) and `target` (`(bsz, tsz)`) into chunks of at most
/// `max_rows` flattened positions.
pub fn batch_for_softmax<'a>(
    logits: TensorView<'a>,
    target: &'a Matrix<TokenId>,
    max_rows: usize,
) -> Result<SoftmaxBatches<'a>> {
    if max_rows == 0 {
        return Err(EvalError::InvalidConfiguration(
            "softmax batch size must be positive".to_string(),
        ));
    }
    let [bsz, tsz, _] = logits.dims();
    if target.rows() != bsz || target.cols() != tsz {
        return Err(EvalError::Shape(format!(
            "target {}x{} does not match logits {:?}",
            target.rows(),
            target.cols(),
            logits.dims()
        )));
    }
    let whole_batch = bsz * tsz < max_rows;
    Ok(SoftmaxBatches {
        logits: if whole_batch { logits } else { logits.flatten() },
        target: target.as_slice(),
        max_rows,
        cursor: 0,
        whole_batch,
        done: false,
    })
}

impl<'a> Iterator for SoftmaxBatches<'a> {
    type Item = SoftmaxChunk<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.whole_batch {
            self.done = true;
            return Some(SoftmaxChunk {
                logits: self.logits,
                target: self.target,
                offset: 0,
                whole_batch: true,
            });
        }

        let total = self.logits.num_rows();
        if self.cursor >= total {
            self.done = true;
            return None;
        }
        let start = self.cursor;
        let end = start.saturating_add(self.max_rows).min(total);
        self.cursor = end;
        Some(SoftmaxChunk {
            logits: self.logits.slice_rows(start, end),
            target: &self.target[start..end],
            offset: start,
            whole_batch: false,
        })
    }
}

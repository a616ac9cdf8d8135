//! Language-modelling blocks and batches over a token stream.
//!
//! The stream is cut into fixed-size blocks. Each block's source is the
//! stream shifted right by one position (the stream starts with end-of-sentence),
//! so position `t` of the source predicts position `t` of the target.
//! With a context window, every row is prefixed with up to `context_window`
//! previous source tokens whose targets are padded out and skipped by the
//! scorer via `start_indices`.

use std::path::Path;

use tracing::info;

use crate::error::{EvalError, Result};
use crate::sample::{NetInput, Sample};
use crate::tensor::{Matrix, TokenId};
use crate::vocab::Vocabulary;

/// One block of the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub id: u64,
    pub source: Vec<TokenId>,
    pub target: Vec<TokenId>,
}

/// Special ids the dataset needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecialIds {
    pub bos: TokenId,
    pub pad: TokenId,
    pub eos: TokenId,
}

impl SpecialIds {
    pub fn of(vocab: &Vocabulary) -> Self {
        Self {
            bos: vocab.bos(),
            pad: vocab.pad(),
            eos: vocab.eos(),
        }
    }
}

/// An evaluation split as contiguous blocks.
#[derive(Debug, Clone)]
pub struct LmDataset {
    blocks: Vec<Block>,
    special: SpecialIds,
}

impl LmDataset {
    /// Cut `stream` into blocks of `block_size` tokens.
    ///
    /// With `add_bos_token` both source and target of every block are
    /// prefixed with beginning-of-sentence.
    pub fn from_tokens(
        stream: &[TokenId],
        block_size: usize,
        special: SpecialIds,
        add_bos_token: bool,
    ) -> Result<Self> {
        if block_size == 0 {
            return Err(EvalError::InvalidConfiguration(
                "tokens per sample must exceed the context window".to_string(),
            ));
        }

        let blocks = stream
            .chunks(block_size)
            .enumerate()
            .map(|(i, target)| {
                let start = i * block_size;
                let mut source = Vec::with_capacity(target.len() + 1);
                if add_bos_token {
                    source.push(special.bos);
                }
                if start == 0 {
                    source.push(special.eos);
                    source.extend_from_slice(&target[..target.len() - 1]);
                } else {
                    source.extend_from_slice(&stream[start - 1..start + target.len() - 1]);
                }
                let target = if add_bos_token {
                    std::iter::once(special.bos).chain(target.iter().copied()).collect()
                } else {
                    target.to_vec()
                };
                Block {
                    id: i as u64,
                    source,
                    target,
                }
            })
            .collect();
        Ok(Self { blocks, special })
    }

    /// Encode every line of a text file (each followed by end-of-sentence) and cut it into blocks.
    pub fn load<P: AsRef<Path>>(
        path: P,
        vocab: &Vocabulary,
        block_size: usize,
        add_bos_token: bool,
    ) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let mut stream = Vec::new();
        for line in text.lines() {
            stream.extend(vocab.encode_line(line, true)?);
        }
        let dataset = Self::from_tokens(&stream, block_size, SpecialIds::of(vocab), add_bos_token)?;
        info!(
            "{:?}: {} tokens in {} blocks",
            path.as_ref(),
            stream.len(),
            dataset.len()
        );
        Ok(dataset)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn special(&self) -> SpecialIds {
        self.special
    }

    /// Total target tokens.
    pub fn num_tokens(&self) -> usize {
        self.blocks.iter().map(|b| b.target.len()).sum()
    }

    /// Batches of up to `batch_size` blocks in order, each call starting afresh.
    pub fn batches(&self, batch_size: usize, context_window: usize) -> Batches<'_> {
        Batches {
            dataset: self,
            batch_size: batch_size.max(1),
            context_window,
            cursor: 0,
            prev_tokens: Vec::new(),
        }
    }
}

/// Iterator returned by [`LmDataset::batches`].
#[derive(Debug, Clone)]
pub struct Batches<'a> {
    dataset: &'a LmDataset,
    batch_size: usize,
    context_window: usize,
    cursor: usize,
    /// Trailing non-pad source tokens of the previous row.
    prev_tokens: Vec<TokenId>,
}

impl Batches<'_> {
    fn collate(&mut self, blocks: &[Block]) -> Result<Sample> {
        let pad = self.dataset.special.pad;
        let mut sources = Vec::with_capacity(blocks.len());
        let mut targets = Vec::with_capacity(blocks.len());
        let mut starts = Vec::with_capacity(blocks.len());

        for block in blocks {
            let prefix = self.prev_tokens.len();
            let mut source = std::mem::take(&mut self.prev_tokens);
            source.extend_from_slice(&block.source);

            let mut target = vec![pad; prefix];
            target.extend_from_slice(&block.target);

            if self.context_window > 0 {
                let keep = source.len().min(self.context_window);
                self.prev_tokens = source[source.len() - keep..].to_vec();
            }
            starts.push(prefix);
            sources.push(source);
            targets.push(target);
        }

        let width = sources.iter().map(Vec::len).max().unwrap_or(0);
        let src_lengths = sources.iter().map(Vec::len).collect();
        let pad_rows = |rows: Vec<Vec<TokenId>>| {
            rows.into_iter()
                .map(|mut r| {
                    r.resize(width, pad);
                    r
                })
                .collect::<Vec<_>>()
        };
        let target = Matrix::from_rows(pad_rows(targets))?;
        let ntokens = target.as_slice().iter().filter(|&&t| t != pad).count();

        Ok(Sample {
            ids: blocks.iter().map(|b| b.id).collect(),
            net_input: Some(NetInput {
                src_tokens: Matrix::from_rows(pad_rows(sources))?,
                src_lengths,
            }),
            target,
            start_indices: (self.context_window > 0).then_some(starts),
            ntokens,
        })
    }
}

impl Iterator for Batches<'_> {
    type Item = Result<Sample>;

    fn next(&mut self) -> Option<Self::Item> {
        let blocks = &self.dataset.blocks;
        if self.cursor >= blocks.len() {
            return None;
        }
        let end = (self.cursor + self.batch_size).min(blocks.len());
        let chunk = &blocks[self.cursor..end];
        self.cursor = end;
        Some(self.collate(chunk))
    }
}

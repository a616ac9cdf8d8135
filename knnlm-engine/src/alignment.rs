//! Reference cleanup and attention-derived hard alignments.

use crate::tensor::{Matrix, TokenId};

/// Tokens with every `pad` removed.
pub fn strip_pad(tokens: &[TokenId], pad: TokenId) -> Vec<TokenId> {
    tokens.iter().copied().filter(|&t| t != pad).collect()
}

/// Word index of each token, counting only tokens not in `exclude`.
///
/// Excluded tokens map to the index of the preceding counted token (or `-1` before any).
fn token_to_word(tokens: &[TokenId], exclude: &[TokenId]) -> Vec<isize> {
    let mut word = 0isize;
    tokens
        .iter()
        .map(|t| {
            if !exclude.contains(t) {
                word += 1;
            }
            word - 1
        })
        .collect()
}

/// One-to-one alignment from target positions to their most-attended source position.
///
/// `attn` is `(tgt_len, src_len)`. Target positions holding `pad` or `eos` are not
/// aligned, and source positions holding them are never chosen. Pairs are
/// `(source_word, target_word)` where words count only non-pad, non-eos tokens.
pub fn extract_hard_alignment(
    attn: &Matrix<f32>,
    src: &[TokenId],
    tgt: &[TokenId],
    pad: TokenId,
    eos: TokenId,
) -> Vec<(usize, usize)> {
    let special = [pad, eos];
    let tgt_valid: Vec<usize> = tgt
        .iter()
        .enumerate()
        .filter(|(i, t)| *i < attn.rows() && !special.contains(t))
        .map(|(i, _)| i)
        .collect();
    let src_valid: Vec<usize> = src
        .iter()
        .enumerate()
        .filter(|(j, s)| *j < attn.cols() && !special.contains(s))
        .map(|(j, _)| j)
        .collect();
    if tgt_valid.is_empty() || src_valid.is_empty() {
        return Vec::new();
    }

    let src_words = token_to_word(src, &special);
    let tgt_words = token_to_word(tgt, &special);

    tgt_valid
        .into_iter()
        .filter_map(|ti| {
            let row = attn.row(ti);
            let best = src_valid
                .iter()
                .copied()
                .max_by(|&a, &b| row[a].total_cmp(&row[b]).then(b.cmp(&a)))?;
            Some((src_words[best] as usize, tgt_words[ti] as usize))
        })
        .collect()
}

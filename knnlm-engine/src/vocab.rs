//! Symbol tables mapping token ids to surface strings.
//!
//! Two sources are supported: a plain `dict.txt` (one `symbol count` pair per
//! line, with `<s>`, `<pad>`, `</s>` and `<unk>` reserved as ids 0 to 3) and a
//! HuggingFace `tokenizer.json` for models that ship one.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;

use serde::Deserialize;

use crate::error::{EvalError, Result};
use crate::tensor::TokenId;

pub const BOS_SYMBOL: &str = "<s>";
pub const PAD_SYMBOL: &str = "<pad>";
pub const EOS_SYMBOL: &str = "</s>";
pub const UNK_SYMBOL: &str = "<unk>";

/// Names of the special tokens in a tokenizer vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SpecialTokens {
    pub bos: String,
    pub eos: String,
    pub pad: String,
    pub unk: Option<String>,
}

impl Default for SpecialTokens {
    fn default() -> Self {
        Self {
            bos: BOS_SYMBOL.to_string(),
            eos: EOS_SYMBOL.to_string(),
            pad: PAD_SYMBOL.to_string(),
            unk: Some(UNK_SYMBOL.to_string()),
        }
    }
}

/// Token id ↔ symbol table with special ids and the subword continuation set.
pub struct Vocabulary {
    symbols: Vec<String>,
    index: HashMap<String, TokenId>,
    bos: TokenId,
    pad: TokenId,
    eos: TokenId,
    unk: Option<TokenId>,
    continuation_marker: Option<String>,
    continuations: HashSet<TokenId>,
    tokenizer: Option<tokenizers::Tokenizer>,
}

impl fmt::Debug for Vocabulary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vocabulary")
            .field("len", &self.symbols.len())
            .field("bos", &self.bos)
            .field("pad", &self.pad)
            .field("eos", &self.eos)
            .field("unk", &self.unk)
            .field("continuation_marker", &self.continuation_marker)
            .field("tokenizer", &self.tokenizer.is_some())
            .finish()
    }
}

/// Trailing whitespace is dropped from the marker (`"@@ "` → `"@@"`).
fn continuation_marker(remove_bpe: Option<&str>) -> Result<Option<String>> {
    match remove_bpe {
        None => Ok(None),
        Some("sentencepiece") => Err(EvalError::UnsupportedConfiguration(
            "remove_bpe = \"sentencepiece\" is not supported".to_string(),
        )),
        Some(marker) => {
            let marker = marker.trim_end();
            if marker.is_empty() {
                Ok(None)
            } else {
                Ok(Some(marker.to_string()))
            }
        }
    }
}

impl Vocabulary {
    /// Build a dictionary-style vocabulary from `symbols`, after the four reserved ids.
    ///
    /// An unsupported `remove_bpe` marker is ignored here; [`Vocabulary::load_dict`] rejects it.
    pub fn from_symbols<I, S>(symbols: I, remove_bpe: Option<&str>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let all = [BOS_SYMBOL, PAD_SYMBOL, EOS_SYMBOL, UNK_SYMBOL]
            .into_iter()
            .map(String::from)
            .chain(symbols.into_iter().map(Into::into))
            .collect();
        let marker = continuation_marker(remove_bpe).ok().flatten();
        Self::build(all, 0, 1, 2, Some(3), marker, None)
    }

    /// Load a `dict.txt` file.
    pub fn load_dict<P: AsRef<Path>>(path: P, remove_bpe: Option<&str>) -> Result<Self> {
        let marker = continuation_marker(remove_bpe)?;
        let text = std::fs::read_to_string(path.as_ref())?;

        let mut symbols: Vec<String> = [BOS_SYMBOL, PAD_SYMBOL, EOS_SYMBOL, UNK_SYMBOL]
            .into_iter()
            .map(String::from)
            .collect();
        let mut seen: HashSet<String> = symbols.iter().cloned().collect();

        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            let (symbol, rest) = line.rsplit_once(' ').ok_or_else(|| {
                EvalError::Vocabulary(format!(
                    "{:?} line {}: expected '<symbol> <count>'",
                    path.as_ref(),
                    lineno + 1
                ))
            })?;
            // "<symbol> <count> #fairseq:overwrite"
            let (symbol, count, overwrite) = match symbol.rsplit_once(' ') {
                Some((s, c)) if rest == "#fairseq:overwrite" => (s, c, true),
                _ => (symbol, rest, false),
            };
            count.parse::<u64>().map_err(|_| {
                EvalError::Vocabulary(format!(
                    "{:?} line {}: bad count '{}'",
                    path.as_ref(),
                    lineno + 1,
                    count
                ))
            })?;
            if !seen.insert(symbol.to_string()) && !overwrite {
                return Err(EvalError::Vocabulary(format!(
                    "duplicate symbol '{}' in {:?}",
                    symbol,
                    path.as_ref()
                )));
            }
            symbols.push(symbol.to_string());
        }

        Ok(Self::build(symbols, 0, 1, 2, Some(3), marker, None))
    }

    /// Load a HuggingFace `tokenizer.json`; ids are the tokenizer's own.
    pub fn from_tokenizer_file<P: AsRef<Path>>(
        path: P,
        specials: &SpecialTokens,
        remove_bpe: Option<&str>,
    ) -> Result<Self> {
        let mut tokenizer =
            tokenizers::Tokenizer::from_file(path.as_ref()).map_err(EvalError::Tokenizer)?;
        tokenizer.with_padding(None);
        tokenizer
            .with_truncation(None)
            .map_err(EvalError::Tokenizer)?;
        Self::from_tokenizer(tokenizer, specials, remove_bpe)
    }

    pub fn from_tokenizer(
        tokenizer: tokenizers::Tokenizer,
        specials: &SpecialTokens,
        remove_bpe: Option<&str>,
    ) -> Result<Self> {
        let marker = continuation_marker(remove_bpe)?;
        let vocab = tokenizer.get_vocab(true);
        let size = vocab.values().map(|&id| id as usize + 1).max().unwrap_or(0);
        let mut symbols = vec![String::new(); size];
        for (symbol, id) in vocab {
            symbols[id as usize] = symbol;
        }

        let lookup = |name: &str| {
            tokenizer.token_to_id(name).ok_or_else(|| {
                EvalError::Vocabulary(format!("special token '{}' not in tokenizer", name))
            })
        };
        let bos = lookup(&specials.bos)?;
        let eos = lookup(&specials.eos)?;
        let pad = lookup(&specials.pad)?;
        let unk = specials.unk.as_deref().map(lookup).transpose()?;
        check_pad_distinct(&specials.pad, pad, bos, eos, unk)?;

        Ok(Self::build(symbols, bos, pad, eos, unk, marker, Some(tokenizer)))
    }

    fn build(
        symbols: Vec<String>,
        bos: TokenId,
        pad: TokenId,
        eos: TokenId,
        unk: Option<TokenId>,
        continuation_marker: Option<String>,
        tokenizer: Option<tokenizers::Tokenizer>,
    ) -> Self {
        let index = symbols
            .iter()
            .enumerate()
            .map(|(i, s)| (s.clone(), i as TokenId))
            .collect();
        let continuations = match &continuation_marker {
            Some(marker) => symbols
                .iter()
                .enumerate()
                .filter(|(_, s)| s.ends_with(marker.as_str()))
                .map(|(i, _)| i as TokenId)
                .collect(),
            None => HashSet::new(),
        };
        Self {
            symbols,
            index,
            bos,
            pad,
            eos,
            unk,
            continuation_marker,
            continuations,
            tokenizer,
        }
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn bos(&self) -> TokenId {
        self.bos
    }

    pub fn pad(&self) -> TokenId {
        self.pad
    }

    pub fn eos(&self) -> TokenId {
        self.eos
    }

    pub fn unk(&self) -> Option<TokenId> {
        self.unk
    }

    pub fn index(&self, symbol: &str) -> Option<TokenId> {
        self.index.get(symbol).copied()
    }

    /// Surface string of `id`, or the unknown symbol for ids outside the table.
    pub fn symbol(&self, id: TokenId) -> &str {
        self.symbols
            .get(id as usize)
            .map_or(UNK_SYMBOL, String::as_str)
    }

    pub fn continuation_marker(&self) -> Option<&str> {
        self.continuation_marker.as_deref()
    }

    /// The symbol continues into the next one to form a word.
    pub fn is_continuation(&self, id: TokenId) -> bool {
        self.continuations.contains(&id)
    }

    /// Token ids for one line of text, optionally followed by end-of-sentence.
    ///
    /// Dictionary vocabularies split on whitespace and map unknown symbols to
    /// `<unk>`; tokenizer vocabularies run the tokenizer.
    pub fn encode_line(&self, line: &str, append_eos: bool) -> Result<Vec<TokenId>> {
        let mut ids = match &self.tokenizer {
            Some(tokenizer) => tokenizer
                .encode(line, false)
                .map_err(EvalError::Tokenizer)?
                .get_ids()
                .to_vec(),
            None => line
                .split_whitespace()
                .map(|w| {
                    self.index(w).or(self.unk).ok_or_else(|| {
                        EvalError::Vocabulary(format!("'{}' not in vocabulary", w))
                    })
                })
                .collect::<Result<Vec<_>>>()?,
        };
        if append_eos {
            ids.push(self.eos);
        }
        Ok(ids)
    }

    /// Space-joined symbols of `ids`.
    pub fn string(&self, ids: &[TokenId]) -> String {
        ids.iter()
            .map(|&id| self.symbol(id))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Padding is stripped from references, so it must not share an id with a scored token.
fn check_pad_distinct(
    name: &str,
    pad: TokenId,
    bos: TokenId,
    eos: TokenId,
    unk: Option<TokenId>,
) -> Result<()> {
    if pad == bos || pad == eos || unk == Some(pad) {
        return Err(EvalError::Vocabulary(format!(
            "pad token '{}' (id {}) is also bos, eos or unk; choose a token that never occurs in text",
            name, pad
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_reserved_ids() {
        let vocab = Vocabulary::from_symbols(["the", "cat"], None);
        assert_eq!(vocab.bos(), 0);
        assert_eq!(vocab.pad(), 1);
        assert_eq!(vocab.eos(), 2);
        assert_eq!(vocab.unk(), Some(3));
        assert_eq!(vocab.index("the"), Some(4));
        assert_eq!(vocab.symbol(5), "cat");
        assert_eq!(vocab.symbol(99), UNK_SYMBOL);
        assert_eq!(vocab.len(), 6);
    }

    #[test]
    fn test_pad_must_not_alias_scored_tokens() {
        // llama tokenizers: <unk>=0, <s>=1, </s>=2, <0x00>=3
        assert!(check_pad_distinct("<0x00>", 3, 1, 2, Some(0)).is_ok());
        assert!(matches!(
            check_pad_distinct("<unk>", 0, 1, 2, Some(0)),
            Err(EvalError::Vocabulary(_))
        ));
        assert!(check_pad_distinct("</s>", 2, 1, 2, None).is_err());
        assert!(check_pad_distinct("<s>", 1, 1, 2, None).is_err());
    }

    #[test]
    fn test_load_dict() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "the 100").unwrap();
        writeln!(file, "ca@@ 7").unwrap();
        writeln!(file, "t 3").unwrap();
        writeln!(file, "<s> 0 #fairseq:overwrite").unwrap();
        file.flush().unwrap();

        let vocab = Vocabulary::load_dict(file.path(), Some("@@ ")).unwrap();
        assert_eq!(vocab.len(), 8);
        assert_eq!(vocab.index("the"), Some(4));
        assert_eq!(vocab.continuation_marker(), Some("@@"));
        assert!(vocab.is_continuation(5));
        assert!(!vocab.is_continuation(4));
    }

    #[test]
    fn test_load_dict_rejects_bad_line() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "lonely").unwrap();
        file.flush().unwrap();
        assert!(Vocabulary::load_dict(file.path(), None).is_err());
    }

    #[test]
    fn test_sentencepiece_unsupported() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "a 1").unwrap();
        file.flush().unwrap();
        assert!(matches!(
            Vocabulary::load_dict(file.path(), Some("sentencepiece")),
            Err(EvalError::UnsupportedConfiguration(_))
        ));
    }

    #[test]
    fn test_encode_line_maps_unknown() {
        let vocab = Vocabulary::from_symbols(["the", "cat"], None);
        let ids = vocab.encode_line("the dog cat", true).unwrap();
        assert_eq!(ids, vec![4, 3, 5, 2]);
        assert_eq!(vocab.string(&ids), "the <unk> cat </s>");
    }
}

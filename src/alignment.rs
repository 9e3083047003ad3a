//! Sub-word to word alignment
//!
//! Maps a sentence's sub-word tokenization back onto its whitespace-delimited
//! words. The number of sub-words per word is learned by tokenizing each word
//! on its own and cached; the sentence encoding is then walked left to right,
//! consuming exactly that many content tokens per word.
//!
//! ## Leading-space sensitivity
//!
//! Byte-level BPE tokenizers (GPT-2, RoBERTa) encode "cat" and " cat"
//! differently. Every word except the first is therefore counted with a
//! dummy prefix (`"a cat"`) and the dummy's token is discarded, so the count
//! matches how the word tokenizes mid-sentence.
//!
//! ## Positions
//!
//! Spans are expressed in model-input positions. Special tokens added by the
//! post-processor (`[CLS]`, `<s>`, ...) are skipped using the encoding's
//! special-tokens mask, so they never shift a word's span.

use std::collections::HashMap;

use anyhow::Result;
use tokenizers::{Encoding, Tokenizer};
use tracing::{debug, warn};

/// Dummy context placed before non-initial words when counting sub-words
pub const PRIMING_PREFIX: &str = "a ";

/// Process-wide cache of sub-word counts keyed by primed surface form
#[derive(Debug, Default, Clone)]
pub struct TokenizationCounts {
    counts: HashMap<String, usize>,
}

impl TokenizationCounts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the count for `key`.
    ///
    /// The first encounter fills the cache; every later encounter must agree
    /// with it. A disagreement is an invariant violation and fails the run.
    pub fn record(&mut self, key: &str, count: usize) -> Result<usize> {
        if let Some(&cached) = self.counts.get(key) {
            anyhow::ensure!(
                cached == count,
                "Tokenization count mismatch for {key:?}: cached {cached}, got {count}"
            );
            return Ok(cached);
        }
        self.counts.insert(key.to_string(), count);
        Ok(count)
    }

    pub fn get(&self, key: &str) -> Option<usize> {
        self.counts.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

/// Cache key for a word at a given index in its sentence
pub fn priming_key(word_index: usize, word: &str) -> String {
    if word_index == 0 {
        word.to_string()
    } else {
        format!("{PRIMING_PREFIX}{word}")
    }
}

/// Marker a tokenizer attaches to sub-word pieces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubwordMarker {
    /// Leading marker: `##able` (WordPiece), `Ġcat` (byte-level BPE), `▁cat` (SentencePiece)
    Prefix(&'static str),
    /// Trailing end-of-word marker: `cat</w>` (XLM BPE)
    Suffix(&'static str),
}

impl SubwordMarker {
    /// Remove the marker from one piece, if present
    pub fn strip<'a>(&self, piece: &'a str) -> &'a str {
        match self {
            SubwordMarker::Prefix(m) => piece.strip_prefix(m).unwrap_or(piece),
            SubwordMarker::Suffix(m) => piece.strip_suffix(m).unwrap_or(piece),
        }
    }
}

/// Join sub-word pieces, dropping each piece's marker
pub fn detokenize(pieces: &[String], marker: SubwordMarker) -> String {
    pieces.iter().map(|piece| marker.strip(piece)).collect()
}

/// Number of non-special tokens in an encoding
fn content_len(encoding: &Encoding) -> usize {
    encoding
        .get_special_tokens_mask()
        .iter()
        .filter(|&&m| m == 0)
        .count()
}

/// A word's position range in the content-token walk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WordPosition {
    pub word_index: usize,
    pub start: usize,
    pub end: usize,
}

/// Walk content positions left to right, consuming `counts[i]` tokens per word.
///
/// `content_positions` are the model-input indices of non-special tokens.
/// Returned spans are inclusive model-input positions. When `truncated` is
/// set, words past the truncation point are dropped and the final
/// consistency check is skipped; otherwise any mismatch is an error.
pub fn walk_spans(
    counts: &[usize],
    content_positions: &[usize],
    truncated: bool,
) -> Result<Vec<WordPosition>> {
    let mut counter = 0;
    let mut spans = Vec::with_capacity(counts.len());

    for (word_index, &count) in counts.iter().enumerate() {
        if count == 0 {
            warn!("Word {} tokenizes to nothing, skipping", word_index);
            continue;
        }
        if counter + count > content_positions.len() {
            anyhow::ensure!(
                truncated,
                "Word {} needs tokens {}..{} but the sentence has only {}",
                word_index,
                counter,
                counter + count,
                content_positions.len()
            );
            break;
        }
        spans.push(WordPosition {
            word_index,
            start: content_positions[counter],
            end: content_positions[counter + count - 1],
        });
        counter += count;
    }

    debug!("Counter: {}", counter);

    if truncated {
        warn!("Input truncated because of length, skipping check");
    } else {
        anyhow::ensure!(
            counter == content_positions.len(),
            "Sub-word count mismatch: words consume {} tokens, sentence has {}",
            counter,
            content_positions.len()
        );
    }

    Ok(spans)
}

/// One word mapped onto its sub-word span
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WordSpan {
    /// Original whitespace-delimited word
    pub word: String,
    /// Sub-word pieces joined with continuation markers removed
    pub token: String,
    /// First model-input position (inclusive)
    pub start: usize,
    /// Last model-input position (inclusive)
    pub end: usize,
}

impl WordSpan {
    /// Number of sub-word positions the word covers
    pub fn n_subwords(&self) -> usize {
        self.end - self.start + 1
    }
}

/// Alignment of one sentence
#[derive(Debug, Clone)]
pub struct SentenceAlignment {
    /// Model input, special tokens included
    pub input_ids: Vec<u32>,
    /// Token string for every input position
    pub pieces: Vec<String>,
    /// Spans of the words that survived truncation
    pub spans: Vec<WordSpan>,
    /// Number of whitespace-delimited words in the sentence
    pub n_words: usize,
    pub truncated: bool,
}

/// Aligns sentences against a tokenizer, owning the tokenization-count cache
#[derive(Debug, Clone)]
pub struct SubwordAligner {
    counts: TokenizationCounts,
    marker: SubwordMarker,
    max_seq_len: usize,
}

impl SubwordAligner {
    /// `marker` is the tokenizer's continuation marker; `max_seq_len` the
    /// truncation length configured on the tokenizer.
    pub fn new(marker: SubwordMarker, max_seq_len: usize) -> Self {
        Self {
            counts: TokenizationCounts::new(),
            marker,
            max_seq_len,
        }
    }

    pub fn counts(&self) -> &TokenizationCounts {
        &self.counts
    }

    /// Sub-word count of `word` at `word_index`, checked against the cache
    pub fn word_count(
        &mut self,
        tokenizer: &Tokenizer,
        word_index: usize,
        word: &str,
    ) -> Result<usize> {
        let key = priming_key(word_index, word);
        let encoding = tokenizer
            .encode(key.as_str(), true)
            .map_err(|e| anyhow::anyhow!("Tokenization error: {e}"))?;

        let mut count = content_len(&encoding);
        if word_index != 0 {
            // Discard the priming token
            count = count.saturating_sub(1);
        }
        self.counts.record(&key, count)
    }

    /// Align a sentence's words onto its sub-word encoding.
    ///
    /// The model input is the words re-joined with single spaces, so runs of
    /// whitespace or tabs never produce tokens that belong to no word.
    pub fn align(&mut self, tokenizer: &Tokenizer, sentence: &str) -> Result<SentenceAlignment> {
        let words: Vec<&str> = sentence.split_whitespace().collect();
        let counts = words
            .iter()
            .enumerate()
            .map(|(i, word)| self.word_count(tokenizer, i, word))
            .collect::<Result<Vec<_>>>()?;

        let normalized = words.join(" ");
        let encoding = tokenizer
            .encode(normalized.as_str(), true)
            .map_err(|e| anyhow::anyhow!("Tokenization error: {e}"))?;
        let input_ids = encoding.get_ids().to_vec();
        let pieces = encoding.get_tokens().to_vec();
        let truncated =
            input_ids.len() >= self.max_seq_len || !encoding.get_overflowing().is_empty();

        let content_positions: Vec<usize> = encoding
            .get_special_tokens_mask()
            .iter()
            .enumerate()
            .filter(|(_, m)| **m == 0)
            .map(|(i, _)| i)
            .collect();

        debug!("Sentence          : {:?}", sentence);
        debug!("Original    ({:03}): {:?}", words.len(), words);
        debug!("Tokenized   ({:03}): {:?}", pieces.len(), pieces);

        let spans: Vec<WordSpan> = walk_spans(&counts, &content_positions, truncated)?
            .into_iter()
            .map(|p| {
                let token = detokenize(&pieces[p.start..=p.end], self.marker);
                let word = words[p.word_index].to_string();
                WordSpan {
                    token: if token.is_empty() { word.clone() } else { token },
                    word,
                    start: p.start,
                    end: p.end,
                }
            })
            .collect();

        debug!(
            "Detokenized ({:03}): {:?}",
            spans.len(),
            spans.iter().map(|s| s.token.as_str()).collect::<Vec<_>>()
        );

        Ok(SentenceAlignment {
            input_ids,
            pieces,
            spans,
            n_words: words.len(),
            truncated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use tokenizers::TruncationParams;

    /// Lowercasing WordPiece tokenizer with BERT special tokens
    fn wordpiece_tokenizer() -> Tokenizer {
        let json = serde_json::json!({
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": [
                {"id": 0, "content": "[PAD]", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true},
                {"id": 1, "content": "[UNK]", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true},
                {"id": 2, "content": "[CLS]", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true},
                {"id": 3, "content": "[SEP]", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true}
            ],
            "normalizer": {
                "type": "BertNormalizer",
                "clean_text": true,
                "handle_chinese_chars": true,
                "strip_accents": null,
                "lowercase": true
            },
            "pre_tokenizer": {"type": "BertPreTokenizer"},
            "post_processor": {
                "type": "BertProcessing",
                "sep": ["[SEP]", 3],
                "cls": ["[CLS]", 2]
            },
            "decoder": null,
            "model": {
                "type": "WordPiece",
                "unk_token": "[UNK]",
                "continuing_subword_prefix": "##",
                "max_input_chars_per_word": 100,
                "vocab": {
                    "[PAD]": 0, "[UNK]": 1, "[CLS]": 2, "[SEP]": 3,
                    "a": 4, "the": 5, "cat": 6, "is": 7, "un": 8,
                    "##believ": 9, "##able": 10, ".": 11
                }
            }
        });
        Tokenizer::from_str(&json.to_string()).unwrap()
    }

    const WORDPIECE: SubwordMarker = SubwordMarker::Prefix("##");
    const BYTE_LEVEL: SubwordMarker = SubwordMarker::Prefix("\u{120}");

    /// Byte-level BPE tokenizer definition without special tokens (GPT-2 style)
    fn byte_level_json() -> serde_json::Value {
        serde_json::json!({
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": [],
            "normalizer": null,
            "pre_tokenizer": {
                "type": "ByteLevel",
                "add_prefix_space": false,
                "trim_offsets": true,
                "use_regex": true
            },
            "post_processor": null,
            "decoder": null,
            "model": {
                "type": "BPE",
                "dropout": null,
                "unk_token": null,
                "continuing_subword_prefix": null,
                "end_of_word_suffix": null,
                "fuse_unk": false,
                "byte_fallback": false,
                "vocab": {
                    "a": 0, "c": 1, "e": 2, "h": 3, "s": 4, "t": 5, "Ġ": 6,
                    "Ġc": 7, "Ġt": 8, "Ġca": 9, "Ġcat": 10, "Ġth": 11, "Ġthe": 12,
                    "th": 13, "the": 14, "ca": 15, "cat": 16
                },
                "merges": [
                    "Ġ c", "Ġ t", "Ġc a", "Ġca t", "Ġt h", "Ġth e",
                    "t h", "th e", "c a", "ca t"
                ]
            }
        })
    }

    fn byte_level_tokenizer() -> Tokenizer {
        Tokenizer::from_str(&byte_level_json().to_string()).unwrap()
    }

    /// Byte-level BPE wrapped in `<s> ... </s>` (RoBERTa style)
    fn roberta_tokenizer() -> Tokenizer {
        let mut json = byte_level_json();
        json["model"]["vocab"]["<s>"] = 17.into();
        json["model"]["vocab"]["</s>"] = 18.into();
        json["added_tokens"] = serde_json::json!([
            {"id": 17, "content": "<s>", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true},
            {"id": 18, "content": "</s>", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true}
        ]);
        json["post_processor"] = serde_json::json!({
            "type": "RobertaProcessing",
            "sep": ["</s>", 18],
            "cls": ["<s>", 17],
            "trim_offsets": true,
            "add_prefix_space": false
        });
        Tokenizer::from_str(&json.to_string()).unwrap()
    }

    #[test]
    fn test_counts_cache_detects_mismatch() {
        let mut counts = TokenizationCounts::new();
        assert_eq!(counts.record("a word", 2).unwrap(), 2);
        assert_eq!(counts.record("a word", 2).unwrap(), 2);
        assert!(counts.record("a word", 3).is_err());
        assert_eq!(counts.get("a word"), Some(2));
        assert_eq!(counts.len(), 1);
    }

    #[test]
    fn test_priming_key_and_detokenize() {
        assert_eq!(priming_key(0, "cat"), "cat");
        assert_eq!(priming_key(3, "cat"), "a cat");

        let wp = vec!["un".to_string(), "##believ".to_string(), "##able".to_string()];
        assert_eq!(detokenize(&wp, WORDPIECE), "unbelievable");

        let bpe = vec!["Ġcat".to_string(), "s".to_string()];
        assert_eq!(detokenize(&bpe, BYTE_LEVEL), "cats");

        let xlm = vec!["unbeliev".to_string(), "able</w>".to_string()];
        assert_eq!(detokenize(&xlm, SubwordMarker::Suffix("</w>")), "unbelievable");
    }

    #[test]
    fn test_walk_spans_offsets_past_special_tokens() {
        // [CLS] w0 w1a w1b [SEP]
        let spans = walk_spans(&[1, 2], &[1, 2, 3], false).unwrap();
        assert_eq!(
            spans,
            vec![
                WordPosition { word_index: 0, start: 1, end: 1 },
                WordPosition { word_index: 1, start: 2, end: 3 },
            ]
        );
    }

    #[test]
    fn test_walk_spans_mismatch() {
        assert!(walk_spans(&[1, 2], &[1, 2, 3, 4], false).is_err());
        assert!(walk_spans(&[1, 4], &[1, 2, 3], false).is_err());

        // Truncated input: the second word falls past the end and is dropped
        let spans = walk_spans(&[1, 4], &[1, 2, 3], true).unwrap();
        assert_eq!(spans.len(), 1);
    }

    #[test]
    fn test_walk_spans_skips_empty_words() {
        let spans = walk_spans(&[1, 0, 1], &[0, 1], false).unwrap();
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[1].word_index, 2);
    }

    #[test]
    fn test_align_wordpiece() {
        let tokenizer = wordpiece_tokenizer();
        let mut aligner = SubwordAligner::new(WORDPIECE, 512);

        let alignment = aligner
            .align(&tokenizer, "The cat is unbelievable .")
            .unwrap();

        assert!(!alignment.truncated);
        assert_eq!(alignment.n_words, 5);
        assert_eq!(alignment.input_ids.len(), 9);
        assert_eq!(alignment.pieces[0], "[CLS]");

        let tokens: Vec<&str> = alignment.spans.iter().map(|s| s.token.as_str()).collect();
        assert_eq!(tokens, vec!["the", "cat", "is", "unbelievable", "."]);

        let unbelievable = &alignment.spans[3];
        assert_eq!((unbelievable.start, unbelievable.end), (4, 6));
        assert_eq!(unbelievable.n_subwords(), 3);
        assert_eq!(unbelievable.word, "unbelievable");
    }

    #[test]
    fn test_repeated_words_share_counts() {
        let tokenizer = wordpiece_tokenizer();
        let mut aligner = SubwordAligner::new(WORDPIECE, 512);

        let alignment = aligner
            .align(&tokenizer, "unbelievable cat unbelievable cat unbelievable")
            .unwrap();

        assert_eq!(alignment.spans.len(), 5);
        assert_eq!(aligner.counts().get("unbelievable"), Some(3));
        assert_eq!(aligner.counts().get("a unbelievable"), Some(3));
        assert_eq!(aligner.counts().get("a cat"), Some(1));
        for span in alignment.spans.iter().filter(|s| s.word == "unbelievable") {
            assert_eq!(span.n_subwords(), 3);
        }
    }

    #[test]
    fn test_align_byte_level_leading_space() {
        let tokenizer = byte_level_tokenizer();
        let mut aligner = SubwordAligner::new(BYTE_LEVEL, 512);

        let alignment = aligner.align(&tokenizer, "the cats sat").unwrap();

        let tokens: Vec<&str> = alignment.spans.iter().map(|s| s.token.as_str()).collect();
        assert_eq!(tokens, vec!["the", "cats", "sat"]);
        assert_eq!(alignment.input_ids.len(), 7);
        assert_eq!((alignment.spans[1].start, alignment.spans[1].end), (1, 2));
        assert_eq!((alignment.spans[2].start, alignment.spans[2].end), (3, 6));

        // Word-initial and mid-sentence forms are cached separately
        assert_eq!(aligner.counts().get("the"), Some(1));
        assert_eq!(aligner.counts().get("a cats"), Some(2));
    }

    #[test]
    fn test_repeated_whitespace_and_tabs() {
        let tokenizer = byte_level_tokenizer();
        let mut aligner = SubwordAligner::new(BYTE_LEVEL, 512);

        let alignment = aligner.align(&tokenizer, "the  cats\tsat").unwrap();

        assert_eq!(alignment.n_words, 3);
        let tokens: Vec<&str> = alignment.spans.iter().map(|s| s.token.as_str()).collect();
        assert_eq!(tokens, vec!["the", "cats", "sat"]);
        // Same input as the single-spaced sentence
        assert_eq!(alignment.input_ids.len(), 7);
        assert!(alignment.pieces.iter().all(|p| p != "\u{120}\u{120}" && !p.contains('\u{109}')));
    }

    #[test]
    fn test_align_roberta_special_tokens() {
        let tokenizer = roberta_tokenizer();
        let mut aligner = SubwordAligner::new(BYTE_LEVEL, 512);

        let alignment = aligner.align(&tokenizer, "the cats sat").unwrap();

        // <s> the Ġcat s Ġ s a t </s>
        assert_eq!(alignment.input_ids.len(), 9);
        assert_eq!(alignment.pieces[0], "<s>");
        assert_eq!(alignment.pieces[8], "</s>");

        let spans: Vec<(usize, usize)> = alignment.spans.iter().map(|s| (s.start, s.end)).collect();
        assert_eq!(spans, vec![(1, 1), (2, 3), (4, 7)]);
        let tokens: Vec<&str> = alignment.spans.iter().map(|s| s.token.as_str()).collect();
        assert_eq!(tokens, vec!["the", "cats", "sat"]);

        // Priming token and <s>/</s> are both excluded from the counts
        assert_eq!(aligner.counts().get("the"), Some(1));
        assert_eq!(aligner.counts().get("a cats"), Some(2));
        assert_eq!(aligner.counts().get("a sat"), Some(4));
    }

    #[test]
    fn test_truncation_skips_check() {
        let mut tokenizer = wordpiece_tokenizer();
        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length: 6,
                ..Default::default()
            }))
            .unwrap();
        let mut aligner = SubwordAligner::new(WORDPIECE, 6);

        let alignment = aligner
            .align(&tokenizer, "the cat is unbelievable .")
            .unwrap();

        assert!(alignment.truncated);
        assert_eq!(alignment.input_ids.len(), 6);
        let words: Vec<&str> = alignment.spans.iter().map(|s| s.word.as_str()).collect();
        assert_eq!(words, vec!["the", "cat", "is"]);
    }
}

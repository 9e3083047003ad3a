// Pedantic clippy configuration for ML/math codebase
// These are acceptable in numerical/ML code:
#![allow(clippy::cast_precision_loss)] // usize→f64/f32 intentional in ML
#![allow(clippy::cast_possible_truncation)] // usize→u32 in tensor indexing
#![allow(clippy::many_single_char_names)] // x, y, i, j standard in math
#![allow(clippy::similar_names)] // related variables like `head`/`heads`
#![allow(clippy::module_name_repetitions)] // CtxrepModel in model.rs is fine
// Documentation pedantic - acceptable for research code:
#![allow(clippy::doc_markdown)] // backticks for every technical term is excessive
#![allow(clippy::missing_errors_doc)] // # Errors section for every Result fn
#![allow(clippy::missing_panics_doc)] // # Panics section for every panic
// Method style pedantic:
#![allow(clippy::must_use_candidate)] // #[must_use] on every pure fn is excessive
#![allow(clippy::return_self_not_must_use)] // #[must_use] on Self returns
#![allow(clippy::trivially_copy_pass_by_ref)] // &self on Copy enums for API consistency
#![allow(clippy::needless_pass_by_value)] // value params for API flexibility

//! ctxrep-rs: contextual word representations from transformer models
//!
//! Runs a pretrained encoder or decoder over a corpus (one sentence per
//! line), maps its sub-word hidden states back onto the sentence's words and
//! stores one vector per layer per word.
//!
//! ## Architecture
//!
//! - `model`: CtxrepModel wrapper (tokenizer + backend + device), weight resolution
//! - `forward_bert`: BERT / RoBERTa forward pass capturing every hidden state
//! - `forward_distilbert`: DistilBERT forward pass capturing every hidden state
//! - `forward_gpt2`: GPT-2 forward pass capturing every hidden state
//! - `forward_xlm`: XLM forward pass and tokenizer assembly from raw BPE files
//! - `forward_xlnet`: XLNet relative-attention forward pass
//! - `cache`: HiddenStates for storing per-layer activations
//! - `masks`: Cached causal attention masks
//! - `alignment`: Sub-word to word alignment with the tokenization-count cache
//! - `aggregate`: First / last / average aggregation over a sub-word span
//! - `corpus`: Sentence streaming and filter vocabulary
//! - `sink`: Output formats and the sink trait
//! - `sink_json`: Line-oriented JSON output
//! - `sink_container`: Random-access safetensors container and reader
//! - `extraction`: Extractor coordinating the full pipeline

pub mod aggregate;
pub mod alignment;
pub mod cache;
pub mod corpus;
pub mod extraction;
pub mod forward_bert;
pub mod forward_distilbert;
pub mod forward_gpt2;
pub mod forward_xlm;
pub mod forward_xlnet;
pub mod masks;
pub mod model;
pub mod sink;
pub mod sink_container;
pub mod sink_json;

pub use aggregate::{aggregate, Aggregation};
pub use alignment::{
    detokenize, SentenceAlignment, SubwordAligner, SubwordMarker, TokenizationCounts, WordSpan,
};
pub use cache::HiddenStates;
pub use corpus::{Corpus, FilterVocab};
pub use extraction::{
    ExtractionConfig, ExtractionSummary, Extractor, SentenceRepresentation, WordRepresentation,
};
pub use forward_bert::{BertConfig, BertFlavor, CtxrepBert};
pub use forward_distilbert::{CtxrepDistilBert, DistilBertConfig};
pub use forward_gpt2::{CtxrepGpt2, Gpt2Config};
pub use forward_xlm::{xlm_tokenizer, CtxrepXlm, XlmConfig};
pub use forward_xlnet::{CtxrepXlnet, XlnetConfig};
pub use masks::{clear_mask_caches, create_causal_mask};
pub use model::{CtxrepBackend, CtxrepModel, LoadOptions, ModelArchitecture, TokenizerFiles};
pub use sink::{check_extension, create_sink, OutputFormat, RepresentationSink, SinkOptions};
pub use sink_container::{sanitize_key, ContainerReader, ContainerSink};
pub use sink_json::{JsonFeature, JsonLayer, JsonRecord, JsonSink};

//! Extraction runner
//!
//! Coordinates corpus streaming, alignment, inference, aggregation and
//! output for one pass over the corpus.

use anyhow::Result;
use tracing::{debug, info};

use crate::aggregate::{aggregate, Aggregation};
use crate::alignment::SubwordAligner;
use crate::corpus::{Corpus, FilterVocab};
use crate::model::CtxrepModel;
use crate::sink::{RepresentationSink, SinkOptions};

/// Configuration for an extraction run
#[derive(Debug, Clone)]
pub struct ExtractionConfig {
    /// How sub-word vectors collapse into one word vector
    pub aggregation: Aggregation,
    /// Keep the embedding output as the first stored layer
    pub include_embeddings: bool,
    /// Tokenizer truncation length (capped by the model's positions)
    pub max_seq_len: usize,
    /// Cap on stored occurrences per word (container output only)
    pub limit_max_occurrences: Option<usize>,
    /// One container tensor per layer
    pub decompose_layers: bool,
    /// Log progress every N sentences
    pub progress_every: usize,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            aggregation: Aggregation::Last,
            include_embeddings: true,
            max_seq_len: 512,
            limit_max_occurrences: None,
            decompose_layers: false,
            progress_every: 100,
        }
    }
}

/// One word's aggregated vectors
#[derive(Debug, Clone, PartialEq)]
pub struct WordRepresentation {
    /// Surface word from the sentence
    pub word: String,
    /// Detokenized sub-words, used as the output key
    pub token: String,
    /// One vector per stored layer
    pub layers: Vec<Vec<f32>>,
}

/// All extracted words of one sentence
#[derive(Debug, Clone, PartialEq)]
pub struct SentenceRepresentation {
    /// 0-based line index in the corpus
    pub index: usize,
    pub sentence: String,
    pub words: Vec<WordRepresentation>,
}

/// Totals for a finished run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractionSummary {
    pub sentences: usize,
    pub words: usize,
    pub truncated: usize,
    /// Words dropped by the filter vocabulary
    pub filtered: usize,
}

/// Drives a model over a corpus
pub struct Extractor {
    config: ExtractionConfig,
    model: CtxrepModel,
    aligner: SubwordAligner,
    vocab: Option<FilterVocab>,
    summary: ExtractionSummary,
}

impl Extractor {
    /// Prepare a run; configures the tokenizer's truncation length
    pub fn new(
        mut model: CtxrepModel,
        config: ExtractionConfig,
        vocab: Option<FilterVocab>,
    ) -> Result<Self> {
        let max_seq_len = model.set_max_seq_len(config.max_seq_len)?;
        let aligner = SubwordAligner::new(model.architecture().subword_marker(), max_seq_len);
        Ok(Self {
            config,
            model,
            aligner,
            vocab,
            summary: ExtractionSummary::default(),
        })
    }

    pub fn config(&self) -> &ExtractionConfig {
        &self.config
    }

    pub fn model(&self) -> &CtxrepModel {
        &self.model
    }

    /// Number of layers stored per word
    pub fn stored_layers(&self) -> usize {
        self.model.n_layers() + usize::from(self.config.include_embeddings)
    }

    /// Container settings and run metadata for the output sink
    pub fn sink_options(&self) -> SinkOptions {
        SinkOptions {
            limit_max_occurrences: self.config.limit_max_occurrences,
            decompose_layers: self.config.decompose_layers,
            run_metadata: vec![
                ("model".to_string(), self.model.model_name().to_string()),
                ("aggregation".to_string(), self.config.aggregation.to_string()),
                ("num_layers".to_string(), self.stored_layers().to_string()),
                ("hidden_size".to_string(), self.model.d_model().to_string()),
            ],
        }
    }

    pub fn summary(&self) -> &ExtractionSummary {
        &self.summary
    }

    /// Align, run and aggregate one sentence
    pub fn extract_sentence(
        &mut self,
        index: usize,
        sentence: &str,
    ) -> Result<SentenceRepresentation> {
        let alignment = self.aligner.align(self.model.tokenizer(), sentence)?;
        if alignment.truncated {
            self.summary.truncated += 1;
        }

        let mut words = Vec::with_capacity(alignment.spans.len());
        if !alignment.spans.is_empty() {
            let states = self
                .model
                .hidden_states(&alignment.input_ids)?
                .stacked(self.config.include_embeddings)?;
            debug!("Hidden states: {:?}", states.dims());

            for span in &alignment.spans {
                if let Some(vocab) = &self.vocab {
                    if !vocab.contains(&span.word) {
                        self.summary.filtered += 1;
                        continue;
                    }
                }
                let vector = aggregate(&states, span.start, span.end, self.config.aggregation)?;
                words.push(WordRepresentation {
                    word: span.word.clone(),
                    token: span.token.clone(),
                    layers: vector.to_vec2::<f32>()?,
                });
            }
        }
        debug!("# Extracted words: {}", words.len());

        self.summary.sentences += 1;
        self.summary.words += words.len();

        Ok(SentenceRepresentation {
            index,
            sentence: sentence.to_string(),
            words,
        })
    }

    /// Stream the corpus through the sink, then close it
    pub fn run(
        &mut self,
        corpus: &Corpus,
        mut sink: Box<dyn RepresentationSink>,
    ) -> Result<ExtractionSummary> {
        info!("Extracting representations from model");
        info!(
            "Config: {} aggregation, {} layers per word",
            self.config.aggregation,
            self.stored_layers()
        );

        for (index, sentence) in corpus.sentences()?.enumerate() {
            let sentence = sentence?;
            let representation = self.extract_sentence(index, &sentence)?;
            sink.write_sentence(&representation)?;

            let done = index + 1;
            if self.config.progress_every > 0 && done % self.config.progress_every == 0 {
                info!("Processed {} sentences ({} words)", done, self.summary.words);
            }
        }
        sink.finish()?;

        info!(
            "Done: {} sentences, {} words, {} truncated, {} filtered",
            self.summary.sentences, self.summary.words, self.summary.truncated, self.summary.filtered
        );
        Ok(self.summary.clone())
    }
}

//! Sub-word aggregation
//!
//! Collapses the vectors of the sub-word tokens that make up one word into a
//! single vector per layer. For "This is an example" tokenized as
//! `[CLS] this is an ex ##am ##ple [SEP]`, the word "example" spans positions
//! 4..=6 and every policy reads only those positions.

use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use candle_core::{IndexOp, Tensor};

/// How to collapse a multi-token span into one vector per layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum Aggregation {
    /// Vector of the first sub-word
    First,
    /// Vector of the last sub-word
    #[default]
    Last,
    /// Elementwise mean over the span
    Average,
}

impl Aggregation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Aggregation::First => "first",
            Aggregation::Last => "last",
            Aggregation::Average => "average",
        }
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Aggregation {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "first" => Ok(Aggregation::First),
            "last" => Ok(Aggregation::Last),
            "average" => Ok(Aggregation::Average),
            other => anyhow::bail!(
                "Invalid aggregation option '{other}', please specify first, average or last"
            ),
        }
    }
}

/// Aggregate activations over the inclusive span `start..=end`.
///
/// `states` has shape `(layers, seq_len, d_model)`; the result has shape
/// `(layers, d_model)`, each layer aggregated independently.
pub fn aggregate(states: &Tensor, start: usize, end: usize, method: Aggregation) -> Result<Tensor> {
    let (_, seq_len, _) = states.dims3()?;
    anyhow::ensure!(start <= end, "Empty span {start}..={end}");
    anyhow::ensure!(
        end < seq_len,
        "Span {start}..={end} out of range (seq_len={seq_len})"
    );

    let word_vector = match method {
        Aggregation::First => states.i((.., start, ..))?,
        Aggregation::Last => states.i((.., end, ..))?,
        Aggregation::Average => states.narrow(1, start, end - start + 1)?.mean(1)?,
    };
    Ok(word_vector)
}

//! Line-oriented JSON sink
//!
//! Each sentence becomes one line:
//!
//! ```json
//! {"linex_index": 0, "features": [{"token": "hello", "layers": [{"index": 0, "values": [...]}]}]}
//! ```

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::extraction::SentenceRepresentation;
use crate::sink::RepresentationSink;

/// One output line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRecord {
    pub linex_index: usize,
    pub features: Vec<JsonFeature>,
}

/// One word of a sentence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonFeature {
    pub token: String,
    pub layers: Vec<JsonLayer>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonLayer {
    pub index: usize,
    pub values: Vec<f64>,
}

/// Round to 8 decimal places
pub fn round8(value: f32) -> f64 {
    (f64::from(value) * 1e8).round() / 1e8
}

impl From<&SentenceRepresentation> for JsonRecord {
    fn from(sentence: &SentenceRepresentation) -> Self {
        let features = sentence
            .words
            .iter()
            .map(|word| JsonFeature {
                token: word.token.clone(),
                layers: word
                    .layers
                    .iter()
                    .enumerate()
                    .map(|(index, values)| JsonLayer {
                        index,
                        values: values.iter().copied().map(round8).collect(),
                    })
                    .collect(),
            })
            .collect();

        Self {
            linex_index: sentence.index,
            features,
        }
    }
}

/// Streams one JSON record per sentence
pub struct JsonSink {
    writer: BufWriter<File>,
}

impl JsonSink {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("Failed to create output file {}", path.display()))?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }
}

impl RepresentationSink for JsonSink {
    fn write_sentence(&mut self, sentence: &SentenceRepresentation) -> Result<()> {
        let record = JsonRecord::from(sentence);
        serde_json::to_writer(&mut self.writer, &record)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> Result<()> {
        self.writer.flush().context("Failed to flush JSON output")?;
        Ok(())
    }
}

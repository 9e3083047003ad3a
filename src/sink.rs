//! Output sinks for extracted word representations
//!
//! - `sink_json`: one JSON object per sentence, streamed line by line
//! - `sink_container`: random-access safetensors container keyed by word

use std::path::Path;

use anyhow::Result;
use tracing::warn;

use crate::extraction::SentenceRepresentation;
use crate::sink_container::ContainerSink;
use crate::sink_json::JsonSink;

/// Output file format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Line-oriented JSON, one object per sentence
    #[default]
    Json,
    /// Random-access safetensors container
    Safetensors,
}

impl OutputFormat {
    /// File extension the output path is expected to carry
    pub fn expected_extension(&self) -> &'static str {
        match self {
            OutputFormat::Json => "json",
            OutputFormat::Safetensors => "safetensors",
        }
    }
}

/// Warn when `path` does not end with the format's extension. Never fatal.
///
/// Returns whether the extension matched.
pub fn check_extension(path: &Path, format: OutputFormat) -> bool {
    let expected = format.expected_extension();
    let matches = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case(expected));
    if !matches {
        warn!(
            "Output filename ({}) does not end with .{}, but output file type is {:?}",
            path.display(),
            expected,
            format
        );
    }
    matches
}

/// Destination for per-sentence representations
pub trait RepresentationSink {
    /// Append one sentence's word representations
    fn write_sentence(&mut self, sentence: &SentenceRepresentation) -> Result<()>;

    /// Flush and close the output
    fn finish(self: Box<Self>) -> Result<()>;
}

/// Options shared by the sink constructors
#[derive(Debug, Clone, Default)]
pub struct SinkOptions {
    /// Cap on stored occurrences per word (container only)
    pub limit_max_occurrences: Option<usize>,
    /// Store one tensor per layer instead of one per word occurrence
    pub decompose_layers: bool,
    /// Run-level metadata recorded in the container header
    pub run_metadata: Vec<(String, String)>,
}

/// Open the sink for `format` at `path`
pub fn create_sink(
    format: OutputFormat,
    path: &Path,
    options: SinkOptions,
) -> Result<Box<dyn RepresentationSink>> {
    check_extension(path, format);
    let sink: Box<dyn RepresentationSink> = match format {
        OutputFormat::Json => {
            if options.limit_max_occurrences.is_some() {
                warn!("--limit-max-occurrences only applies to safetensors output, ignoring");
            }
            Box::new(JsonSink::create(path)?)
        }
        OutputFormat::Safetensors => Box::new(ContainerSink::create(path, options)?),
    };
    Ok(sink)
}

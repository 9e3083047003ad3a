//! ctxrep-rs CLI: extract contextual word representations

use anyhow::Result;
use clap::Parser;
use ctxrep_rs::{
    create_sink, Aggregation, Corpus, CtxrepModel, ExtractionConfig, Extractor, FilterVocab,
    LoadOptions, ModelArchitecture, OutputFormat,
};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "ctxrep-rs")]
#[command(about = "Extract per-word hidden-state representations from transformer models")]
#[command(version)]
struct Cli {
    /// Model name (e.g., "bert-base-uncased", "roberta-base", "gpt2", "xlnet-base-cased")
    model_name: String,

    /// Text file with one sentence per line
    input_corpus: PathBuf,

    /// Output file where extracted representations are stored
    output_file: PathBuf,

    /// Only extract words listed in this file (first column)
    #[arg(long, alias = "filter_vocab")]
    filter_vocab: Option<PathBuf>,

    /// Local checkpoint directory (config.json, tokenizer.json, weights)
    #[arg(long, alias = "model_path")]
    model_path: Option<PathBuf>,

    /// Sub-word aggregation
    #[arg(long, value_enum, default_value_t = Aggregation::Last)]
    aggregation: Aggregation,

    /// Maximum stored occurrences per word (safetensors output only)
    #[arg(long, alias = "limit_max_occurrences")]
    limit_max_occurrences: Option<usize>,

    /// Output format
    #[arg(long, alias = "output_type", value_enum, default_value_t = OutputFormat::Json)]
    output_type: OutputFormat,

    /// Store one tensor per layer (safetensors output only)
    #[arg(long, alias = "decompose_layers")]
    decompose_layers: bool,

    /// Force CPU even when CUDA is available
    #[arg(long, alias = "disable_cuda")]
    disable_cuda: bool,

    /// Drop the embedding layer from the stored layers
    #[arg(long, alias = "ignore_embeddings")]
    ignore_embeddings: bool,

    /// Use randomly initialized weights instead of the pretrained ones
    #[arg(long, alias = "random_weights")]
    random_weights: bool,

    /// Maximum tokenized sentence length before truncation
    #[arg(long, alias = "max_seq_len", default_value_t = 512)]
    max_seq_len: usize,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Fail before any download when the model family is unknown
    let architecture = ModelArchitecture::from_model_name(&cli.model_name)?;

    println!("=== ctxrep-rs: contextual representation extraction ===");
    println!("Model:       {} ({:?})", cli.model_name, architecture);
    println!("Corpus:      {}", cli.input_corpus.display());
    println!("Output:      {} ({:?})", cli.output_file.display(), cli.output_type);
    println!("Aggregation: {}", cli.aggregation);
    if cli.disable_cuda {
        println!("Mode:        CPU (forced)");
    }
    if cli.random_weights {
        println!("Weights:     random");
    }

    // Load model
    let options = LoadOptions {
        model_name: cli.model_name.clone(),
        model_path: cli.model_path.clone(),
        force_cpu: cli.disable_cuda,
        random_weights: cli.random_weights,
    };
    let model = CtxrepModel::load(&options)?;

    let corpus = Corpus::open(&cli.input_corpus)?;
    info!("Corpus: {}", corpus.path().display());

    let vocab = match &cli.filter_vocab {
        Some(path) => {
            let vocab = FilterVocab::load(path)?;
            info!("Filter vocabulary: {} words", vocab.len());
            Some(vocab)
        }
        None => None,
    };

    let config = ExtractionConfig {
        aggregation: cli.aggregation,
        include_embeddings: !cli.ignore_embeddings,
        max_seq_len: cli.max_seq_len,
        limit_max_occurrences: cli.limit_max_occurrences,
        decompose_layers: cli.decompose_layers,
        ..Default::default()
    };

    let mut extractor = Extractor::new(model, config, vocab)?;

    let sink = create_sink(cli.output_type, &cli.output_file, extractor.sink_options())?;

    let summary = extractor.run(&corpus, sink)?;

    println!("\n=== Summary ===");
    println!("Sentences: {}", summary.sentences);
    println!("Words:     {}", summary.words);
    println!("Truncated: {}", summary.truncated);
    if summary.filtered > 0 {
        println!("Filtered:  {}", summary.filtered);
    }
    info!("Representations saved to {}", cli.output_file.display());

    Ok(())
}

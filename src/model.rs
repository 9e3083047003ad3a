//! CtxrepModel wrapper for hidden-state extraction
//!
//! Supports multiple encoder/decoder families (BERT, RoBERTa, DistilBERT,
//! GPT-2, XLM, XLNet) behind a unified interface.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use hf_hub::{api::sync::Api, Repo, RepoType};
use serde::de::DeserializeOwned;
use tokenizers::{Tokenizer, TruncationParams};
use tracing::{info, warn};

use crate::alignment::SubwordMarker;
use crate::cache::HiddenStates;
use crate::forward_bert::{BertConfig, BertFlavor, CtxrepBert};
use crate::forward_distilbert::{CtxrepDistilBert, DistilBertConfig};
use crate::forward_gpt2::{CtxrepGpt2, Gpt2Config};
use crate::forward_xlm::{xlm_tokenizer, CtxrepXlm, XlmConfig};
use crate::forward_xlnet::{CtxrepXlnet, XlnetConfig};

/// Supported model architectures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelArchitecture {
    /// BERT (Google)
    Bert,
    /// RoBERTa (Facebook AI)
    Roberta,
    /// DistilBERT (HuggingFace)
    DistilBert,
    /// GPT-2 (OpenAI)
    Gpt2,
    /// XLM (Facebook AI)
    Xlm,
    /// XLNet (Google / CMU)
    Xlnet,
}

impl ModelArchitecture {
    /// Detect architecture from the model name.
    ///
    /// Matches on the prefix of the final path segment, so both `bert-base-cased`
    /// and `google-bert/bert-base-cased` resolve to BERT.
    pub fn from_model_name(model_name: &str) -> Result<Self> {
        let base = model_name
            .rsplit('/')
            .next()
            .unwrap_or(model_name)
            .to_lowercase();
        if base.starts_with("xlnet") {
            Ok(ModelArchitecture::Xlnet)
        } else if base.starts_with("xlm") {
            Ok(ModelArchitecture::Xlm)
        } else if base.starts_with("distilbert") {
            Ok(ModelArchitecture::DistilBert)
        } else if base.starts_with("roberta") {
            Ok(ModelArchitecture::Roberta)
        } else if base.starts_with("bert") {
            Ok(ModelArchitecture::Bert)
        } else if base.starts_with("gpt2") {
            Ok(ModelArchitecture::Gpt2)
        } else {
            anyhow::bail!("Unrecognized model name: {model_name}")
        }
    }

    /// Marker the tokenizer puts on sub-word pieces.
    ///
    /// WordPiece marks word-internal pieces (`##able`); byte-level BPE marks
    /// word-initial pieces after a space (`Ġhello`), SentencePiece likewise
    /// with `▁`. XLM's BPE closes each word with `</w>`.
    pub fn subword_marker(&self) -> SubwordMarker {
        match self {
            ModelArchitecture::Bert | ModelArchitecture::DistilBert => SubwordMarker::Prefix("##"),
            ModelArchitecture::Roberta | ModelArchitecture::Gpt2 => {
                SubwordMarker::Prefix("\u{120}")
            }
            ModelArchitecture::Xlnet => SubwordMarker::Prefix("\u{2581}"),
            ModelArchitecture::Xlm => SubwordMarker::Suffix("</w>"),
        }
    }

    /// Checkpoint prefixes to try when the bare weight names are missing
    pub fn weight_prefixes(&self) -> &'static [&'static str] {
        match self {
            ModelArchitecture::Bert => &["", "bert"],
            ModelArchitecture::Roberta => &["", "roberta"],
            ModelArchitecture::DistilBert => &["", "distilbert"],
            ModelArchitecture::Gpt2 | ModelArchitecture::Xlm | ModelArchitecture::Xlnet => {
                &["", "transformer"]
            }
        }
    }
}

/// Unified backend trait for all model architectures.
///
/// A backend runs one un-batched sequence and returns every hidden state.
pub trait CtxrepBackend {
    fn n_layers(&self) -> usize;
    fn d_model(&self) -> usize;
    /// Longest input (in tokens) the position embeddings can address
    fn max_positions(&self) -> usize;
    /// Forward pass over `input_ids` of shape `(1, seq_len)`
    fn forward_hidden_states(&self, input_ids: &Tensor) -> Result<HiddenStates>;
}

/// Safetensors index for sharded models
#[derive(Debug, serde::Deserialize)]
struct SafetensorsIndex {
    weight_map: std::collections::HashMap<String, String>,
}

/// Checkpoint weight files
#[derive(Debug, Clone)]
pub enum WeightFiles {
    Safetensors(Vec<PathBuf>),
    Pth(PathBuf),
}

/// Tokenizer definition shipped with a checkpoint
#[derive(Debug, Clone)]
pub enum TokenizerFiles {
    /// Serialized `tokenizer.json`
    Json(PathBuf),
    /// Raw BPE vocabulary and merges (checkpoints without `tokenizer.json`)
    VocabMerges { vocab: PathBuf, merges: PathBuf },
}

impl TokenizerFiles {
    /// Build the tokenizer; raw vocabulary files are only understood for XLM
    pub fn load(&self, architecture: ModelArchitecture) -> Result<Tokenizer> {
        match self {
            TokenizerFiles::Json(path) => Tokenizer::from_file(path)
                .map_err(|e| anyhow::anyhow!("Tokenizer error: {e}")),
            TokenizerFiles::VocabMerges { vocab, merges } => match architecture {
                ModelArchitecture::Xlm => xlm_tokenizer(vocab, merges),
                other => anyhow::bail!(
                    "No tokenizer.json for {:?}, cannot build a tokenizer from {}",
                    other,
                    vocab.display()
                ),
            },
        }
    }
}

/// Resolved checkpoint files
#[derive(Debug, Clone)]
pub struct ModelFiles {
    pub config: PathBuf,
    pub tokenizer: TokenizerFiles,
    pub weights: WeightFiles,
}

impl ModelFiles {
    /// Download (or reuse cached) files from HuggingFace
    pub fn from_hub(model_id: &str) -> Result<Self> {
        let api = Api::new()?;
        let repo = api.repo(Repo::new(model_id.to_string(), RepoType::Model));

        let config = repo
            .get("config.json")
            .context("Failed to download config.json")?;
        let tokenizer = match repo.get("tokenizer.json") {
            Ok(path) => TokenizerFiles::Json(path),
            Err(_) => {
                info!("No tokenizer.json, falling back to vocab.json + merges.txt");
                TokenizerFiles::VocabMerges {
                    vocab: repo
                        .get("vocab.json")
                        .context("Failed to download tokenizer.json or vocab.json")?,
                    merges: repo
                        .get("merges.txt")
                        .context("Failed to download merges.txt")?,
                }
            }
        };

        let weights = if let Ok(index_path) = repo.get("model.safetensors.index.json") {
            info!("Model is sharded, loading index...");
            let mut paths = Vec::new();
            for shard_name in shard_names(&index_path)? {
                let path = repo
                    .get(&shard_name)
                    .with_context(|| format!("Failed to download {shard_name}"))?;
                paths.push(path);
            }
            WeightFiles::Safetensors(paths)
        } else if let Ok(path) = repo.get("model.safetensors") {
            WeightFiles::Safetensors(vec![path])
        } else {
            let path = repo
                .get("pytorch_model.bin")
                .context("Failed to download model.safetensors or pytorch_model.bin")?;
            WeightFiles::Pth(path)
        };

        Ok(Self {
            config,
            tokenizer,
            weights,
        })
    }

    /// Use files from a local checkpoint directory
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let require = |name: &str| -> Result<PathBuf> {
            let path = dir.join(name);
            anyhow::ensure!(path.is_file(), "Missing {} in {}", name, dir.display());
            Ok(path)
        };

        let config = require("config.json")?;
        let tokenizer = if dir.join("tokenizer.json").is_file() {
            TokenizerFiles::Json(dir.join("tokenizer.json"))
        } else {
            TokenizerFiles::VocabMerges {
                vocab: require("vocab.json")?,
                merges: require("merges.txt")?,
            }
        };

        let index_path = dir.join("model.safetensors.index.json");
        let single_path = dir.join("model.safetensors");
        let pth_path = dir.join("pytorch_model.bin");
        let weights = if index_path.is_file() {
            let paths = shard_names(&index_path)?
                .into_iter()
                .map(|name| dir.join(name))
                .collect();
            WeightFiles::Safetensors(paths)
        } else if single_path.is_file() {
            WeightFiles::Safetensors(vec![single_path])
        } else if pth_path.is_file() {
            WeightFiles::Pth(pth_path)
        } else {
            anyhow::bail!(
                "No model.safetensors or pytorch_model.bin in {}",
                dir.display()
            )
        };

        Ok(Self {
            config,
            tokenizer,
            weights,
        })
    }

    /// Build a VarBuilder over the checkpoint weights, or over fresh random
    /// parameters when `random_weights` is set.
    pub fn var_builder(
        &self,
        random_weights: bool,
        dtype: DType,
        device: &Device,
    ) -> Result<VarBuilder<'static>> {
        if random_weights {
            info!("Randomizing weights");
            let varmap = VarMap::new();
            return Ok(VarBuilder::from_varmap(&varmap, dtype, device));
        }

        match &self.weights {
            WeightFiles::Safetensors(paths) => {
                info!("Loading weights from {} file(s)...", paths.len());
                Ok(unsafe { VarBuilder::from_mmaped_safetensors(paths, dtype, device)? })
            }
            WeightFiles::Pth(path) => {
                info!("Loading weights from {}", path.display());
                Ok(VarBuilder::from_pth(path, dtype, device)?)
            }
        }
    }
}

/// Unique, sorted shard filenames from a safetensors index
fn shard_names(index_path: &Path) -> Result<Vec<String>> {
    let index_str = std::fs::read_to_string(index_path).context("Failed to read index")?;
    let index: SafetensorsIndex = serde_json::from_str(&index_str)?;

    let mut names: Vec<String> = index.weight_map.values().cloned().collect();
    names.sort();
    names.dedup();
    Ok(names)
}

/// Parse a `config.json` into an architecture config
pub fn read_config<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let config_str = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    serde_json::from_str(&config_str)
        .with_context(|| format!("Failed to parse config {}", path.display()))
}

/// Load a component under the first checkpoint prefix that has its weights.
///
/// `""` means the root of the VarBuilder.
pub(crate) fn load_with_prefixes<T>(
    vb: &VarBuilder,
    prefixes: &[&str],
    load: impl Fn(VarBuilder) -> Result<T>,
) -> Result<T> {
    let mut last_err = None;
    for prefix in prefixes {
        let scoped = if prefix.is_empty() {
            vb.clone()
        } else {
            vb.pp(*prefix)
        };
        match load(scoped) {
            Ok(component) => return Ok(component),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("No weight prefixes to try")))
}

/// Options controlling how a model is loaded
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Model name, e.g. "bert-base-cased" (selects the architecture)
    pub model_name: String,
    /// Local checkpoint directory overriding the hub download
    pub model_path: Option<PathBuf>,
    /// Force CPU even when CUDA is available
    pub force_cpu: bool,
    /// Initialize parameters randomly instead of loading them
    pub random_weights: bool,
}

impl LoadOptions {
    pub fn new(model_name: impl Into<String>) -> Self {
        Self {
            model_name: model_name.into(),
            ..Default::default()
        }
    }
}

/// High-level model wrapper for extraction runs
pub struct CtxrepModel {
    model: Box<dyn CtxrepBackend>,
    tokenizer: Tokenizer,
    device: Device,
    architecture: ModelArchitecture,
    model_name: String,
}

impl CtxrepModel {
    /// Load from HuggingFace or a local directory (tries CUDA, falls back to CPU)
    pub fn load(options: &LoadOptions) -> Result<Self> {
        let architecture = ModelArchitecture::from_model_name(&options.model_name)?;

        let device = if options.force_cpu {
            info!("Forcing CPU mode");
            Device::Cpu
        } else {
            match Device::cuda_if_available(0) {
                Ok(dev) if dev.is_cuda() => {
                    info!("Using CUDA device");
                    dev
                }
                _ => {
                    info!("CUDA not available, using CPU");
                    Device::Cpu
                }
            }
        };
        // Activations are exported as float32
        let dtype = DType::F32;

        info!("Loading model: {}", options.model_name);
        info!("Architecture: {:?}", architecture);
        info!("Device: {:?}", device);

        let files = match &options.model_path {
            Some(path) => {
                info!("Initializing model from local path: {}", path.display());
                ModelFiles::from_dir(path)?
            }
            None => ModelFiles::from_hub(&options.model_name)?,
        };

        let tokenizer = files.tokenizer.load(architecture)?;

        let vb = files.var_builder(options.random_weights, dtype, &device)?;
        let model = load_backend(architecture, &files.config, vb)?;

        info!(
            "Model loaded: {} layers, {} hidden",
            model.n_layers(),
            model.d_model()
        );

        Ok(Self::from_parts(
            model,
            tokenizer,
            device,
            architecture,
            &options.model_name,
        ))
    }

    /// Assemble a model from an already-built backend and tokenizer
    pub fn from_parts(
        model: Box<dyn CtxrepBackend>,
        tokenizer: Tokenizer,
        device: Device,
        architecture: ModelArchitecture,
        model_name: &str,
    ) -> Self {
        Self {
            model,
            tokenizer,
            device,
            architecture,
            model_name: model_name.to_string(),
        }
    }

    pub fn architecture(&self) -> ModelArchitecture {
        self.architecture
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    /// Number of transformer layers (embedding layer excluded)
    pub fn n_layers(&self) -> usize {
        self.model.n_layers()
    }

    /// Hidden dimension of the model
    pub fn d_model(&self) -> usize {
        self.model.d_model()
    }

    /// Configure tokenizer truncation and return the effective maximum length.
    ///
    /// The effective length never exceeds what the position embeddings address.
    pub fn set_max_seq_len(&mut self, max_seq_len: usize) -> Result<usize> {
        let effective = max_seq_len.min(self.model.max_positions());
        if effective < max_seq_len {
            warn!(
                "Model addresses at most {} positions, lowering max sequence length from {}",
                effective, max_seq_len
            );
        }
        self.tokenizer
            .with_truncation(Some(TruncationParams {
                max_length: effective,
                ..Default::default()
            }))
            .map_err(|e| anyhow::anyhow!("Truncation error: {e}"))?;
        self.tokenizer.with_padding(None);
        Ok(effective)
    }

    /// Run the model and capture every hidden state
    pub fn hidden_states(&self, input_ids: &[u32]) -> Result<HiddenStates> {
        anyhow::ensure!(!input_ids.is_empty(), "Cannot run the model on an empty input");
        let input_tensor = Tensor::new(input_ids, &self.device)?.unsqueeze(0)?;
        self.model.forward_hidden_states(&input_tensor)
    }
}

/// Build the backend for an architecture from its config and weights
pub fn load_backend(
    architecture: ModelArchitecture,
    config_path: &Path,
    vb: VarBuilder,
) -> Result<Box<dyn CtxrepBackend>> {
    let prefixes = architecture.weight_prefixes();
    let model: Box<dyn CtxrepBackend> = match architecture {
        ModelArchitecture::Bert => {
            let config: BertConfig = read_config(config_path)?;
            Box::new(CtxrepBert::load(&config, BertFlavor::Bert, vb, prefixes)?)
        }
        ModelArchitecture::Roberta => {
            let config: BertConfig = read_config(config_path)?;
            Box::new(CtxrepBert::load(&config, BertFlavor::Roberta, vb, prefixes)?)
        }
        ModelArchitecture::DistilBert => {
            let config: DistilBertConfig = read_config(config_path)?;
            Box::new(CtxrepDistilBert::load(&config, vb, prefixes)?)
        }
        ModelArchitecture::Gpt2 => {
            let config: Gpt2Config = read_config(config_path)?;
            Box::new(CtxrepGpt2::load(&config, vb, prefixes)?)
        }
        ModelArchitecture::Xlm => {
            let config: XlmConfig = read_config(config_path)?;
            Box::new(CtxrepXlm::load(&config, vb, prefixes)?)
        }
        ModelArchitecture::Xlnet => {
            let config: XlnetConfig = read_config(config_path)?;
            Box::new(CtxrepXlnet::load(&config, vb, prefixes)?)
        }
    };
    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_architecture_from_name() {
        assert_eq!(
            ModelArchitecture::from_model_name("bert-base-cased").unwrap(),
            ModelArchitecture::Bert
        );
        assert_eq!(
            ModelArchitecture::from_model_name("google-bert/bert-base-uncased").unwrap(),
            ModelArchitecture::Bert
        );
        assert_eq!(
            ModelArchitecture::from_model_name("distilbert-base-uncased").unwrap(),
            ModelArchitecture::DistilBert
        );
        assert_eq!(
            ModelArchitecture::from_model_name("FacebookAI/roberta-base").unwrap(),
            ModelArchitecture::Roberta
        );
        assert_eq!(
            ModelArchitecture::from_model_name("gpt2-medium").unwrap(),
            ModelArchitecture::Gpt2
        );
        assert_eq!(
            ModelArchitecture::from_model_name("xlnet-base-cased").unwrap(),
            ModelArchitecture::Xlnet
        );
        assert_eq!(
            ModelArchitecture::from_model_name("FacebookAI/xlm-mlm-en-2048").unwrap(),
            ModelArchitecture::Xlm
        );
    }

    #[test]
    fn test_unrecognized_model_name() {
        let err = ModelArchitecture::from_model_name("t5-small").unwrap_err();
        assert!(err.to_string().contains("Unrecognized model name"));
        assert!(ModelArchitecture::from_model_name("albert-base-v2").is_err());
    }

    #[test]
    fn test_subword_markers() {
        assert_eq!(
            ModelArchitecture::Bert.subword_marker(),
            SubwordMarker::Prefix("##")
        );
        assert_eq!(
            ModelArchitecture::Gpt2.subword_marker(),
            SubwordMarker::Prefix("Ġ")
        );
        assert_eq!(
            ModelArchitecture::Roberta.subword_marker(),
            SubwordMarker::Prefix("Ġ")
        );
        assert_eq!(
            ModelArchitecture::Xlnet.subword_marker(),
            SubwordMarker::Prefix("▁")
        );
        assert_eq!(
            ModelArchitecture::Xlm.subword_marker(),
            SubwordMarker::Suffix("</w>")
        );
    }

    #[test]
    fn test_tokenizer_fallback_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.json"), "{}").unwrap();
        std::fs::write(dir.path().join("pytorch_model.bin"), b"").unwrap();
        assert!(ModelFiles::from_dir(dir.path()).is_err());

        std::fs::write(dir.path().join("vocab.json"), r#"{"<unk>": 0}"#).unwrap();
        std::fs::write(dir.path().join("merges.txt"), "").unwrap();
        let files = ModelFiles::from_dir(dir.path()).unwrap();
        assert!(matches!(files.tokenizer, TokenizerFiles::VocabMerges { .. }));

        // Only XLM knows how to read raw BPE files
        let err = files.tokenizer.load(ModelArchitecture::Gpt2).unwrap_err();
        assert!(err.to_string().contains("No tokenizer.json"));
    }

    #[test]
    fn test_model_files_from_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ModelFiles::from_dir(dir.path()).is_err());

        std::fs::write(dir.path().join("config.json"), "{}").unwrap();
        std::fs::write(dir.path().join("tokenizer.json"), "{}").unwrap();
        assert!(ModelFiles::from_dir(dir.path()).is_err());

        std::fs::write(dir.path().join("pytorch_model.bin"), b"").unwrap();
        let files = ModelFiles::from_dir(dir.path()).unwrap();
        assert!(matches!(files.weights, WeightFiles::Pth(_)));

        std::fs::write(dir.path().join("model.safetensors"), b"").unwrap();
        let files = ModelFiles::from_dir(dir.path()).unwrap();
        assert!(matches!(files.weights, WeightFiles::Safetensors(ref p) if p.len() == 1));
    }

    #[test]
    fn test_sharded_index() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.json"), "{}").unwrap();
        std::fs::write(dir.path().join("tokenizer.json"), "{}").unwrap();
        std::fs::write(
            dir.path().join("model.safetensors.index.json"),
            r#"{"weight_map": {"a": "model-00002.safetensors", "b": "model-00001.safetensors", "c": "model-00001.safetensors"}}"#,
        )
        .unwrap();

        let files = ModelFiles::from_dir(dir.path()).unwrap();
        match files.weights {
            WeightFiles::Safetensors(paths) => {
                assert_eq!(paths.len(), 2);
                assert!(paths[0].ends_with("model-00001.safetensors"));
            }
            WeightFiles::Pth(_) => panic!("expected safetensors shards"),
        }
    }
}

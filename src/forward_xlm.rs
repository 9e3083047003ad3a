//! XLM forward pass with per-layer hidden-state capture
//!
//! Post-LayerNorm encoder (Lample & Conneau 2019). Unlike BERT the embedding
//! LayerNorm and the per-layer norms live in flat, index-addressed lists
//! (`layer_norm1.{i}`, `ffns.{i}`), and CLM checkpoints run causally.
//!
//! XLM checkpoints ship a raw BPE vocabulary (`vocab.json` + `merges.txt`)
//! instead of a `tokenizer.json`; [`xlm_tokenizer`] assembles the equivalent
//! fast tokenizer, with `</w>` closing every word.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use candle_core::{Module, Tensor};
use candle_nn::{embedding, linear, Embedding, LayerNorm, Linear, VarBuilder};
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::cache::HiddenStates;
use crate::forward_bert::{activation, layer_norm, multi_head_attention};
use crate::masks::create_causal_mask;
use crate::model::{load_with_prefixes, CtxrepBackend};

/// End-of-word marker of XLM's BPE vocabulary
pub const END_OF_WORD: &str = "</w>";

/// Model configuration (matches HuggingFace config.json for XLM)
#[derive(Debug, Clone, serde::Deserialize)]
pub struct XlmConfig {
    #[serde(default)]
    pub vocab_size: Option<usize>,
    /// Older checkpoints name the vocabulary size `n_words`
    #[serde(default)]
    pub n_words: Option<usize>,
    pub emb_dim: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    #[serde(default = "default_true")]
    pub gelu_activation: bool,
    #[serde(default)]
    pub sinusoidal_embeddings: bool,
    #[serde(default)]
    pub causal: bool,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
}

fn default_true() -> bool {
    true
}

fn default_max_position_embeddings() -> usize {
    512
}

fn default_layer_norm_eps() -> f64 {
    1e-12
}

impl XlmConfig {
    pub fn vocab_size(&self) -> Result<usize> {
        self.vocab_size
            .or(self.n_words)
            .ok_or_else(|| anyhow::anyhow!("XLM config has neither vocab_size nor n_words"))
    }

    fn activation(&self) -> &'static str {
        if self.gelu_activation {
            "gelu"
        } else {
            "relu"
        }
    }
}

/// Fixed sinusoidal position table, shape `(n_pos, dim)`.
///
/// Even columns hold `sin(pos / 10000^(j / dim))`, odd columns the matching
/// cosine of the same frequency.
pub fn sinusoidal_table(n_pos: usize, dim: usize, device: &candle_core::Device) -> Result<Tensor> {
    let mut values = Vec::with_capacity(n_pos * dim);
    for pos in 0..n_pos {
        for j in 0..dim {
            let exponent = (2 * (j / 2)) as f64 / dim as f64;
            let angle = pos as f64 / 10000f64.powf(exponent);
            let value = if j % 2 == 0 { angle.sin() } else { angle.cos() };
            values.push(value as f32);
        }
    }
    Ok(Tensor::from_vec(values, (n_pos, dim), device)?)
}

struct XlmLayer {
    q_lin: Linear,
    k_lin: Linear,
    v_lin: Linear,
    out_lin: Linear,
    layer_norm1: LayerNorm,
    lin1: Linear,
    lin2: Linear,
    layer_norm2: LayerNorm,
    n_heads: usize,
    activation: &'static str,
}

impl XlmLayer {
    fn load(vb: &VarBuilder, i: usize, config: &XlmConfig) -> Result<Self> {
        let dim = config.emb_dim;
        let hidden = 4 * dim;
        let eps = config.layer_norm_eps;
        let attn_vb = vb.pp(format!("attentions.{i}"));
        let ffn_vb = vb.pp(format!("ffns.{i}"));

        Ok(Self {
            q_lin: linear(dim, dim, attn_vb.pp("q_lin"))?,
            k_lin: linear(dim, dim, attn_vb.pp("k_lin"))?,
            v_lin: linear(dim, dim, attn_vb.pp("v_lin"))?,
            out_lin: linear(dim, dim, attn_vb.pp("out_lin"))?,
            layer_norm1: layer_norm(dim, eps, vb.pp(format!("layer_norm1.{i}")))?,
            lin1: linear(dim, hidden, ffn_vb.pp("lin1"))?,
            lin2: linear(hidden, dim, ffn_vb.pp("lin2"))?,
            layer_norm2: layer_norm(dim, eps, vb.pp(format!("layer_norm2.{i}")))?,
            n_heads: config.n_heads,
            activation: config.activation(),
        })
    }

    fn forward(&self, x: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let attn = multi_head_attention(
            &self.q_lin.forward(x)?,
            &self.k_lin.forward(x)?,
            &self.v_lin.forward(x)?,
            self.n_heads,
            mask,
        )?;
        let x = self.layer_norm1.forward(&(x + self.out_lin.forward(&attn)?)?)?;

        let h = activation(self.activation, &self.lin1.forward(&x)?)?;
        let h = self.lin2.forward(&h)?;
        Ok(self.layer_norm2.forward(&(x + h)?)?)
    }
}

/// XLM encoder with hidden-state capture after every layer
pub struct CtxrepXlm {
    embeddings: Embedding,
    position_embeddings: Embedding,
    layer_norm_emb: LayerNorm,
    layers: Vec<XlmLayer>,
    causal: bool,
    n_layers: usize,
    dim: usize,
    max_positions: usize,
}

impl CtxrepXlm {
    pub fn load(config: &XlmConfig, vb: VarBuilder, prefixes: &[&str]) -> Result<Self> {
        anyhow::ensure!(
            config.emb_dim % config.n_heads == 0,
            "emb_dim {} not divisible by n_heads {}",
            config.emb_dim,
            config.n_heads
        );
        let vocab_size = config.vocab_size()?;
        info!(
            "Model config: {} layers, {} hidden, {} vocab (causal: {})",
            config.n_layers, config.emb_dim, vocab_size, config.causal
        );

        let (embeddings, position_embeddings, layer_norm_emb, layers) =
            load_with_prefixes(&vb, prefixes, |vb| {
                let embeddings = embedding(vocab_size, config.emb_dim, vb.pp("embeddings"))?;
                let position_embeddings = if config.sinusoidal_embeddings {
                    let table = sinusoidal_table(
                        config.max_position_embeddings,
                        config.emb_dim,
                        vb.device(),
                    )?
                    .to_dtype(vb.dtype())?;
                    Embedding::new(table, config.emb_dim)
                } else {
                    embedding(
                        config.max_position_embeddings,
                        config.emb_dim,
                        vb.pp("position_embeddings"),
                    )?
                };
                let layer_norm_emb =
                    layer_norm(config.emb_dim, config.layer_norm_eps, vb.pp("layer_norm_emb"))?;
                let mut layers = Vec::with_capacity(config.n_layers);
                for i in 0..config.n_layers {
                    layers.push(XlmLayer::load(&vb, i, config)?);
                }
                Ok((embeddings, position_embeddings, layer_norm_emb, layers))
            })?;

        Ok(Self {
            embeddings,
            position_embeddings,
            layer_norm_emb,
            layers,
            causal: config.causal,
            n_layers: config.n_layers,
            dim: config.emb_dim,
            max_positions: config.max_position_embeddings,
        })
    }
}

impl CtxrepBackend for CtxrepXlm {
    fn n_layers(&self) -> usize {
        self.n_layers
    }

    fn d_model(&self) -> usize {
        self.dim
    }

    fn max_positions(&self) -> usize {
        self.max_positions
    }

    fn forward_hidden_states(&self, input_ids: &Tensor) -> Result<HiddenStates> {
        let mut cache = HiddenStates::with_capacity(self.n_layers);
        let seq_len = input_ids.dim(1)?;
        let device = input_ids.device();

        let position_ids = Tensor::arange(0u32, seq_len as u32, device)?.unsqueeze(0)?;
        let embedded = self
            .embeddings
            .forward(input_ids)?
            .broadcast_add(&self.position_embeddings.forward(&position_ids)?)?;
        let mut hidden = self.layer_norm_emb.forward(&embedded)?;
        cache.push(hidden.clone())?;

        let mask = if self.causal {
            Some(create_causal_mask(seq_len, device, hidden.dtype())?)
        } else {
            None
        };
        for layer in &self.layers {
            hidden = layer.forward(&hidden, mask.as_ref())?;
            cache.push(hidden.clone())?;
        }

        Ok(cache)
    }
}

/// Build a fast tokenizer from XLM's `vocab.json` and `merges.txt`.
///
/// Input is lower-cased and stripped of accents, split on whitespace and
/// punctuation, then BPE-encoded with `</w>` appended to each word's last
/// piece. Sentences are wrapped as `<s> ... </s>`.
pub fn xlm_tokenizer(vocab_path: &Path, merges_path: &Path) -> Result<Tokenizer> {
    let vocab_str = std::fs::read_to_string(vocab_path)
        .with_context(|| format!("Failed to read vocab {}", vocab_path.display()))?;
    let vocab: HashMap<String, u32> = serde_json::from_str(&vocab_str)
        .with_context(|| format!("Failed to parse vocab {}", vocab_path.display()))?;
    let merges_str = std::fs::read_to_string(merges_path)
        .with_context(|| format!("Failed to read merges {}", merges_path.display()))?;

    // "left right [count]" per line; merges the vocabulary cannot express are dropped
    let mut merges = Vec::new();
    let mut dropped = 0;
    for line in merges_str.lines() {
        if line.starts_with("#version") {
            continue;
        }
        let mut fields = line.split_whitespace();
        let (Some(left), Some(right)) = (fields.next(), fields.next()) else {
            continue;
        };
        let merged = format!("{left}{right}");
        if vocab.contains_key(left) && vocab.contains_key(right) && vocab.contains_key(&merged) {
            merges.push(format!("{left} {right}"));
        } else {
            dropped += 1;
        }
    }
    debug!("XLM merges: {} kept, {} dropped", merges.len(), dropped);

    let token_id = |token: &str| -> Result<u32> {
        vocab
            .get(token)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("XLM vocabulary has no {token} token"))
    };
    let bos = token_id("<s>")?;
    let eos = token_id("</s>")?;
    token_id("<unk>")?;

    let mut specials: Vec<(&String, &u32)> = vocab
        .iter()
        .filter(|(token, _)| {
            matches!(token.as_str(), "<s>" | "</s>" | "<pad>" | "<unk>")
                || token.starts_with("<special")
        })
        .collect();
    specials.sort_by_key(|(_, id)| **id);
    let added_tokens: Vec<serde_json::Value> = specials
        .into_iter()
        .map(|(token, id)| {
            serde_json::json!({
                "id": id, "content": token, "single_word": false, "lstrip": false,
                "rstrip": false, "normalized": false, "special": true
            })
        })
        .collect();

    let json = serde_json::json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": added_tokens,
        "normalizer": {
            "type": "BertNormalizer",
            "clean_text": true,
            "handle_chinese_chars": true,
            "strip_accents": true,
            "lowercase": true
        },
        "pre_tokenizer": {"type": "BertPreTokenizer"},
        "post_processor": {
            "type": "BertProcessing",
            "sep": ["</s>", eos],
            "cls": ["<s>", bos]
        },
        "decoder": {"type": "BPEDecoder", "suffix": END_OF_WORD},
        "model": {
            "type": "BPE",
            "dropout": null,
            "unk_token": "<unk>",
            "continuing_subword_prefix": null,
            "end_of_word_suffix": END_OF_WORD,
            "fuse_unk": false,
            "byte_fallback": false,
            "vocab": vocab,
            "merges": merges
        }
    });
    Tokenizer::from_str(&json.to_string()).map_err(|e| anyhow::anyhow!("Tokenizer error: {e}"))
}

//! DistilBERT forward pass with per-layer hidden-state capture
//!
//! Six-layer distilled BERT (Sanh et al. 2019): no token-type embeddings,
//! different parameter names, same post-LayerNorm block structure.

use anyhow::Result;
use candle_core::{Module, Tensor};
use candle_nn::{embedding, linear, Embedding, LayerNorm, Linear, VarBuilder};
use tracing::info;

use crate::cache::HiddenStates;
use crate::forward_bert::{activation, layer_norm, multi_head_attention};
use crate::model::{load_with_prefixes, CtxrepBackend};

const LAYER_NORM_EPS: f64 = 1e-12;

/// Model configuration (matches HuggingFace config.json for DistilBERT)
#[derive(Debug, Clone, serde::Deserialize)]
pub struct DistilBertConfig {
    pub vocab_size: usize,
    pub dim: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    pub hidden_dim: usize,
    #[serde(default = "default_activation")]
    pub activation: String,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
}

fn default_activation() -> String {
    "gelu".to_string()
}

fn default_max_position_embeddings() -> usize {
    512
}

struct Embeddings {
    word_embeddings: Embedding,
    position_embeddings: Embedding,
    layer_norm: LayerNorm,
}

impl Embeddings {
    fn load(vb: VarBuilder, config: &DistilBertConfig) -> Result<Self> {
        Ok(Self {
            word_embeddings: embedding(config.vocab_size, config.dim, vb.pp("word_embeddings"))?,
            position_embeddings: embedding(
                config.max_position_embeddings,
                config.dim,
                vb.pp("position_embeddings"),
            )?,
            layer_norm: layer_norm(config.dim, LAYER_NORM_EPS, vb.pp("LayerNorm"))?,
        })
    }

    fn forward(&self, input_ids: &Tensor) -> Result<Tensor> {
        let seq_len = input_ids.dim(1)?;
        let position_ids = Tensor::arange(0u32, seq_len as u32, input_ids.device())?.unsqueeze(0)?;
        let embeddings = self
            .word_embeddings
            .forward(input_ids)?
            .broadcast_add(&self.position_embeddings.forward(&position_ids)?)?;
        Ok(self.layer_norm.forward(&embeddings)?)
    }
}

struct TransformerBlock {
    q_lin: Linear,
    k_lin: Linear,
    v_lin: Linear,
    out_lin: Linear,
    sa_layer_norm: LayerNorm,
    lin1: Linear,
    lin2: Linear,
    output_layer_norm: LayerNorm,
    n_heads: usize,
    activation: String,
}

impl TransformerBlock {
    fn load(vb: VarBuilder, config: &DistilBertConfig) -> Result<Self> {
        let dim = config.dim;
        let attn_vb = vb.pp("attention");
        let ffn_vb = vb.pp("ffn");

        Ok(Self {
            q_lin: linear(dim, dim, attn_vb.pp("q_lin"))?,
            k_lin: linear(dim, dim, attn_vb.pp("k_lin"))?,
            v_lin: linear(dim, dim, attn_vb.pp("v_lin"))?,
            out_lin: linear(dim, dim, attn_vb.pp("out_lin"))?,
            sa_layer_norm: layer_norm(dim, LAYER_NORM_EPS, vb.pp("sa_layer_norm"))?,
            lin1: linear(dim, config.hidden_dim, ffn_vb.pp("lin1"))?,
            lin2: linear(config.hidden_dim, dim, ffn_vb.pp("lin2"))?,
            output_layer_norm: layer_norm(dim, LAYER_NORM_EPS, vb.pp("output_layer_norm"))?,
            n_heads: config.n_heads,
            activation: config.activation.clone(),
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let attn = multi_head_attention(
            &self.q_lin.forward(x)?,
            &self.k_lin.forward(x)?,
            &self.v_lin.forward(x)?,
            self.n_heads,
            None,
        )?;
        let attn = self.out_lin.forward(&attn)?;
        let x = self.sa_layer_norm.forward(&(x + attn)?)?;

        let h = activation(&self.activation, &self.lin1.forward(&x)?)?;
        let h = self.lin2.forward(&h)?;
        Ok(self.output_layer_norm.forward(&(x + h)?)?)
    }
}

/// DistilBERT encoder with hidden-state capture after every block
pub struct CtxrepDistilBert {
    embeddings: Embeddings,
    layers: Vec<TransformerBlock>,
    n_layers: usize,
    dim: usize,
    max_positions: usize,
}

impl CtxrepDistilBert {
    pub fn load(config: &DistilBertConfig, vb: VarBuilder, prefixes: &[&str]) -> Result<Self> {
        anyhow::ensure!(
            config.dim % config.n_heads == 0,
            "dim {} not divisible by n_heads {}",
            config.dim,
            config.n_heads
        );
        info!(
            "Model config: {} layers, {} hidden, {} vocab",
            config.n_layers, config.dim, config.vocab_size
        );

        let (embeddings, layers) = load_with_prefixes(&vb, prefixes, |vb| {
            let embeddings = Embeddings::load(vb.pp("embeddings"), config)?;
            let mut layers = Vec::with_capacity(config.n_layers);
            for i in 0..config.n_layers {
                layers.push(TransformerBlock::load(
                    vb.pp(format!("transformer.layer.{i}")),
                    config,
                )?);
            }
            Ok((embeddings, layers))
        })?;

        Ok(Self {
            embeddings,
            layers,
            n_layers: config.n_layers,
            dim: config.dim,
            max_positions: config.max_position_embeddings,
        })
    }
}

impl CtxrepBackend for CtxrepDistilBert {
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

        let mut hidden = self.embeddings.forward(input_ids)?;
        cache.push(hidden.clone())?;

        for layer in &self.layers {
            hidden = layer.forward(&hidden)?;
            cache.push(hidden.clone())?;
        }

        Ok(cache)
    }
}

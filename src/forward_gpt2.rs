//! GPT-2 forward pass with per-layer hidden-state capture
//!
//! Pre-LayerNorm causal decoder (Radford et al. 2019). Checkpoints store
//! projections as `Conv1D` with `(in, out)` weights, transposed here into
//! candle `Linear` layout at load time.
//!
//! The last captured hidden state has `ln_f` applied, matching what
//! HuggingFace returns as the final entry of `hidden_states`.

use anyhow::Result;
use candle_core::{Module, Tensor};
use candle_nn::{embedding, Embedding, Init, LayerNorm, Linear, VarBuilder};
use tracing::info;

use crate::cache::HiddenStates;
use crate::forward_bert::{activation, layer_norm, multi_head_attention};
use crate::masks::create_causal_mask;
use crate::model::{load_with_prefixes, CtxrepBackend};

/// Model configuration (matches HuggingFace config.json for GPT-2)
#[derive(Debug, Clone, serde::Deserialize)]
pub struct Gpt2Config {
    pub vocab_size: usize,
    pub n_embd: usize,
    pub n_layer: usize,
    pub n_head: usize,
    #[serde(default = "default_n_positions")]
    pub n_positions: usize,
    #[serde(default)]
    pub n_inner: Option<usize>,
    #[serde(default = "default_layer_norm_epsilon")]
    pub layer_norm_epsilon: f64,
    #[serde(default = "default_activation_function")]
    pub activation_function: String,
}

fn default_n_positions() -> usize {
    1024
}

fn default_layer_norm_epsilon() -> f64 {
    1e-5
}

fn default_activation_function() -> String {
    "gelu_new".to_string()
}

/// Load a GPT-2 `Conv1D` as a `Linear`
fn conv1d(in_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<Linear> {
    let weight = vb.get_with_hints(
        (in_dim, out_dim),
        "weight",
        candle_nn::init::DEFAULT_KAIMING_NORMAL,
    )?;
    let bias = vb.get_with_hints(out_dim, "bias", Init::Const(0.))?;
    Ok(Linear::new(weight.t()?.contiguous()?, Some(bias)))
}

struct Block {
    ln_1: LayerNorm,
    c_attn: Linear,
    attn_proj: Linear,
    ln_2: LayerNorm,
    c_fc: Linear,
    mlp_proj: Linear,
    n_embd: usize,
    n_head: usize,
    activation: String,
}

impl Block {
    fn load(vb: VarBuilder, config: &Gpt2Config) -> Result<Self> {
        let d = config.n_embd;
        let inner = config.n_inner.unwrap_or(4 * d);
        let eps = config.layer_norm_epsilon;

        Ok(Self {
            ln_1: layer_norm(d, eps, vb.pp("ln_1"))?,
            c_attn: conv1d(d, 3 * d, vb.pp("attn").pp("c_attn"))?,
            attn_proj: conv1d(d, d, vb.pp("attn").pp("c_proj"))?,
            ln_2: layer_norm(d, eps, vb.pp("ln_2"))?,
            c_fc: conv1d(d, inner, vb.pp("mlp").pp("c_fc"))?,
            mlp_proj: conv1d(inner, d, vb.pp("mlp").pp("c_proj"))?,
            n_embd: d,
            n_head: config.n_head,
            activation: config.activation_function.clone(),
        })
    }

    fn forward(&self, x: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let d = self.n_embd;
        let qkv = self.c_attn.forward(&self.ln_1.forward(x)?)?;
        let q = qkv.narrow(2, 0, d)?;
        let k = qkv.narrow(2, d, d)?;
        let v = qkv.narrow(2, 2 * d, d)?;

        let attn = multi_head_attention(&q, &k, &v, self.n_head, Some(mask))?;
        let x = (x + self.attn_proj.forward(&attn)?)?;

        let h = activation(&self.activation, &self.c_fc.forward(&self.ln_2.forward(&x)?)?)?;
        Ok((&x + self.mlp_proj.forward(&h)?)?)
    }
}

/// GPT-2 decoder with hidden-state capture after every block
pub struct CtxrepGpt2 {
    wte: Embedding,
    wpe: Embedding,
    blocks: Vec<Block>,
    ln_f: LayerNorm,
    n_layers: usize,
    n_embd: usize,
    n_positions: usize,
}

impl CtxrepGpt2 {
    pub fn load(config: &Gpt2Config, vb: VarBuilder, prefixes: &[&str]) -> Result<Self> {
        anyhow::ensure!(
            config.n_embd % config.n_head == 0,
            "n_embd {} not divisible by n_head {}",
            config.n_embd,
            config.n_head
        );
        info!(
            "Model config: {} layers, {} hidden, {} vocab",
            config.n_layer, config.n_embd, config.vocab_size
        );

        let (wte, wpe, blocks, ln_f) = load_with_prefixes(&vb, prefixes, |vb| {
            let wte = embedding(config.vocab_size, config.n_embd, vb.pp("wte"))?;
            let wpe = embedding(config.n_positions, config.n_embd, vb.pp("wpe"))?;
            let mut blocks = Vec::with_capacity(config.n_layer);
            for i in 0..config.n_layer {
                blocks.push(Block::load(vb.pp(format!("h.{i}")), config)?);
            }
            let ln_f = layer_norm(config.n_embd, config.layer_norm_epsilon, vb.pp("ln_f"))?;
            Ok((wte, wpe, blocks, ln_f))
        })?;

        Ok(Self {
            wte,
            wpe,
            blocks,
            ln_f,
            n_layers: config.n_layer,
            n_embd: config.n_embd,
            n_positions: config.n_positions,
        })
    }
}

impl CtxrepBackend for CtxrepGpt2 {
    fn n_layers(&self) -> usize {
        self.n_layers
    }

    fn d_model(&self) -> usize {
        self.n_embd
    }

    fn max_positions(&self) -> usize {
        self.n_positions
    }

    fn forward_hidden_states(&self, input_ids: &Tensor) -> Result<HiddenStates> {
        let mut cache = HiddenStates::with_capacity(self.n_layers);
        let seq_len = input_ids.dim(1)?;
        let device = input_ids.device();

        let position_ids = Tensor::arange(0u32, seq_len as u32, device)?.unsqueeze(0)?;
        let mut hidden = self
            .wte
            .forward(input_ids)?
            .broadcast_add(&self.wpe.forward(&position_ids)?)?;
        cache.push(hidden.clone())?;

        let mask = create_causal_mask(seq_len, device, hidden.dtype())?;
        let last = self.blocks.len().saturating_sub(1);
        for (i, block) in self.blocks.iter().enumerate() {
            hidden = block.forward(&hidden, &mask)?;
            if i == last {
                cache.push(self.ln_f.forward(&hidden)?)?;
            } else {
                cache.push(hidden.clone())?;
            }
        }

        Ok(cache)
    }
}

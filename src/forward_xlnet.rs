//! XLNet forward pass with per-layer hidden-state capture
//!
//! Transformer-XL style encoder (Yang et al. 2019) run as a plain
//! bidirectional model: no memory, no permutation mask and only the content
//! stream. Positions enter through relative attention instead of an
//! embedding table, so the input length is unbounded.
//!
//! Projections are stored as `(d_model, n_head, d_head)` tensors and
//! flattened to `(d_model, n_head * d_head)` at load time.

use anyhow::Result;
use candle_core::{Device, Module, Tensor};
use candle_nn::{embedding, linear, Embedding, Init, LayerNorm, Linear, VarBuilder};
use tracing::info;

use crate::cache::HiddenStates;
use crate::forward_bert::{activation, layer_norm};
use crate::model::{load_with_prefixes, CtxrepBackend};

const INIT: Init = Init::Randn {
    mean: 0.,
    stdev: 0.02,
};

/// Model configuration (matches HuggingFace config.json for XLNet)
#[derive(Debug, Clone, serde::Deserialize)]
pub struct XlnetConfig {
    pub vocab_size: usize,
    pub d_model: usize,
    pub n_layer: usize,
    pub n_head: usize,
    #[serde(default)]
    pub d_head: Option<usize>,
    pub d_inner: usize,
    #[serde(default = "default_ff_activation")]
    pub ff_activation: String,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
    #[serde(default = "default_attn_type")]
    pub attn_type: String,
}

fn default_ff_activation() -> String {
    "gelu".to_string()
}

fn default_layer_norm_eps() -> f64 {
    1e-12
}

fn default_attn_type() -> String {
    "bi".to_string()
}

impl XlnetConfig {
    fn d_head(&self) -> usize {
        self.d_head.unwrap_or(self.d_model / self.n_head)
    }
}

/// Sinusoidal encodings of the relative distances `seq_len, ..., -seq_len + 1`.
///
/// Shape `(2 * seq_len, d_model)`: all sines first, then all cosines.
pub fn relative_positional_encoding(
    seq_len: usize,
    d_model: usize,
    device: &Device,
) -> Result<Tensor> {
    let half = d_model / 2;
    let mut values = Vec::with_capacity(2 * seq_len * d_model);
    for step in 0..2 * seq_len {
        let pos = seq_len as f64 - step as f64;
        let angles: Vec<f64> = (0..half)
            .map(|f| pos / 10000f64.powf((2 * f) as f64 / d_model as f64))
            .collect();
        values.extend(angles.iter().map(|a| a.sin() as f32));
        values.extend(angles.iter().map(|a| a.cos() as f32));
    }
    Ok(Tensor::from_vec(values, (2 * seq_len, d_model), device)?)
}

/// Re-index position scores from absolute relative-table rows to key positions.
///
/// `x` is `(n_head, q_len, r_len)` with row `i` scored against every
/// relative distance; the result is `(n_head, q_len, k_len)` where column
/// `j` holds the score for distance `i - j`.
pub fn rel_shift(x: &Tensor, k_len: usize) -> Result<Tensor> {
    let (n_head, q_len, r_len) = x.dims3()?;
    Ok(x.reshape((n_head, r_len, q_len))?
        .narrow(1, 1, r_len - 1)?
        .contiguous()?
        .reshape((n_head, q_len, r_len - 1))?
        .narrow(2, 0, k_len)?
        .contiguous()?)
}

struct RelativeAttention {
    q: Tensor,
    k: Tensor,
    v: Tensor,
    o: Tensor,
    r: Tensor,
    r_w_bias: Tensor,
    r_r_bias: Tensor,
    layer_norm: LayerNorm,
    n_head: usize,
    d_head: usize,
}

impl RelativeAttention {
    fn load(vb: VarBuilder, config: &XlnetConfig) -> Result<Self> {
        let (d, n, dh) = (config.d_model, config.n_head, config.d_head());
        let proj = |name: &str| -> Result<Tensor> {
            Ok(vb.get_with_hints((d, n, dh), name, INIT)?.reshape((d, n * dh))?)
        };
        let bias = |name: &str| -> Result<Tensor> {
            Ok(vb.get_with_hints((n, dh), name, INIT)?.unsqueeze(1)?)
        };

        Ok(Self {
            q: proj("q")?,
            k: proj("k")?,
            v: proj("v")?,
            o: proj("o")?.t()?.contiguous()?,
            r: proj("r")?,
            r_w_bias: bias("r_w_bias")?,
            r_r_bias: bias("r_r_bias")?,
            layer_norm: layer_norm(d, config.layer_norm_eps, vb.pp("layer_norm"))?,
            n_head: n,
            d_head: dh,
        })
    }

    /// Project `(len, d_model)` into `(n_head, len, d_head)`
    fn heads(&self, x: &Tensor, weight: &Tensor) -> Result<Tensor> {
        let len = x.dim(0)?;
        Ok(x.matmul(weight)?
            .reshape((len, self.n_head, self.d_head))?
            .transpose(0, 1)?
            .contiguous()?)
    }

    /// `h` is `(seq_len, d_model)`, `pos_emb` is `(2 * seq_len, d_model)`
    fn forward(&self, h: &Tensor, pos_emb: &Tensor) -> Result<Tensor> {
        let seq_len = h.dim(0)?;
        let q = self.heads(h, &self.q)?;
        let k = self.heads(h, &self.k)?;
        let v = self.heads(h, &self.v)?;
        let k_r = self.heads(pos_emb, &self.r)?;

        // Content and position terms
        let ac = q
            .broadcast_add(&self.r_w_bias)?
            .matmul(&k.t()?.contiguous()?)?;
        let bd = q
            .broadcast_add(&self.r_r_bias)?
            .matmul(&k_r.t()?.contiguous()?)?;
        let bd = rel_shift(&bd, seq_len)?;

        let scale = 1.0 / (self.d_head as f64).sqrt();
        let scores = ((ac + bd)? * scale)?;
        let probs = candle_nn::ops::softmax_last_dim(&scores)?;
        let attn_vec = probs
            .matmul(&v)?
            .transpose(0, 1)?
            .reshape((seq_len, self.n_head * self.d_head))?;

        let out = attn_vec.matmul(&self.o)?;
        Ok(self.layer_norm.forward(&(out + h)?)?)
    }
}

struct FeedForward {
    layer_1: Linear,
    layer_2: Linear,
    layer_norm: LayerNorm,
    activation: String,
}

impl FeedForward {
    fn load(vb: VarBuilder, config: &XlnetConfig) -> Result<Self> {
        Ok(Self {
            layer_1: linear(config.d_model, config.d_inner, vb.pp("layer_1"))?,
            layer_2: linear(config.d_inner, config.d_model, vb.pp("layer_2"))?,
            layer_norm: layer_norm(config.d_model, config.layer_norm_eps, vb.pp("layer_norm"))?,
            activation: config.ff_activation.clone(),
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let h = activation(&self.activation, &self.layer_1.forward(x)?)?;
        let h = self.layer_2.forward(&h)?;
        Ok(self.layer_norm.forward(&(h + x)?)?)
    }
}

struct XlnetLayer {
    rel_attn: RelativeAttention,
    ff: FeedForward,
}

/// XLNet encoder with hidden-state capture after every layer
pub struct CtxrepXlnet {
    word_embedding: Embedding,
    layers: Vec<XlnetLayer>,
    n_layers: usize,
    d_model: usize,
}

impl CtxrepXlnet {
    pub fn load(config: &XlnetConfig, vb: VarBuilder, prefixes: &[&str]) -> Result<Self> {
        anyhow::ensure!(
            config.attn_type == "bi",
            "Unsupported XLNet attn_type {:?}, only \"bi\" is supported",
            config.attn_type
        );
        anyhow::ensure!(
            config.d_model % 2 == 0,
            "d_model {} must be even for sinusoidal positions",
            config.d_model
        );
        info!(
            "Model config: {} layers, {} hidden, {} vocab",
            config.n_layer, config.d_model, config.vocab_size
        );

        let (word_embedding, layers) = load_with_prefixes(&vb, prefixes, |vb| {
            let word_embedding =
                embedding(config.vocab_size, config.d_model, vb.pp("word_embedding"))?;
            let mut layers = Vec::with_capacity(config.n_layer);
            for i in 0..config.n_layer {
                let layer_vb = vb.pp(format!("layer.{i}"));
                layers.push(XlnetLayer {
                    rel_attn: RelativeAttention::load(layer_vb.pp("rel_attn"), config)?,
                    ff: FeedForward::load(layer_vb.pp("ff"), config)?,
                });
            }
            Ok((word_embedding, layers))
        })?;

        Ok(Self {
            word_embedding,
            layers,
            n_layers: config.n_layer,
            d_model: config.d_model,
        })
    }
}

impl CtxrepBackend for CtxrepXlnet {
    fn n_layers(&self) -> usize {
        self.n_layers
    }

    fn d_model(&self) -> usize {
        self.d_model
    }

    fn max_positions(&self) -> usize {
        usize::MAX
    }

    fn forward_hidden_states(&self, input_ids: &Tensor) -> Result<HiddenStates> {
        let mut cache = HiddenStates::with_capacity(self.n_layers);
        let mut hidden = self.word_embedding.forward(input_ids)?.squeeze(0)?;
        cache.push(hidden.clone())?;

        let seq_len = hidden.dim(0)?;
        let pos_emb = relative_positional_encoding(seq_len, self.d_model, hidden.device())?
            .to_dtype(hidden.dtype())?;

        for layer in &self.layers {
            hidden = layer.rel_attn.forward(&hidden, &pos_emb)?;
            hidden = layer.ff.forward(&hidden)?;
            cache.push(hidden.clone())?;
        }

        Ok(cache)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use candle_nn::VarMap;

    fn tiny_config(extra: &str) -> XlnetConfig {
        serde_json::from_str(&format!(
            r#"{{"vocab_size": 20, "d_model": 8, "n_layer": 2, "n_head": 2,
                "d_inner": 16{extra}}}"#
        ))
        .unwrap()
    }

    #[test]
    fn test_config_defaults() {
        let config = tiny_config("");
        assert_eq!(config.d_head(), 4);
        assert_eq!(config.ff_activation, "gelu");
        assert_eq!(config.attn_type, "bi");
    }

    #[test]
    fn test_forward_captures_every_layer() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = CtxrepXlnet::load(&tiny_config(""), vb, &[""]).unwrap();

        let ids = Tensor::new(&[5u32, 9, 11, 3, 4], &Device::Cpu)
            .unwrap()
            .unsqueeze(0)
            .unwrap();
        let states = model.forward_hidden_states(&ids).unwrap();

        assert_eq!(states.n_layers(), 3);
        assert_eq!(states.seq_len().unwrap(), 5);
        assert_eq!(states.get_layer(2).unwrap().dims(), &[5, 8]);
        assert_eq!(model.max_positions(), usize::MAX);
    }

    #[test]
    fn test_unidirectional_attention_rejected() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let config = tiny_config(r#", "attn_type": "uni""#);
        assert!(CtxrepXlnet::load(&config, vb, &[""]).is_err());
    }

    #[test]
    fn test_rel_shift() {
        // Distances for two positions: [2, 1, 0, -1]
        let x = Tensor::arange(0f32, 8., &Device::Cpu)
            .unwrap()
            .reshape((1, 2, 4))
            .unwrap();
        let shifted: Vec<Vec<Vec<f32>>> = rel_shift(&x, 2).unwrap().to_vec3().unwrap();
        // Row i, column j picks distance i - j
        assert_eq!(shifted, vec![vec![vec![2., 3.], vec![5., 6.]]]);
    }

    #[test]
    fn test_relative_positional_encoding() {
        let table: Vec<Vec<f32>> = relative_positional_encoding(2, 4, &Device::Cpu)
            .unwrap()
            .to_vec2()
            .unwrap();
        assert_eq!(table.len(), 4);
        // First row is distance 2: [sin(2), sin(0.02), cos(2), cos(0.02)]
        assert!((table[0][0] - 2f32.sin()).abs() < 1e-6);
        assert!((table[0][1] - 0.02f32.sin()).abs() < 1e-6);
        assert!((table[0][2] - 2f32.cos()).abs() < 1e-6);
        // Distance 0 row
        assert_eq!(table[2], vec![0.0, 0.0, 1.0, 1.0]);
    }
}
